//! Maps raw worker failures onto the closed [`ErrorKind`] taxonomy.

use serde::Deserialize;
use shared_types::{ClassifiedError, ErrorKind};

use crate::error::WorkerError;
use crate::registry::RawFailure;

/// Structured error line some workers write to stderr before exiting.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkerErrorLine {
    error_text: String,
    #[serde(default)]
    diagnostic_info: Option<String>,
}

pub fn classify(failure: &RawFailure) -> ClassifiedError {
    match failure {
        RawFailure::Spawn(message) => ClassifiedError {
            kind: ErrorKind::Spawn,
            message: format!("failed to start worker: {message}"),
            diagnostic: None,
        },
        RawFailure::Stderr(text) => classify_stderr(text),
        RawFailure::RecordTooLarge { limit } => ClassifiedError {
            kind: ErrorKind::Runtime,
            message: format!("worker output record exceeded {limit} bytes and was discarded"),
            diagnostic: None,
        },
        RawFailure::Exit(code) => ClassifiedError {
            kind: ErrorKind::AbnormalExit,
            message: match code {
                Some(code) => format!("worker exited with code {code}"),
                None => "worker terminated by signal".to_string(),
            },
            diagnostic: None,
        },
    }
}

fn classify_stderr(text: &str) -> ClassifiedError {
    let trimmed = text.trim();
    if let Ok(line) = serde_json::from_str::<WorkerErrorLine>(trimmed) {
        return ClassifiedError {
            kind: ErrorKind::Runtime,
            message: line.error_text,
            diagnostic: line.diagnostic_info.filter(|d| !d.is_empty()),
        };
    }
    ClassifiedError {
        kind: ErrorKind::Runtime,
        message: trimmed.to_string(),
        diagnostic: None,
    }
}

pub fn from_worker_error(error: &WorkerError) -> ClassifiedError {
    ClassifiedError {
        kind: error.kind(),
        message: error.to_string(),
        diagnostic: None,
    }
}
