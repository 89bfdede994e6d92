use shared_types::ErrorKind;

/// Synchronous failures raised by a [`crate::registry::WorkerRegistry`] call.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum WorkerError {
    #[error("Too many workers running")]
    MaximumConcurrency,
    #[error("Duplicate worker id: {0}")]
    DuplicateId(String),
    #[error("Worker not found: {0}")]
    NotFound(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl WorkerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkerError::MaximumConcurrency => ErrorKind::MaximumConcurrency,
            WorkerError::DuplicateId(_) => ErrorKind::DuplicateId,
            WorkerError::NotFound(_) => ErrorKind::NotFound,
            WorkerError::InvalidRequest(_) => ErrorKind::InvalidRequest,
        }
    }
}
