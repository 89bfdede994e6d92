use serde_json::Value;

use crate::error::WorkerError;

/// The two kinds of worker the host runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    /// Long-lived anomaly model; accepts records on stdin.
    Model,
    /// Parameter search over an input file; stdin is closed.
    ParamFinder,
}

impl WorkerKind {
    pub fn accepts_input(self) -> bool {
        matches!(self, WorkerKind::Model)
    }
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerKind::Model => write!(f, "model"),
            WorkerKind::ParamFinder => write!(f, "param-finder"),
        }
    }
}

impl serde::Serialize for WorkerKind {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

/// Program (and leading args) used to start one kind of worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl LaunchCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// Option blobs forwarded verbatim onto a worker's command line.
#[derive(Debug, Clone, PartialEq)]
pub enum LaunchParams {
    Model {
        input: Value,
        aggregation: Option<Value>,
        model: Value,
    },
    ParamFinder {
        input: Value,
    },
}

impl LaunchParams {
    /// Read `create` params for `kind`.
    ///
    /// Model: `{ inputOpt, aggOpt?, modelOpt }`. Param finder: `{ inputOpt }`.
    pub fn from_create_params(kind: WorkerKind, params: &Value) -> Result<Self, WorkerError> {
        let input = required(params, "inputOpt")?;
        match kind {
            WorkerKind::Model => Ok(LaunchParams::Model {
                input,
                aggregation: params.get("aggOpt").filter(|v| !v.is_null()).cloned(),
                model: required(params, "modelOpt")?,
            }),
            WorkerKind::ParamFinder => Ok(LaunchParams::ParamFinder { input }),
        }
    }

    pub fn kind(&self) -> WorkerKind {
        match self {
            LaunchParams::Model { .. } => WorkerKind::Model,
            LaunchParams::ParamFinder { .. } => WorkerKind::ParamFinder,
        }
    }

    /// Flags appended after the launch command's own args.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        match self {
            LaunchParams::Model {
                input,
                aggregation,
                model,
            } => {
                push_flag(&mut args, "--input", input);
                if let Some(aggregation) = aggregation {
                    push_flag(&mut args, "--agg", aggregation);
                }
                push_flag(&mut args, "--model", model);
            }
            LaunchParams::ParamFinder { input } => push_flag(&mut args, "--input", input),
        }
        args
    }
}

fn required(params: &Value, key: &str) -> Result<Value, WorkerError> {
    params
        .get(key)
        .filter(|v| !v.is_null())
        .cloned()
        .ok_or_else(|| WorkerError::InvalidRequest(format!("missing create param '{key}'")))
}

fn push_flag(args: &mut Vec<String>, flag: &str, value: &Value) {
    args.push(flag.to_string());
    args.push(serialize_blob(value));
}

/// Strings are taken as already-serialized JSON.
fn serialize_blob(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_model_args_with_aggregation() {
        let params = json!({
            "inputOpt": {"csv": "/tmp/a.csv", "rowOffset": 1},
            "aggOpt": {"windowSize": 300},
            "modelOpt": {"min": 0, "max": 10},
        });
        let launch = LaunchParams::from_create_params(WorkerKind::Model, &params).unwrap();
        assert_eq!(
            launch.to_args(),
            vec![
                "--input",
                r#"{"csv":"/tmp/a.csv","rowOffset":1}"#,
                "--agg",
                r#"{"windowSize":300}"#,
                "--model",
                r#"{"max":10,"min":0}"#,
            ]
        );
    }

    #[test]
    fn test_model_args_without_aggregation() {
        let params = json!({"inputOpt": {}, "aggOpt": null, "modelOpt": {}});
        let launch = LaunchParams::from_create_params(WorkerKind::Model, &params).unwrap();
        assert_eq!(launch.to_args(), vec!["--input", "{}", "--model", "{}"]);
    }

    #[test]
    fn test_string_blobs_pass_through() {
        let params = json!({"inputOpt": "{\"csv\": \"x.csv\"}"});
        let launch = LaunchParams::from_create_params(WorkerKind::ParamFinder, &params).unwrap();
        assert_eq!(launch.to_args(), vec!["--input", "{\"csv\": \"x.csv\"}"]);
        assert_eq!(launch.kind(), WorkerKind::ParamFinder);
    }

    #[test]
    fn test_missing_model_opt() {
        let params = json!({"inputOpt": {}});
        let err = LaunchParams::from_create_params(WorkerKind::Model, &params).unwrap_err();
        assert!(matches!(err, WorkerError::InvalidRequest(ref m) if m.contains("modelOpt")));
    }

    #[test]
    fn test_missing_params_entirely() {
        let err =
            LaunchParams::from_create_params(WorkerKind::ParamFinder, &Value::Null).unwrap_err();
        assert!(matches!(err, WorkerError::InvalidRequest(_)));
    }
}
