use std::path::PathBuf;

use thiserror::Error;

/// A stage or query command that could not be started at all.
#[derive(Debug, Error)]
#[error("failed to launch `{program}`: {source}")]
pub struct LaunchError {
    pub program: String,
    #[source]
    pub source: std::io::Error,
}

/// One-shot command execution (probes, `ollama list`, GPU queries).
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("`{program}` did not finish within {timeout_ms} ms")]
    Timeout { program: String, timeout_ms: u64 },

    #[error("`{program}` exited with {status}: {stderr}")]
    Failed { program: String, status: String, stderr: String },

    #[error("i/o error while waiting for `{program}`: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("run `{0}` not found")]
    NotFound(String),

    #[error("invalid run label `{0}`")]
    InvalidLabel(String),

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode metrics document: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}

/// A telemetry query result that could not be turned into a sample.
#[derive(Debug, Error, PartialEq)]
pub enum SampleError {
    #[error("empty query output")]
    Empty,

    #[error("expected 4 fields, got {0}")]
    FieldCount(usize),

    #[error("field `{field}` is not a number: {value:?}")]
    NotANumber { field: &'static str, value: String },
}

/// Errors that end a run before any stage executes.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("run `{0}` is already in progress")]
    AlreadyRunning(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_error_names_program() {
        let err = LaunchError {
            program: "sysbench".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(err.to_string().contains("sysbench"));
    }

    #[test]
    fn not_found_mentions_label() {
        let err = StoreError::NotFound("bench1".into());
        assert_eq!(err.to_string(), "run `bench1` not found");
    }
}
