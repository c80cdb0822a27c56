use std::path::PathBuf;

use thiserror::Error;

/// Run-level errors. Anything surfacing as a `BenchError` from the dispatcher
/// stops the whole run.
#[derive(Debug, Error)]
pub enum BenchError {
    #[error("Failed to persist result for {job_id}: {source}")]
    SinkWrite {
        job_id: String,
        #[source]
        source: SinkError,
    },

    #[error("Worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    #[error("Result stream closed with {missing} job(s) unaccounted for")]
    MissingResults { missing: usize },
}

/// Failures raised by an inference client for a single job attempt.
///
/// The retry policy classifies these by status code and message text, so
/// variants only need to carry enough context to be matched on.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("API returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Failed to parse API response: {0}")]
    Parse(String),

    #[error("{0}")]
    Other(String),
}

impl InferenceError {
    /// Numeric status code, when the failure came with one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            InferenceError::Status { status, .. } => Some(*status),
            InferenceError::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Renders the error and its source chain, one frame per line, keeping at
    /// most `limit` frames.
    pub fn trace(&self, limit: usize) -> String {
        let mut frames = vec![self.to_string()];
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            if frames.len() >= limit {
                break;
            }
            frames.push(format!("caused by: {err}"));
            source = err.source();
        }
        frames.join("\n")
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode result: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Result sink lock poisoned")]
    Poisoned,
}

impl SinkError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SinkError::Io {
            path: path.into(),
            source,
        }
    }
}
