use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures reported by a [`crate::platform::Platform`] implementation.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("{resource} not found")]
    NotFound { resource: String },
    #[error("rate limit exceeded")]
    RateLimited { reset_at: Option<u64> },
    #[error("platform under maintenance: {message}")]
    Maintenance { message: String },
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },
    #[error("request rejected with status {status}: {message}")]
    Client { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("I/O error on {}: {message}", path.display())]
    Io { path: PathBuf, message: String },
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl PlatformError {
    pub fn not_found(resource: impl Into<String>) -> Self {
        PlatformError::NotFound {
            resource: resource.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, PlatformError::NotFound { .. })
    }
}

impl From<reqwest::Error> for PlatformError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            PlatformError::Decode(err.to_string())
        } else {
            PlatformError::Transport(err.to_string())
        }
    }
}

pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to read {}: {message}", path.display())]
    Io { path: PathBuf, message: String },
    #[error("YAML parse error in {}: {message}", path.display())]
    Yaml { path: PathBuf, message: String },
    #[error("JSON parse error in {}: {message}", path.display())]
    Json { path: PathBuf, message: String },
    #[error("job file must be JSON or YAML: {}", path.display())]
    UnsupportedJobFormat { path: PathBuf },
    #[error("invalid document {label}: {message}")]
    InvalidDocument { label: String, message: String },
    #[error("project not found: {project}")]
    ProjectNotFound { project: String },
    #[error("task {task_id} still {status} after waiting {waited:?}")]
    Timeout {
        task_id: String,
        status: String,
        waited: Duration,
    },
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl RunnerError {
    pub(crate) fn io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        RunnerError::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }

    pub(crate) fn invalid(label: impl Into<String>, message: impl Into<String>) -> Self {
        RunnerError::InvalidDocument {
            label: label.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RunnerError>;
