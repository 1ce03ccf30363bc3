//! Error types for the cachet server

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while serving a request or running a process
#[derive(Error, Debug)]
pub enum Error {
    /// Resolved path escapes the sandbox root
    #[error("Forbidden: {path}")]
    Forbidden { path: String },

    /// Nothing exists at the requested path
    #[error("Not found: {path}")]
    NotFound { path: String },

    /// Read or stat failure other than not-found
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected fault anywhere in the pipeline
    #[error("Internal error: {0}")]
    Internal(String),

    /// Malformed request line or headers
    #[error("Malformed request: {0}")]
    BadRequest(String),

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("Request too large")]
    RequestTooLarge,

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Dispatcher/worker channel failure
    #[error("Handoff error: {0}")]
    Handoff(String),
}

impl Error {
    /// HTTP status code this error is answered with.
    pub fn status(&self) -> u16 {
        match self {
            Error::Forbidden { .. } => 403,
            Error::NotFound { .. } => 404,
            Error::BadRequest(_) => 400,
            Error::MethodNotAllowed(_) => 405,
            Error::RequestTooLarge => 413,
            Error::Io(_) | Error::Internal(_) | Error::Config(_) | Error::Handoff(_) => 500,
        }
    }

    /// Classify a filesystem error for `path`: not-found stays distinct
    /// from other I/O failures.
    pub fn from_fs(err: std::io::Error, path: &str) -> Self {
        // ENOTDIR: a path component below a regular file
        if err.kind() == std::io::ErrorKind::NotFound || err.raw_os_error() == Some(libc::ENOTDIR) {
            return Error::NotFound {
                path: path.to_string(),
            };
        }
        Error::Io(err)
    }
}
