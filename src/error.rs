//! Error types shared by the repositories, cache, and task pipeline.
//!
//! Library code returns [`Result`]; the `nim` binary wraps these in
//! `anyhow` at the edge. [`NimError::kind`] gives the taxonomy class name
//! that prefixes a failed receipt's message.

use thiserror::Error;

/// Errors raised by the image maker.
#[derive(Error, Debug)]
pub enum NimError {
    /// Missing, expired, or rejected session key.
    #[error("{0}")]
    Authorization(String),

    /// A recomputed digest does not match the declared one.
    #[error("Image {id} uncompressed SHA-256 digest {actual} does not match {expected}")]
    Integrity {
        id: String,
        expected: String,
        actual: String,
    },

    /// The customization script was rejected before execution.
    #[error("{script}{}: {message}", .line.map(|l| format!(" line {}", l)).unwrap_or_default())]
    Script {
        script: String,
        line: Option<usize>,
        message: String,
    },

    /// The external customization tool exited unsuccessfully.
    #[error("customization tool {}: {output}", .code.map(|c| format!("returned non-zero exit code {}", c)).unwrap_or_else(|| "failed".to_string()))]
    ToolFailed { code: Option<i32>, output: String },

    /// Repository or cache storage failure.
    #[error("{0}")]
    Storage(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP transport or unexpected HTTP status.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Unsupported or corrupt compression stream.
    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Task cancelled")]
    Cancelled,
}

impl NimError {
    /// Taxonomy class name for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            NimError::Authorization(_) => "AuthorizationError",
            NimError::Integrity { .. } => "IntegrityError",
            NimError::Script { .. } | NimError::ToolFailed { .. } => "ExternalToolError",
            NimError::Storage(_)
            | NimError::Io(_)
            | NimError::Json(_)
            | NimError::Http(_)
            | NimError::Compression(_) => "StorageError",
            NimError::NotFound(_) => "NotFound",
            NimError::InvalidArgument(_) => "InvalidArgument",
            NimError::Cancelled => "Cancelled",
        }
    }

    pub(crate) fn storage(context: impl std::fmt::Display, e: impl std::fmt::Display) -> Self {
        NimError::Storage(format!("{}: {}", context, e))
    }
}

impl From<reqwest::Error> for NimError {
    fn from(e: reqwest::Error) -> Self {
        NimError::Http(e.to_string())
    }
}

/// Result type alias for image maker operations.
pub type Result<T> = std::result::Result<T, NimError>;
