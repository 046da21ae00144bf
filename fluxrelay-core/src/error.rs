//! Error types for FluxRelay

use thiserror::Error;

/// Result type alias for FluxRelay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// FluxRelay error types
#[derive(Error, Debug)]
pub enum RelayError {
    /// Malformed request (missing parameter, bad body)
    #[error("{0}")]
    BadRequest(String),

    /// Point is missing tags required by its partition key
    #[error("partition key validation failed, missing tags: {}", missing.join(", "))]
    PartitionValidation { missing: Vec<String> },

    /// InfluxQL or admin statement parse error
    #[error("error parsing query: {0}")]
    Parse(String),

    /// Statement or function the cluster cannot serve
    #[error("{0}")]
    Unsupported(String),

    /// Bad or missing credentials
    #[error("authorization failed: {0}")]
    Unauthorized(String),

    /// Authenticated but lacking privileges
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Object already exists
    #[error("{0}")]
    Conflict(String),

    /// Object does not exist
    #[error("{0}")]
    NotFound(String),

    /// Per-backend retry buffer cannot admit the write
    #[error("retry buffer full for {0}")]
    BufferFull(String),

    /// No replica could serve the request
    #[error("no healthy replica: {0}")]
    NoHealthyReplica(String),

    /// Metadata store failure
    #[error("metadata store error: {0}")]
    Meta(String),

    /// TSDB answered with an error
    #[error("tsdb error ({status}): {message}")]
    Tsdb { status: u16, message: String },

    /// HTTP transport failure
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Data corruption detected in a recovery log
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// HTTP status code used when this error is surfaced to a client
    pub fn status_code(&self) -> u16 {
        match self {
            RelayError::BadRequest(_)
            | RelayError::PartitionValidation { .. }
            | RelayError::Parse(_)
            | RelayError::Unsupported(_) => 400,
            RelayError::Unauthorized(_) => 401,
            RelayError::Forbidden(_) => 403,
            RelayError::NotFound(_) => 404,
            RelayError::Conflict(_) => 409,
            RelayError::BufferFull(_) | RelayError::NoHealthyReplica(_) => 503,
            RelayError::Tsdb { status, .. } if (400..500).contains(status) => 400,
            _ => 500,
        }
    }

    /// Check if a background loop should retry after this error
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayError::Io(_) | RelayError::Http(_) | RelayError::Meta(_) => true,
            RelayError::Tsdb { status, .. } => *status >= 500,
            RelayError::BufferFull(_) | RelayError::NoHealthyReplica(_) => true,
            _ => false,
        }
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            RelayError::Corruption(_) | RelayError::ChecksumMismatch { .. }
        )
    }
}
