use thiserror::Error;

/// Central error type for the observation sync engine
#[derive(Debug, Error)]
pub enum AppError {
    /// Missing required linkage or malformed input; fatal, never retried
    #[error("Validation error: {0}")]
    Validation(String),
    /// A record write without a key
    #[error("Record has no uuid")]
    MissingKey,
    /// Transport failure before any response arrived; transient
    #[error("Network error: {0}")]
    Network(String),
    /// Remote 5xx; transient
    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },
    /// Remote 4xx other than 401; triggers compensation
    #[error("Client error {status}: {message}")]
    Client { status: u16, message: String },
    /// Remote 401 or no usable credential; pauses the drain
    #[error("Stale or missing credentials")]
    Auth,
    /// Impossible state reached; a programmer or data-integrity bug
    #[error("Consistency error: {0}")]
    Consistency(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Photo store error: {0}")]
    Photo(#[from] photo_store::PhotoStoreError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),
}

impl AppError {
    /// Errors worth retrying by re-queueing the same request
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::Network(_) | AppError::Server { .. })
    }
}
