use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Remote backend error: http {status}; {message}")]
    Remote { status: u16, message: String },
    #[error("Credential error: {0}")]
    Credential(String),
    #[error("Signature error: {0}")]
    Signature(String),
}

impl InfraError {
    /// Errors after which the active backend should be abandoned for local storage.
    pub fn is_failover(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Remote { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            _ => false,
        }
    }
}
