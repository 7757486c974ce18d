use thiserror::Error;

#[derive(Debug, Error)]
pub enum SenderError {
    #[error("pairing code not found or expired: {0}")]
    CodeNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SenderError>;
