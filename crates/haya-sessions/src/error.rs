use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid session id: {0}")]
    InvalidId(String),

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("corrupt entry in session {session} at line {line}")]
    Corrupt { session: String, line: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<SessionError> for haya_core::HayaError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::InvalidId(id) => {
                haya_core::HayaError::Validation(format!("invalid session id: {id}"))
            }
            SessionError::NotFound(id) => {
                haya_core::HayaError::NotFound(format!("session {id}"))
            }
            SessionError::Corrupt { session, line } => {
                haya_core::HayaError::CorruptSession { session, line }
            }
            SessionError::Io(e) => haya_core::HayaError::Io(e),
            SessionError::Serialization(e) => haya_core::HayaError::Serialization(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
