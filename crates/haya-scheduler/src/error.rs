use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid cron schedule: {0}")]
    InvalidSchedule(String),

    #[error("job not found: {id}")]
    JobNotFound { id: String },

    #[error("timestamp is in the past or invalid: {0}")]
    BadTimestamp(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<SchedulerError> for haya_core::HayaError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::JobNotFound { id } => {
                haya_core::HayaError::NotFound(format!("cron job {id}"))
            }
            SchedulerError::InvalidSchedule(s) | SchedulerError::BadTimestamp(s) => {
                haya_core::HayaError::Validation(s)
            }
            SchedulerError::Io(e) => haya_core::HayaError::Io(e),
            SchedulerError::Serialization(e) => haya_core::HayaError::Serialization(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
