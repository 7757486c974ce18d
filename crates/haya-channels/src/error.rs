use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("unknown channel: {0}")]
    Unknown(String),

    #[error("channel {0} is not connected")]
    NotConnected(String),

    #[error("channel {channel} cannot route id '{id}'")]
    NotRouted { channel: String, id: String },

    #[error("channel {channel} failed to start: {reason}")]
    Start { channel: String, reason: String },

    #[error("channel {channel} send failed: {reason}")]
    Send { channel: String, reason: String },
}
