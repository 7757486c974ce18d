use serde::{Deserialize, Serialize};

/// Outcome of checking an inbound sender against the configured mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderDecision {
    Allowed,
    Denied,
    /// Pairing mode only: the sender is unknown and a code was issued.
    PairingRequired { code: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovedSender {
    pub channel: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub approved_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingCode {
    pub code: String,
    pub channel: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub created_at: i64,
    pub expires_at: i64,
}

impl PairingCode {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at
    }
}
