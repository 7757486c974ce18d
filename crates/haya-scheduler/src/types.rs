use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A persisted cron job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJobEntry {
    /// UUID v4 string.
    pub id: String,
    /// Human-readable label; seed jobs merge by name.
    pub name: String,
    /// Standard 5-field cron expression.
    pub schedule: String,
    /// Action name consulted by the dispatcher.
    pub action: String,
    pub enabled: bool,
    /// Arbitrary payload forwarded to the action handler.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<i64>,
}
