//! Reminder helpers — reminders are one-shot cron jobs.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::error::{Result, SchedulerError};

pub const ACTION_SEND_REMINDER: &str = "send_reminder";
pub const ACTION_PRUNE_SESSIONS: &str = "prune_sessions";

/// Convert a future ISO-8601 timestamp to a one-shot cron expression
/// (minute hour day month *). Past or unparseable timestamps are rejected.
pub fn iso_to_cron_expression(iso: &str) -> Result<String> {
    let when = DateTime::parse_from_rfc3339(iso)
        .map_err(|_| SchedulerError::BadTimestamp(iso.to_string()))?
        .with_timezone(&Utc);
    if when <= Utc::now() {
        return Err(SchedulerError::BadTimestamp(iso.to_string()));
    }
    let local = when.with_timezone(&chrono::Local);
    Ok(format!(
        "{} {} {} {} *",
        local.minute(),
        local.hour(),
        local.day(),
        local.month()
    ))
}

/// Metadata a `send_reminder` job carries: the message to deliver, the
/// original timestamp, and the channel/conversation to deliver it to.
pub fn reminder_metadata(
    message: &str,
    datetime_iso: &str,
    channel: &str,
    channel_id: &str,
) -> BTreeMap<String, serde_json::Value> {
    let mut meta = BTreeMap::new();
    meta.insert("message".into(), serde_json::json!(message));
    meta.insert("datetime".into(), serde_json::json!(datetime_iso));
    meta.insert("channel".into(), serde_json::json!(channel));
    meta.insert("channel_id".into(), serde_json::json!(channel_id));
    meta
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn future_timestamp_becomes_one_shot_cron() {
        let future = Utc::now() + chrono::Duration::hours(2);
        let expr = iso_to_cron_expression(&future.to_rfc3339()).unwrap();
        let parsed = crate::cron::CronExpr::parse(&expr).unwrap();
        assert!(parsed.is_one_shot_shape());
    }

    #[test]
    fn past_and_invalid_timestamps_rejected() {
        let past = Utc::now() - chrono::Duration::hours(1);
        assert!(matches!(
            iso_to_cron_expression(&past.to_rfc3339()),
            Err(SchedulerError::BadTimestamp(_))
        ));
        assert!(iso_to_cron_expression("next tuesday").is_err());
    }
}
