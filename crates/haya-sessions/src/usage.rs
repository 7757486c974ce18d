//! Per-request usage records with simple rollups.
//!
//! One JSONL file per UTC day under `<data>/usage/`. Aggregation reads the
//! files back and groups in memory — the volumes here are one user's chat
//! traffic, not telemetry.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub session_id: String,
    pub model: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    #[serde(default)]
    pub cost_usd: f64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct UsageTotals {
    pub requests: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
}

impl UsageTotals {
    fn add(&mut self, r: &UsageRecord) {
        self.requests += 1;
        self.tokens_in += r.tokens_in;
        self.tokens_out += r.tokens_out;
        self.cost_usd += r.cost_usd;
    }
}

pub struct UsageTracker {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl UsageTracker {
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = data_dir.into().join("usage");
        fs::create_dir_all(&dir)?;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn record(&self, record: &UsageRecord) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let day = DateTime::<Utc>::from_timestamp_millis(record.timestamp)
            .unwrap_or_else(Utc::now)
            .format("%Y-%m-%d");
        let path = self.dir.join(format!("{day}.jsonl"));
        let existed = path.exists();
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if !existed {
            file.set_permissions(fs::Permissions::from_mode(0o600))?;
        }
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        file.write_all(&line)?;
        debug!(session = %record.session_id, model = %record.model, "usage recorded");
        Ok(())
    }

    /// All records, optionally filtered by session and a `since` bound.
    pub fn query(&self, session_id: Option<&str>, since_ms: Option<i64>) -> Result<Vec<UsageRecord>> {
        let mut records = Vec::new();
        if !self.dir.exists() {
            return Ok(records);
        }
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            for line in fs::read_to_string(&path)?.lines() {
                let Ok(r) = serde_json::from_str::<UsageRecord>(line) else {
                    continue;
                };
                if session_id.is_some_and(|s| s != r.session_id) {
                    continue;
                }
                if since_ms.is_some_and(|t| r.timestamp < t) {
                    continue;
                }
                records.push(r);
            }
        }
        records.sort_by_key(|r| r.timestamp);
        Ok(records)
    }

    pub fn totals_by_session(&self) -> Result<BTreeMap<String, UsageTotals>> {
        self.rollup(|r| r.session_id.clone())
    }

    pub fn totals_by_model(&self) -> Result<BTreeMap<String, UsageTotals>> {
        self.rollup(|r| r.model.clone())
    }

    pub fn totals_by_day(&self) -> Result<BTreeMap<String, UsageTotals>> {
        self.rollup(|r| {
            DateTime::<Utc>::from_timestamp_millis(r.timestamp)
                .unwrap_or_else(Utc::now)
                .format("%Y-%m-%d")
                .to_string()
        })
    }

    fn rollup(&self, key: impl Fn(&UsageRecord) -> String) -> Result<BTreeMap<String, UsageTotals>> {
        let mut out: BTreeMap<String, UsageTotals> = BTreeMap::new();
        for r in self.query(None, None)? {
            out.entry(key(&r)).or_default().add(&r);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(session: &str, model: &str, tokens_in: u64) -> UsageRecord {
        UsageRecord {
            session_id: session.into(),
            model: model.into(),
            tokens_in,
            tokens_out: tokens_in / 2,
            cost_usd: 0.001,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    #[test]
    fn record_and_query_by_session() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = UsageTracker::new(dir.path()).unwrap();
        tracker.record(&record("a", "m1", 100)).unwrap();
        tracker.record(&record("b", "m1", 200)).unwrap();

        let only_a = tracker.query(Some("a"), None).unwrap();
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].tokens_in, 100);
    }

    #[test]
    fn rollups_group_correctly() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = UsageTracker::new(dir.path()).unwrap();
        tracker.record(&record("a", "m1", 100)).unwrap();
        tracker.record(&record("a", "m2", 50)).unwrap();
        tracker.record(&record("b", "m1", 10)).unwrap();

        let by_session = tracker.totals_by_session().unwrap();
        assert_eq!(by_session["a"].requests, 2);
        assert_eq!(by_session["a"].tokens_in, 150);

        let by_model = tracker.totals_by_model().unwrap();
        assert_eq!(by_model["m1"].requests, 2);

        let by_day = tracker.totals_by_day().unwrap();
        assert_eq!(by_day.values().map(|t| t.requests).sum::<u64>(), 3);
    }
}
