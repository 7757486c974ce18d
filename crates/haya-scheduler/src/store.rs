//! Persistent cron store: a JSON array in `<config>.cron.json`.
//!
//! Saves are atomic (write to temp, then rename). Config-seeded jobs merge
//! in by name at load without overwriting persisted state. All mutation
//! happens under one lock.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::{info, warn};
use uuid::Uuid;

use haya_core::config::CronJobSeed;

use crate::cron::CronExpr;
use crate::error::{Result, SchedulerError};
use crate::types::CronJobEntry;

pub struct CronStore {
    path: PathBuf,
    jobs: Mutex<Vec<CronJobEntry>>,
}

impl CronStore {
    /// Load the store file and merge config seeds in by name.
    pub fn load(path: impl Into<PathBuf>, seeds: &[CronJobSeed]) -> Result<Self> {
        let path = path.into();
        let mut jobs: Vec<CronJobEntry> = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "cron store unreadable, starting empty");
                Vec::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let now = chrono::Utc::now().timestamp_millis();
        let mut added = 0;
        for seed in seeds {
            if jobs.iter().any(|j| j.name == seed.name) {
                continue;
            }
            if let Err(e) = CronExpr::parse(&seed.schedule) {
                warn!(name = %seed.name, error = %e, "skipping seed job with bad schedule");
                continue;
            }
            jobs.push(CronJobEntry {
                id: Uuid::new_v4().to_string(),
                name: seed.name.clone(),
                schedule: seed.schedule.clone(),
                action: seed.action.clone(),
                enabled: seed.enabled,
                metadata: seed.metadata.clone(),
                created_at: now,
                updated_at: now,
                last_run: None,
            });
            added += 1;
        }

        let store = Self {
            path,
            jobs: Mutex::new(jobs),
        };
        if added > 0 {
            info!(added, "cron seeds merged from config");
            store.save()?;
        }
        Ok(store)
    }

    pub fn list(&self) -> Vec<CronJobEntry> {
        self.jobs.lock().unwrap().clone()
    }

    pub fn get(&self, id: &str) -> Result<CronJobEntry> {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .find(|j| j.id == id)
            .cloned()
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })
    }

    /// Validate the schedule and append a new job.
    pub fn add(
        &self,
        name: &str,
        schedule: &str,
        action: &str,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Result<CronJobEntry> {
        CronExpr::parse(schedule)?;
        let now = chrono::Utc::now().timestamp_millis();
        let job = CronJobEntry {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            schedule: schedule.to_string(),
            action: action.to_string(),
            enabled: true,
            metadata,
            created_at: now,
            updated_at: now,
            last_run: None,
        };
        self.jobs.lock().unwrap().push(job.clone());
        self.save()?;
        info!(job_id = %job.id, name, "cron job added");
        Ok(job)
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        {
            let mut jobs = self.jobs.lock().unwrap();
            let before = jobs.len();
            jobs.retain(|j| j.id != id);
            if jobs.len() == before {
                return Err(SchedulerError::JobNotFound { id: id.to_string() });
            }
        }
        self.save()?;
        info!(job_id = %id, "cron job removed");
        Ok(())
    }

    pub fn mark_ran(&self, id: &str, at_ms: i64) -> Result<()> {
        {
            let mut jobs = self.jobs.lock().unwrap();
            let Some(job) = jobs.iter_mut().find(|j| j.id == id) else {
                return Err(SchedulerError::JobNotFound { id: id.to_string() });
            };
            job.last_run = Some(at_ms);
            job.updated_at = at_ms;
        }
        self.save()
    }

    /// Atomic save: serialize to a temp file, then rename over the store.
    fn save(&self) -> Result<()> {
        let jobs = self.jobs.lock().unwrap().clone();
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&jobs)?)?;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
