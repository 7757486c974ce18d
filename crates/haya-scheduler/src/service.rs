//! Timer service: one armed one-shot timer per enabled job.
//!
//! On fire the registered dispatcher runs, the job's last_run is recorded,
//! and the timer re-arms from the new now. One-shot jobs (reminders) are
//! removed after their single fire instead of re-arming.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cron::CronExpr;
use crate::reminder::ACTION_SEND_REMINDER;
use crate::store::CronStore;
use crate::types::CronJobEntry;

type ActionHandler =
    Arc<dyn Fn(CronJobEntry) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

pub struct SchedulerService {
    store: Arc<CronStore>,
    handler: RwLock<Option<ActionHandler>>,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl SchedulerService {
    pub fn new(store: Arc<CronStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            handler: RwLock::new(None),
            timers: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &Arc<CronStore> {
        &self.store
    }

    /// Register the single action dispatcher consulted by name.
    pub fn on_action<F, Fut>(&self, handler: F)
    where
        F: Fn(CronJobEntry) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let wrapped: ActionHandler = Arc::new(move |job| Box::pin(handler(job)));
        *self.handler.write().unwrap() = Some(wrapped);
    }

    /// Arm a timer for every enabled job. Jobs arm in id order so identical
    /// fire times dispatch deterministically.
    pub fn start(self: &Arc<Self>) {
        let mut jobs = self.store.list();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        let enabled = jobs.iter().filter(|j| j.enabled).count();
        info!(jobs = jobs.len(), enabled, "scheduler starting");
        for job in jobs.into_iter().filter(|j| j.enabled) {
            self.arm(job);
        }
    }

    /// Abort every armed timer. Synchronous, idempotent.
    pub fn stop(&self) {
        let mut timers = self.timers.lock().unwrap();
        for (_, handle) in timers.drain() {
            handle.abort();
        }
        info!("scheduler stopped");
    }

    pub fn is_armed(&self, id: &str) -> bool {
        self.timers.lock().unwrap().contains_key(id)
    }

    /// Add a job to the store and arm it immediately.
    pub fn add_job(
        self: &Arc<Self>,
        name: &str,
        schedule: &str,
        action: &str,
        metadata: std::collections::BTreeMap<String, serde_json::Value>,
    ) -> crate::error::Result<CronJobEntry> {
        let job = self.store.add(name, schedule, action, metadata)?;
        self.arm(job.clone());
        Ok(job)
    }

    /// Remove a job from the store and disarm its timer.
    pub fn remove_job(&self, id: &str) -> crate::error::Result<()> {
        self.store.remove(id)?;
        if let Some(handle) = self.timers.lock().unwrap().remove(id) {
            handle.abort();
        }
        Ok(())
    }

    fn arm(self: &Arc<Self>, job: CronJobEntry) {
        let expr = match CronExpr::parse(&job.schedule) {
            Ok(e) => e,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "unschedulable job, not arming");
                return;
            }
        };

        let service = Arc::clone(self);
        let job_id = job.id.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Some(next) = expr.next_fire(chrono::Utc::now()) else {
                    warn!(job_id = %job.id, "no future fire time, disarming");
                    break;
                };
                let wait = (next - chrono::Utc::now())
                    .to_std()
                    .unwrap_or_default();
                debug!(job_id = %job.id, in_secs = wait.as_secs(), "timer armed");
                tokio::time::sleep(wait).await;

                let now_ms = chrono::Utc::now().timestamp_millis();
                info!(job_id = %job.id, name = %job.name, action = %job.action, "job fired");
                let handler = service.handler.read().unwrap().clone();
                match handler {
                    Some(h) => h(job.clone()).await,
                    None => warn!(job_id = %job.id, "job fired with no action handler"),
                }
                let _ = service.store.mark_ran(&job.id, now_ms);

                // reminders fire once, then leave the store
                let one_shot = job.action == ACTION_SEND_REMINDER || expr.is_one_shot_shape();
                if one_shot {
                    if let Err(e) = service.store.remove(&job.id) {
                        warn!(job_id = %job.id, error = %e, "one-shot cleanup failed");
                    }
                    break;
                }
            }
            service.timers.lock().unwrap().remove(&job.id);
        });

        self.timers.lock().unwrap().insert(job_id, handle);
    }
}

impl Drop for SchedulerService {
    fn drop(&mut self) {
        self.stop();
    }
}
