//! `haya-scheduler` — cron store with in-memory timers.
//!
//! Jobs persist in a JSON file next to the config
//! (`<config>.cron.json`). Each enabled job holds a standard 5-field cron
//! expression; the service arms a one-shot Tokio timer per job, dispatches
//! the registered action handler on fire, and re-arms. Reminders are
//! one-shot jobs removed after their single fire.

pub mod cron;
pub mod error;
pub mod reminder;
pub mod service;
pub mod store;
pub mod types;

pub use cron::CronExpr;
pub use error::{Result, SchedulerError};
pub use reminder::{iso_to_cron_expression, reminder_metadata, ACTION_PRUNE_SESSIONS, ACTION_SEND_REMINDER};
pub use service::SchedulerService;
pub use store::CronStore;
pub use types::CronJobEntry;
