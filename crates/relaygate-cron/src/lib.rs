//! Persistent cron scheduler: job records, atomic JSON persistence, and the
//! dispatch loop that injects synthetic inbound messages on schedule.

pub mod service;
pub mod types;

pub use service::CronService;
pub use types::{CronJob, CronMode, CronPayload, CronSchedule, ScheduleKind};
