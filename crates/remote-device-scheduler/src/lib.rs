//! Cron-driven task scheduling.
//!
//! Provides:
//! - `CronSchedule` - Six-field cron parsing and next-run computation
//! - `CronTrigger` - A cancellable recurring timer
//! - `TaskScheduler` - Task registry with runtime CRUD and run history

pub mod cron;
pub mod registry;
pub mod trigger;

pub use cron::{CronError, CronSchedule};
pub use registry::{HISTORY_CAPACITY, SchedulerError, TaskDetails, TaskScheduler, TaskSummary};
pub use trigger::{CronTrigger, TriggerCallback};
