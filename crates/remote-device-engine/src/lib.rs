//! Orchestration engine for a single remote device.
//!
//! `Engine` owns one `EventBroadcaster`, one `ConnectionManager`, one
//! `TaskExecutor` and one `TaskScheduler`, and exposes the operations the
//! observer-facing transport calls into.

pub mod engine;

pub use engine::{Engine, EngineError, EngineStatus};
pub use remote_device_connection::{ConnectionState, ConnectionStatus};
pub use remote_device_scheduler::{TaskDetails, TaskSummary};
