//! Core abstractions for remote device orchestration.
//!
//! This crate provides the shared building blocks:
//! - `EventBroadcaster` - Channel-routed pub/sub with recent-history rings
//! - `TaskDefinition`, `CommandSpec`, `ExecutionResult` - Task data model
//! - `DeviceTransport`, `CommandChannel`, `DeviceCommand` - Collaborator traits
//! - `ErrorCode` - Stable codes carried by every public failure

pub mod broadcaster;
pub mod config;
pub mod error;
pub mod event;
pub mod task;
pub mod traits;

pub use broadcaster::{BroadcastError, EventBroadcaster, ObserverHandle, ObserverId};
pub use config::{DeviceConfig, EngineConfig, ServerConfig};
pub use error::{Coded, DeviceError, ErrorBody, ErrorCode, TransportError};
pub use event::{Channel, Event, LogEntry, LogLevel, LogQuery, topics};
pub use task::{
    CommandOutcome, CommandSpec, ExecutionResult, ExecutionStatus, HistoryEntry, TaskDefinition,
};
pub use traits::{CommandChannel, CommandOutput, DeviceCommand, DeviceTransport, SessionHandle};
