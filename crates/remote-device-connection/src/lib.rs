//! Single-session device connection management.
//!
//! Provides:
//! - `ConnectionManager` - Connect/disconnect/execute, heartbeat, reconnection loop
//! - `AdbTransport` - `DeviceTransport` over the `adb` client
//! - Reconnection backoff sequence

pub mod adb;
pub mod backoff;
pub mod manager;

pub use adb::AdbTransport;
pub use backoff::{RECONNECT_BACKOFF_SECS, reconnect_delay};
pub use manager::{ConnectionManager, ConnectionSettings, ConnectionState, ConnectionStatus};
