//! Stable error codes shared by every public operation.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable, machine-readable error code.
///
/// Codes are part of the public contract: CLI and API consumers match on
/// them, so variants are only ever added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// A connection attempt to the device failed.
    ConnectionFailed,
    /// An operation needed a live session and there was none.
    DeviceNotConnected,
    /// No task with the given name is registered.
    TaskNotFound,
    /// A task with the given name is already registered.
    TaskAlreadyExists,
    /// The task definition is malformed (e.g. missing name).
    InvalidTask,
    /// The cron expression failed validation.
    InvalidSchedule,
    /// A command type has no registered implementation.
    UnknownCommand,
    /// An observer asked for a channel outside the allow-list.
    UnsupportedChannel,
    /// A request could not be parsed.
    InvalidRequest,
    /// Anything unexpected.
    Internal,
}

impl ErrorCode {
    /// The wire representation of the code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionFailed => "CONNECTION_FAILED",
            Self::DeviceNotConnected => "DEVICE_NOT_CONNECTED",
            Self::TaskNotFound => "TASK_NOT_FOUND",
            Self::TaskAlreadyExists => "TASK_ALREADY_EXISTS",
            Self::InvalidTask => "INVALID_TASK",
            Self::InvalidSchedule => "INVALID_SCHEDULE",
            Self::UnknownCommand => "UNKNOWN_COMMAND",
            Self::UnsupportedChannel => "UNSUPPORTED_CHANNEL",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializable failure: a stable code plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorBody {
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Errors that carry a stable [`ErrorCode`].
pub trait Coded: std::error::Error {
    /// The stable code for this error.
    fn code(&self) -> ErrorCode;

    /// Code and display message, ready for presentation.
    fn to_body(&self) -> ErrorBody {
        ErrorBody::new(self.code(), self.to_string())
    }
}

/// Failure to connect to, or talk through, the device session.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeviceError {
    #[error("Failed to connect to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },
    #[error("Device not connected")]
    NotConnected,
    #[error("Command execution failed: {0}")]
    Command(String),
}

impl Coded for DeviceError {
    fn code(&self) -> ErrorCode {
        match self {
            Self::ConnectionFailed { .. } => ErrorCode::ConnectionFailed,
            Self::NotConnected => ErrorCode::DeviceNotConnected,
            Self::Command(_) => ErrorCode::Internal,
        }
    }
}

/// Error reported by a [`DeviceTransport`](crate::traits::DeviceTransport).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("Execute failed: {0}")]
    Execute(String),
    #[error("Transport executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
