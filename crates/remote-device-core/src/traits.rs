//! Collaborator traits: the device transport and command implementations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{DeviceError, TransportError};

/// Handle to one live transport session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle {
    pub id: Uuid,
    pub address: String,
}

impl SessionHandle {
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            address: address.into(),
        }
    }
}

/// Client for the wire-level command-execution channel.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Open a session to `address`.
    async fn connect(&self, address: &str) -> Result<SessionHandle, TransportError>;

    /// Release a session. Best-effort.
    async fn disconnect(&self, handle: &SessionHandle);

    /// Run a raw command on the session and return its output.
    async fn execute(&self, handle: &SessionHandle, command: &str)
    -> Result<String, TransportError>;
}

/// Something that can run raw commands on the device, typically the
/// connection manager's current session.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    async fn execute_command(&self, raw: &str) -> Result<String, DeviceError>;
}

/// Outcome reported by a command implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandOutput {
    #[must_use]
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            error: None,
        }
    }

    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: None,
            error: Some(error.into()),
        }
    }
}

/// A named remote action, looked up by its type tag.
#[async_trait]
pub trait DeviceCommand: Send + Sync {
    /// Type tag this implementation handles.
    fn name(&self) -> &str;

    /// Run the command against the device with its task parameters.
    async fn execute(&self, device: &dyn CommandChannel, params: &Value) -> CommandOutput;
}
