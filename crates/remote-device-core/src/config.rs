//! Engine configuration, as handed over by the loader.

use serde::{Deserialize, Serialize};

use crate::task::TaskDefinition;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,
}

/// Device connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Target to connect to at startup.
    pub address: Option<String>,
    pub heartbeat_interval_secs: u64,
    /// No-op command issued by the heartbeat.
    pub heartbeat_command: String,
    /// Start the reconnection loop if the startup connect fails.
    pub reconnect_on_start: bool,
    /// Override for the transport executable.
    pub adb_path: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: None,
            heartbeat_interval_secs: 5,
            heartbeat_command: "echo ping".into(),
            reconnect_on_start: true,
            adb_path: None,
        }
    }
}

/// Observer-facing server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3000".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"device":{"address":"192.168.1.40:5555"},"tasks":[{"name":"morning","schedule":"0 30 7 * * *","commands":[{"type":"wake"}]}]}"#,
        )
        .unwrap();
        assert_eq!(config.device.address.as_deref(), Some("192.168.1.40:5555"));
        assert_eq!(config.device.heartbeat_interval_secs, 5);
        assert!(config.device.reconnect_on_start);
        assert_eq!(config.server.bind, "127.0.0.1:3000");
        assert_eq!(config.tasks.len(), 1);
    }
}
