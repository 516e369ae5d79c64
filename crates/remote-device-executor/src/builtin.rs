//! Built-in device commands.

use std::time::Duration;

use async_trait::async_trait;
use remote_device_core::{CommandChannel, CommandOutput, DeviceCommand};
use serde_json::Value;

fn str_param<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Runs `params.command` verbatim.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellCommand;

#[async_trait]
impl DeviceCommand for ShellCommand {
    fn name(&self) -> &str {
        "shell"
    }

    async fn execute(&self, device: &dyn CommandChannel, params: &Value) -> CommandOutput {
        let Some(raw) = str_param(params, "command") else {
            return CommandOutput::failed("Missing 'command' parameter");
        };
        match device.execute_command(raw).await {
            Ok(output) => CommandOutput::ok(output),
            Err(e) => CommandOutput::failed(e.to_string()),
        }
    }
}

/// Sends a single key event.
#[derive(Debug, Clone, Copy)]
pub struct KeyEventCommand {
    name: &'static str,
    keycode: &'static str,
}

impl KeyEventCommand {
    pub const WAKE: Self = Self {
        name: "wake",
        keycode: "KEYCODE_WAKEUP",
    };
    pub const POWER_OFF: Self = Self {
        name: "power_off",
        keycode: "KEYCODE_SLEEP",
    };
}

#[async_trait]
impl DeviceCommand for KeyEventCommand {
    fn name(&self) -> &str {
        self.name
    }

    async fn execute(&self, device: &dyn CommandChannel, _params: &Value) -> CommandOutput {
        match device
            .execute_command(&format!("input keyevent {}", self.keycode))
            .await
        {
            Ok(_) => CommandOutput::ok(format!("Sent {}", self.keycode)),
            Err(e) => CommandOutput::failed(e.to_string()),
        }
    }
}

/// Launches an app by package name through its launcher intent.
#[derive(Debug, Clone, Copy, Default)]
pub struct LaunchAppCommand;

#[async_trait]
impl DeviceCommand for LaunchAppCommand {
    fn name(&self) -> &str {
        "launch_app"
    }

    async fn execute(&self, device: &dyn CommandChannel, params: &Value) -> CommandOutput {
        let Some(package) = str_param(params, "package") else {
            return CommandOutput::failed("Missing 'package' parameter");
        };
        let quoted = match shlex::try_quote(package) {
            Ok(q) => q,
            Err(e) => return CommandOutput::failed(format!("Invalid package name: {e}")),
        };

        let raw = format!("monkey -p {quoted} -c android.intent.category.LAUNCHER 1");
        match device.execute_command(&raw).await {
            Ok(output) if output.contains("No activities found") || output.contains("aborted") => {
                CommandOutput::failed(format!("Could not launch {package}: {}", output.trim()))
            }
            Ok(_) => CommandOutput::ok(format!("Launched {package}")),
            Err(e) => CommandOutput::failed(e.to_string()),
        }
    }
}

/// Pauses for `params.ms` milliseconds without touching the device.
#[derive(Debug, Clone, Copy, Default)]
pub struct WaitCommand;

#[async_trait]
impl DeviceCommand for WaitCommand {
    fn name(&self) -> &str {
        "wait"
    }

    async fn execute(&self, _device: &dyn CommandChannel, params: &Value) -> CommandOutput {
        let Some(ms) = params.get("ms").and_then(Value::as_u64) else {
            return CommandOutput::failed("Missing or invalid 'ms' parameter");
        };
        tokio::time::sleep(Duration::from_millis(ms)).await;
        CommandOutput::ok(format!("Waited {ms}ms"))
    }
}
