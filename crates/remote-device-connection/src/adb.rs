//! `DeviceTransport` backed by the `adb` command-line client.

use std::{path::PathBuf, process::Output, time::Duration};

use async_trait::async_trait;
use remote_device_core::{DeviceTransport, SessionHandle, TransportError};
use tokio::process::Command;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Talks to the device through `adb connect` / `adb -s <target> shell`.
#[derive(Debug, Clone)]
pub struct AdbTransport {
    program: PathBuf,
    timeout: Duration,
}

impl AdbTransport {
    /// Use an explicit `adb` executable.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Resolve `adb`, preferring `path_override` and falling back to `PATH`.
    ///
    /// # Errors
    /// Returns error if no executable can be found.
    pub async fn locate(path_override: Option<&str>) -> Result<Self, TransportError> {
        if let Some(path) = path_override {
            return Ok(Self::new(path));
        }
        which_async("adb")
            .await
            .map(Self::new)
            .ok_or_else(|| TransportError::ExecutableNotFound("adb".into()))
    }

    /// Per-invocation timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, args: &[&str]) -> Result<Output, TransportError> {
        let mut command = Command::new(&self.program);
        command.args(args).kill_on_drop(true);

        tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| {
                TransportError::Execute(format!("adb {} timed out", args.join(" ")))
            })?
            .map_err(TransportError::from)
    }
}

async fn which_async(executable: &str) -> Option<PathBuf> {
    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || which::which(executable))
        .await
        .ok()
        .and_then(Result::ok)
}

/// `adb connect` exits 0 even when it fails; the verdict is in stdout.
fn connect_succeeded(stdout: &str) -> bool {
    let out = stdout.to_ascii_lowercase();
    if out.contains("unable") || out.contains("failed") || out.contains("cannot") {
        return false;
    }
    out.contains("connected to")
}

fn failure_text(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let text = if stderr.trim().is_empty() { stdout } else { stderr };
    let text = text.trim();
    if text.is_empty() {
        format!("exit status {}", output.status)
    } else {
        text.to_string()
    }
}

#[async_trait]
impl DeviceTransport for AdbTransport {
    async fn connect(&self, address: &str) -> Result<SessionHandle, TransportError> {
        let output = self.run(&["connect", address]).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if output.status.success() && connect_succeeded(&stdout) {
            Ok(SessionHandle::new(address))
        } else {
            Err(TransportError::Connect(failure_text(&output)))
        }
    }

    async fn disconnect(&self, handle: &SessionHandle) {
        if let Err(e) = self.run(&["disconnect", &handle.address]).await {
            tracing::debug!(address = %handle.address, error = %e, "adb disconnect failed");
        }
    }

    async fn execute(
        &self,
        handle: &SessionHandle,
        command: &str,
    ) -> Result<String, TransportError> {
        let output = self.run(&["-s", &handle.address, "shell", command]).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
        } else {
            Err(TransportError::Execute(failure_text(&output)))
        }
    }
}
