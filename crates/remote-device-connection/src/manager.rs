//! Connection manager: owns the single device session.
//!
//! States: `Disconnected -> Connected -> Reconnecting -> Connected | Disconnected`.
//! While connected a heartbeat issues a no-op command; when it fails the
//! session is dropped and a reconnection loop retries with the capped
//! backoff sequence until it succeeds or is cancelled.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use remote_device_core::{
    CommandChannel, DeviceConfig, DeviceError, DeviceTransport, EventBroadcaster, LogLevel,
    SessionHandle, topics,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::{task::JoinHandle, time::MissedTickBehavior};

use crate::backoff::reconnect_delay;

const SOURCE: &str = "connection";

/// Heartbeat settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub heartbeat_interval: Duration,
    pub heartbeat_command: String,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_command: "echo ping".into(),
        }
    }
}

impl From<&DeviceConfig> for ConnectionSettings {
    fn from(config: &DeviceConfig) -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs.max(1)),
            heartbeat_command: config.heartbeat_command.clone(),
        }
    }
}

/// Connection state machine phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Reconnecting,
}

/// Snapshot returned by [`ConnectionManager::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub connected: bool,
    pub reconnecting: bool,
    pub target: Option<String>,
    pub reconnect_attempt: u32,
    pub last_connected_at: Option<DateTime<Utc>>,
}

struct State {
    phase: ConnectionState,
    target: Option<String>,
    session: Option<SessionHandle>,
    last_connected_at: Option<DateTime<Utc>>,
    /// Failed attempts since the current reconnection loop started.
    reconnect_attempt: u32,
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    /// Bumped whenever a reconnection loop is started or cancelled. A loop
    /// only installs a session while its epoch is still current.
    reconnect_epoch: u64,
}

impl State {
    fn cancel_reconnect(&mut self) -> bool {
        self.reconnect_epoch = self.reconnect_epoch.wrapping_add(1);
        self.reconnect.take().is_some_and(|task| {
            task.abort();
            true
        })
    }

    fn stop_heartbeat(&mut self) {
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
    }
}

struct Inner {
    transport: Arc<dyn DeviceTransport>,
    broadcaster: Arc<EventBroadcaster>,
    settings: ConnectionSettings,
    state: Mutex<State>,
}

/// Owns the single session to the remote device.
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a manager in the `Disconnected` state.
    #[must_use]
    pub fn new(
        transport: Arc<dyn DeviceTransport>,
        broadcaster: Arc<EventBroadcaster>,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                broadcaster,
                settings,
                state: Mutex::new(State {
                    phase: ConnectionState::Disconnected,
                    target: None,
                    session: None,
                    last_connected_at: None,
                    reconnect_attempt: 0,
                    heartbeat: None,
                    reconnect: None,
                    reconnect_epoch: 0,
                }),
            }),
        }
    }

    /// Attempt a single connection to `address`.
    ///
    /// Any existing session, heartbeat or reconnection loop is torn down
    /// first. A failure leaves the manager `Disconnected` and is not retried.
    ///
    /// # Errors
    /// Returns `DeviceError::ConnectionFailed` if the transport cannot connect.
    pub async fn connect(&self, address: &str) -> Result<ConnectionStatus, DeviceError> {
        let previous = {
            let mut state = self.inner.lock();
            state.cancel_reconnect();
            state.stop_heartbeat();
            state.phase = ConnectionState::Disconnected;
            state.target = Some(address.to_string());
            state.session.take()
        };
        if let Some(previous) = previous {
            self.inner.transport.disconnect(&previous).await;
        }

        tracing::info!(address = %address, "Connecting to device");
        match self.inner.transport.connect(address).await {
            Ok(handle) => {
                let stale = {
                    let mut state = self.inner.lock();
                    self.inner.install_session(&mut state, handle)
                };
                self.inner.release(stale);
                self.inner.announce_connected(address);
                Ok(self.status())
            }
            Err(e) => {
                let err = DeviceError::ConnectionFailed {
                    address: address.to_string(),
                    reason: e.to_string(),
                };
                tracing::warn!(address = %address, error = %e, "Connection failed");
                self.inner.broadcaster.warn(SOURCE, err.to_string());
                Err(err)
            }
        }
    }

    /// Stop the heartbeat, cancel any reconnection loop and release the
    /// session. Safe to call when already disconnected.
    pub async fn disconnect(&self) -> ConnectionStatus {
        let (session, changed) = {
            let mut state = self.inner.lock();
            let cancelled = state.cancel_reconnect();
            state.stop_heartbeat();
            let session = state.session.take();
            let changed =
                cancelled || session.is_some() || state.phase != ConnectionState::Disconnected;
            state.phase = ConnectionState::Disconnected;
            state.reconnect_attempt = 0;
            (session, changed)
        };

        if let Some(session) = &session {
            self.inner.transport.disconnect(session).await;
        }

        if changed {
            let target = self.inner.lock().target.clone();
            tracing::info!(address = ?target, "Disconnected from device");
            self.inner.broadcaster.info(SOURCE, "Disconnected from device");
            self.inner
                .broadcaster
                .publish(topics::DEVICE_DISCONNECTED, json!({ "target": target }));
        }

        self.status()
    }

    /// Run a raw command on the current session.
    ///
    /// # Errors
    /// Returns `DeviceError::NotConnected` without a session, or
    /// `DeviceError::Command` if the transport reports a failure.
    pub async fn execute_command(&self, raw: &str) -> Result<String, DeviceError> {
        let handle = self
            .inner
            .lock()
            .session
            .clone()
            .ok_or(DeviceError::NotConnected)?;

        self.inner
            .transport
            .execute(&handle, raw)
            .await
            .map_err(|e| DeviceError::Command(e.to_string()))
    }

    /// Start the reconnection loop towards the last known target.
    ///
    /// Returns `false` without doing anything when a loop is already active,
    /// the device is connected, or no target is known.
    #[must_use = "returns whether a loop was started"]
    pub fn start_reconnect(&self) -> bool {
        self.inner.start_reconnect_loop()
    }

    /// Cancel an in-flight reconnection loop, including its pending backoff
    /// wait. Returns whether a loop was running.
    pub fn stop_reconnect(&self) -> bool {
        let mut state = self.inner.lock();
        let cancelled = state.cancel_reconnect();
        if state.phase == ConnectionState::Reconnecting {
            state.phase = ConnectionState::Disconnected;
        }
        drop(state);

        if cancelled {
            tracing::info!("Reconnection loop cancelled");
        }
        cancelled
    }

    /// Current phase of the state machine.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().phase
    }

    /// Whether a session is live.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Status snapshot. No side effects.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        let state = self.inner.lock();
        ConnectionStatus {
            connected: state.phase == ConnectionState::Connected,
            reconnecting: state.phase == ConnectionState::Reconnecting,
            target: state.target.clone(),
            reconnect_attempt: state.reconnect_attempt,
            last_connected_at: state.last_connected_at,
        }
    }
}

#[async_trait]
impl CommandChannel for ConnectionManager {
    async fn execute_command(&self, raw: &str) -> Result<String, DeviceError> {
        Self::execute_command(self, raw).await
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `handle` the live session and restart the heartbeat. Returns the
    /// session it replaced, if any.
    fn install_session(
        self: &Arc<Self>,
        state: &mut State,
        handle: SessionHandle,
    ) -> Option<SessionHandle> {
        state.stop_heartbeat();
        state.phase = ConnectionState::Connected;
        state.reconnect_attempt = 0;
        state.last_connected_at = Some(Utc::now());
        state.target = Some(handle.address.clone());
        state.heartbeat = Some(self.spawn_heartbeat(handle.clone()));
        state.session.replace(handle)
    }

    fn release(self: &Arc<Self>, stale: Option<SessionHandle>) {
        if let Some(stale) = stale {
            let inner = Arc::clone(self);
            tokio::spawn(async move { inner.transport.disconnect(&stale).await });
        }
    }

    fn announce_connected(&self, address: &str) {
        tracing::info!(address = %address, "Connected to device");
        self.broadcaster
            .info(SOURCE, format!("Connected to device at {address}"));
        self.broadcaster
            .publish(topics::DEVICE_CONNECTED, json!({ "target": address }));
    }

    fn spawn_heartbeat(self: &Arc<Self>, handle: SessionHandle) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.settings.heartbeat_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match inner
                    .transport
                    .execute(&handle, &inner.settings.heartbeat_command)
                    .await
                {
                    Ok(_) => tracing::trace!(address = %handle.address, "Heartbeat ok"),
                    Err(e) => {
                        inner.on_heartbeat_failure(&handle, &e.to_string());
                        break;
                    }
                }
            }
        })
    }

    /// Moves straight from `Connected` to `Reconnecting` with the loop armed
    /// under the same lock, so a concurrent `disconnect` always has a loop to
    /// cancel.
    fn on_heartbeat_failure(self: &Arc<Self>, handle: &SessionHandle, reason: &str) {
        let released = {
            let mut state = self.lock();
            if state.session.as_ref().map(|s| s.id) != Some(handle.id) {
                return;
            }
            // this task is the heartbeat; it exits on return
            state.heartbeat = None;
            state.phase = ConnectionState::Reconnecting;
            let released = state.session.take();
            self.arm_reconnect(&mut state);
            released
        };

        tracing::warn!(address = %handle.address, error = %reason, "Heartbeat failed, reconnecting");
        self.broadcaster.log(
            LogLevel::Warn,
            SOURCE,
            "Heartbeat failed, reconnecting",
            json!({ "target": handle.address, "error": reason }),
        );
        self.broadcaster.publish(
            topics::DEVICE_RECONNECTING,
            json!({ "target": handle.address, "attempt": 0, "reason": reason }),
        );
        self.release(released);
    }

    fn start_reconnect_loop(self: &Arc<Self>) -> bool {
        let mut state = self.lock();
        self.arm_reconnect(&mut state)
    }

    fn arm_reconnect(self: &Arc<Self>, state: &mut State) -> bool {
        if state.reconnect.is_some() || state.phase == ConnectionState::Connected {
            return false;
        }
        let Some(address) = state.target.clone() else {
            return false;
        };

        state.reconnect_epoch = state.reconnect_epoch.wrapping_add(1);
        state.phase = ConnectionState::Reconnecting;
        state.reconnect_attempt = 0;
        let epoch = state.reconnect_epoch;

        let inner = Arc::clone(self);
        state.reconnect = Some(tokio::spawn(async move {
            inner.reconnect_loop(address, epoch).await;
        }));
        true
    }

    fn is_current_loop(&self, epoch: u64) -> bool {
        let state = self.lock();
        state.reconnect_epoch == epoch && state.phase == ConnectionState::Reconnecting
    }

    async fn reconnect_loop(self: Arc<Self>, address: String, epoch: u64) {
        let mut failures: u32 = 0;

        loop {
            let delay = reconnect_delay(failures);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if !self.is_current_loop(epoch) {
                return;
            }

            tracing::debug!(address = %address, attempt = failures + 1, "Reconnection attempt");
            match self.transport.connect(&address).await {
                Ok(handle) => {
                    let installed = {
                        let mut state = self.lock();
                        if state.reconnect_epoch == epoch
                            && state.phase == ConnectionState::Reconnecting
                        {
                            state.reconnect = None;
                            Some(self.install_session(&mut state, handle.clone()))
                        } else {
                            None
                        }
                    };

                    match installed {
                        Some(stale) => {
                            self.release(stale);
                            self.announce_connected(&address);
                        }
                        // cancelled while connecting
                        None => self.transport.disconnect(&handle).await,
                    }
                    return;
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    {
                        let mut state = self.lock();
                        if state.reconnect_epoch != epoch {
                            return;
                        }
                        state.reconnect_attempt = failures;
                    }

                    let next = reconnect_delay(failures);
                    tracing::warn!(
                        address = %address,
                        attempt = failures,
                        retry_in_secs = next.as_secs(),
                        error = %e,
                        "Reconnection attempt failed"
                    );
                    self.broadcaster.log(
                        LogLevel::Warn,
                        SOURCE,
                        format!("Reconnection attempt {failures} failed"),
                        json!({ "target": address, "error": e.to_string() }),
                    );
                    self.broadcaster.publish(
                        topics::DEVICE_RECONNECTING,
                        json!({
                            "target": address,
                            "attempt": failures,
                            "nextRetryInSecs": next.as_secs(),
                        }),
                    );
                }
            }
        }
    }
}
