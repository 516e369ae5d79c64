//! The orchestration engine.

use std::sync::{Arc, Weak};

use chrono::{DateTime, Local, Utc};
use remote_device_connection::{ConnectionManager, ConnectionSettings, ConnectionStatus};
use remote_device_core::{
    Coded, DeviceError, DeviceTransport, EngineConfig, ErrorCode, EventBroadcaster,
    ExecutionResult, TaskDefinition,
};
use remote_device_executor::{CommandRegistry, TaskExecutor};
use remote_device_scheduler::{
    SchedulerError, TaskDetails, TaskScheduler, TaskSummary, TriggerCallback,
};
use serde::Serialize;

const SOURCE: &str = "engine";

/// Engine error.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("Unknown command type '{kind}' at index {index}")]
    UnknownCommand { kind: String, index: usize },
    #[error("No device address known")]
    NoTarget,
}

impl Coded for EngineError {
    fn code(&self) -> ErrorCode {
        match self {
            Self::Scheduler(e) => e.code(),
            Self::Device(e) => e.code(),
            Self::UnknownCommand { .. } => ErrorCode::UnknownCommand,
            Self::NoTarget => ErrorCode::ConnectionFailed,
        }
    }
}

/// Combined status snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub device: ConnectionStatus,
    pub task_count: usize,
    pub enabled_tasks: usize,
    pub observers: usize,
}

/// Wires the connection manager, executor and scheduler to one broadcaster.
///
/// Time-based triggers and on-demand runs both go through the same
/// execute-then-record path.
pub struct Engine {
    config: EngineConfig,
    broadcaster: Arc<EventBroadcaster>,
    connection: ConnectionManager,
    executor: TaskExecutor,
    scheduler: TaskScheduler,
}

impl Engine {
    /// Build an engine with a fresh broadcaster.
    #[must_use]
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn DeviceTransport>,
        registry: CommandRegistry,
    ) -> Arc<Self> {
        Self::with_broadcaster(config, transport, registry, Arc::new(EventBroadcaster::new()))
    }

    /// Build an engine publishing into `broadcaster`.
    #[must_use]
    pub fn with_broadcaster(
        config: EngineConfig,
        transport: Arc<dyn DeviceTransport>,
        registry: CommandRegistry,
        broadcaster: Arc<EventBroadcaster>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let on_fire: TriggerCallback = Arc::new(move |task: TaskDefinition| {
                let Some(engine) = weak.upgrade() else {
                    return;
                };
                tokio::spawn(async move {
                    engine.run_definition(task).await;
                });
            });

            let connection = ConnectionManager::new(
                transport,
                Arc::clone(&broadcaster),
                ConnectionSettings::from(&config.device),
            );
            let executor = TaskExecutor::new(Arc::new(registry), Arc::clone(&broadcaster));
            let scheduler = TaskScheduler::new(Arc::clone(&broadcaster), on_fire);

            Self {
                config,
                broadcaster,
                connection,
                executor,
                scheduler,
            }
        })
    }

    /// Register configured tasks and connect to the configured device.
    ///
    /// A failed startup connect is not an error; when configured it starts
    /// the reconnection loop instead.
    ///
    /// # Errors
    /// Returns error if a configured task is invalid.
    pub async fn start(&self) -> Result<(), EngineError> {
        for task in &self.config.tasks {
            self.validate_commands(task)?;
            self.scheduler.register(task.clone())?;
        }
        tracing::info!(tasks = self.config.tasks.len(), "Engine started");
        self.broadcaster.info(
            SOURCE,
            format!("Engine started with {} task(s)", self.config.tasks.len()),
        );

        let Some(address) = self.config.device.address.as_deref() else {
            tracing::info!("No device address configured, waiting for a connect request");
            return Ok(());
        };

        if let Err(e) = self.connection.connect(address).await {
            tracing::warn!(address, error = %e, "Startup connection failed");
            if self.config.device.reconnect_on_start && self.connection.start_reconnect() {
                tracing::info!(address, "Reconnection loop started");
            }
        }
        Ok(())
    }

    fn validate_commands(&self, task: &TaskDefinition) -> Result<(), EngineError> {
        let registry = self.executor.registry();
        match task
            .commands
            .iter()
            .enumerate()
            .find(|(_, c)| !registry.contains(&c.kind))
        {
            Some((index, command)) => Err(EngineError::UnknownCommand {
                kind: command.kind.clone(),
                index,
            }),
            None => Ok(()),
        }
    }

    async fn run_definition(&self, task: TaskDefinition) -> ExecutionResult {
        let start = Utc::now();
        let result = self.executor.execute(&task, &self.connection).await;
        let end = Utc::now();

        if let Err(e) = self
            .scheduler
            .record_execution(&task.name, &result, start, end)
        {
            tracing::debug!(task = %task.name, error = %e, "Run finished for a task no longer registered");
        }
        result
    }

    /// Run a registered task now, enabled or not, and record the result.
    ///
    /// # Errors
    /// Returns error if no task is called `name`.
    pub async fn run_task(&self, name: &str) -> Result<ExecutionResult, EngineError> {
        let task = self
            .scheduler
            .definition(name)
            .ok_or_else(|| SchedulerError::NotFound(name.to_string()))?;
        tracing::info!(task = %name, "On-demand run requested");
        Ok(self.run_definition(task).await)
    }

    /// # Errors
    /// Returns error if the task is invalid, uses an unknown command or the
    /// name is taken.
    pub fn add_task(&self, task: TaskDefinition) -> Result<Option<DateTime<Local>>, EngineError> {
        self.validate_commands(&task)?;
        Ok(self.scheduler.add(task)?)
    }

    /// # Errors
    /// Returns error if `name` is unknown or the new definition is invalid.
    pub fn update_task(
        &self,
        name: &str,
        task: TaskDefinition,
    ) -> Result<Option<DateTime<Local>>, EngineError> {
        self.validate_commands(&task)?;
        Ok(self.scheduler.update(name, task)?)
    }

    /// # Errors
    /// Returns error if `name` is unknown.
    pub fn remove_task(&self, name: &str) -> Result<TaskDefinition, EngineError> {
        Ok(self.scheduler.remove(name)?)
    }

    /// # Errors
    /// Returns error if `name` is unknown.
    pub fn set_task_enabled(
        &self,
        name: &str,
        enabled: bool,
    ) -> Result<Option<DateTime<Local>>, EngineError> {
        Ok(self.scheduler.set_enabled(name, enabled)?)
    }

    #[must_use]
    pub fn list_tasks(&self) -> Vec<TaskSummary> {
        self.scheduler.list()
    }

    /// # Errors
    /// Returns error if `name` is unknown.
    pub fn task_details(&self, name: &str) -> Result<TaskDetails, EngineError> {
        Ok(self.scheduler.details(name)?)
    }

    /// Connect to `address`, or to the last known / configured target.
    ///
    /// # Errors
    /// Returns error if no target is known or the connection fails.
    pub async fn connect(&self, address: Option<&str>) -> Result<ConnectionStatus, EngineError> {
        let address = match address {
            Some(address) => address.to_string(),
            None => self
                .connection
                .status()
                .target
                .or_else(|| self.config.device.address.clone())
                .ok_or(EngineError::NoTarget)?,
        };
        Ok(self.connection.connect(&address).await?)
    }

    pub async fn disconnect(&self) -> ConnectionStatus {
        self.connection.disconnect().await
    }

    /// Start the reconnection loop. Returns whether a new loop was started.
    #[must_use = "returns whether a loop was started"]
    pub fn start_reconnect(&self) -> bool {
        self.connection.start_reconnect()
    }

    /// Returns whether a loop was cancelled.
    pub fn stop_reconnect(&self) -> bool {
        self.connection.stop_reconnect()
    }

    #[must_use]
    pub fn device_status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    #[must_use]
    pub fn status(&self) -> EngineStatus {
        let tasks = self.scheduler.list();
        EngineStatus {
            device: self.connection.status(),
            task_count: tasks.len(),
            enabled_tasks: tasks.iter().filter(|t| t.enabled).count(),
            observers: self.broadcaster.observer_count(),
        }
    }

    #[must_use]
    pub fn broadcaster(&self) -> &Arc<EventBroadcaster> {
        &self.broadcaster
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Cancel every trigger, stop reconnecting and release the session.
    pub async fn shutdown(&self) {
        tracing::info!("Engine shutting down");
        self.scheduler.shutdown();
        self.connection.disconnect().await;
        self.broadcaster.info(SOURCE, "Engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Mutex,
            atomic::{AtomicBool, Ordering},
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use remote_device_core::{CommandSpec, ExecutionStatus, SessionHandle, TransportError};

    use super::*;

    #[derive(Default)]
    struct MockTransport {
        fail_connect: AtomicBool,
        executed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DeviceTransport for MockTransport {
        async fn connect(&self, address: &str) -> Result<SessionHandle, TransportError> {
            if self.fail_connect.load(Ordering::SeqCst) {
                Err(TransportError::Connect(format!("unable to connect to {address}")))
            } else {
                Ok(SessionHandle::new(address))
            }
        }

        async fn disconnect(&self, _handle: &SessionHandle) {}

        async fn execute(
            &self,
            _handle: &SessionHandle,
            command: &str,
        ) -> Result<String, TransportError> {
            self.executed.lock().unwrap().push(command.to_string());
            Ok(String::new())
        }
    }

    fn shell(command: &str) -> CommandSpec {
        CommandSpec::new("shell").with_param("command", command)
    }

    fn config(address: Option<&str>, tasks: Vec<TaskDefinition>) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.device.address = address.map(str::to_string);
        config.tasks = tasks;
        config
    }

    fn engine(config: EngineConfig) -> (Arc<Engine>, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::default());
        let engine = Engine::new(
            config,
            Arc::clone(&transport) as Arc<dyn DeviceTransport>,
            CommandRegistry::with_builtins(),
        );
        (engine, transport)
    }

    fn user_commands(transport: &MockTransport) -> Vec<String> {
        transport
            .executed
            .lock()
            .unwrap()
            .iter()
            .filter(|c| *c != "echo ping")
            .cloned()
            .collect()
    }

    #[tokio::test]
    async fn test_start_registers_tasks_and_connects() {
        let morning = TaskDefinition::new(
            "morning",
            "0 30 7 * * *",
            vec![CommandSpec::new("wake")],
        );
        let (engine, _) = engine(config(Some("192.168.1.40:5555"), vec![morning]));
        engine.start().await.unwrap();

        let status = engine.status();
        assert!(status.device.connected);
        assert_eq!(status.device.target.as_deref(), Some("192.168.1.40:5555"));
        assert_eq!(status.task_count, 1);
        assert_eq!(status.enabled_tasks, 1);
        assert!(engine.list_tasks()[0].next_run.is_some());
        engine.shutdown().await;
        assert!(!engine.device_status().connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_startup_connect_starts_reconnecting() {
        let transport = Arc::new(MockTransport::default());
        transport.fail_connect.store(true, Ordering::SeqCst);
        let engine = Engine::new(
            config(Some("192.168.1.40:5555"), Vec::new()),
            Arc::clone(&transport) as Arc<dyn DeviceTransport>,
            CommandRegistry::with_builtins(),
        );

        engine.start().await.unwrap();
        assert!(engine.device_status().reconnecting);

        transport.fail_connect.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(engine.device_status().connected);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_task_fails_start() {
        let bad = TaskDefinition::new("bad", "0 30 7 * * *", vec![CommandSpec::new("teleport")]);
        let (engine, _) = engine(config(None, vec![bad]));
        let err = engine.start().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnknownCommand);
    }

    #[tokio::test]
    async fn test_add_rejects_unknown_command_type() {
        let (engine, _) = engine(EngineConfig::default());
        let task = TaskDefinition::new(
            "evening",
            "0 0 20 * * *",
            vec![CommandSpec::new("wake"), CommandSpec::new("teleport")],
        );

        let err = engine.add_task(task.clone()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnknownCommand);
        assert!(err.to_string().contains("teleport"));
        assert!(engine.list_tasks().is_empty());

        let mut fixed = task;
        fixed.commands.pop();
        assert!(engine.add_task(fixed.clone()).unwrap().is_some());

        fixed.commands.push(CommandSpec::new("teleport"));
        let err = engine.update_task("evening", fixed).unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnknownCommand);
    }

    #[tokio::test]
    async fn test_run_task_executes_and_records() {
        let (engine, transport) = engine(config(Some("10.0.0.2:5555"), Vec::new()));
        engine.start().await.unwrap();

        let mut task = TaskDefinition::new(
            "evening",
            "0 0 20 * * *",
            vec![shell("settings put system screen_brightness 40"), CommandSpec::new("power_off")],
        );
        task.enabled = false;
        engine.add_task(task).unwrap();

        let result = engine.run_task("evening").await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.results.len(), 2);
        assert_eq!(
            user_commands(&transport),
            [
                "settings put system screen_brightness 40",
                "input keyevent KEYCODE_SLEEP"
            ]
        );

        let details = engine.task_details("evening").unwrap();
        assert_eq!(details.execution_history.len(), 1);
        assert_eq!(details.last_status, Some(ExecutionStatus::Completed));
        assert_eq!(details.next_run, None);
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_while_disconnected_fails_and_counts() {
        let (engine, _) = engine(EngineConfig::default());
        engine.start().await.unwrap();
        engine
            .add_task(TaskDefinition::new("morning", "0 30 7 * * *", vec![CommandSpec::new("wake")]))
            .unwrap();

        let result = engine.run_task("morning").await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.failed_command.as_deref(), Some("wake"));
        assert_eq!(result.error.as_deref(), Some("Device not connected"));

        let details = engine.task_details("morning").unwrap();
        assert_eq!(details.failure_count, 1);
        assert_eq!(details.execution_history[0].error.as_deref(), Some("Device not connected"));
    }

    #[tokio::test]
    async fn test_unknown_task_and_missing_target() {
        let (engine, _) = engine(EngineConfig::default());
        let err = tokio_test::assert_err!(engine.run_task("ghost").await);
        assert_eq!(err.code(), ErrorCode::TaskNotFound);
        assert_eq!(
            engine.connect(None).await.unwrap_err().code(),
            ErrorCode::ConnectionFailed
        );
        assert!(!engine.start_reconnect());
    }

    #[tokio::test]
    async fn test_trigger_runs_task_through_executor() {
        let (engine, transport) = engine(config(Some("10.0.0.2:5555"), Vec::new()));
        engine.start().await.unwrap();
        engine
            .add_task(TaskDefinition::new("tick", "* * * * * *", vec![shell("input tap 10 10")]))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1800)).await;
        engine.set_task_enabled("tick", false).unwrap();

        assert!(!user_commands(&transport).is_empty());
        let details = engine.task_details("tick").unwrap();
        assert!(!details.execution_history.is_empty());
        engine.shutdown().await;
    }
}
