//! Runs a task's commands in order with uniform retry.

use std::{panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use remote_device_core::{
    CommandChannel, CommandOutcome, CommandOutput, CommandSpec, DeviceCommand, EventBroadcaster,
    ExecutionResult, ExecutionStatus, LogLevel, TaskDefinition, topics,
};
use serde_json::json;
use tokio::time::Instant;

use crate::{registry::CommandRegistry, retry::RetryPolicy};

const SOURCE: &str = "executor";

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Executes tasks against a device.
///
/// The first command that still fails after all retry attempts stops the
/// task; later commands are never attempted.
pub struct TaskExecutor {
    registry: Arc<CommandRegistry>,
    broadcaster: Arc<EventBroadcaster>,
    policy: RetryPolicy,
}

impl TaskExecutor {
    /// Create an executor with the default retry policy.
    #[must_use]
    pub fn new(registry: Arc<CommandRegistry>, broadcaster: Arc<EventBroadcaster>) -> Self {
        Self {
            registry,
            broadcaster,
            policy: RetryPolicy::default(),
        }
    }

    /// Override the retry policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    /// Run `task` once and report the outcome.
    ///
    /// Emits `task:triggered` before the first command and exactly one of
    /// `task:completed` / `task:failed` at the end.
    pub async fn execute(
        &self,
        task: &TaskDefinition,
        device: &dyn CommandChannel,
    ) -> ExecutionResult {
        let started = Instant::now();

        tracing::info!(task = %task.name, commands = task.commands.len(), "Task started");
        self.broadcaster.publish(
            topics::TASK_TRIGGERED,
            json!({ "name": task.name, "commandCount": task.commands.len() }),
        );
        self.broadcaster
            .info(SOURCE, format!("Task '{}' started", task.name));

        if task.commands.is_empty() {
            tracing::warn!(task = %task.name, "Task has no commands");
            self.broadcaster
                .warn(SOURCE, format!("Task '{}' has no commands", task.name));
        }

        let mut results = Vec::with_capacity(task.commands.len());
        let mut failure: Option<(usize, String, String)> = None;

        for (index, spec) in task.commands.iter().enumerate() {
            let Some(command) = self.registry.get(&spec.kind) else {
                tracing::error!(task = %task.name, index, command = %spec.kind, "Unknown command");
                failure = Some((index, spec.kind.clone(), format!("Unknown command: {}", spec.kind)));
                break;
            };

            let outcome = self
                .run_with_retry(&task.name, index, spec, command.as_ref(), device)
                .await;
            let error = (!outcome.success).then(|| {
                outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("Command '{}' failed", spec.kind))
            });
            results.push(outcome);

            if let Some(error) = error {
                failure = Some((index, spec.kind.clone(), error));
                break;
            }
        }

        let duration_ms = elapsed_ms(started);
        match failure {
            None => {
                tracing::info!(task = %task.name, duration_ms, "Task completed");
                self.broadcaster.publish(
                    topics::TASK_COMPLETED,
                    json!({ "name": task.name, "durationMs": duration_ms }),
                );
                self.broadcaster.info(
                    SOURCE,
                    format!("Task '{}' completed in {duration_ms}ms", task.name),
                );
                ExecutionResult {
                    task: task.name.clone(),
                    status: ExecutionStatus::Completed,
                    duration_ms,
                    results,
                    failed_at_index: None,
                    failed_command: None,
                    error: None,
                }
            }
            Some((index, kind, error)) => {
                tracing::warn!(
                    task = %task.name,
                    failed_at = index,
                    command = %kind,
                    error = %error,
                    duration_ms,
                    "Task failed"
                );
                self.broadcaster.publish(
                    topics::TASK_FAILED,
                    json!({
                        "name": task.name,
                        "durationMs": duration_ms,
                        "failedAtIndex": index,
                        "failedCommand": kind,
                        "error": error,
                    }),
                );
                self.broadcaster.log(
                    LogLevel::Error,
                    SOURCE,
                    format!("Task '{}' failed at command {index} ({kind}): {error}", task.name),
                    json!({ "task": task.name, "failedAtIndex": index }),
                );
                ExecutionResult {
                    task: task.name.clone(),
                    status: ExecutionStatus::Failed,
                    duration_ms,
                    results,
                    failed_at_index: Some(index),
                    failed_command: Some(kind),
                    error: Some(error),
                }
            }
        }
    }

    async fn run_with_retry(
        &self,
        task: &str,
        index: usize,
        spec: &CommandSpec,
        command: &dyn DeviceCommand,
        device: &dyn CommandChannel,
    ) -> CommandOutcome {
        let params = spec.params_value();
        let max_attempts = self.policy.max_attempts.max(1);
        let started = Instant::now();
        let mut attempt: u32 = 0;

        tracing::debug!(task, index, command = %spec.kind, "Command started");

        loop {
            let output = match AssertUnwindSafe(command.execute(device, &params))
                .catch_unwind()
                .await
            {
                Ok(output) => output,
                Err(_) => {
                    tracing::error!(task, index, command = %spec.kind, "Command panicked");
                    CommandOutput::failed(format!("Command '{}' panicked", spec.kind))
                }
            };

            if output.success {
                tracing::debug!(task, index, command = %spec.kind, retries = attempt, "Command completed");
                return CommandOutcome {
                    kind: spec.kind.clone(),
                    success: true,
                    duration_ms: elapsed_ms(started),
                    retry_count: (attempt > 0).then_some(attempt),
                    message: output.message,
                    error: None,
                };
            }

            let error = output
                .error
                .unwrap_or_else(|| format!("Command '{}' reported failure", spec.kind));
            attempt += 1;

            if attempt >= max_attempts {
                tracing::warn!(task, index, command = %spec.kind, attempts = attempt, error = %error, "Command failed");
                return CommandOutcome {
                    kind: spec.kind.clone(),
                    success: false,
                    duration_ms: elapsed_ms(started),
                    retry_count: (attempt > 1).then_some(attempt - 1),
                    message: None,
                    error: Some(error),
                };
            }

            let delay = self.policy.delay_after(attempt - 1);
            tracing::warn!(
                task,
                index,
                command = %spec.kind,
                attempt,
                retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "Command attempt failed, retrying"
            );
            self.broadcaster.log(
                LogLevel::Warn,
                SOURCE,
                format!("'{}' attempt {attempt}/{max_attempts} failed: {error}", spec.kind),
                json!({ "task": task, "index": index }),
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Mutex,
            atomic::{AtomicU32, Ordering},
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use remote_device_core::{DeviceError, Event};
    use serde_json::Value;

    use super::*;

    struct NullDevice;

    #[async_trait]
    impl CommandChannel for NullDevice {
        async fn execute_command(&self, _raw: &str) -> Result<String, DeviceError> {
            Ok(String::new())
        }
    }

    /// Fails the first `failures` calls, then succeeds.
    struct Flaky {
        name: &'static str,
        failures: u32,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl DeviceCommand for Flaky {
        fn name(&self) -> &str {
            self.name
        }

        async fn execute(&self, _device: &dyn CommandChannel, _params: &Value) -> CommandOutput {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                CommandOutput::failed(format!("{} not ready", self.name))
            } else {
                CommandOutput::ok("done")
            }
        }
    }

    struct Panicky;

    #[async_trait]
    impl DeviceCommand for Panicky {
        fn name(&self) -> &str {
            "panicky"
        }

        async fn execute(&self, _device: &dyn CommandChannel, _params: &Value) -> CommandOutput {
            panic!("boom");
        }
    }

    fn flaky(name: &'static str, failures: u32) -> (Flaky, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        (
            Flaky {
                name,
                failures,
                calls: Arc::clone(&calls),
            },
            calls,
        )
    }

    fn executor(registry: CommandRegistry) -> (TaskExecutor, Arc<EventBroadcaster>) {
        let broadcaster = Arc::new(EventBroadcaster::new());
        (
            TaskExecutor::new(Arc::new(registry), Arc::clone(&broadcaster)),
            broadcaster,
        )
    }

    fn task(kinds: &[&str]) -> TaskDefinition {
        TaskDefinition::new(
            "evening",
            "0 0 20 * * *",
            kinds.iter().map(|k| CommandSpec::new(*k)).collect(),
        )
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<Event>) -> Vec<String> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.topic)
            .filter(|t| !t.starts_with("logs:"))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_command_fails_permanently() {
        let (first, first_calls) = flaky("wake", u32::MAX);
        let (second, second_calls) = flaky("launch_app", 0);
        let mut registry = CommandRegistry::new();
        registry.register(first);
        registry.register(second);
        let (executor, broadcaster) = executor(registry);
        let mut events = broadcaster.subscribe_all();

        let result = executor
            .execute(&task(&["wake", "launch_app"]), &NullDevice)
            .await;

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.failed_at_index, Some(0));
        assert_eq!(result.failed_command.as_deref(), Some("wake"));
        assert_eq!(result.error.as_deref(), Some("wake not ready"));
        assert_eq!(first_calls.load(Ordering::SeqCst), 3);
        assert_eq!(second_calls.load(Ordering::SeqCst), 0);
        assert_eq!(result.results.len(), 1);
        assert_eq!(result.results[0].retry_count, Some(2));
        // 1s + 2s of backoff
        assert!(result.duration_ms >= 3000);

        assert_eq!(drain(&mut events), [topics::TASK_TRIGGERED, topics::TASK_FAILED]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_policy() {
        let (wake, calls) = flaky("wake", 4);
        let mut registry = CommandRegistry::new();
        registry.register(wake);
        let (executor, _) = executor(registry);
        let executor = executor.with_policy(RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(10),
            multiplier: 1,
        });

        let result = executor.execute(&task(&["wake"]), &NullDevice).await;

        assert!(result.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(result.results[0].retry_count, Some(4));
        assert!(result.duration_ms >= 40);
        assert!(result.duration_ms < 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_retries_records_retry_count() {
        let (wake, calls) = flaky("wake", 2);
        let mut registry = CommandRegistry::new();
        registry.register(wake);
        let (executor, broadcaster) = executor(registry);
        let mut events = broadcaster.subscribe_all();

        let result = executor.execute(&task(&["wake"]), &NullDevice).await;

        assert!(result.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.results[0].retry_count, Some(2));
        assert!(result.results[0].duration_ms >= 3000);
        assert_eq!(drain(&mut events), [topics::TASK_TRIGGERED, topics::TASK_COMPLETED]);
    }

    #[tokio::test]
    async fn test_first_try_success_has_no_retry_count() {
        let (wake, _) = flaky("wake", 0);
        let mut registry = CommandRegistry::new();
        registry.register(wake);
        let (executor, _) = executor(registry);

        let result = executor.execute(&task(&["wake"]), &NullDevice).await;
        assert!(result.is_success());
        assert_eq!(result.results[0].retry_count, None);
    }

    #[tokio::test]
    async fn test_unknown_command_short_circuits() {
        let (wake, calls) = flaky("wake", 0);
        let mut registry = CommandRegistry::new();
        registry.register(wake);
        let (executor, _) = executor(registry);

        let result = executor
            .execute(&task(&["teleport", "wake"]), &NullDevice)
            .await;

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.failed_at_index, Some(0));
        assert_eq!(result.error.as_deref(), Some("Unknown command: teleport"));
        assert!(result.results.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_task_succeeds_with_warning() {
        let (executor, broadcaster) = executor(CommandRegistry::new());
        let result = executor.execute(&task(&[]), &NullDevice).await;

        assert!(result.is_success());
        assert!(result.results.is_empty());
        let warnings = broadcaster.recent_logs(&remote_device_core::LogQuery {
            level: Some(LogLevel::Warn),
            ..Default::default()
        });
        assert!(warnings.iter().any(|e| e.message.contains("no commands")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_command_becomes_failure() {
        let mut registry = CommandRegistry::new();
        registry.register(Panicky);
        let (executor, _) = executor(registry);

        let result = executor.execute(&task(&["panicky"]), &NullDevice).await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(result.error.unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn test_params_reach_command() {
        struct Capture(Arc<Mutex<Option<Value>>>);

        #[async_trait]
        impl DeviceCommand for Capture {
            fn name(&self) -> &str {
                "capture"
            }

            async fn execute(&self, _device: &dyn CommandChannel, params: &Value) -> CommandOutput {
                *self.0.lock().unwrap() = Some(params.clone());
                CommandOutput::ok("captured")
            }
        }

        let seen = Arc::new(Mutex::new(None));
        let mut registry = CommandRegistry::new();
        registry.register(Capture(Arc::clone(&seen)));
        let (executor, _) = executor(registry);

        let mut definition = task(&[]);
        definition.commands = vec![CommandSpec::new("capture").with_param("package", "com.example.tv")];
        let result = executor.execute(&definition, &NullDevice).await;

        assert!(result.is_success());
        assert_eq!(result.results[0].message.as_deref(), Some("captured"));
        assert_eq!(
            seen.lock().unwrap().clone(),
            Some(serde_json::json!({"package": "com.example.tv"}))
        );
    }
}
