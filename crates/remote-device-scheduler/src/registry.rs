//! Task registry: named tasks, their live triggers and run history.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use chrono::{DateTime, Local, Utc};
use remote_device_core::{
    Coded, CommandSpec, ErrorCode, EventBroadcaster, ExecutionResult, ExecutionStatus,
    HistoryEntry, TaskDefinition, topics,
};
use serde::Serialize;
use serde_json::json;

use crate::{
    cron::{CronError, CronSchedule},
    trigger::{CronTrigger, TriggerCallback},
};

/// Runs kept per task; the oldest is evicted first.
pub const HISTORY_CAPACITY: usize = 10;

const SOURCE: &str = "scheduler";

/// Scheduler error.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Task not found: {0}")]
    NotFound(String),
    #[error("Task already exists: {0}")]
    AlreadyExists(String),
    #[error("Invalid task: {0}")]
    InvalidTask(String),
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(#[from] CronError),
}

impl Coded for SchedulerError {
    fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::TaskNotFound,
            Self::AlreadyExists(_) => ErrorCode::TaskAlreadyExists,
            Self::InvalidTask(_) => ErrorCode::InvalidTask,
            Self::InvalidSchedule(_) => ErrorCode::InvalidSchedule,
        }
    }
}

/// One row of the task list.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub name: String,
    pub schedule: String,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub command_count: usize,
    pub next_run: Option<DateTime<Local>>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_status: Option<ExecutionStatus>,
    pub failure_count: u32,
}

/// Full state of one task.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDetails {
    pub name: String,
    pub schedule: String,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub commands: Vec<CommandSpec>,
    pub next_run: Option<DateTime<Local>>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_status: Option<ExecutionStatus>,
    pub failure_count: u32,
    pub execution_history: Vec<HistoryEntry>,
}

struct TaskEntry {
    definition: TaskDefinition,
    schedule: CronSchedule,
    trigger: Option<CronTrigger>,
    last_run: Option<DateTime<Utc>>,
    last_status: Option<ExecutionStatus>,
    failure_count: u32,
    history: VecDeque<HistoryEntry>,
}

impl TaskEntry {
    fn next_run(&self) -> Option<DateTime<Local>> {
        self.trigger.as_ref().and_then(CronTrigger::next_run)
    }

    fn summary(&self) -> TaskSummary {
        TaskSummary {
            name: self.definition.name.clone(),
            schedule: self.definition.schedule.clone(),
            enabled: self.definition.enabled,
            description: self.definition.description.clone(),
            command_count: self.definition.commands.len(),
            next_run: self.next_run(),
            last_run: self.last_run,
            last_status: self.last_status,
            failure_count: self.failure_count,
        }
    }

    fn details(&self) -> TaskDetails {
        TaskDetails {
            name: self.definition.name.clone(),
            schedule: self.definition.schedule.clone(),
            enabled: self.definition.enabled,
            description: self.definition.description.clone(),
            commands: self.definition.commands.clone(),
            next_run: self.next_run(),
            last_run: self.last_run,
            last_status: self.last_status,
            failure_count: self.failure_count,
            execution_history: self.history.iter().cloned().collect(),
        }
    }

    fn disarm(&mut self) {
        if let Some(trigger) = self.trigger.take() {
            trigger.cancel();
        }
    }
}

/// Owns every registered task and one trigger per enabled task.
///
/// The map is only mutated through these methods. A task's reported
/// `next_run` is always read from its live trigger.
pub struct TaskScheduler {
    tasks: RwLock<HashMap<String, TaskEntry>>,
    broadcaster: Arc<EventBroadcaster>,
    on_fire: TriggerCallback,
}

impl TaskScheduler {
    /// Create an empty scheduler; `on_fire` receives every triggered task.
    #[must_use]
    pub fn new(broadcaster: Arc<EventBroadcaster>, on_fire: TriggerCallback) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            broadcaster,
            on_fire,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, TaskEntry>> {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, TaskEntry>> {
        self.tasks.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn validate(task: &TaskDefinition) -> Result<CronSchedule, SchedulerError> {
        if task.name.trim().is_empty() {
            return Err(SchedulerError::InvalidTask("Task name is required".into()));
        }
        Ok(CronSchedule::parse(&task.schedule)?)
    }

    fn arm(&self, task: &TaskDefinition, schedule: &CronSchedule) -> Option<CronTrigger> {
        task.enabled.then(|| {
            CronTrigger::start(task.clone(), schedule.clone(), Arc::clone(&self.on_fire))
        })
    }

    /// Validate `task` and arm its trigger if enabled.
    ///
    /// Returns the next run time, or `None` for a disabled task. No event
    /// is published; use [`Self::add`] for runtime creation.
    ///
    /// # Errors
    /// Returns error if the name is missing or taken, or the schedule is invalid.
    pub fn register(&self, task: TaskDefinition) -> Result<Option<DateTime<Local>>, SchedulerError> {
        let schedule = Self::validate(&task)?;

        let mut tasks = self.write();
        if tasks.contains_key(&task.name) {
            return Err(SchedulerError::AlreadyExists(task.name));
        }

        let trigger = self.arm(&task, &schedule);
        let entry = TaskEntry {
            definition: task,
            schedule,
            trigger,
            last_run: None,
            last_status: None,
            failure_count: 0,
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
        };
        let next_run = entry.next_run();
        tracing::info!(
            task = %entry.definition.name,
            schedule = %entry.schedule,
            enabled = entry.definition.enabled,
            next_run = ?next_run,
            "Task registered"
        );
        tasks.insert(entry.definition.name.clone(), entry);
        Ok(next_run)
    }

    /// Register a new task and publish `task:created`.
    ///
    /// # Errors
    /// Returns error if the name is missing or taken, or the schedule is invalid.
    pub fn add(&self, task: TaskDefinition) -> Result<Option<DateTime<Local>>, SchedulerError> {
        let name = task.name.clone();
        let next_run = self.register(task)?;
        self.broadcaster.publish(
            topics::TASK_CREATED,
            json!({ "name": name, "nextRun": next_run }),
        );
        self.broadcaster
            .info(SOURCE, format!("Task '{name}' created"));
        Ok(next_run)
    }

    /// Replace the task called `name`, re-arming its trigger.
    ///
    /// Run history and counters carry over, also across a rename.
    ///
    /// # Errors
    /// Returns error if `name` is unknown, the new name is taken, or the new
    /// definition is invalid. The old task is left untouched on error.
    pub fn update(
        &self,
        name: &str,
        task: TaskDefinition,
    ) -> Result<Option<DateTime<Local>>, SchedulerError> {
        let schedule = Self::validate(&task)?;

        let next_run = {
            let mut tasks = self.write();
            if !tasks.contains_key(name) {
                return Err(SchedulerError::NotFound(name.to_string()));
            }
            if task.name != name && tasks.contains_key(&task.name) {
                return Err(SchedulerError::AlreadyExists(task.name));
            }

            let Some(mut entry) = tasks.remove(name) else {
                return Err(SchedulerError::NotFound(name.to_string()));
            };
            entry.disarm();
            entry.trigger = self.arm(&task, &schedule);
            entry.definition = task;
            entry.schedule = schedule;
            let next_run = entry.next_run();
            tasks.insert(entry.definition.name.clone(), entry);
            next_run
        };

        tracing::info!(task = %name, next_run = ?next_run, "Task updated");
        self.broadcaster.publish(
            topics::TASK_UPDATED,
            json!({ "name": name, "nextRun": next_run }),
        );
        self.broadcaster
            .info(SOURCE, format!("Task '{name}' updated"));
        Ok(next_run)
    }

    /// Cancel the task's trigger and delete it.
    ///
    /// # Errors
    /// Returns error if `name` is unknown.
    pub fn remove(&self, name: &str) -> Result<TaskDefinition, SchedulerError> {
        let mut entry = self
            .write()
            .remove(name)
            .ok_or_else(|| SchedulerError::NotFound(name.to_string()))?;
        entry.disarm();

        tracing::info!(task = %name, "Task removed");
        self.broadcaster
            .publish(topics::TASK_DELETED, json!({ "name": name }));
        self.broadcaster
            .info(SOURCE, format!("Task '{name}' deleted"));
        Ok(entry.definition)
    }

    /// Enable or disable a task.
    ///
    /// Disabling cancels the trigger; enabling arms a fresh one from now.
    /// Events are only published when the enabled flag changes.
    ///
    /// # Errors
    /// Returns error if `name` is unknown.
    pub fn set_enabled(
        &self,
        name: &str,
        enabled: bool,
    ) -> Result<Option<DateTime<Local>>, SchedulerError> {
        let (changed, next_run) = {
            let mut tasks = self.write();
            let entry = tasks
                .get_mut(name)
                .ok_or_else(|| SchedulerError::NotFound(name.to_string()))?;

            let changed = entry.definition.enabled != enabled;
            entry.disarm();
            entry.definition.enabled = enabled;
            if enabled {
                entry.trigger = self.arm(&entry.definition, &entry.schedule);
            }
            (changed, entry.next_run())
        };

        if changed {
            let (topic, verb) = if enabled {
                (topics::TASK_ENABLED, "enabled")
            } else {
                (topics::TASK_DISABLED, "disabled")
            };
            tracing::info!(task = %name, next_run = ?next_run, "Task {verb}");
            self.broadcaster
                .publish(topic, json!({ "name": name, "nextRun": next_run }));
            self.broadcaster
                .info(SOURCE, format!("Task '{name}' {verb}"));
        }
        Ok(next_run)
    }

    /// Append a run to the task's history and update its counters.
    ///
    /// # Errors
    /// Returns error if `name` is unknown (e.g. removed while running).
    pub fn record_execution(
        &self,
        name: &str,
        result: &ExecutionResult,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let mut tasks = self.write();
        let entry = tasks
            .get_mut(name)
            .ok_or_else(|| SchedulerError::NotFound(name.to_string()))?;

        if entry.history.len() >= HISTORY_CAPACITY {
            entry.history.pop_front();
        }
        entry.history.push_back(HistoryEntry {
            status: result.status,
            start,
            end,
            duration_ms: u64::try_from((end - start).num_milliseconds()).unwrap_or(0),
            error: result.error.clone(),
        });
        if !result.is_success() {
            entry.failure_count += 1;
        }
        entry.last_run = Some(start);
        entry.last_status = Some(result.status);

        tracing::debug!(
            task = %name,
            status = ?result.status,
            failures = entry.failure_count,
            next_run = ?entry.next_run(),
            "Execution recorded"
        );
        Ok(())
    }

    /// Every task, sorted by name.
    #[must_use]
    pub fn list(&self) -> Vec<TaskSummary> {
        let mut list: Vec<TaskSummary> = self.read().values().map(TaskEntry::summary).collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// # Errors
    /// Returns error if `name` is unknown.
    pub fn details(&self, name: &str) -> Result<TaskDetails, SchedulerError> {
        self.read()
            .get(name)
            .map(TaskEntry::details)
            .ok_or_else(|| SchedulerError::NotFound(name.to_string()))
    }

    /// The stored definition of `name`.
    #[must_use]
    pub fn definition(&self, name: &str) -> Option<TaskDefinition> {
        self.read().get(name).map(|e| e.definition.clone())
    }

    /// Number of registered tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether no task is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Cancel every trigger. Tasks stay registered.
    pub fn shutdown(&self) {
        let mut tasks = self.write();
        for entry in tasks.values_mut() {
            entry.disarm();
        }
        tracing::info!(tasks = tasks.len(), "Scheduler stopped");
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
