//! Cancellable timer backing one enabled task.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Local};
use remote_device_core::TaskDefinition;
use tokio::task::JoinHandle;

use crate::cron::CronSchedule;

/// Invoked with the task on every fire.
///
/// Runs while the trigger's fire lock is held, so it must hand the work off
/// (e.g. `tokio::spawn`) rather than block or call back into the scheduler.
pub type TriggerCallback = Arc<dyn Fn(TaskDefinition) + Send + Sync>;

struct Shared {
    /// Held across the armed check and the callback; `cancel` takes it too.
    armed: Mutex<bool>,
    next_run: Mutex<Option<DateTime<Local>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A live recurring trigger.
///
/// Once [`CronTrigger::cancel`] returns the callback will not be invoked
/// again. Dropping the trigger cancels it.
pub struct CronTrigger {
    shared: Arc<Shared>,
    handle: JoinHandle<()>,
}

impl CronTrigger {
    /// Arm a trigger for `task` on the tokio runtime.
    #[must_use]
    pub fn start(task: TaskDefinition, schedule: CronSchedule, callback: TriggerCallback) -> Self {
        let shared = Arc::new(Shared {
            armed: Mutex::new(true),
            next_run: Mutex::new(schedule.next_after(&Local::now())),
        });
        let handle = tokio::spawn(run(Arc::clone(&shared), task, schedule, callback));
        Self { shared, handle }
    }

    /// The trigger's own next invocation time; `None` once cancelled.
    #[must_use]
    pub fn next_run(&self) -> Option<DateTime<Local>> {
        let armed = lock(&self.shared.armed);
        if !*armed {
            return None;
        }
        *lock(&self.shared.next_run)
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        *lock(&self.shared.armed)
    }

    /// Disarm and stop the timer task.
    pub fn cancel(&self) {
        {
            let mut armed = lock(&self.shared.armed);
            *armed = false;
            *lock(&self.shared.next_run) = None;
        }
        self.handle.abort();
    }
}

impl Drop for CronTrigger {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn run(
    shared: Arc<Shared>,
    task: TaskDefinition,
    schedule: CronSchedule,
    callback: TriggerCallback,
) {
    loop {
        let Some(next) = *lock(&shared.next_run) else {
            tracing::debug!(task = %task.name, "Trigger has no further runs");
            return;
        };

        let wait = (next - Local::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::time::sleep(wait).await;

        let now = Local::now();
        if now < next {
            // woke early (wall clock moved); sleep again
            continue;
        }

        {
            let armed = lock(&shared.armed);
            if !*armed {
                return;
            }
            *lock(&shared.next_run) = schedule.next_after(&now.max(next));
            tracing::debug!(task = %task.name, scheduled_for = %next, "Trigger fired");
            callback(task.clone());
        }
    }
}
