//! Self-rescheduling periodic task.
//!
//! The next pass is armed only after the current one returns, so two passes
//! of the same schedule never overlap however long a pass takes.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::trace;

/// A restartable periodic task bound to an owner.
#[derive(Debug)]
pub struct Schedule {
    name: &'static str,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Schedule {
    #[must_use]
    pub fn new(name: &'static str, interval: Duration) -> Self {
        Self {
            name,
            interval,
            task: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Arm the schedule: sleep `interval`, run `pass`, repeat.
    ///
    /// Any previously armed task is cancelled first. The task holds only a
    /// weak reference to `owner` and ends once the owner is dropped.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn start<T, F>(&self, owner: &Arc<T>, pass: F)
    where
        T: Send + Sync + 'static,
        F: Fn(&T) + Send + 'static,
    {
        let mut task = self.task.lock();
        if let Some(previous) = task.take() {
            previous.abort();
        }

        let owner: Weak<T> = Arc::downgrade(owner);
        let interval = self.interval;
        let name = self.name;

        *task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(owner) = owner.upgrade() else {
                    break;
                };
                trace!(schedule = name, "Running pass");
                pass(&owner);
            }
            trace!(schedule = name, "Owner dropped, schedule ended");
        }));
    }

    /// Cancel the pending pass without rescheduling.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            trace!(schedule = self.name, "Stopped");
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl Drop for Schedule {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}
