//! Cancellable delayed and background tasks.
//!
//! A [`ScheduledTask`] owns a spawned tokio task and aborts it when cancelled or
//! dropped. Replacing a timer is plain assignment: the old task is aborted as
//! the old value drops.
//!
//! All constructors spawn onto the current tokio runtime and must be called
//! from within one.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Handle to a spawned timer or background task.
#[derive(Debug)]
pub struct ScheduledTask {
    handle: JoinHandle<()>,
    deadline: Option<Instant>,
}

impl ScheduledTask {
    /// Spawn a background future.
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(future),
            deadline: None,
        }
    }

    /// Run `callback` once after `delay`.
    pub fn after<F>(delay: Duration, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline = Instant::now() + delay;
        Self {
            handle: tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                callback();
            }),
            deadline: Some(deadline),
        }
    }

    /// When a delayed task fires. `None` for spawned futures.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the task has run to completion or was cancelled.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Abort the task. Idempotent.
    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
