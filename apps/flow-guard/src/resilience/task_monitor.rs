//! Supervision for background tasks.
//!
//! Every long-running loop in the service (executor workers, the batch
//! timer, the reload loop) is spawned through a [`TaskMonitor`]. The monitor
//! catches errors and panics, logs them with the task name, counts outcomes
//! and hands failures to an optional [`ErrorCallback`]. Nothing dies silently.
//!
//! # Example
//!
//! ```rust,no_run
//! use flow_guard::resilience::{ErrorCallback, TaskMonitor, TaskOutcome};
//!
//! # async fn demo() {
//! let monitor = TaskMonitor::new().with_error_callback(ErrorCallback::from_sync(|failure| {
//!     eprintln!("{} died: {}", failure.task_name, failure.message);
//!     Ok(())
//! }));
//!
//! let handle = monitor.spawn("worker", async { Err(anyhow::anyhow!("boom")) });
//! assert!(matches!(handle.join().await, TaskOutcome::Failed(_)));
//! # }
//! ```

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::infrastructure::metrics::{self, TaskExit};

/// How a monitored task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Returned `Ok(())`.
    Completed,
    /// Returned an error (rendered with its cause chain).
    Failed(String),
    /// Panicked (panic payload message).
    Panicked(String),
    /// Aborted before finishing.
    Cancelled,
}

/// Failure report handed to the error callback.
#[derive(Debug, Clone)]
pub struct TaskFailure {
    /// Name given at spawn time.
    pub task_name: String,
    /// Error or panic message.
    pub message: String,
    /// True if the task panicked rather than returning an error.
    pub panicked: bool,
}

type CallbackFn = dyn Fn(TaskFailure) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

/// Callback invoked when a monitored task fails or panics.
///
/// Sync and async closures are normalized into one async callable.
#[derive(Clone)]
pub struct ErrorCallback(Arc<CallbackFn>);

impl ErrorCallback {
    /// Wrap an async closure.
    pub fn from_async<F, Fut>(callback: F) -> Self
    where
        F: Fn(TaskFailure) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self(Arc::new(move |failure| callback(failure).boxed()))
    }

    /// Wrap a sync closure. It runs on the runtime, inside the guard.
    pub fn from_sync<F>(callback: F) -> Self
    where
        F: Fn(TaskFailure) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);
        Self(Arc::new(move |failure| {
            let callback = Arc::clone(&callback);
            async move { callback(failure) }.boxed()
        }))
    }

    fn call(&self, failure: TaskFailure) -> BoxFuture<'static, anyhow::Result<()>> {
        (self.0)(failure)
    }
}

impl std::fmt::Debug for ErrorCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorCallback").finish_non_exhaustive()
    }
}

/// Counters over every task spawned through a monitor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskMonitorStats {
    /// Tasks spawned.
    pub spawned: u64,
    /// Tasks still running.
    pub active: u64,
    /// Tasks that returned `Ok`.
    pub completed: u64,
    /// Tasks that returned `Err`.
    pub failed: u64,
    /// Tasks that panicked.
    pub panicked: u64,
    /// Tasks aborted before finishing.
    pub cancelled: u64,
}

#[derive(Debug, Default)]
struct MonitorInner {
    callback: RwLock<Option<ErrorCallback>>,
    spawned: AtomicU64,
    active: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
    cancelled: AtomicU64,
}

impl MonitorInner {
    async fn report(&self, name: &str, outcome: &TaskOutcome) {
        let failure = match outcome {
            TaskOutcome::Completed => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                metrics::record_task_exit(TaskExit::Completed);
                tracing::debug!(task = %name, "Background task completed");
                return;
            }
            TaskOutcome::Failed(message) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                metrics::record_task_exit(TaskExit::Failed);
                tracing::error!(task = %name, error = %message, "Background task failed");
                TaskFailure {
                    task_name: name.to_string(),
                    message: message.clone(),
                    panicked: false,
                }
            }
            TaskOutcome::Panicked(message) => {
                self.panicked.fetch_add(1, Ordering::Relaxed);
                metrics::record_task_exit(TaskExit::Panicked);
                tracing::error!(task = %name, panic = %message, "Background task panicked");
                TaskFailure {
                    task_name: name.to_string(),
                    message: message.clone(),
                    panicked: true,
                }
            }
            TaskOutcome::Cancelled => return,
        };

        let callback = self.callback.read().clone();
        if let Some(callback) = callback {
            invoke_guarded(&callback, failure).await;
        }
    }
}

/// Run the error callback, containing its own errors and panics.
async fn invoke_guarded(callback: &ErrorCallback, failure: TaskFailure) {
    let name = failure.task_name.clone();
    let callback = callback.clone();

    match AssertUnwindSafe(async move { callback.call(failure).await })
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!(task = %name, error = %e, "Task error callback failed");
        }
        Err(panic) => {
            tracing::error!(
                task = %name,
                panic = %panic_message(panic.as_ref()),
                "Task error callback panicked"
            );
        }
    }
}

/// Decrements the active count when the task future is dropped, which also
/// covers aborts.
struct ActiveGuard {
    inner: Arc<MonitorInner>,
    name: String,
    finished: bool,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.inner.active.fetch_sub(1, Ordering::Relaxed);
        if !self.finished {
            self.inner.cancelled.fetch_add(1, Ordering::Relaxed);
            metrics::record_task_exit(TaskExit::Cancelled);
            tracing::debug!(task = %self.name, "Background task cancelled");
        }
    }
}

/// Spawns and supervises background tasks.
///
/// Cheap to clone; clones share counters and the error callback.
#[derive(Debug, Clone, Default)]
pub struct TaskMonitor {
    inner: Arc<MonitorInner>,
}

impl TaskMonitor {
    /// Create a monitor with no error callback.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the callback invoked for every failed or panicked task.
    #[must_use]
    pub fn with_error_callback(self, callback: ErrorCallback) -> Self {
        *self.inner.callback.write() = Some(callback);
        self
    }

    /// Spawn a monitored task on the current runtime.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F>(&self, name: impl Into<String>, future: F) -> MonitoredTask
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        self.inner.spawned.fetch_add(1, Ordering::Relaxed);
        self.inner.active.fetch_add(1, Ordering::Relaxed);

        let mut guard = ActiveGuard {
            inner: Arc::clone(&self.inner),
            name: name.clone(),
            finished: false,
        };

        tracing::debug!(task = %name, "Spawning background task");

        let handle = tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(Ok(())) => TaskOutcome::Completed,
                Ok(Err(e)) => TaskOutcome::Failed(format!("{e:#}")),
                Err(panic) => TaskOutcome::Panicked(panic_message(panic.as_ref())),
            };

            guard.finished = true;
            let inner = Arc::clone(&guard.inner);
            let name = guard.name.clone();
            drop(guard);

            inner.report(&name, &outcome).await;
            outcome
        });

        MonitoredTask { name, handle }
    }

    /// Get outcome counters.
    #[must_use]
    pub fn stats(&self) -> TaskMonitorStats {
        TaskMonitorStats {
            spawned: self.inner.spawned.load(Ordering::Relaxed),
            active: self.inner.active.load(Ordering::Relaxed),
            completed: self.inner.completed.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            panicked: self.inner.panicked.load(Ordering::Relaxed),
            cancelled: self.inner.cancelled.load(Ordering::Relaxed),
        }
    }
}

/// Handle to a task spawned through [`TaskMonitor::spawn`].
#[derive(Debug)]
pub struct MonitoredTask {
    name: String,
    handle: JoinHandle<TaskOutcome>,
}

impl MonitoredTask {
    /// Task name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true if the task has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Request cancellation at the task's next suspension point.
    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Wait for the task to end.
    pub async fn join(self) -> TaskOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => TaskOutcome::Cancelled,
            Err(e) => TaskOutcome::Panicked(e.to_string()),
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
