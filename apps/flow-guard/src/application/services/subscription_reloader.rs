//! Subscription Reloader
//!
//! Coalesces subscription-change notifications into as few reconciliation
//! runs as possible.
//!
//! # Timing
//!
//! ```text
//! trigger ─┬─ trigger ─┬─ trigger ────── debounce ──────┐
//!          │ (restart) │ (restart)                       ▼
//!                                      wait for min_interval since last start
//!                                                        ▼
//!                                              run (single-flight, timeout)
//! ```
//!
//! - **Debounce**: a run starts only after `debounce` of quiet time.
//! - **Rate limit**: consecutive run start times are at least `min_interval`
//!   apart.
//! - **Single-flight**: one run at a time; triggers that arrive mid-run are
//!   picked up by the next cycle.
//!
//! Reload errors, panics and timeouts are logged and counted. The loop keeps
//! servicing later triggers.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::application::ports::ReloadCallback;
use crate::infrastructure::metrics;
use crate::resilience::{MonitoredTask, TaskMonitor, panic_message};

/// Reloader configuration.
#[derive(Debug, Clone)]
pub struct ReloaderConfig {
    /// Quiet time required after the last trigger.
    pub debounce: Duration,
    /// Minimum time between consecutive run starts.
    pub min_interval: Duration,
    /// Upper bound on a single run.
    pub reload_timeout: Duration,
}

impl Default for ReloaderConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(1),
            min_interval: Duration::from_secs(5),
            reload_timeout: Duration::from_secs(30),
        }
    }
}

/// Reloader statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ReloaderStats {
    /// Loop running.
    pub running: bool,
    /// A trigger is waiting to be serviced.
    pub pending: bool,
    /// A run is in flight.
    pub in_flight: bool,
    /// Triggers received.
    pub triggers: u64,
    /// Runs started.
    pub executions: u64,
    /// Runs that failed, panicked or timed out.
    pub failures: u64,
    /// When the last run finished.
    pub last_reload_at: Option<DateTime<Utc>>,
    /// Error from the last run, if it failed.
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct ReloadState {
    pending: bool,
    last_trigger: Option<Instant>,
    last_reload_start: Option<Instant>,
    last_reload_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

/// Debounced, rate-limited, single-flight runner for a reconciliation.
pub struct SubscriptionReloader {
    config: ReloaderConfig,
    reload: ReloadCallback,
    state: Mutex<ReloadState>,
    triggered: Notify,
    slot: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    task: Mutex<Option<MonitoredTask>>,
    triggers: AtomicU64,
    executions: AtomicU64,
    failures: AtomicU64,
}

impl std::fmt::Debug for SubscriptionReloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionReloader")
            .field("config", &self.config)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl SubscriptionReloader {
    /// Create a reloader. The loop starts with [`Self::start`].
    #[must_use]
    pub fn new(config: ReloaderConfig, reload: ReloadCallback) -> Self {
        Self {
            config,
            reload,
            state: Mutex::new(ReloadState::default()),
            triggered: Notify::new(),
            slot: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
            triggers: AtomicU64::new(0),
            executions: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Record that subscriptions changed. Never runs the reload inline.
    pub fn trigger_reload(&self) {
        {
            let mut state = self.state.lock();
            state.pending = true;
            state.last_trigger = Some(Instant::now());
        }
        self.triggers.fetch_add(1, Ordering::Relaxed);
        self.triggered.notify_one();
        tracing::debug!("Subscription reload triggered");
    }

    /// Run a reload now, skipping the debounce.
    ///
    /// Waits for an in-flight run to finish first.
    ///
    /// # Errors
    ///
    /// Returns the run's failure, or an error if the reloader was stopped.
    pub async fn reload_now(&self) -> anyhow::Result<()> {
        if self.cancel.is_cancelled() {
            return Err(anyhow!("subscription reloader stopped"));
        }

        let _slot = self.slot.lock().await;
        self.run_locked().await.map_err(|e| anyhow!(e))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Spawn the reload loop.
    pub fn start(self: &Arc<Self>, monitor: &TaskMonitor) {
        let mut task = self.task.lock();
        if task.is_some() || self.cancel.is_cancelled() {
            tracing::warn!("Subscription reloader already started");
            return;
        }

        let reloader = Arc::clone(self);
        *task = Some(monitor.spawn("subscription-reloader", reloader.run()));

        tracing::info!(
            debounce_ms = self.config.debounce.as_millis(),
            min_interval_ms = self.config.min_interval.as_millis(),
            "Subscription reloader started"
        );
    }

    /// Stop the loop. A pending reload is discarded; an in-flight one is
    /// allowed to finish.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let task = self.task.lock().take();
        if let Some(task) = task {
            task.join().await;
        }

        tracing::info!(pending = self.state.lock().pending, "Subscription reloader stopped");
    }

    /// Returns true while the loop runs.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
            && self
                .task
                .lock()
                .as_ref()
                .is_some_and(|task| !task.is_finished())
    }

    /// Get reload statistics.
    #[must_use]
    pub fn stats(&self) -> ReloaderStats {
        let state = self.state.lock();
        ReloaderStats {
            running: self.is_running(),
            pending: state.pending,
            in_flight: self.slot.try_lock().is_err(),
            triggers: self.triggers.load(Ordering::Relaxed),
            executions: self.executions.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            last_reload_at: state.last_reload_at,
            last_error: state.last_error.clone(),
        }
    }

    // =========================================================================
    // Loop
    // =========================================================================

    async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        while self.wait_for_trigger().await && self.wait_until_due().await {
            let _slot = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                slot = self.slot.lock() => slot,
            };

            if self.cancel.is_cancelled() {
                break;
            }

            // Already serviced by reload_now while we waited for the slot.
            if !self.state.lock().pending {
                continue;
            }

            // reload_now may have moved the window while we waited.
            if self.due_at().is_some_and(|due| Instant::now() < due) {
                continue;
            }

            // Failures are recorded by run_locked.
            let _ = self.run_locked().await;
        }

        Ok(())
    }

    /// Wait until a trigger is pending. Returns false on cancellation.
    async fn wait_for_trigger(&self) -> bool {
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            if self.state.lock().pending {
                return true;
            }
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return false,
                () = self.triggered.notified() => {}
            }
        }
    }

    /// Earliest instant a run may start: `debounce` after the latest trigger
    /// and `min_interval` after the last run started.
    fn due_at(&self) -> Option<Instant> {
        let state = self.state.lock();
        let quiet = state.last_trigger.map(|at| at + self.config.debounce);
        let allowed = state
            .last_reload_start
            .map(|at| at + self.config.min_interval);
        quiet.max(allowed)
    }

    /// Wait until both the debounce and the rate limit are satisfied.
    /// Triggers that land while waiting push the deadline out. Returns false
    /// on cancellation.
    async fn wait_until_due(&self) -> bool {
        loop {
            let Some(due) = self.due_at() else {
                return !self.cancel.is_cancelled();
            };

            let now = Instant::now();
            if now >= due {
                return !self.cancel.is_cancelled();
            }

            tracing::debug!(wait_ms = (due - now).as_millis(), "Reload deferred");
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return false,
                () = tokio::time::sleep_until(due) => {}
            }
        }
    }

    /// Run the reload. The caller holds the execution slot.
    async fn run_locked(&self) -> Result<(), String> {
        let started = Instant::now();
        {
            let mut state = self.state.lock();
            state.pending = false;
            state.last_reload_start = Some(started);
        }
        let execution = self.executions.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(execution, "Reloading subscriptions");

        let result = tokio::time::timeout(
            self.config.reload_timeout,
            AssertUnwindSafe(async { self.reload.call().await }).catch_unwind(),
        )
        .await;

        let outcome = match result {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(format!("{e:#}")),
            Ok(Err(panic)) => Err(format!("reload panicked: {}", panic_message(panic.as_ref()))),
            Err(_) => Err(format!(
                "reload timed out after {}ms",
                self.config.reload_timeout.as_millis()
            )),
        };

        let elapsed = started.elapsed();
        metrics::record_reload(outcome.is_ok(), elapsed);

        {
            let mut state = self.state.lock();
            state.last_reload_at = Some(Utc::now());
            state.last_error = outcome.as_ref().err().cloned();
        }

        match &outcome {
            Ok(()) => tracing::info!(
                execution,
                elapsed_ms = elapsed.as_millis(),
                "Subscriptions reloaded"
            ),
            Err(error) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(execution, error = %error, "Subscription reload failed");
            }
        }

        outcome
    }
}
