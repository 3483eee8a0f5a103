//! Order Task Executor
//!
//! Admission and execution for broker order operations.
//!
//! # Flow
//!
//! ```text
//! submit_task ──► validate ──► idempotency lookup ──► Duplicate(existing)
//!                                     │
//!                                     ▼
//!                          insert PENDING + enqueue ──► Accepted(task)
//!                                     │
//!                                     ▼
//!    worker: PROCESSING ──► breaker.can_execute()? ──no──► FAILED "circuit_open"
//!                                     │ yes
//!                                     ▼
//!              broker call (bounded by broker_timeout)
//!                 ok ──► COMPLETED + record_success
//!        err/timeout/panic ──► FAILED + record_failure
//! ```
//!
//! The lookup and the insert happen in one critical section, so concurrent
//! submissions of the same logical request resolve to one task. Broker
//! failures are recorded on the task and never surface to the submitter.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{self, BrokerPort};
use crate::domain::order_task::{
    InsertError, OrderOperation, OrderParams, OrderTask, TaskId, TaskStatus, TaskTable,
    ValidationError,
};
use crate::infrastructure::metrics::{self, RejectLabel};
use crate::resilience::{
    CircuitBreaker, CircuitBreakerMetrics, CircuitBreakerRegistry, MonitoredTask, TaskMonitor,
    panic_message,
};

/// Error recorded when the breaker refuses a call.
pub const CIRCUIT_OPEN: &str = "circuit_open";

/// Error recorded on tasks still pending at shutdown.
pub const EXECUTOR_STOPPED: &str = "executor_stopped";

/// Error recorded when a broker call exceeds its timeout.
pub const BROKER_TIMEOUT: &str = "broker_timeout";

/// Name of the shared broker breaker.
pub const SHARED_BREAKER: &str = "broker";

// =============================================================================
// Configuration
// =============================================================================

/// Which circuit breaker guards a broker call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerScope {
    /// One breaker (`broker`) for every account.
    #[default]
    Shared,
    /// One breaker per account (`broker:{account_id}`).
    PerAccount,
}

impl BreakerScope {
    /// Breaker name for an account.
    #[must_use]
    pub fn breaker_name(self, account_id: &str) -> String {
        match self {
            Self::Shared => SHARED_BREAKER.to_string(),
            Self::PerAccount => format!("{SHARED_BREAKER}:{account_id}"),
        }
    }
}

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum tasks held in the table.
    pub max_tasks: usize,
    /// Number of worker loops.
    pub workers: usize,
    /// Upper bound on a single broker call.
    pub broker_timeout: Duration,
    /// How long a terminal task keeps answering duplicates.
    pub idempotency_ttl: Duration,
    /// Breaker scope.
    pub breaker_scope: BreakerScope,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_tasks: 10_000,
            workers: 1,
            broker_timeout: Duration::from_secs(10),
            idempotency_ttl: Duration::from_secs(24 * 60 * 60),
            breaker_scope: BreakerScope::Shared,
        }
    }
}

// =============================================================================
// Outcomes
// =============================================================================

/// Why a submission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Table is full of active tasks.
    Backpressure,
    /// Executor has been stopped.
    ShuttingDown,
}

impl RejectReason {
    const fn label(self) -> RejectLabel {
        match self {
            Self::Backpressure => RejectLabel::Backpressure,
            Self::ShuttingDown => RejectLabel::ShuttingDown,
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backpressure => write!(f, "backpressure"),
            Self::ShuttingDown => write!(f, "shutting_down"),
        }
    }
}

/// Result of a structurally valid submission.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// New task created and queued.
    Accepted(OrderTask),
    /// Request matched an existing task; nothing was scheduled.
    Duplicate(OrderTask),
    /// Request refused.
    Rejected(RejectReason),
}

impl SubmitOutcome {
    /// The task this submission resolved to, if any.
    #[must_use]
    pub const fn task(&self) -> Option<&OrderTask> {
        match self {
            Self::Accepted(task) | Self::Duplicate(task) => Some(task),
            Self::Rejected(_) => None,
        }
    }

    /// Task ID this submission resolved to, if any.
    #[must_use]
    pub fn task_id(&self) -> Option<TaskId> {
        self.task().map(|task| task.task_id)
    }

    /// Returns true for a new task.
    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }

    /// Returns true when an existing task was returned.
    #[must_use]
    pub const fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

/// Executor statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutorStats {
    /// Worker loops running.
    pub running: bool,
    /// Table capacity.
    pub capacity: usize,
    /// Tasks in the table.
    pub total: usize,
    /// PENDING tasks.
    pub pending: usize,
    /// PROCESSING tasks.
    pub processing: usize,
    /// COMPLETED tasks.
    pub completed: usize,
    /// FAILED tasks.
    pub failed: usize,
    /// Accepted submissions.
    pub submitted: u64,
    /// Submissions answered with an existing task.
    pub duplicates: u64,
    /// Refused submissions.
    pub rejected: u64,
    /// Terminal tasks evicted to make room.
    pub evicted: u64,
    /// Broker breakers.
    pub breakers: Vec<CircuitBreakerMetrics>,
}

// =============================================================================
// Executor
// =============================================================================

#[derive(Debug)]
struct ExecutorState {
    table: TaskTable,
    pending: VecDeque<TaskId>,
    accepting: bool,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    duplicates: AtomicU64,
    rejected: AtomicU64,
    evicted: AtomicU64,
}

/// Idempotent, circuit-protected executor for broker order operations.
pub struct OrderTaskExecutor {
    config: ExecutorConfig,
    broker: Arc<dyn BrokerPort>,
    breakers: Arc<CircuitBreakerRegistry>,
    state: Mutex<ExecutorState>,
    work_available: Notify,
    cancel: CancellationToken,
    workers: Mutex<Vec<MonitoredTask>>,
    counters: Counters,
}

impl std::fmt::Debug for OrderTaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderTaskExecutor")
            .field("config", &self.config)
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl OrderTaskExecutor {
    /// Create an executor. Workers start with [`Self::start`].
    #[must_use]
    pub fn new(
        config: ExecutorConfig,
        broker: Arc<dyn BrokerPort>,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Self {
        let table = TaskTable::new(config.max_tasks);
        Self {
            config,
            broker,
            breakers,
            state: Mutex::new(ExecutorState {
                table,
                pending: VecDeque::new(),
                accepting: true,
            }),
            work_available: Notify::new(),
            cancel: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
            counters: Counters::default(),
        }
    }

    /// Get the configuration.
    #[must_use]
    pub const fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Submit a request by operation name.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] for an unknown operation, an empty
    /// account ID or params that are not a JSON object. Every other outcome
    /// is reported through [`SubmitOutcome`].
    pub fn submit_task(
        &self,
        operation: &str,
        account_id: &str,
        params: Value,
    ) -> Result<SubmitOutcome, ValidationError> {
        let operation: OrderOperation = operation.parse()?;
        let params = OrderParams::try_from(params)?;
        self.submit(operation, account_id, params)
    }

    /// Submit a typed request.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyAccountId`] if `account_id` is blank.
    pub fn submit(
        &self,
        operation: OrderOperation,
        account_id: &str,
        params: OrderParams,
    ) -> Result<SubmitOutcome, ValidationError> {
        let account_id = account_id.trim();
        if account_id.is_empty() {
            return Err(ValidationError::EmptyAccountId);
        }

        let candidate = OrderTask::new(operation, account_id.to_string(), params);
        let outcome = self.admit(candidate);

        match &outcome {
            SubmitOutcome::Accepted(task) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                metrics::record_order_submitted(operation);
                self.work_available.notify_one();
                tracing::info!(
                    task_id = %task.task_id,
                    operation = %operation,
                    account_id = %task.account_id,
                    "Order task accepted"
                );
            }
            SubmitOutcome::Duplicate(task) => {
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                metrics::record_order_duplicate(operation);
                tracing::info!(
                    task_id = %task.task_id,
                    status = %task.status,
                    operation = %operation,
                    "Duplicate order request"
                );
            }
            SubmitOutcome::Rejected(reason) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                metrics::record_order_rejected(reason.label());
                tracing::warn!(
                    operation = %operation,
                    account_id = %account_id,
                    reason = %reason,
                    "Order request rejected"
                );
            }
        }

        Ok(outcome)
    }

    /// Idempotency lookup and insert, under one lock.
    fn admit(&self, candidate: OrderTask) -> SubmitOutcome {
        let mut state = self.state.lock();

        if !state.accepting {
            return SubmitOutcome::Rejected(RejectReason::ShuttingDown);
        }

        if let Some(existing) = state.table.find_by_key(&candidate.idempotency_key) {
            if !existing.is_terminal() || !self.is_expired(existing) {
                return SubmitOutcome::Duplicate(existing.clone());
            }

            let stale = existing.task_id;
            state.table.remove(&stale);
            tracing::debug!(task_id = %stale, "Idempotency window expired, replacing task");
        }

        match state.table.insert(candidate.clone()) {
            Ok(evicted) => {
                if let Some(evicted) = evicted {
                    self.counters.evicted.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(task_id = %evicted.task_id, "Evicted oldest terminal task");
                }
                state.pending.push_back(candidate.task_id);
                SubmitOutcome::Accepted(candidate)
            }
            Err(InsertError::Full { .. }) => SubmitOutcome::Rejected(RejectReason::Backpressure),
            Err(InsertError::DuplicateKey(key)) => state
                .table
                .find_by_key(&key)
                .cloned()
                .map_or(
                    SubmitOutcome::Rejected(RejectReason::Backpressure),
                    SubmitOutcome::Duplicate,
                ),
        }
    }

    fn is_expired(&self, task: &OrderTask) -> bool {
        let ttl = chrono::TimeDelta::from_std(self.config.idempotency_ttl)
            .unwrap_or(chrono::TimeDelta::MAX);
        task.age() >= ttl
    }

    /// Look up a task.
    #[must_use]
    pub fn get_task(&self, task_id: &TaskId) -> Option<OrderTask> {
        self.state.lock().table.get(task_id).cloned()
    }

    /// List tasks in creation order, optionally filtered by status.
    #[must_use]
    pub fn get_all_tasks(&self, status: Option<TaskStatus>) -> Vec<OrderTask> {
        let state = self.state.lock();
        state
            .table
            .iter()
            .filter(|task| status.is_none_or(|s| task.status == s))
            .cloned()
            .collect()
    }

    /// Number of tasks waiting for a worker.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Get executor statistics.
    #[must_use]
    pub fn stats(&self) -> ExecutorStats {
        let (total, pending, processing, completed, failed) = {
            let state = self.state.lock();
            let table = &state.table;
            (
                table.len(),
                table.count_by_status(TaskStatus::Pending),
                table.count_by_status(TaskStatus::Processing),
                table.count_by_status(TaskStatus::Completed),
                table.count_by_status(TaskStatus::Failed),
            )
        };

        let breakers = self
            .breakers
            .all_metrics()
            .into_iter()
            .filter(|m| {
                m.name == SHARED_BREAKER || m.name.starts_with(&format!("{SHARED_BREAKER}:"))
            })
            .collect();

        ExecutorStats {
            running: self.is_running(),
            capacity: self.config.max_tasks,
            total,
            pending,
            processing,
            completed,
            failed,
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            breakers,
        }
    }

    /// Returns true while worker loops are running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.workers.lock().is_empty() && !self.cancel.is_cancelled()
    }

    /// Breaker guarding calls for an account.
    #[must_use]
    pub fn breaker_for(&self, account_id: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .get_or_create(&self.config.breaker_scope.breaker_name(account_id))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Spawn the worker loops.
    ///
    /// Calling `start` on a running or stopped executor does nothing.
    pub fn start(self: &Arc<Self>, monitor: &TaskMonitor) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() || self.cancel.is_cancelled() {
            tracing::warn!("Order executor already started");
            return;
        }

        let count = self.config.workers.max(1);
        for worker_id in 0..count {
            let executor = Arc::clone(self);
            workers.push(monitor.spawn(
                format!("order-worker-{worker_id}"),
                executor.run_worker(worker_id),
            ));
        }

        tracing::info!(
            workers = count,
            max_tasks = self.config.max_tasks,
            broker_timeout_ms = self.config.broker_timeout.as_millis(),
            "Order executor started"
        );
    }

    /// Stop accepting work, let in-flight calls finish and fail the rest.
    ///
    /// After `stop` returns no task is PENDING or PROCESSING.
    pub async fn stop(&self) {
        self.state.lock().accepting = false;
        self.cancel.cancel();

        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            worker.join().await;
        }

        let abandoned = {
            let mut state = self.state.lock();
            let queued: Vec<_> = state.pending.drain(..).collect();
            let mut abandoned = Vec::with_capacity(queued.len());
            for task_id in queued {
                if let Some(task) = state
                    .table
                    .update(&task_id, |t| t.mark_failed(EXECUTOR_STOPPED))
                {
                    abandoned.push(task);
                }
            }
            abandoned
        };

        for task in &abandoned {
            metrics::record_task_finished(task.operation, task.status);
        }

        tracing::info!(abandoned = abandoned.len(), "Order executor stopped");
    }

    // =========================================================================
    // Workers
    // =========================================================================

    async fn run_worker(self: Arc<Self>, worker_id: usize) -> anyhow::Result<()> {
        tracing::debug!(worker_id, "Order worker started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            if let Some(task) = self.next_pending() {
                self.execute(task).await;
                continue;
            }

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = self.work_available.notified() => {}
            }
        }

        tracing::debug!(worker_id, "Order worker stopped");
        Ok(())
    }

    /// Pop the next queued task and mark it PROCESSING.
    fn next_pending(&self) -> Option<OrderTask> {
        let mut state = self.state.lock();

        while let Some(task_id) = state.pending.pop_front() {
            if let Some(task) = state.table.update(&task_id, OrderTask::mark_processing) {
                if !state.pending.is_empty() {
                    self.work_available.notify_one();
                }
                return Some(task);
            }
        }

        None
    }

    async fn execute(&self, task: OrderTask) {
        let breaker = self.breaker_for(&task.account_id);

        if !breaker.can_execute() {
            tracing::warn!(
                task_id = %task.task_id,
                breaker = %breaker.name(),
                "Circuit open, broker call skipped"
            );
            self.finish(&task, Err(CIRCUIT_OPEN.to_string()));
            return;
        }

        let started = Instant::now();
        let call = ports::dispatch(
            self.broker.as_ref(),
            task.operation,
            &task.account_id,
            &task.params,
        );
        let result =
            tokio::time::timeout(self.config.broker_timeout, AssertUnwindSafe(call).catch_unwind())
                .await;
        metrics::record_broker_call(task.operation, started.elapsed());

        let outcome = match result {
            Ok(Ok(Ok(response))) => {
                breaker.record_success();
                Ok(response)
            }
            Ok(Ok(Err(e))) => {
                breaker.record_failure(&e);
                Err(e.to_string())
            }
            Ok(Err(panic)) => {
                let message = format!("broker call panicked: {}", panic_message(panic.as_ref()));
                breaker.record_failure(&message);
                Err(message)
            }
            Err(_elapsed) => {
                breaker.record_failure(&BROKER_TIMEOUT);
                Err(BROKER_TIMEOUT.to_string())
            }
        };

        self.finish(&task, outcome);
    }

    fn finish(&self, task: &OrderTask, outcome: Result<Value, String>) {
        let updated = {
            let mut state = self.state.lock();
            match outcome {
                Ok(response) => state
                    .table
                    .update(&task.task_id, |t| t.mark_completed(response)),
                Err(error) => state.table.update(&task.task_id, |t| t.mark_failed(error)),
            }
        };

        let Some(updated) = updated else {
            return;
        };

        metrics::record_task_finished(updated.operation, updated.status);
        match updated.status {
            TaskStatus::Completed => tracing::info!(
                task_id = %updated.task_id,
                operation = %updated.operation,
                "Order task completed"
            ),
            _ => tracing::warn!(
                task_id = %updated.task_id,
                operation = %updated.operation,
                error = updated.error.as_deref().unwrap_or_default(),
                "Order task failed"
            ),
        }
    }
}
