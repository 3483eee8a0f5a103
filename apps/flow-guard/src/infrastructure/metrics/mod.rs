//! Prometheus Metrics Module
//!
//! Exposes admission-control and throughput metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Orders**: Submissions, duplicates, rejections and task outcomes
//! - **Circuit breakers**: State gauge and rejected calls per breaker
//! - **Batching**: Published and failed batches, batch sizes
//! - **Reloads**: Reconciliation executions, failures and durations
//! - **Tasks**: Monitored background task outcomes
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! functions are safe to call before [`init_metrics`]: without an installed
//! recorder they are no-ops.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::order_task::{OrderOperation, TaskStatus};
use crate::resilience::CircuitBreakerState;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Subsequent calls return the handle installed by the first call.
///
/// # Errors
///
/// Returns an error if the global recorder cannot be installed (another
/// recorder is already registered).
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();

    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Order admission
    describe_counter!(
        "flow_guard_orders_submitted_total",
        "Order requests accepted as new tasks"
    );
    describe_counter!(
        "flow_guard_orders_duplicate_total",
        "Order requests resolved to an existing task"
    );
    describe_counter!(
        "flow_guard_orders_rejected_total",
        "Order requests refused by admission control"
    );
    describe_counter!(
        "flow_guard_order_tasks_finished_total",
        "Order tasks that reached a terminal status"
    );
    describe_histogram!(
        "flow_guard_broker_call_seconds",
        "Broker call latency"
    );

    // Circuit breakers
    describe_gauge!(
        "flow_guard_circuit_state",
        "Circuit breaker state (0=closed, 1=open, 2=half-open)"
    );
    describe_counter!(
        "flow_guard_circuit_rejections_total",
        "Calls refused by an open circuit breaker"
    );

    // Batching
    describe_counter!(
        "flow_guard_batches_published_total",
        "Batched market data messages published"
    );
    describe_counter!(
        "flow_guard_batch_publish_failures_total",
        "Batched market data publishes that failed"
    );
    describe_histogram!(
        "flow_guard_batch_size",
        "Items per published batch"
    );

    // Reloads
    describe_counter!(
        "flow_guard_reloads_total",
        "Subscription reload executions by outcome"
    );
    describe_histogram!(
        "flow_guard_reload_seconds",
        "Subscription reload duration"
    );

    // Monitored tasks
    describe_counter!(
        "flow_guard_monitored_tasks_total",
        "Background task exits by outcome"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Metric labels for batch types.
#[derive(Debug, Clone, Copy)]
pub enum BatchKind {
    /// Underlying ticks.
    Underlying,
    /// Option snapshots.
    Options,
}

impl BatchKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Underlying => "underlying",
            Self::Options => "options",
        }
    }
}

/// Metric labels for admission rejections.
#[derive(Debug, Clone, Copy)]
pub enum RejectLabel {
    /// Task table full of active tasks.
    Backpressure,
    /// Executor stopped.
    ShuttingDown,
}

impl RejectLabel {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Backpressure => "backpressure",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

/// Metric labels for background task outcomes.
#[derive(Debug, Clone, Copy)]
pub enum TaskExit {
    /// Returned `Ok`.
    Completed,
    /// Returned `Err`.
    Failed,
    /// Panicked.
    Panicked,
    /// Aborted.
    Cancelled,
}

impl TaskExit {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Panicked => "panicked",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Record an order request accepted as a new task.
pub fn record_order_submitted(operation: OrderOperation) {
    counter!(
        "flow_guard_orders_submitted_total",
        "operation" => operation.as_str()
    )
    .increment(1);
}

/// Record an order request resolved to an existing task.
pub fn record_order_duplicate(operation: OrderOperation) {
    counter!(
        "flow_guard_orders_duplicate_total",
        "operation" => operation.as_str()
    )
    .increment(1);
}

/// Record an order request refused by admission control.
pub fn record_order_rejected(reason: RejectLabel) {
    counter!(
        "flow_guard_orders_rejected_total",
        "reason" => reason.as_str()
    )
    .increment(1);
}

/// Record an order task reaching a terminal status.
pub fn record_task_finished(operation: OrderOperation, status: TaskStatus) {
    counter!(
        "flow_guard_order_tasks_finished_total",
        "operation" => operation.as_str(),
        "status" => status.as_str()
    )
    .increment(1);
}

/// Record broker call latency.
pub fn record_broker_call(operation: OrderOperation, duration: Duration) {
    histogram!(
        "flow_guard_broker_call_seconds",
        "operation" => operation.as_str()
    )
    .record(duration.as_secs_f64());
}

/// Update the state gauge of a circuit breaker.
pub fn set_circuit_state(name: &str, state: CircuitBreakerState) {
    gauge!(
        "flow_guard_circuit_state",
        "breaker" => name.to_string()
    )
    .set(state.as_gauge());
}

/// Record a call refused by a circuit breaker.
pub fn record_circuit_rejection(name: &str) {
    counter!(
        "flow_guard_circuit_rejections_total",
        "breaker" => name.to_string()
    )
    .increment(1);
}

/// Record a published batch.
pub fn record_batch_published(kind: BatchKind, size: usize) {
    counter!(
        "flow_guard_batches_published_total",
        "batch" => kind.as_str()
    )
    .increment(1);

    #[allow(clippy::cast_precision_loss)]
    histogram!(
        "flow_guard_batch_size",
        "batch" => kind.as_str()
    )
    .record(size as f64);
}

/// Record a failed batch publish.
pub fn record_batch_failed(kind: BatchKind) {
    counter!(
        "flow_guard_batch_publish_failures_total",
        "batch" => kind.as_str()
    )
    .increment(1);
}

/// Record a finished subscription reload.
pub fn record_reload(success: bool, duration: Duration) {
    counter!(
        "flow_guard_reloads_total",
        "outcome" => if success { "success" } else { "failure" }
    )
    .increment(1);
    histogram!("flow_guard_reload_seconds").record(duration.as_secs_f64());
}

/// Record a monitored background task exit.
pub fn record_task_exit(exit: TaskExit) {
    counter!(
        "flow_guard_monitored_tasks_total",
        "outcome" => exit.as_str()
    )
    .increment(1);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_kind_as_str() {
        assert_eq!(BatchKind::Underlying.as_str(), "underlying");
        assert_eq!(BatchKind::Options.as_str(), "options");
    }

    #[test]
    fn reject_label_as_str() {
        assert_eq!(RejectLabel::Backpressure.as_str(), "backpressure");
        assert_eq!(RejectLabel::ShuttingDown.as_str(), "shutting_down");
    }

    #[test]
    fn task_exit_as_str() {
        assert_eq!(TaskExit::Completed.as_str(), "completed");
        assert_eq!(TaskExit::Failed.as_str(), "failed");
        assert_eq!(TaskExit::Panicked.as_str(), "panicked");
        assert_eq!(TaskExit::Cancelled.as_str(), "cancelled");
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        record_order_submitted(OrderOperation::PlaceOrder);
        record_batch_published(BatchKind::Options, 12);
        record_reload(false, Duration::from_millis(5));
        set_circuit_state("broker", CircuitBreakerState::Open);
    }
}
