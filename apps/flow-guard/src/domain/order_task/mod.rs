//! Order Task Types
//!
//! Domain types for broker order operations that pass through the
//! idempotent task executor.
//!
//! # Lifecycle
//!
//! ```text
//! PENDING → PROCESSING → COMPLETED
//!                      ↘ FAILED
//! ```
//!
//! A task is created on the first submission of a given idempotency key.
//! Later submissions of the same logical request resolve to the same task.

mod errors;
mod idempotency;
mod table;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub use errors::ValidationError;
pub use idempotency::{canonical_json, generate_idempotency_key};
pub use table::{InsertError, TaskTable};

// =============================================================================
// Identifiers
// =============================================================================

/// Unique identifier for an order task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generate a new unique task identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// =============================================================================
// Operation
// =============================================================================

/// Broker operation carried by a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderOperation {
    /// Place a new order.
    PlaceOrder,
    /// Modify a resting order.
    ModifyOrder,
    /// Cancel a resting order.
    CancelOrder,
}

impl OrderOperation {
    /// Get all operations.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::PlaceOrder, Self::ModifyOrder, Self::CancelOrder]
    }

    /// Wire name of the operation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PlaceOrder => "place_order",
            Self::ModifyOrder => "modify_order",
            Self::CancelOrder => "cancel_order",
        }
    }
}

impl fmt::Display for OrderOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderOperation {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "place_order" => Ok(Self::PlaceOrder),
            "modify_order" => Ok(Self::ModifyOrder),
            "cancel_order" => Ok(Self::CancelOrder),
            other => Err(ValidationError::UnknownOperation(other.to_string())),
        }
    }
}

// =============================================================================
// Status
// =============================================================================

/// Task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Accepted, waiting for a worker.
    Pending,
    /// A worker is executing the broker call.
    Processing,
    /// Broker call succeeded.
    Completed,
    /// Broker call failed, timed out, or was never attempted.
    Failed,
}

impl TaskStatus {
    /// Returns true if the task will not change again.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Status name as exposed to operators.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Params
// =============================================================================

/// Structured order request parameters.
///
/// Always a JSON object. Field order carries no meaning; the idempotency
/// key is computed over the canonical encoding.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderParams(Map<String, Value>);

impl OrderParams {
    /// Create params from a JSON object.
    #[must_use]
    pub const fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Look up a field.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Get a string field.
    #[must_use]
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    /// Borrow the underlying object.
    #[must_use]
    pub const fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Stable, key-order independent encoding.
    #[must_use]
    pub fn canonical(&self) -> String {
        canonical_json(&Value::Object(self.0.clone()))
    }
}

impl TryFrom<Value> for OrderParams {
    type Error = ValidationError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(fields) => Ok(Self(fields)),
            other => Err(ValidationError::ParamsNotObject(json_kind(&other))),
        }
    }
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// =============================================================================
// Task
// =============================================================================

/// A broker operation tracked by the executor.
///
/// Values handed out by the executor are snapshots; later status changes
/// are observed by reading the task again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderTask {
    /// Unique task identifier.
    pub task_id: TaskId,
    /// Deterministic fingerprint of the logical request.
    pub idempotency_key: String,
    /// Broker operation.
    pub operation: OrderOperation,
    /// Account the operation targets.
    pub account_id: String,
    /// Request parameters.
    pub params: OrderParams,
    /// Current status.
    pub status: TaskStatus,
    /// When the task was accepted.
    pub created_at: DateTime<Utc>,
    /// When a worker picked the task up.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
    /// Broker response on success.
    pub result: Option<Value>,
    /// Failure reason.
    pub error: Option<String>,
}

impl OrderTask {
    /// Create a new pending task.
    #[must_use]
    pub fn new(operation: OrderOperation, account_id: String, params: OrderParams) -> Self {
        let idempotency_key = generate_idempotency_key(operation, &account_id, &params);
        Self {
            task_id: TaskId::generate(),
            idempotency_key,
            operation,
            account_id,
            params,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
        }
    }

    /// Mark the task as picked up by a worker.
    pub fn mark_processing(&mut self) {
        self.status = TaskStatus::Processing;
        self.started_at = Some(Utc::now());
    }

    /// Mark the task as completed with the broker response.
    pub fn mark_completed(&mut self, result: Value) {
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self.finished_at = Some(Utc::now());
    }

    /// Mark the task as failed.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.error = Some(error.into());
        self.finished_at = Some(Utc::now());
    }

    /// Returns true if the task has reached a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock age of the task.
    #[must_use]
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}
