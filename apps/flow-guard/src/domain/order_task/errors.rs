//! Order task validation errors.

/// A structurally invalid task request.
///
/// This is the only error `submit_task` surfaces to its caller. Broker
/// failures are recorded on the task instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Operation name is not one of the supported broker operations.
    #[error("unknown operation: {0:?}")]
    UnknownOperation(String),

    /// Account identifier is missing.
    #[error("account_id cannot be empty")]
    EmptyAccountId,

    /// Params must be a JSON object.
    #[error("params must be a JSON object, got {0}")]
    ParamsNotObject(&'static str),
}
