//! Broker Port (Driven Port)
//!
//! Interface for the broker's order API. Params are passed through as the
//! structured request the caller submitted; the response is the broker's
//! JSON acknowledgment.

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::order_task::{OrderOperation, OrderParams};

/// Broker port error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    /// Connection error.
    #[error("Broker connection error: {message}")]
    ConnectionError {
        /// Error details.
        message: String,
    },

    /// Order rejected by broker.
    #[error("Order rejected: {reason}")]
    OrderRejected {
        /// Rejection reason.
        reason: String,
    },

    /// Order not found.
    #[error("Order not found: {order_id}")]
    OrderNotFound {
        /// The missing order ID.
        order_id: String,
    },

    /// Rate limited.
    #[error("Rate limited by broker")]
    RateLimited,

    /// Unknown error.
    #[error("Broker error: {message}")]
    Unknown {
        /// Error details.
        message: String,
    },
}

/// Port for broker order operations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerPort: Send + Sync {
    /// Place a new order.
    async fn place_order(&self, account_id: &str, params: &OrderParams)
    -> Result<Value, BrokerError>;

    /// Modify an open order.
    async fn modify_order(
        &self,
        account_id: &str,
        params: &OrderParams,
    ) -> Result<Value, BrokerError>;

    /// Cancel an open order.
    async fn cancel_order(
        &self,
        account_id: &str,
        params: &OrderParams,
    ) -> Result<Value, BrokerError>;
}

/// Dispatch an operation to the matching broker call.
pub(crate) async fn dispatch(
    broker: &dyn BrokerPort,
    operation: OrderOperation,
    account_id: &str,
    params: &OrderParams,
) -> Result<Value, BrokerError> {
    match operation {
        OrderOperation::PlaceOrder => broker.place_order(account_id, params).await,
        OrderOperation::ModifyOrder => broker.modify_order(account_id, params).await,
        OrderOperation::CancelOrder => broker.cancel_order(account_id, params).await,
    }
}
