//! Market Data Publisher Port (Driven Port)
//!
//! Interface for the pub/sub transport that fans market data out to
//! downstream consumers.

use async_trait::async_trait;

/// Publish error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PublishError {
    /// Connection error.
    #[error("Publish connection error: {message}")]
    ConnectionError {
        /// Error details.
        message: String,
    },

    /// Serialization error.
    #[error("Message serialization error: {message}")]
    SerializationError {
        /// Error details.
        message: String,
    },

    /// Publishing failed.
    #[error("Publish failed: {message}")]
    PublishFailed {
        /// Error details.
        message: String,
    },
}

/// Port for publishing market data messages.
#[async_trait]
pub trait MarketDataPublisher: Send + Sync {
    /// Publish one message on a channel.
    async fn publish(&self, channel: &str, message: String) -> Result<(), PublishError>;
}

/// Publisher that discards every message.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpPublisher;

#[async_trait]
impl MarketDataPublisher for NoOpPublisher {
    async fn publish(&self, _channel: &str, _message: String) -> Result<(), PublishError> {
        Ok(())
    }
}
