//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `BrokerPort`: Order placement, modification and cancellation
//! - `MarketDataPublisher`: Pub/sub transport for market data
//! - `ReloadCallback`: Subscription reconciliation operation

mod broker_port;
mod publisher_port;
mod reload_callback;

#[cfg(test)]
pub use broker_port::MockBrokerPort;
pub use broker_port::{BrokerError, BrokerPort};
pub(crate) use broker_port::dispatch;
pub use publisher_port::{MarketDataPublisher, NoOpPublisher, PublishError};
pub use reload_callback::ReloadCallback;
