//! Paper Adapters
//!
//! In-process implementations of the driven ports, used by the binary in
//! paper mode and by integration tests.
//!
//! - `PaperBroker`: simulated broker with latency and failure injection
//! - `ChannelPublisher`: one tokio broadcast channel per pub/sub channel

mod broker;
mod publisher;

pub use broker::{PaperBroker, PaperBrokerConfig, PaperBrokerStats};
pub use publisher::{ChannelPublisher, ChannelPublisherStats};
