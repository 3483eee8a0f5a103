//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the admission-control services and the port
//! interfaces through which they reach the broker, the pub/sub transport
//! and the subscription reconciler.

/// Port interfaces for external systems (broker, publisher, reconciler).
pub mod ports;

/// Order execution, tick batching and subscription reload services.
pub mod services;
