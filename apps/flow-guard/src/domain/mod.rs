//! Domain Layer - Core types with no runtime dependencies.
//!
//! This layer contains the order task model, the idempotency fingerprint,
//! the bounded task table and the market data value objects. Nothing here
//! spawns tasks or performs I/O.

/// Market data value objects (underlying ticks, option snapshots).
pub mod market_data;

/// Order tasks, idempotency keys and the bounded task table.
pub mod order_task;
