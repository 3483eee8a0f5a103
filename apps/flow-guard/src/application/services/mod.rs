//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `OrderTaskExecutor`: Idempotent, circuit-protected order execution
//! - `TickBatcher`: Batched market data publishing
//! - `SubscriptionReloader`: Debounced subscription reconciliation

mod order_executor;
mod subscription_reloader;
mod tick_batcher;

pub use order_executor::{
    BROKER_TIMEOUT, BreakerScope, CIRCUIT_OPEN, EXECUTOR_STOPPED, ExecutorConfig, ExecutorStats,
    OrderTaskExecutor, RejectReason, SHARED_BREAKER, SubmitOutcome,
};
pub use subscription_reloader::{ReloaderConfig, ReloaderStats, SubscriptionReloader};
pub use tick_batcher::{BatchType, BatcherConfig, BatcherStats, BufferStats, TickBatcher};
