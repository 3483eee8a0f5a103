//! Resilience primitives shared by every service.
//!
//! - [`CircuitBreaker`]: fault isolation for unreliable dependencies
//! - [`CircuitBreakerRegistry`]: named breakers created at startup
//! - [`TaskMonitor`]: supervision for background tasks

mod circuit_breaker;
mod task_monitor;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitBreakerRegistry,
    CircuitBreakerState,
};
pub(crate) use task_monitor::panic_message;
pub use task_monitor::{
    ErrorCallback, MonitoredTask, TaskFailure, TaskMonitor, TaskMonitorStats, TaskOutcome,
};
