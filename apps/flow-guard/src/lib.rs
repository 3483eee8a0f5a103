#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Flow Guard - Admission Control and Throughput Shaping
//!
//! Sits between the trading stack and its two unreliable dependencies, the
//! broker API and the market data pub/sub layer.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core types
//!   - `order_task`: Order tasks, idempotency keys, bounded task table
//!   - `market_data`: Underlying ticks and option snapshots
//!
//! - **Resilience**: Shared primitives
//!   - `CircuitBreaker` / `CircuitBreakerRegistry`: fault isolation
//!   - `TaskMonitor`: background task supervision
//!
//! - **Application**: Services and port definitions
//!   - `ports`: Broker, publisher and reload callback interfaces
//!   - `services`: Order executor, tick batcher, subscription reloader
//!
//! - **Infrastructure**: Adapters and ambient stack
//!   - `paper`: Paper broker and in-process publisher
//!   - `config`: Environment configuration
//!   - `health`: Health check HTTP endpoint
//!   - `metrics` / `telemetry`: Prometheus and OpenTelemetry
//!
//! # Data Flow
//!
//! ```text
//! order request ──► OrderTaskExecutor ──► CircuitBreaker ──► BrokerPort
//!
//! ticks ──────────► TickBatcher ──(size | window)──► MarketDataPublisher
//!
//! sub change ─────► SubscriptionReloader ──(debounce, rate limit)──► ReloadCallback
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core types with no runtime dependencies.
pub mod domain;

/// Resilience primitives - circuit breakers and task supervision.
pub mod resilience;

/// Application layer - Services and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::market_data::{OptionSnapshot, OptionType, UnderlyingTick};
pub use domain::order_task::{
    OrderOperation, OrderParams, OrderTask, TaskId, TaskStatus, ValidationError,
    generate_idempotency_key,
};

// Resilience
pub use resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitBreakerRegistry,
    CircuitBreakerState, ErrorCallback, TaskFailure, TaskMonitor, TaskMonitorStats, TaskOutcome,
};

// Ports
pub use application::ports::{
    BrokerError, BrokerPort, MarketDataPublisher, NoOpPublisher, PublishError, ReloadCallback,
};

// Services
pub use application::services::{
    BatchType, BatcherConfig, BatcherStats, BreakerScope, ExecutorConfig, ExecutorStats,
    OrderTaskExecutor, RejectReason, ReloaderConfig, ReloaderStats, SubmitOutcome,
    SubscriptionReloader, TickBatcher,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, Environment, FlowGuardConfig};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Paper adapters (for integration tests)
pub use infrastructure::paper::{ChannelPublisher, PaperBroker, PaperBrokerConfig};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
