//! Flow Guard Binary
//!
//! Starts the order executor, tick batcher and subscription reloader against
//! the paper adapters, plus the health endpoint.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin flow-guard
//! ```
//!
//! # Environment Variables
//!
//! - `FLOW_GUARD_ENV`: PAPER | LIVE (default: PAPER)
//! - `FLOW_GUARD_HEALTH_PORT`: Health check HTTP port (default: 8083)
//! - `FLOW_GUARD_*`: Component tuning, see `FlowGuardConfig`
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: flow-guard)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use flow_guard::infrastructure::health::{HealthServer, HealthServerState};
use flow_guard::infrastructure::paper::{ChannelPublisher, PaperBroker, PaperBrokerConfig};
use flow_guard::infrastructure::telemetry;
use flow_guard::{
    CircuitBreakerConfig, CircuitBreakerRegistry, ErrorCallback, FlowGuardConfig,
    OrderTaskExecutor, ReloadCallback, SubscriptionReloader, TaskMonitor, TickBatcher, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Name of the publisher circuit breaker.
const PUBLISHER_BREAKER: &str = "publisher";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let telemetry_guard = telemetry::init()?;

    tracing::info!(
        otlp_export = telemetry_guard.exporting(),
        "Starting Flow Guard"
    );

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics()?;

    let config = FlowGuardConfig::from_env()?;
    log_config(&config);

    if config.environment.is_live() {
        return Err("no live broker adapter is configured; run with FLOW_GUARD_ENV=PAPER".into());
    }

    let shutdown_token = CancellationToken::new();

    let monitor = TaskMonitor::new().with_error_callback(ErrorCallback::from_sync(
        |failure| {
            tracing::error!(
                task = %failure.task_name,
                panicked = failure.panicked,
                error = %failure.message,
                "Background task failed"
            );
            Ok(())
        },
    ));

    // Circuit breakers
    let breakers = Arc::new(CircuitBreakerRegistry::new(config.breaker.clone()));
    let publisher_breaker =
        breakers.register(PUBLISHER_BREAKER, CircuitBreakerConfig::publisher());

    // Paper adapters
    let broker = Arc::new(PaperBroker::new(PaperBrokerConfig::from(&config.paper)));
    let publisher = Arc::new(ChannelPublisher::new(config.paper.channel_capacity));

    // Order executor
    let executor = Arc::new(OrderTaskExecutor::new(
        config.executor.clone(),
        broker,
        Arc::clone(&breakers),
    ));
    executor.start(&monitor);

    // Tick batcher
    let batcher = Arc::new(
        TickBatcher::new(config.batcher.clone(), Arc::clone(&publisher) as _)
            .with_circuit_breaker(publisher_breaker),
    );
    batcher.start(&monitor);

    // Subscription reloader
    let reload_publisher = Arc::clone(&publisher);
    let reloader = Arc::new(SubscriptionReloader::new(
        config.reloader.clone(),
        ReloadCallback::from_sync(move || {
            let stats = reload_publisher.stats();
            tracing::info!(
                channels = stats.channels,
                receivers = stats.receivers,
                "Subscriptions reconciled"
            );
            Ok(())
        }),
    ));
    reloader.start(&monitor);

    // Health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&executor),
        Arc::clone(&batcher),
        Arc::clone(&reloader),
        Arc::clone(&breakers),
        monitor.clone(),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    let health_task = monitor.spawn("health-server", async move {
        health_server.run().await?;
        Ok(())
    });

    tracing::info!("Flow Guard ready");

    await_shutdown().await;

    let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        reloader.stop().await;
        batcher.stop().await;
        executor.stop().await;
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Components did not stop in time"
        );
    }

    shutdown_token.cancel();
    let outcome = health_task.join().await;
    tracing::debug!(?outcome, "Health server task finished");

    tracing::info!(tasks = ?monitor.stats(), "Flow Guard stopped");
    Ok(())
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &FlowGuardConfig) {
    tracing::info!(
        environment = config.environment.as_str(),
        health_port = config.server.health_port,
        workers = config.executor.workers,
        max_tasks = config.executor.max_tasks,
        breaker_scope = ?config.executor.breaker_scope,
        "Configuration loaded"
    );
    tracing::debug!(
        batching = config.batcher.enabled,
        batch_max_size = config.batcher.max_batch_size,
        batch_window_ms = config.batcher.window.as_millis(),
        reload_debounce_ms = config.reloader.debounce.as_millis(),
        reload_min_interval_ms = config.reloader.min_interval.as_millis(),
        "Component tuning"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
