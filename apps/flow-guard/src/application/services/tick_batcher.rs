//! Tick Batcher
//!
//! Coalesces high-rate market data into batched publishes so bursts do not
//! overwhelm the pub/sub layer.
//!
//! Two independent buffers (underlying ticks, option snapshots) are flushed
//! when either:
//!
//! - the buffer reaches `max_batch_size` (synchronously, inside `add_*`), or
//! - the window timer fires (every `window`), bounding latency.
//!
//! Each flush is one publish of
//! `{"type": "...", "count": n, "items": [...], "timestamp": "..."}`.
//! Publish failures are logged and counted; the batch is dropped and the
//! pipeline keeps going.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{MarketDataPublisher, PublishError};
use crate::domain::market_data::{OptionSnapshot, UnderlyingTick};
use crate::infrastructure::metrics::{self, BatchKind};
use crate::resilience::{CircuitBreaker, MonitoredTask, TaskMonitor};

/// Shortest flush window the timer accepts.
const MIN_WINDOW: Duration = Duration::from_millis(1);

// =============================================================================
// Configuration
// =============================================================================

/// Batcher configuration.
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// When false, every item is published on its own.
    pub enabled: bool,
    /// Buffer length that triggers an immediate flush.
    pub max_batch_size: usize,
    /// Timer period for flushing partial batches.
    pub window: Duration,
    /// Channel for single underlying ticks (batching disabled).
    pub underlying_channel: String,
    /// Channel for underlying tick batches.
    pub underlying_batch_channel: String,
    /// Channel for single option snapshots (batching disabled).
    pub options_channel: String,
    /// Channel for option snapshot batches.
    pub options_batch_channel: String,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_batch_size: 100,
            window: Duration::from_millis(100),
            underlying_channel: "market:underlying".to_string(),
            underlying_batch_channel: "market:underlying:batch".to_string(),
            options_channel: "market:options".to_string(),
            options_batch_channel: "market:options:batch".to_string(),
        }
    }
}

/// Which buffer to operate on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchType {
    /// Underlying ticks.
    Underlying,
    /// Option snapshots.
    Options,
}

impl BatchType {
    /// Value of the `type` field in a batch message.
    #[must_use]
    pub const fn message_type(self) -> &'static str {
        match self {
            Self::Underlying => "underlying_batch",
            Self::Options => "options_batch",
        }
    }

    const fn metric(self) -> BatchKind {
        match self {
            Self::Underlying => BatchKind::Underlying,
            Self::Options => BatchKind::Options,
        }
    }
}

impl std::fmt::Display for BatchType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Underlying => write!(f, "underlying"),
            Self::Options => write!(f, "options"),
        }
    }
}

// =============================================================================
// Buffers
// =============================================================================

#[derive(Debug)]
struct Buffer<T> {
    items: Vec<T>,
    total_added: u64,
    total_flushed: u64,
    batches_published: u64,
    publish_failures: u64,
}

impl<T> Buffer<T> {
    const fn new() -> Self {
        Self {
            items: Vec::new(),
            total_added: 0,
            total_flushed: 0,
            batches_published: 0,
            publish_failures: 0,
        }
    }

    fn stats(&self, max_batch_size: usize) -> BufferStats {
        BufferStats {
            pending: self.items.len(),
            total_added: self.total_added,
            total_flushed: self.total_flushed,
            batches_published: self.batches_published,
            publish_failures: self.publish_failures,
            fill_rate: fill_rate(self.items.len(), max_batch_size),
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn fill_rate(len: usize, max_batch_size: usize) -> f64 {
    if max_batch_size == 0 {
        return 0.0;
    }
    len as f64 / max_batch_size as f64 * 100.0
}

/// Per-buffer statistics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BufferStats {
    /// Items waiting for the next flush.
    pub pending: usize,
    /// Items ever added.
    pub total_added: u64,
    /// Items drained by flushes.
    pub total_flushed: u64,
    /// Batches published successfully.
    pub batches_published: u64,
    /// Batches that failed to publish.
    pub publish_failures: u64,
    /// `pending / max_batch_size * 100`.
    pub fill_rate: f64,
}

/// Batcher statistics.
#[derive(Debug, Clone, Serialize)]
pub struct BatcherStats {
    /// Batching enabled.
    pub enabled: bool,
    /// Timer running.
    pub running: bool,
    /// Flush threshold.
    pub max_batch_size: usize,
    /// Timer period in milliseconds.
    pub window_ms: u64,
    /// Underlying tick buffer.
    pub underlying: BufferStats,
    /// Option snapshot buffer.
    pub options: BufferStats,
}

#[derive(Serialize)]
struct BatchMessage<'a, T> {
    #[serde(rename = "type")]
    kind: &'static str,
    count: usize,
    items: &'a [T],
    timestamp: DateTime<Utc>,
}

// =============================================================================
// Batcher
// =============================================================================

/// Batches market data before publishing.
pub struct TickBatcher {
    config: BatcherConfig,
    publisher: Arc<dyn MarketDataPublisher>,
    breaker: Option<Arc<CircuitBreaker>>,
    underlying: Mutex<Buffer<UnderlyingTick>>,
    options: Mutex<Buffer<OptionSnapshot>>,
    cancel: CancellationToken,
    timer: Mutex<Option<MonitoredTask>>,
}

impl std::fmt::Debug for TickBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickBatcher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TickBatcher {
    /// Create a batcher. The window timer starts with [`Self::start`].
    #[must_use]
    pub fn new(config: BatcherConfig, publisher: Arc<dyn MarketDataPublisher>) -> Self {
        Self {
            config,
            publisher,
            breaker: None,
            underlying: Mutex::new(Buffer::new()),
            options: Mutex::new(Buffer::new()),
            cancel: CancellationToken::new(),
            timer: Mutex::new(None),
        }
    }

    /// Guard publishes with a circuit breaker.
    ///
    /// While the breaker refuses calls, flushed batches are dropped and
    /// counted as publish failures.
    #[must_use]
    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Get the configuration.
    #[must_use]
    pub const fn config(&self) -> &BatcherConfig {
        &self.config
    }

    /// Add an underlying tick.
    pub async fn add_underlying(&self, tick: UnderlyingTick) {
        if !self.config.enabled {
            self.publish_single(&self.config.underlying_channel, &tick).await;
            return;
        }

        let full = {
            let mut buffer = self.underlying.lock();
            buffer.items.push(tick);
            buffer.total_added += 1;
            (buffer.items.len() >= self.config.max_batch_size)
                .then(|| std::mem::take(&mut buffer.items))
        };

        if let Some(items) = full {
            self.publish_underlying(items).await;
        }
    }

    /// Add an option snapshot.
    pub async fn add_option(&self, snapshot: OptionSnapshot) {
        if !self.config.enabled {
            self.publish_single(&self.config.options_channel, &snapshot).await;
            return;
        }

        let full = {
            let mut buffer = self.options.lock();
            buffer.items.push(snapshot);
            buffer.total_added += 1;
            (buffer.items.len() >= self.config.max_batch_size)
                .then(|| std::mem::take(&mut buffer.items))
        };

        if let Some(items) = full {
            self.publish_options(items).await;
        }
    }

    /// Flush one buffer. Flushing an empty buffer does nothing.
    pub async fn flush(&self, batch_type: BatchType) {
        match batch_type {
            BatchType::Underlying => {
                let items = std::mem::take(&mut self.underlying.lock().items);
                if !items.is_empty() {
                    self.publish_underlying(items).await;
                }
            }
            BatchType::Options => {
                let items = std::mem::take(&mut self.options.lock().items);
                if !items.is_empty() {
                    self.publish_options(items).await;
                }
            }
        }
    }

    /// Flush both buffers.
    pub async fn flush_all(&self) {
        self.flush(BatchType::Underlying).await;
        self.flush(BatchType::Options).await;
    }

    async fn publish_underlying(&self, items: Vec<UnderlyingTick>) {
        let published = self
            .publish_batch(
                BatchType::Underlying,
                &self.config.underlying_batch_channel,
                &items,
            )
            .await;

        let mut buffer = self.underlying.lock();
        buffer.total_flushed += items.len() as u64;
        if published {
            buffer.batches_published += 1;
        } else {
            buffer.publish_failures += 1;
        }
    }

    async fn publish_options(&self, items: Vec<OptionSnapshot>) {
        let published = self
            .publish_batch(BatchType::Options, &self.config.options_batch_channel, &items)
            .await;

        let mut buffer = self.options.lock();
        buffer.total_flushed += items.len() as u64;
        if published {
            buffer.batches_published += 1;
        } else {
            buffer.publish_failures += 1;
        }
    }

    /// Serialize and publish one batch. Returns true on success.
    async fn publish_batch<T: Serialize + Sync>(
        &self,
        batch_type: BatchType,
        channel: &str,
        items: &[T],
    ) -> bool {
        let message = BatchMessage {
            kind: batch_type.message_type(),
            count: items.len(),
            items,
            timestamp: Utc::now(),
        };

        let result = match serde_json::to_string(&message) {
            Ok(payload) => self.guarded_publish(channel, payload).await,
            Err(e) => Err(PublishError::SerializationError {
                message: e.to_string(),
            }),
        };

        match result {
            Ok(()) => {
                metrics::record_batch_published(batch_type.metric(), items.len());
                tracing::trace!(
                    batch = %batch_type,
                    count = items.len(),
                    channel,
                    "Batch published"
                );
                true
            }
            Err(e) => {
                metrics::record_batch_failed(batch_type.metric());
                tracing::warn!(
                    batch = %batch_type,
                    count = items.len(),
                    channel,
                    error = %e,
                    "Batch publish failed, batch dropped"
                );
                false
            }
        }
    }

    async fn publish_single<T: Serialize + Sync>(&self, channel: &str, item: &T) {
        let result = match serde_json::to_string(item) {
            Ok(payload) => self.guarded_publish(channel, payload).await,
            Err(e) => Err(PublishError::SerializationError {
                message: e.to_string(),
            }),
        };

        if let Err(e) = result {
            tracing::warn!(channel, error = %e, "Market data publish failed");
        }
    }

    async fn guarded_publish(&self, channel: &str, payload: String) -> Result<(), PublishError> {
        let Some(breaker) = &self.breaker else {
            return self.publisher.publish(channel, payload).await;
        };

        if !breaker.can_execute() {
            return Err(PublishError::PublishFailed {
                message: "circuit_open".to_string(),
            });
        }

        let result = self.publisher.publish(channel, payload).await;
        match &result {
            Ok(()) => breaker.record_success(),
            Err(e) => breaker.record_failure(e),
        }
        result
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Spawn the window timer.
    ///
    /// Does nothing when batching is disabled or the timer already runs.
    pub fn start(self: &Arc<Self>, monitor: &TaskMonitor) {
        if !self.config.enabled {
            tracing::info!("Tick batching disabled, publishing items individually");
            return;
        }

        let mut timer = self.timer.lock();
        if timer.is_some() || self.cancel.is_cancelled() {
            tracing::warn!("Tick batcher already started");
            return;
        }

        if self.config.window < MIN_WINDOW {
            tracing::warn!(
                window_ms = self.config.window.as_millis(),
                min_window_ms = MIN_WINDOW.as_millis(),
                "Batch window below minimum, clamping"
            );
        }

        let batcher = Arc::clone(self);
        *timer = Some(monitor.spawn("tick-batcher", batcher.run_timer()));

        tracing::info!(
            max_batch_size = self.config.max_batch_size,
            window_ms = self.window().as_millis(),
            "Tick batcher started"
        );
    }

    fn window(&self) -> Duration {
        self.config.window.max(MIN_WINDOW)
    }

    async fn run_timer(self: Arc<Self>) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(self.window());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.flush_all().await,
            }
        }

        Ok(())
    }

    /// Stop the timer and flush whatever is buffered.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let timer = self.timer.lock().take();
        if let Some(timer) = timer {
            timer.join().await;
        }

        self.flush_all().await;
        tracing::info!("Tick batcher stopped");
    }

    /// Returns true while the window timer runs.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
            && self
                .timer
                .lock()
                .as_ref()
                .is_some_and(|timer| !timer.is_finished())
    }

    /// Get buffer sizes and totals.
    #[must_use]
    pub fn get_stats(&self) -> BatcherStats {
        let max = self.config.max_batch_size;
        BatcherStats {
            enabled: self.config.enabled,
            running: self.is_running(),
            max_batch_size: max,
            window_ms: u64::try_from(self.config.window.as_millis()).unwrap_or(u64::MAX),
            underlying: self.underlying.lock().stats(max),
            options: self.options.lock().stats(max),
        }
    }

    /// Current buffer length as a percentage of `max_batch_size`.
    #[must_use]
    pub fn get_batch_fill_rate(&self, batch_type: BatchType) -> f64 {
        let len = match batch_type {
            BatchType::Underlying => self.underlying.lock().items.len(),
            BatchType::Options => self.options.lock().items.len(),
        };
        fill_rate(len, self.config.max_batch_size)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use serde_json::Value;

    use super::*;
    use crate::domain::market_data::OptionType;
    use crate::resilience::{CircuitBreakerConfig, CircuitBreakerState};

    #[derive(Debug, Default)]
    struct RecordingPublisher {
        messages: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    impl RecordingPublisher {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn on(&self, channel: &str) -> Vec<Value> {
            self.messages
                .lock()
                .iter()
                .filter(|(c, _)| c == channel)
                .map(|(_, m)| serde_json::from_str(m).unwrap())
                .collect()
        }

        fn count(&self) -> usize {
            self.messages.lock().len()
        }
    }

    #[async_trait]
    impl MarketDataPublisher for RecordingPublisher {
        async fn publish(&self, channel: &str, message: String) -> Result<(), PublishError> {
            if self.fail {
                return Err(PublishError::ConnectionError {
                    message: "connection refused".to_string(),
                });
            }
            self.messages.lock().push((channel.to_string(), message));
            Ok(())
        }
    }

    fn tick(n: u64) -> UnderlyingTick {
        UnderlyingTick {
            symbol: "NIFTY".to_string(),
            instrument_token: 256_265,
            last_price: Decimal::new(24_000 + i64::try_from(n).unwrap(), 0),
            volume: n,
            change_percent: None,
            timestamp: Utc::now(),
        }
    }

    fn option(n: u64) -> OptionSnapshot {
        OptionSnapshot {
            symbol: format!("NIFTY24DEC{}CE", 24_000 + n * 50),
            instrument_token: 10_000 + n,
            underlying: "NIFTY".to_string(),
            strike: Decimal::from(24_000 + n * 50),
            option_type: OptionType::Call,
            expiry: chrono::NaiveDate::from_ymd_opt(2024, 12, 26).unwrap(),
            last_price: Decimal::new(1015, 1),
            bid: None,
            ask: None,
            volume: 0,
            open_interest: 0,
            implied_volatility: None,
            timestamp: Utc::now(),
        }
    }

    fn batcher(config: BatcherConfig, publisher: &Arc<RecordingPublisher>) -> Arc<TickBatcher> {
        Arc::new(TickBatcher::new(config, Arc::clone(publisher) as _))
    }

    fn sized(max_batch_size: usize) -> BatcherConfig {
        BatcherConfig {
            max_batch_size,
            ..BatcherConfig::default()
        }
    }

    #[tokio::test]
    async fn size_threshold_flushes_immediately() {
        let publisher = Arc::new(RecordingPublisher::default());
        let batcher = batcher(sized(5), &publisher);

        for n in 0..5 {
            batcher.add_underlying(tick(n)).await;
        }

        let stats = batcher.get_stats().underlying;
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.total_flushed, 5);
        assert_eq!(stats.batches_published, 1);

        let batches = publisher.on("market:underlying:batch");
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0]["type"], "underlying_batch");
        assert_eq!(batches[0]["count"], 5);
        assert_eq!(batches[0]["items"].as_array().unwrap().len(), 5);
        assert!(batches[0]["timestamp"].is_string());
    }

    #[tokio::test]
    async fn buffer_never_exceeds_max() {
        let publisher = Arc::new(RecordingPublisher::default());
        let batcher = batcher(sized(3), &publisher);

        for n in 0..10 {
            batcher.add_option(option(n)).await;
            assert!(batcher.get_stats().options.pending < 3);
        }
        assert_eq!(batcher.get_stats().options.pending, 1);
        assert_eq!(publisher.on("market:options:batch").len(), 3);
    }

    #[tokio::test]
    async fn buffers_are_independent() {
        let publisher = Arc::new(RecordingPublisher::default());
        let batcher = batcher(sized(2), &publisher);

        batcher.add_underlying(tick(1)).await;
        batcher.add_option(option(1)).await;
        assert_eq!(publisher.count(), 0);

        batcher.add_option(option(2)).await;
        assert_eq!(publisher.on("market:options:batch").len(), 1);
        assert_eq!(batcher.get_stats().underlying.pending, 1);
    }

    #[tokio::test]
    async fn flushing_empty_buffer_is_noop() {
        let publisher = Arc::new(RecordingPublisher::default());
        let batcher = batcher(BatcherConfig::default(), &publisher);

        batcher.flush(BatchType::Underlying).await;
        batcher.flush_all().await;

        assert_eq!(publisher.count(), 0);
        assert_eq!(batcher.get_stats().underlying.batches_published, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn window_timer_flushes_partial_batch() {
        let publisher = Arc::new(RecordingPublisher::default());
        let batcher = batcher(BatcherConfig::default(), &publisher);
        batcher.start(&TaskMonitor::new());

        batcher.add_underlying(tick(1)).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(batcher.get_stats().underlying.total_flushed, 1);
        assert_eq!(publisher.on("market:underlying:batch").len(), 1);

        batcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn zero_window_is_clamped() {
        let publisher = Arc::new(RecordingPublisher::default());
        let batcher = batcher(
            BatcherConfig {
                window: Duration::ZERO,
                ..BatcherConfig::default()
            },
            &publisher,
        );
        let monitor = TaskMonitor::new();
        batcher.start(&monitor);

        batcher.add_underlying(tick(1)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(batcher.is_running());
        assert_eq!(batcher.get_stats().underlying.total_flushed, 1);

        batcher.stop().await;
        let tasks = monitor.stats();
        assert_eq!(tasks.panicked, 0);
        assert_eq!(tasks.completed, 1);
    }

    #[tokio::test]
    async fn stop_flushes_residual_items() {
        let publisher = Arc::new(RecordingPublisher::default());
        let batcher = batcher(
            BatcherConfig {
                window: Duration::from_secs(3600),
                ..BatcherConfig::default()
            },
            &publisher,
        );
        batcher.start(&TaskMonitor::new());

        batcher.add_underlying(tick(1)).await;
        batcher.add_underlying(tick(2)).await;
        batcher.stop().await;

        let batches = publisher.on("market:underlying:batch");
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0]["count"], 2);
        assert!(!batcher.is_running());
    }

    #[tokio::test]
    async fn disabled_batching_publishes_each_item() {
        let publisher = Arc::new(RecordingPublisher::default());
        let batcher = batcher(
            BatcherConfig {
                enabled: false,
                ..BatcherConfig::default()
            },
            &publisher,
        );

        batcher.add_underlying(tick(1)).await;
        batcher.add_option(option(1)).await;

        assert_eq!(publisher.on("market:underlying").len(), 1);
        assert_eq!(publisher.on("market:options").len(), 1);
        assert_eq!(publisher.on("market:underlying")[0]["symbol"], "NIFTY");

        let stats = batcher.get_stats();
        assert_eq!(stats.underlying.total_added, 0);
        assert_eq!(stats.options.total_added, 0);
    }

    #[tokio::test]
    async fn publish_failures_are_counted_not_raised() {
        let publisher = Arc::new(RecordingPublisher::failing());
        let batcher = batcher(sized(2), &publisher);

        batcher.add_underlying(tick(1)).await;
        batcher.add_underlying(tick(2)).await;
        batcher.add_underlying(tick(3)).await;

        let stats = batcher.get_stats().underlying;
        assert_eq!(stats.publish_failures, 1);
        assert_eq!(stats.batches_published, 0);
        assert_eq!(stats.total_flushed, 2);
        assert_eq!(stats.pending, 1);
    }

    #[tokio::test]
    async fn open_breaker_drops_batches() {
        let publisher = Arc::new(RecordingPublisher::failing());
        let breaker = Arc::new(CircuitBreaker::new(
            "publisher",
            CircuitBreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_secs(60),
                half_open_max_attempts: 1,
            },
        ));
        let batcher = Arc::new(
            TickBatcher::new(sized(1), Arc::clone(&publisher) as _)
                .with_circuit_breaker(Arc::clone(&breaker)),
        );

        batcher.add_option(option(1)).await;
        assert_eq!(breaker.state(), CircuitBreakerState::Open);

        batcher.add_option(option(2)).await;
        assert_eq!(breaker.metrics().rejected_calls, 1);
        assert_eq!(batcher.get_stats().options.publish_failures, 2);
    }

    #[tokio::test]
    async fn fill_rate_tracks_buffer_length() {
        let publisher = Arc::new(RecordingPublisher::default());
        let batcher = batcher(sized(4), &publisher);

        batcher.add_underlying(tick(1)).await;
        assert!((batcher.get_batch_fill_rate(BatchType::Underlying) - 25.0).abs() < f64::EPSILON);
        assert!(batcher.get_batch_fill_rate(BatchType::Options).abs() < f64::EPSILON);
    }
}
