//! Flow Guard Configuration Settings
//!
//! Configuration types for the service, loaded from environment variables.
//! Unparseable values fall back to their defaults; values that parse but make
//! no sense (zero capacity, failure rate above 1) are rejected.

use std::str::FromStr;
use std::time::Duration;

use crate::application::services::{BatcherConfig, BreakerScope, ExecutorConfig, ReloaderConfig};
use crate::resilience::CircuitBreakerConfig;

/// Trading environment (paper vs live).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    /// Paper trading environment (simulated).
    #[default]
    Paper,
    /// Live trading environment (real money).
    Live,
}

impl Environment {
    /// Parse environment from string.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "LIVE" => Self::Live,
            _ => Self::Paper,
        }
    }

    /// Check if this is the live environment.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self, Self::Live)
    }

    /// Get the environment name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Paper => "paper",
            Self::Live => "live",
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health check and metrics HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Paper adapter settings.
#[derive(Debug, Clone)]
pub struct PaperSettings {
    /// Probability that a paper broker call fails.
    pub failure_rate: f64,
    /// Lower bound of simulated broker latency.
    pub min_latency: Duration,
    /// Upper bound of simulated broker latency.
    pub max_latency: Duration,
    /// Capacity of each paper pub/sub channel.
    pub channel_capacity: usize,
}

impl Default for PaperSettings {
    fn default() -> Self {
        Self {
            failure_rate: 0.0,
            min_latency: Duration::from_millis(5),
            max_latency: Duration::from_millis(50),
            channel_capacity: 10_000,
        }
    }
}

/// Complete service configuration.
#[derive(Debug, Clone, Default)]
pub struct FlowGuardConfig {
    /// Trading environment.
    pub environment: Environment,
    /// Server port settings.
    pub server: ServerSettings,
    /// Order executor settings.
    pub executor: ExecutorConfig,
    /// Broker circuit breaker settings.
    pub breaker: CircuitBreakerConfig,
    /// Tick batcher settings.
    pub batcher: BatcherConfig,
    /// Subscription reloader settings.
    pub reloader: ReloaderConfig,
    /// Paper adapter settings.
    pub paper: PaperSettings,
}

impl FlowGuardConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is out of range.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// Empty values count as unset.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is out of range.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };

        let environment = env
            .raw("FLOW_GUARD_ENV")
            .map(|s| Environment::from_str_case_insensitive(&s))
            .unwrap_or_default();

        let server = ServerSettings {
            health_port: env.parse("FLOW_GUARD_HEALTH_PORT", ServerSettings::default().health_port),
        };

        let executor_defaults = ExecutorConfig::default();
        let executor = ExecutorConfig {
            max_tasks: env.parse("FLOW_GUARD_MAX_TASKS", executor_defaults.max_tasks),
            workers: env.parse("FLOW_GUARD_WORKERS", executor_defaults.workers),
            broker_timeout: env.duration_millis(
                "FLOW_GUARD_BROKER_TIMEOUT_MS",
                executor_defaults.broker_timeout,
            ),
            idempotency_ttl: env.duration_secs(
                "FLOW_GUARD_IDEMPOTENCY_TTL_SECS",
                executor_defaults.idempotency_ttl,
            ),
            breaker_scope: if env.bool("FLOW_GUARD_BREAKER_PER_ACCOUNT", false) {
                BreakerScope::PerAccount
            } else {
                BreakerScope::Shared
            },
        };

        let breaker_defaults = CircuitBreakerConfig::broker();
        let breaker = CircuitBreakerConfig {
            failure_threshold: env.parse(
                "FLOW_GUARD_BREAKER_FAILURE_THRESHOLD",
                breaker_defaults.failure_threshold,
            ),
            recovery_timeout: env.duration_secs(
                "FLOW_GUARD_BREAKER_RECOVERY_TIMEOUT_SECS",
                breaker_defaults.recovery_timeout,
            ),
            half_open_max_attempts: env.parse(
                "FLOW_GUARD_BREAKER_HALF_OPEN_MAX_ATTEMPTS",
                breaker_defaults.half_open_max_attempts,
            ),
        };

        let batcher_defaults = BatcherConfig::default();
        let batcher = BatcherConfig {
            enabled: env.bool("FLOW_GUARD_BATCHING_ENABLED", batcher_defaults.enabled),
            max_batch_size: env.parse("FLOW_GUARD_BATCH_MAX_SIZE", batcher_defaults.max_batch_size),
            window: env.duration_millis("FLOW_GUARD_BATCH_WINDOW_MS", batcher_defaults.window),
            ..batcher_defaults
        };

        let reloader_defaults = ReloaderConfig::default();
        let reloader = ReloaderConfig {
            debounce: env.duration_millis("FLOW_GUARD_RELOAD_DEBOUNCE_MS", reloader_defaults.debounce),
            min_interval: env.duration_millis(
                "FLOW_GUARD_RELOAD_MIN_INTERVAL_MS",
                reloader_defaults.min_interval,
            ),
            reload_timeout: env.duration_secs(
                "FLOW_GUARD_RELOAD_TIMEOUT_SECS",
                reloader_defaults.reload_timeout,
            ),
        };

        let paper = PaperSettings {
            failure_rate: env.parse(
                "FLOW_GUARD_PAPER_FAILURE_RATE",
                PaperSettings::default().failure_rate,
            ),
            ..PaperSettings::default()
        };

        let config = Self {
            environment,
            server,
            executor,
            breaker,
            batcher,
            reloader,
            paper,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns the first out-of-range setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.executor.max_tasks == 0 {
            return Err(ConfigError::invalid("FLOW_GUARD_MAX_TASKS", "must be at least 1"));
        }
        if self.executor.workers == 0 {
            return Err(ConfigError::invalid("FLOW_GUARD_WORKERS", "must be at least 1"));
        }
        if self.executor.broker_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "FLOW_GUARD_BROKER_TIMEOUT_MS",
                "must be greater than 0",
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "FLOW_GUARD_BREAKER_FAILURE_THRESHOLD",
                "must be at least 1",
            ));
        }
        if self.breaker.half_open_max_attempts == 0 {
            return Err(ConfigError::invalid(
                "FLOW_GUARD_BREAKER_HALF_OPEN_MAX_ATTEMPTS",
                "must be at least 1",
            ));
        }
        if self.batcher.max_batch_size == 0 {
            return Err(ConfigError::invalid("FLOW_GUARD_BATCH_MAX_SIZE", "must be at least 1"));
        }
        if self.batcher.window.is_zero() {
            return Err(ConfigError::invalid(
                "FLOW_GUARD_BATCH_WINDOW_MS",
                "must be greater than 0",
            ));
        }
        if self.reloader.reload_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "FLOW_GUARD_RELOAD_TIMEOUT_SECS",
                "must be greater than 0",
            ));
        }
        if !(0.0..=1.0).contains(&self.paper.failure_rate) {
            return Err(ConfigError::invalid(
                "FLOW_GUARD_PAPER_FAILURE_RATE",
                "must be between 0.0 and 1.0",
            ));
        }
        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable is out of range.
    #[error("invalid value for {key}: {message}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// What is wrong with it.
        message: String,
    },
}

impl ConfigError {
    fn invalid(key: &str, message: &str) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            message: message.to_string(),
        }
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> T {
        self.raw(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn bool(&self, key: &str, default: bool) -> bool {
        self.raw(key)
            .map_or(default, |v| match v.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => default,
            })
    }

    fn duration_secs(&self, key: &str, default: Duration) -> Duration {
        self.raw(key)
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn duration_millis(&self, key: &str, default: Duration) -> Duration {
        self.raw(key)
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }
}
