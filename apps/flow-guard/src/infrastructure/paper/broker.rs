//! Simulated broker for paper mode.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::{Value, json};

use crate::application::ports::{BrokerError, BrokerPort};
use crate::domain::order_task::OrderParams;
use crate::infrastructure::config::PaperSettings;

/// Paper broker configuration.
#[derive(Debug, Clone)]
pub struct PaperBrokerConfig {
    /// Probability in `[0, 1]` that a call fails with a connection error.
    pub failure_rate: f64,
    /// Lower bound of simulated latency.
    pub min_latency: Duration,
    /// Upper bound of simulated latency.
    pub max_latency: Duration,
}

impl Default for PaperBrokerConfig {
    fn default() -> Self {
        Self::from(&PaperSettings::default())
    }
}

impl From<&PaperSettings> for PaperBrokerConfig {
    fn from(settings: &PaperSettings) -> Self {
        Self {
            failure_rate: settings.failure_rate,
            min_latency: settings.min_latency,
            max_latency: settings.max_latency,
        }
    }
}

impl PaperBrokerConfig {
    /// No latency, no failures.
    #[must_use]
    pub const fn instant() -> Self {
        Self {
            failure_rate: 0.0,
            min_latency: Duration::ZERO,
            max_latency: Duration::ZERO,
        }
    }
}

/// Paper broker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaperBrokerStats {
    /// Calls received.
    pub calls: u64,
    /// Calls failed by injection.
    pub injected_failures: u64,
    /// Orders currently open.
    pub open_orders: usize,
}

/// Broker that keeps orders in memory.
///
/// Modify and cancel require an `order_id` param naming an order this
/// broker placed.
#[derive(Debug)]
pub struct PaperBroker {
    config: PaperBrokerConfig,
    next_order: AtomicU64,
    calls: AtomicU64,
    injected_failures: AtomicU64,
    orders: Mutex<HashMap<String, Value>>,
}

impl PaperBroker {
    /// Create a paper broker.
    #[must_use]
    pub fn new(config: PaperBrokerConfig) -> Self {
        Self {
            config,
            next_order: AtomicU64::new(1),
            calls: AtomicU64::new(0),
            injected_failures: AtomicU64::new(0),
            orders: Mutex::new(HashMap::new()),
        }
    }

    /// Get broker counters.
    #[must_use]
    pub fn stats(&self) -> PaperBrokerStats {
        PaperBrokerStats {
            calls: self.calls.load(Ordering::Relaxed),
            injected_failures: self.injected_failures.load(Ordering::Relaxed),
            open_orders: self.orders.lock().len(),
        }
    }

    /// Look up an open order.
    #[must_use]
    pub fn order(&self, order_id: &str) -> Option<Value> {
        self.orders.lock().get(order_id).cloned()
    }

    async fn simulate(&self) -> Result<(), BrokerError> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        let (latency, fail) = {
            let mut rng = rand::rng();
            let min = self.config.min_latency;
            let max = self.config.max_latency.max(min);
            let latency = if max > min {
                rng.random_range(min..=max)
            } else {
                min
            };
            let fail = self.config.failure_rate > 0.0
                && rng.random::<f64>() < self.config.failure_rate;
            (latency, fail)
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if fail {
            self.injected_failures.fetch_add(1, Ordering::Relaxed);
            return Err(BrokerError::ConnectionError {
                message: "simulated broker failure".to_string(),
            });
        }
        Ok(())
    }

    fn order_id_param(params: &OrderParams) -> Result<String, BrokerError> {
        params
            .get_str("order_id")
            .map(str::to_string)
            .ok_or_else(|| BrokerError::OrderRejected {
                reason: "order_id is required".to_string(),
            })
    }
}

#[async_trait]
impl BrokerPort for PaperBroker {
    async fn place_order(
        &self,
        account_id: &str,
        params: &OrderParams,
    ) -> Result<Value, BrokerError> {
        self.simulate().await?;

        let order_id = format!(
            "paper-{:08}",
            self.next_order.fetch_add(1, Ordering::Relaxed)
        );
        let order = json!({
            "order_id": order_id,
            "account_id": account_id,
            "status": "accepted",
            "params": params,
            "submitted_at": Utc::now(),
        });
        self.orders.lock().insert(order_id.clone(), order.clone());

        tracing::debug!(order_id = %order_id, account_id, "Paper order placed");
        Ok(order)
    }

    async fn modify_order(
        &self,
        account_id: &str,
        params: &OrderParams,
    ) -> Result<Value, BrokerError> {
        self.simulate().await?;
        let order_id = Self::order_id_param(params)?;

        let mut orders = self.orders.lock();
        let order = orders
            .get_mut(&order_id)
            .ok_or_else(|| BrokerError::OrderNotFound {
                order_id: order_id.clone(),
            })?;
        order["status"] = json!("replaced");
        order["params"] = json!(params);
        order["modified_at"] = json!(Utc::now());

        tracing::debug!(order_id = %order_id, account_id, "Paper order modified");
        Ok(order.clone())
    }

    async fn cancel_order(
        &self,
        account_id: &str,
        params: &OrderParams,
    ) -> Result<Value, BrokerError> {
        self.simulate().await?;
        let order_id = Self::order_id_param(params)?;

        let mut order = self
            .orders
            .lock()
            .remove(&order_id)
            .ok_or_else(|| BrokerError::OrderNotFound {
                order_id: order_id.clone(),
            })?;
        order["status"] = json!("cancelled");

        tracing::debug!(order_id = %order_id, account_id, "Paper order cancelled");
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    fn params(value: Value) -> OrderParams {
        OrderParams::try_from(value).unwrap()
    }

    #[tokio::test]
    async fn place_modify_cancel() {
        let broker = PaperBroker::new(PaperBrokerConfig::instant());

        let placed = broker
            .place_order("acct", &params(json!({"symbol": "AAPL", "qty": 10})))
            .await
            .unwrap();
        let order_id = placed["order_id"].as_str().unwrap().to_string();
        assert_eq!(order_id, "paper-00000001");
        assert_eq!(placed["status"], "accepted");
        assert_eq!(broker.stats().open_orders, 1);

        let modified = assert_ok!(
            broker
                .modify_order("acct", &params(json!({"order_id": order_id, "qty": 5})))
                .await
        );
        assert_eq!(modified["status"], "replaced");
        assert_eq!(modified["params"]["qty"], 5);

        let cancelled = broker
            .cancel_order("acct", &params(json!({"order_id": order_id})))
            .await
            .unwrap();
        assert_eq!(cancelled["status"], "cancelled");
        assert!(broker.order(&order_id).is_none());
        assert_eq!(broker.stats().calls, 3);
    }

    #[tokio::test]
    async fn cancel_unknown_order() {
        let broker = PaperBroker::new(PaperBrokerConfig::instant());
        let err = assert_err!(
            broker
                .cancel_order("acct", &params(json!({"order_id": "nope"})))
                .await
        );
        assert!(matches!(err, BrokerError::OrderNotFound { order_id } if order_id == "nope"));
    }

    #[tokio::test]
    async fn modify_requires_order_id() {
        let broker = PaperBroker::new(PaperBrokerConfig::instant());
        let err = broker
            .modify_order("acct", &params(json!({"qty": 1})))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::OrderRejected { .. }));
    }

    #[tokio::test]
    async fn full_failure_rate_always_fails() {
        let broker = PaperBroker::new(PaperBrokerConfig {
            failure_rate: 1.0,
            ..PaperBrokerConfig::instant()
        });

        for _ in 0..5 {
            let result = broker.place_order("acct", &params(json!({}))).await;
            assert!(matches!(result, Err(BrokerError::ConnectionError { .. })));
        }
        let stats = broker.stats();
        assert_eq!(stats.injected_failures, 5);
        assert_eq!(stats.open_orders, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn latency_stays_within_bounds() {
        let broker = PaperBroker::new(PaperBrokerConfig {
            failure_rate: 0.0,
            min_latency: Duration::from_millis(20),
            max_latency: Duration::from_millis(40),
        });

        let started = tokio::time::Instant::now();
        broker.place_order("acct", &params(json!({}))).await.unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(20));
        assert!(elapsed <= Duration::from_millis(41));
    }
}
