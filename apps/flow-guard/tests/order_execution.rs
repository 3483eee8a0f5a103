//! Order Execution Integration Tests
//!
//! Drives the executor end to end against the paper broker and a few
//! hand-written brokers.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use flow_guard::{
    BrokerError, BrokerPort, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerState,
    ExecutorConfig, OrderParams, OrderTask, OrderTaskExecutor, PaperBroker, PaperBrokerConfig,
    RejectReason, SubmitOutcome, TaskId, TaskMonitor, TaskStatus,
};

/// Broker that never answers within any sane timeout.
struct SlowBroker {
    calls: AtomicUsize,
}

#[async_trait]
impl BrokerPort for SlowBroker {
    async fn place_order(&self, _: &str, _: &OrderParams) -> Result<Value, BrokerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(json!({"status": "late"}))
    }

    async fn modify_order(&self, _: &str, _: &OrderParams) -> Result<Value, BrokerError> {
        unreachable!("not exercised")
    }

    async fn cancel_order(&self, _: &str, _: &OrderParams) -> Result<Value, BrokerError> {
        unreachable!("not exercised")
    }
}

fn registry(failure_threshold: u32) -> Arc<CircuitBreakerRegistry> {
    Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
        failure_threshold,
        recovery_timeout: Duration::from_secs(60),
        half_open_max_attempts: 1,
    }))
}

async fn wait_terminal(executor: &OrderTaskExecutor, task_id: &TaskId) -> OrderTask {
    for _ in 0..2000 {
        if let Some(task) = executor.get_task(task_id) {
            if task.is_terminal() {
                return task;
            }
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("task {task_id} never finished");
}

#[tokio::test]
async fn place_then_cancel_through_paper_broker() {
    let broker = Arc::new(PaperBroker::new(PaperBrokerConfig::instant()));
    let executor = Arc::new(OrderTaskExecutor::new(
        ExecutorConfig::default(),
        Arc::clone(&broker) as _,
        registry(5),
    ));
    let monitor = TaskMonitor::new();
    executor.start(&monitor);

    let placed = executor
        .submit_task(
            "place_order",
            "acct-1",
            json!({"symbol": "NIFTY", "qty": 50, "side": "BUY"}),
        )
        .unwrap();
    assert!(placed.is_accepted());

    let placed = wait_terminal(&executor, &placed.task_id().unwrap()).await;
    assert_eq!(placed.status, TaskStatus::Completed);
    let order_id = placed.result.as_ref().unwrap()["order_id"]
        .as_str()
        .unwrap()
        .to_string();

    let cancel = executor
        .submit_task("cancel_order", "acct-1", json!({"order_id": order_id}))
        .unwrap();
    let cancelled = wait_terminal(&executor, &cancel.task_id().unwrap()).await;
    assert_eq!(cancelled.status, TaskStatus::Completed);
    assert_eq!(cancelled.result.unwrap()["status"], "cancelled");

    assert_eq!(broker.stats().calls, 2);
    assert_eq!(broker.stats().open_orders, 0);

    executor.stop().await;
}

#[tokio::test]
async fn concurrent_duplicates_resolve_to_one_task() {
    let broker = Arc::new(PaperBroker::new(PaperBrokerConfig::instant()));
    let executor = Arc::new(OrderTaskExecutor::new(
        ExecutorConfig::default(),
        Arc::clone(&broker) as _,
        registry(5),
    ));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let executor = Arc::clone(&executor);
        handles.push(tokio::spawn(async move {
            executor
                .submit_task(
                    "place_order",
                    "acct-1",
                    json!({"qty": 1, "symbol": "BANKNIFTY"}),
                )
                .unwrap()
        }));
    }

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap());
    }

    let accepted = outcomes.iter().filter(|o| o.is_accepted()).count();
    let duplicates = outcomes.iter().filter(|o| o.is_duplicate()).count();
    assert_eq!(accepted, 1);
    assert_eq!(duplicates, 15);

    let first = outcomes[0].task_id();
    assert!(outcomes.iter().all(|o| o.task_id() == first));

    let monitor = TaskMonitor::new();
    executor.start(&monitor);
    let task = wait_terminal(&executor, &first.unwrap()).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(broker.stats().calls, 1);

    executor.stop().await;
}

#[tokio::test]
async fn key_order_does_not_create_a_new_task() {
    let executor = OrderTaskExecutor::new(
        ExecutorConfig::default(),
        Arc::new(PaperBroker::new(PaperBrokerConfig::instant())),
        registry(5),
    );

    let first = executor
        .submit_task("place_order", "acct-1", json!({"symbol": "X", "qty": 1}))
        .unwrap();
    let second = executor
        .submit_task("place_order", "acct-1", json!({"qty": 1, "symbol": "X"}))
        .unwrap();

    assert!(second.is_duplicate());
    assert_eq!(first.task_id(), second.task_id());
}

#[tokio::test(start_paused = true)]
async fn slow_broker_times_out() {
    let broker = Arc::new(SlowBroker {
        calls: AtomicUsize::new(0),
    });
    let breakers = registry(5);
    let executor = Arc::new(OrderTaskExecutor::new(
        ExecutorConfig {
            broker_timeout: Duration::from_secs(2),
            ..ExecutorConfig::default()
        },
        Arc::clone(&broker) as _,
        Arc::clone(&breakers),
    ));
    let monitor = TaskMonitor::new();
    executor.start(&monitor);

    let outcome = executor
        .submit_task("place_order", "acct-1", json!({"qty": 1}))
        .unwrap();
    let task = wait_terminal(&executor, &outcome.task_id().unwrap()).await;

    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some("broker_timeout"));
    assert_eq!(broker.calls.load(Ordering::SeqCst), 1);
    assert_eq!(executor.breaker_for("acct-1").failure_count(), 1);

    executor.stop().await;
}

#[tokio::test]
async fn failing_broker_opens_circuit_and_short_circuits() {
    let broker = Arc::new(PaperBroker::new(PaperBrokerConfig {
        failure_rate: 1.0,
        ..PaperBrokerConfig::instant()
    }));
    let executor = Arc::new(OrderTaskExecutor::new(
        ExecutorConfig::default(),
        Arc::clone(&broker) as _,
        registry(2),
    ));
    let monitor = TaskMonitor::new();
    executor.start(&monitor);

    for qty in 1..=2 {
        let outcome = executor
            .submit_task("place_order", "acct-1", json!({"qty": qty}))
            .unwrap();
        let task = wait_terminal(&executor, &outcome.task_id().unwrap()).await;
        assert_eq!(task.status, TaskStatus::Failed);
    }
    assert_eq!(
        executor.breaker_for("acct-1").state(),
        CircuitBreakerState::Open
    );

    let outcome = executor
        .submit_task("place_order", "acct-1", json!({"qty": 3}))
        .unwrap();
    let task = wait_terminal(&executor, &outcome.task_id().unwrap()).await;
    assert_eq!(task.error.as_deref(), Some("circuit_open"));
    assert_eq!(broker.stats().calls, 2);

    let stats = executor.stats();
    assert_eq!(stats.failed, 3);
    assert_eq!(stats.breakers.len(), 1);
    assert_eq!(stats.breakers[0].rejected_calls, 1);

    executor.stop().await;
}

#[tokio::test]
async fn stopped_executor_rejects_and_drains() {
    let executor = Arc::new(OrderTaskExecutor::new(
        ExecutorConfig::default(),
        Arc::new(PaperBroker::new(PaperBrokerConfig::instant())),
        registry(5),
    ));

    let queued = executor
        .submit_task("place_order", "acct-1", json!({"qty": 1}))
        .unwrap();
    executor.stop().await;

    let task = executor.get_task(&queued.task_id().unwrap()).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some("executor_stopped"));

    let late = executor
        .submit_task("place_order", "acct-1", json!({"qty": 2}))
        .unwrap();
    assert_eq!(late, SubmitOutcome::Rejected(RejectReason::ShuttingDown));
    assert!(executor.get_all_tasks(Some(TaskStatus::Pending)).is_empty());
}

#[tokio::test(start_paused = true)]
async fn stop_lets_in_flight_call_finish() {
    let broker = Arc::new(PaperBroker::new(PaperBrokerConfig {
        failure_rate: 0.0,
        min_latency: Duration::from_millis(500),
        max_latency: Duration::from_millis(500),
    }));
    let executor = Arc::new(OrderTaskExecutor::new(
        ExecutorConfig::default(),
        Arc::clone(&broker) as _,
        registry(5),
    ));
    let monitor = TaskMonitor::new();
    executor.start(&monitor);

    let first = executor
        .submit_task("place_order", "acct-1", json!({"symbol": "NIFTY", "qty": 1}))
        .unwrap()
        .task_id()
        .unwrap();
    let second = executor
        .submit_task("place_order", "acct-1", json!({"symbol": "NIFTY", "qty": 2}))
        .unwrap()
        .task_id()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        executor.get_task(&first).unwrap().status,
        TaskStatus::Processing
    );
    assert_eq!(executor.get_task(&second).unwrap().status, TaskStatus::Pending);

    executor.stop().await;

    let first = executor.get_task(&first).unwrap();
    assert_eq!(first.status, TaskStatus::Completed);
    assert_eq!(first.result.as_ref().unwrap()["status"], "accepted");

    let second = executor.get_task(&second).unwrap();
    assert_eq!(second.status, TaskStatus::Failed);
    assert_eq!(second.error.as_deref(), Some("executor_stopped"));
    assert_eq!(broker.stats().calls, 1);
}
