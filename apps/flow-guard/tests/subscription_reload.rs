//! Subscription Reload Integration Tests
//!
//! Timing behavior of the reloader loop under paused tokio time.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{Instant, sleep};
use tokio_test::assert_err;

use flow_guard::{ReloadCallback, ReloaderConfig, SubscriptionReloader, TaskMonitor};

fn config() -> ReloaderConfig {
    ReloaderConfig {
        debounce: Duration::from_millis(500),
        min_interval: Duration::from_secs(5),
        reload_timeout: Duration::from_secs(10),
    }
}

fn start(reload: ReloadCallback) -> (Arc<SubscriptionReloader>, TaskMonitor) {
    let reloader = Arc::new(SubscriptionReloader::new(config(), reload));
    let monitor = TaskMonitor::new();
    reloader.start(&monitor);
    (reloader, monitor)
}

#[tokio::test(start_paused = true)]
async fn burst_of_changes_runs_once() {
    let starts = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&starts);
    let (reloader, _monitor) = start(ReloadCallback::from_sync(move || {
        recorded.lock().push(Instant::now());
        Ok(())
    }));

    let first_trigger = Instant::now();
    for _ in 0..10 {
        reloader.trigger_reload();
        sleep(Duration::from_millis(100)).await;
    }
    let last_trigger = first_trigger + Duration::from_millis(900);

    sleep(Duration::from_secs(2)).await;

    let starts = starts.lock().clone();
    assert_eq!(starts.len(), 1);
    assert!(starts[0] >= last_trigger + Duration::from_millis(500));

    let stats = reloader.stats();
    assert_eq!(stats.triggers, 10);
    assert_eq!(stats.executions, 1);
    assert!(!stats.pending);

    reloader.stop().await;
}

#[tokio::test(start_paused = true)]
async fn consecutive_runs_respect_min_interval() {
    let starts = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&starts);
    let (reloader, _monitor) = start(ReloadCallback::from_sync(move || {
        recorded.lock().push(Instant::now());
        Ok(())
    }));

    reloader.trigger_reload();
    sleep(Duration::from_secs(1)).await;
    reloader.trigger_reload();
    sleep(Duration::from_secs(10)).await;

    let starts = starts.lock().clone();
    assert_eq!(starts.len(), 2);
    assert!(starts[1] - starts[0] >= Duration::from_secs(5));

    reloader.stop().await;
}

#[tokio::test(start_paused = true)]
async fn failed_reload_keeps_loop_alive() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let (reloader, monitor) = start(ReloadCallback::from_async(move || {
        let counter = Arc::clone(&counter);
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("subscription store unavailable");
            }
            Ok(())
        }
    }));

    reloader.trigger_reload();
    sleep(Duration::from_secs(1)).await;

    let stats = reloader.stats();
    assert_eq!(stats.failures, 1);
    assert_eq!(
        stats.last_error.as_deref(),
        Some("subscription store unavailable")
    );
    assert!(reloader.is_running());

    reloader.trigger_reload();
    sleep(Duration::from_secs(10)).await;

    let stats = reloader.stats();
    assert_eq!(stats.executions, 2);
    assert_eq!(stats.failures, 1);
    assert!(stats.last_error.is_none());
    assert!(stats.last_reload_at.is_some());

    reloader.stop().await;
    let tasks = monitor.stats();
    assert_eq!(tasks.completed, 1);
    assert_eq!(tasks.failed, 0);
}

#[tokio::test(start_paused = true)]
async fn hung_reload_times_out() {
    let (reloader, _monitor) = start(ReloadCallback::from_async(|| async {
        sleep(Duration::from_secs(3600)).await;
        Ok(())
    }));

    reloader.trigger_reload();
    sleep(Duration::from_secs(15)).await;

    let stats = reloader.stats();
    assert_eq!(stats.executions, 1);
    assert_eq!(stats.failures, 1);
    assert!(stats.last_error.unwrap().contains("timed out"));
    assert!(!stats.in_flight);

    reloader.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_discards_pending_trigger() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let (reloader, _monitor) = start(ReloadCallback::from_sync(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }));

    reloader.trigger_reload();
    reloader.stop().await;
    sleep(Duration::from_secs(10)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(reloader.stats().pending);
    assert_err!(reloader.reload_now().await);
}
