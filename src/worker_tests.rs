// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for the rate-limited work queues.

use super::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex as StdMutex;

fn counting_reconciler(
    counter: Arc<AtomicU32>,
    failures_before_success: u32,
) -> ReconcileFn<String> {
    Arc::new(move |_key: String| {
        let counter = counter.clone();
        Box::pin(async move {
            let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= failures_before_success {
                anyhow::bail!("transient failure on attempt {attempt}")
            }
            Ok(())
        })
    })
}

fn fast_rate() -> RateLimiterOptions {
    RateLimiterOptions {
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(20),
        qps: 10_000.0,
        burst: 10_000,
    }
}

#[test]
fn test_backoff_doubles_and_saturates() {
    let rate = RateLimiterOptions {
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_secs(1),
        ..RateLimiterOptions::default()
    };
    assert_eq!(rate.delay_for(1), Duration::from_millis(5));
    assert_eq!(rate.delay_for(2), Duration::from_millis(10));
    assert_eq!(rate.delay_for(3), Duration::from_millis(20));
    assert_eq!(rate.delay_for(30), Duration::from_secs(1));
    // Far past the cap: no overflow.
    assert_eq!(rate.delay_for(u32::MAX), Duration::from_secs(1));
}

#[tokio::test]
async fn test_reconciles_enqueued_key() {
    let counter = Arc::new(AtomicU32::new(0));
    let worker = AsyncWorker::new("test", fast_rate(), counting_reconciler(counter.clone(), 0));
    worker.run(1);

    worker.add("key-1".to_string());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(worker.queue_len(), 0);
}

#[tokio::test]
async fn test_duplicates_collapse_while_queued() {
    let processed = Arc::new(StdMutex::new(Vec::new()));
    let log = processed.clone();
    let worker: AsyncWorker<String> = AsyncWorker::new(
        "test",
        fast_rate(),
        Arc::new(move |key: String| {
            let log = log.clone();
            Box::pin(async move {
                log.lock().unwrap().push(key);
                Ok(())
            })
        }),
    );

    // Enqueue duplicates before any worker runs.
    worker.add("dup".to_string());
    worker.add("dup".to_string());
    worker.add("dup".to_string());
    worker.add("other".to_string());
    assert_eq!(worker.queue_len(), 2);

    worker.run(1);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let log = processed.lock().unwrap();
    assert_eq!(log.len(), 2);
    assert!(log.contains(&"dup".to_string()));
    assert!(log.contains(&"other".to_string()));
}

#[tokio::test]
async fn test_failed_key_retries_until_success() {
    let counter = Arc::new(AtomicU32::new(0));
    let worker = AsyncWorker::new("test", fast_rate(), counting_reconciler(counter.clone(), 2));
    worker.run(1);

    worker.add("flaky".to_string());
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Two failures plus the final success.
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_re_add_during_processing_runs_again() {
    let counter = Arc::new(AtomicU32::new(0));
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let entered = Arc::new(tokio::sync::Notify::new());

    let reconciler: ReconcileFn<String> = {
        let counter = counter.clone();
        let gate = gate.clone();
        let entered = entered.clone();
        Arc::new(move |_key: String| {
            let counter = counter.clone();
            let gate = gate.clone();
            let entered = entered.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                entered.notify_one();
                let _permit = gate.acquire().await?;
                Ok(())
            })
        })
    };

    let worker = AsyncWorker::new("test", fast_rate(), reconciler);
    worker.run(1);

    worker.add("key".to_string());
    entered.notified().await;

    // Re-add while the key is in flight: must be parked, not dropped and
    // not run concurrently.
    worker.add("key".to_string());
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    // Release both runs.
    gate.add_permits(2);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_parallel_workers_serialize_per_key() {
    let in_flight = Arc::new(AtomicU32::new(0));
    let max_in_flight = Arc::new(AtomicU32::new(0));

    let reconciler: ReconcileFn<String> = {
        let in_flight = in_flight.clone();
        let max_in_flight = max_in_flight.clone();
        Arc::new(move |_key: String| {
            let in_flight = in_flight.clone();
            let max_in_flight = max_in_flight.clone();
            Box::pin(async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_in_flight.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
        })
    };

    let worker = AsyncWorker::new("test", fast_rate(), reconciler);
    worker.run(4);

    for i in 0..8 {
        worker.add(format!("key-{i}"));
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Distinct keys ran in parallel.
    assert!(max_in_flight.load(Ordering::SeqCst) > 1);
}

#[tokio::test(start_paused = true)]
async fn test_dequeues_throttle_at_qps() {
    let counter = Arc::new(AtomicU32::new(0));
    let rate = RateLimiterOptions {
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(20),
        qps: 1.0,
        burst: 1,
    };
    let worker = AsyncWorker::new("test", rate, counting_reconciler(counter.clone(), 0));
    worker.run(1);

    for i in 0..3 {
        worker.add(format!("key-{i}"));
    }

    // The burst token covers the first dequeue; the rest wait for refills.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 2);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_shutdown_stops_workers() {
    let counter = Arc::new(AtomicU32::new(0));
    let worker = AsyncWorker::new("test", fast_rate(), counting_reconciler(counter.clone(), 0));
    worker.run(1);
    worker.shutdown();
    tokio::time::sleep(Duration::from_millis(20)).await;

    worker.add("late".to_string());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}
