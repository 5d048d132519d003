// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Rate-limited asynchronous work queues.
//!
//! An [`AsyncWorker`] is a deduplicating FIFO of opaque keys dispatched to a
//! fixed number of parallel workers. A key is never processed by two workers
//! at once: re-adds of an in-flight key are parked and delivered after the
//! current reconcile finishes. Failed keys are re-added after a per-key
//! exponential backoff; successful keys have their failure history forgotten.

use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::constants::{
    DEFAULT_RATE_LIMITER_BASE_DELAY_MS, DEFAULT_RATE_LIMITER_BURST,
    DEFAULT_RATE_LIMITER_MAX_DELAY_SECS, DEFAULT_RATE_LIMITER_QPS,
};

/// Keys a work queue can carry.
pub trait WorkKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T: Clone + Eq + Hash + Debug + Send + Sync + 'static> WorkKey for T {}

/// Reconcile callback invoked for each dequeued key.
pub type ReconcileFn<K> = Arc<dyn Fn(K) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Queue rate limiting: per-key exponential backoff plus an overall
/// token-bucket throttle on dequeues.
#[derive(Clone, Copy, Debug)]
pub struct RateLimiterOptions {
    /// Delay after the first failure of a key.
    pub base_delay: Duration,
    /// Upper bound the backoff saturates at.
    pub max_delay: Duration,
    /// Sustained dequeue rate across all keys.
    pub qps: f64,
    /// Dequeues allowed to burst above the sustained rate.
    pub burst: u32,
}

impl Default for RateLimiterOptions {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(DEFAULT_RATE_LIMITER_BASE_DELAY_MS),
            max_delay: Duration::from_secs(DEFAULT_RATE_LIMITER_MAX_DELAY_SECS),
            qps: DEFAULT_RATE_LIMITER_QPS,
            burst: DEFAULT_RATE_LIMITER_BURST,
        }
    }
}

impl RateLimiterOptions {
    /// Backoff for the given consecutive failure count (1-based).
    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = i32::try_from(failures.saturating_sub(1)).unwrap_or(i32::MAX).min(62);
        let delay = self.base_delay.as_secs_f64() * 2f64.powi(exponent);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

struct QueueState<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
}

impl<K> Default for QueueState<K> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            failures: HashMap::new(),
        }
    }
}

struct TokenBucket {
    tokens: f64,
    last_refill: tokio::time::Instant,
}

struct Inner<K> {
    name: String,
    rate: RateLimiterOptions,
    reconcile: ReconcileFn<K>,
    state: Mutex<QueueState<K>>,
    bucket: Mutex<TokenBucket>,
    notify: Notify,
    shutdown: AtomicBool,
}

/// A deduplicating, rate-limited work queue with parallel workers.
pub struct AsyncWorker<K: WorkKey> {
    inner: Arc<Inner<K>>,
}

impl<K: WorkKey> Clone for AsyncWorker<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: WorkKey> AsyncWorker<K> {
    /// Create a worker with the given name (used in logs), backoff options
    /// and reconcile callback. Call [`run`](Self::run) to start processing.
    pub fn new(name: impl Into<String>, rate: RateLimiterOptions, reconcile: ReconcileFn<K>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                rate,
                reconcile,
                state: Mutex::new(QueueState::default()),
                bucket: Mutex::new(TokenBucket {
                    tokens: f64::from(rate.burst),
                    last_refill: tokio::time::Instant::now(),
                }),
                notify: Notify::new(),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Enqueue a key. Duplicates of a queued key collapse; duplicates of an
    /// in-flight key are parked until that reconcile finishes.
    pub fn add(&self, key: K) {
        {
            let mut state = self.inner.state.lock().expect("worker queue poisoned");
            if !state.dirty.insert(key.clone()) {
                return;
            }
            if state.processing.contains(&key) {
                return;
            }
            state.queue.push_back(key);
        }
        self.inner.notify.notify_one();
    }

    /// Re-enqueue a key after a delay, keeping dedup semantics.
    fn add_after(&self, key: K, delay: Duration) {
        let worker = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            worker.add(key);
        });
    }

    /// Number of keys waiting in the queue (excluding in-flight ones).
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.inner.state.lock().expect("worker queue poisoned").queue.len()
    }

    /// Spawn `concurrency` worker tasks.
    pub fn run(&self, concurrency: usize) {
        for index in 0..concurrency.max(1) {
            let inner = self.inner.clone();
            let worker = self.clone();
            tokio::spawn(async move {
                debug!(queue = %inner.name, worker = index, "Worker started");
                worker.worker_loop().await;
                debug!(queue = %inner.name, worker = index, "Worker stopped");
            });
        }
    }

    /// Stop all workers after their in-flight reconciles finish.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    async fn worker_loop(&self) {
        loop {
            if self.inner.shutdown.load(Ordering::SeqCst) {
                return;
            }
            let Some(key) = self.next() else {
                // notified() returns immediately when a permit was stored by
                // an add() that found no waiter.
                self.inner.notify.notified().await;
                continue;
            };

            self.throttle().await;
            let result = (self.inner.reconcile)(key.clone()).await;
            match result {
                Ok(()) => self.forget(&key),
                Err(error) => {
                    let failures = self.record_failure(&key);
                    let delay = self.inner.rate.delay_for(failures);
                    warn!(
                        queue = %self.inner.name,
                        key = ?key,
                        failures,
                        retry_after = ?delay,
                        error = %format!("{error:#}"),
                        "Reconcile failed, requeueing with backoff"
                    );
                    self.add_after(key.clone(), delay);
                }
            }
            self.done(&key);
        }
    }

    /// Take one token from the dequeue bucket, sleeping until the refill
    /// rate provides it.
    async fn throttle(&self) {
        if self.inner.rate.qps <= 0.0 {
            return;
        }
        loop {
            let wait = {
                let mut bucket = self.inner.bucket.lock().expect("rate bucket poisoned");
                let now = tokio::time::Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.inner.rate.qps)
                    .min(f64::from(self.inner.rate.burst));
                bucket.last_refill = now;

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.inner.rate.qps)
            };
            tokio::time::sleep(wait).await;
        }
    }

    fn next(&self) -> Option<K> {
        let mut state = self.inner.state.lock().expect("worker queue poisoned");
        let key = state.queue.pop_front()?;
        state.dirty.remove(&key);
        state.processing.insert(key.clone());
        Some(key)
    }

    fn done(&self, key: &K) {
        let should_notify = {
            let mut state = self.inner.state.lock().expect("worker queue poisoned");
            state.processing.remove(key);
            if state.dirty.contains(key) {
                state.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if should_notify {
            self.inner.notify.notify_one();
        }
    }

    fn forget(&self, key: &K) {
        let mut state = self.inner.state.lock().expect("worker queue poisoned");
        state.failures.remove(key);
    }

    fn record_failure(&self, key: &K) -> u32 {
        let mut state = self.inner.state.lock().expect("worker queue poisoned");
        let failures = state.failures.entry(key.clone()).or_insert(0);
        *failures += 1;
        *failures
    }
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod worker_tests;
