// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Prometheus metrics for the Stratus resource detector.
//!
//! This module provides metrics collection with the namespace prefix
//! `stratus_io_` (prometheus-safe version of "stratus.io").
//!
//! # Metrics Categories
//!
//! - **Policy Apply Metrics** - Track policy apply attempts and latency
//! - **Reconciliation Metrics** - Track reconcile outcomes per controller
//! - **Binding Lifecycle Metrics** - Track binding creates and updates
//! - **Waiting List Metrics** - Track unmatched templates
//!
//! # Example
//!
//! ```rust,no_run
//! use stratus::metrics::observe_apply_policy_attempt_and_latency;
//! use std::time::Instant;
//!
//! let start = Instant::now();
//! // ... apply a policy ...
//! observe_apply_policy_attempt_and_latency(true, start);
//! ```

use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::LazyLock;
use std::time::Instant;

/// Namespace prefix for all detector metrics (prometheus-safe)
const METRICS_NAMESPACE: &str = "stratus_io";

/// Global Prometheus metrics registry.
///
/// All metrics are registered here and exposed via the `/metrics` endpoint.
pub static METRICS_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Total policy apply attempts by result
///
/// Labels:
/// - `result`: `success` or `error`
pub static APPLY_POLICY_ATTEMPTS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_apply_policy_attempts_total"),
        "Total policy apply attempts by result",
    );
    let counter = CounterVec::new(opts, &["result"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

/// Latency of policy apply attempts in seconds
pub static APPLY_POLICY_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let opts = HistogramOpts::new(
        format!("{METRICS_NAMESPACE}_apply_policy_duration_seconds"),
        "Latency of policy apply attempts in seconds",
    )
    .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]);
    let histogram = HistogramVec::new(opts, &["result"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(histogram.clone()))
        .unwrap();
    histogram
});

/// Total reconciliations by controller and status
///
/// Labels:
/// - `controller`: `resource-template`, `propagation-policy` or
///   `cluster-propagation-policy`
/// - `status`: `success` or `error`
pub static RECONCILIATION_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_reconciliations_total"),
        "Total reconciliations by controller and status",
    );
    let counter = CounterVec::new(opts, &["controller", "status"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

/// Total bindings written by kind and operation
///
/// Labels:
/// - `kind`: `ResourceBinding` or `ClusterResourceBinding`
/// - `operation`: `created` or `updated`
pub static BINDING_OPERATIONS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_binding_operations_total"),
        "Total bindings written by kind and operation",
    );
    let counter = CounterVec::new(opts, &["kind", "operation"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

/// Current number of templates waiting for a matching policy
pub static WAITING_RESOURCES: LazyLock<Gauge> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_waiting_resources"),
        "Current number of templates waiting for a matching policy",
    );
    let gauge = Gauge::with_opts(opts).unwrap();
    METRICS_REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

/// Record one policy apply attempt and its latency.
pub fn observe_apply_policy_attempt_and_latency(success: bool, start: Instant) {
    let result = if success { "success" } else { "error" };
    APPLY_POLICY_ATTEMPTS_TOTAL
        .with_label_values(&[result])
        .inc();
    APPLY_POLICY_DURATION_SECONDS
        .with_label_values(&[result])
        .observe(start.elapsed().as_secs_f64());
}

/// Record the outcome of one reconcile.
pub fn record_reconciliation(controller: &str, success: bool) {
    let status = if success { "success" } else { "error" };
    RECONCILIATION_TOTAL
        .with_label_values(&[controller, status])
        .inc();
}

/// Record a binding create or update.
pub fn record_binding_operation(kind: &str, operation: &str) {
    BINDING_OPERATIONS_TOTAL
        .with_label_values(&[kind, operation])
        .inc();
}

/// Publish the current waiting-list size.
pub fn set_waiting_resources(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    WAITING_RESOURCES.set(count as f64);
}

/// Gather all registered metrics in the Prometheus text format.
///
/// # Errors
///
/// Returns an error if encoding fails or the output is not valid UTF-8.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let families = METRICS_REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
