// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! # Stratus Resource Detector
//!
//! The resource detector at the heart of the Stratus multi-cluster workload
//! federation control plane. It observes every user-created workload object
//! (resource template) and every propagation policy, decides which policy
//! governs each template, and materializes that decision as a binding
//! consumed by the downstream scheduler and propagator.
//!
//! ## Overview
//!
//! - Dynamically discovers propagatable resource kinds and watches them
//! - Matches templates against namespace- and cluster-scoped policies with
//!   deterministic priority, specificity and name tie-breaks
//! - Claims templates by writing policy identity marks under optimistic
//!   concurrency
//! - Creates and refreshes `ResourceBinding`/`ClusterResourceBinding`
//!   artifacts owned by their templates, never touching the scheduler's
//!   `spec.clusters`
//! - Tracks unmatched templates on a waiting list rescanned on every policy
//!   change, with preemption between policies of differing priority
//!
//! ## Modules
//!
//! - [`crd`] - Custom Resource Definitions for policies and bindings
//! - [`detector`] - the coordination core
//! - [`reconcilers`] - template, policy, binding and cleanup logic
//! - [`matcher`] - policy selection engine
//! - [`worker`] - rate-limited deduplicating work queues
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use stratus::config::DetectorConfig;
//! use stratus::detector::ResourceDetector;
//! use stratus::interpreter::BuiltinInterpreter;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let client = kube::Client::try_default().await?;
//! let detector = Arc::new(ResourceDetector::new(
//!     client,
//!     DetectorConfig::from_env()?,
//!     Arc::new(BuiltinInterpreter),
//! ));
//! detector.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod crd;
pub mod detector;
pub mod discovery;
pub mod eventfilter;
pub mod informers;
pub mod interpreter;
pub mod keys;
pub mod labels;
pub mod matcher;
pub mod metrics;
pub mod reconcilers;
pub mod waiting;
pub mod worker;
