// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Periodic resource discovery.
//!
//! Every [`DISCOVERY_PERIOD_SECS`] the detector asks the API server which
//! kinds it serves, keeps the ones supporting the `delete` verb (anything the
//! platform can garbage-collect is propagatable), drops the ones disabled by
//! the skip configuration, and attaches a watch for each kind not already
//! watched. Attaching is idempotent, so the loop is safe to run forever.

use anyhow::Result;
use kube::discovery::{verbs, Discovery};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::constants::DISCOVERY_PERIOD_SECS;
use crate::detector::ResourceDetector;

/// Run the discovery loop until the process shuts down.
pub async fn discover_resources(detector: Arc<ResourceDetector>) {
    let period = Duration::from_secs(DISCOVERY_PERIOD_SECS);
    loop {
        if let Err(err) = discover_once(&detector).await {
            error!(error = %format!("{err:#}"), "Resource discovery pass failed");
        }
        tokio::time::sleep(period).await;
    }
}

/// One discovery pass: enumerate served kinds and attach missing watches.
async fn discover_once(detector: &ResourceDetector) -> Result<()> {
    let discovery = Discovery::new(detector.client.clone()).run().await?;

    for group in discovery.groups() {
        for (resource, capabilities) in group.recommended_resources() {
            if !capabilities.supports_operation(verbs::DELETE) {
                continue;
            }
            if detector.config.skipped_resources.resource_disabled(&resource) {
                continue;
            }
            if detector.informers.is_watched(&resource) {
                continue;
            }
            info!(
                group = %resource.group,
                version = %resource.version,
                kind = %resource.kind,
                "Setup informer"
            );
            detector.informers.for_resource(resource);
        }
    }

    Ok(())
}
