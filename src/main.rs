// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

use anyhow::Result;
use axum::{routing::get, Router};
use kube::Client;
use kube_lease_manager::{LeaseManager, LeaseManagerBuilder};
use std::sync::Arc;
use stratus::{
    config::DetectorConfig,
    constants::{
        DEFAULT_LEASE_DURATION_SECS, DEFAULT_LEASE_RETRY_PERIOD_SECS, METRICS_SERVER_BIND_ADDRESS,
        METRICS_SERVER_PATH, METRICS_SERVER_PORT, TOKIO_WORKER_THREADS,
    },
    detector::ResourceDetector,
    interpreter::BuiltinInterpreter,
    metrics,
};
use tracing::{debug, error, info, warn};

fn main() -> Result<()> {
    // Build Tokio runtime with custom thread names
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(TOKIO_WORKER_THREADS)
        .thread_name("stratus-detector")
        .enable_all()
        .build()?;

    runtime.block_on(async_main())
}

/// Initialize logging with custom format
///
/// Respects `RUST_LOG` environment variable if set, otherwise defaults to
/// INFO level. Respects `RUST_LOG_FORMAT` environment variable for output
/// format (json or text).
fn initialize_logging() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let log_format = std::env::var("RUST_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    match log_format.to_lowercase().as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_file(true)
                .with_line_number(true)
                .with_thread_names(true)
                .with_target(false)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_file(true)
                .with_line_number(true)
                .with_thread_names(true)
                .with_target(false)
                .with_ansi(true)
                .compact()
                .init();
        }
    }

    info!("Starting Stratus resource detector");
}

/// Start the Prometheus metrics HTTP server
///
/// Serves metrics on the configured port and path (default:
/// 0.0.0.0:8080/metrics)
fn start_metrics_server() -> tokio::task::JoinHandle<()> {
    info!(
        bind_address = METRICS_SERVER_BIND_ADDRESS,
        port = METRICS_SERVER_PORT,
        path = METRICS_SERVER_PATH,
        "Starting Prometheus metrics HTTP server"
    );

    tokio::spawn(async move {
        async fn metrics_handler() -> String {
            match metrics::gather_metrics() {
                Ok(metrics_text) => metrics_text,
                Err(e) => {
                    error!("Failed to gather metrics: {}", e);
                    String::from("# Error gathering metrics\n")
                }
            }
        }

        let app = Router::new().route(METRICS_SERVER_PATH, get(metrics_handler));

        let bind_addr = format!("{METRICS_SERVER_BIND_ADDRESS}:{METRICS_SERVER_PORT}");
        let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to bind metrics server to {bind_addr}: {e}");
                return;
            }
        };

        info!("Metrics server listening on http://{bind_addr}{METRICS_SERVER_PATH}");

        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {e}");
        }
    })
}

/// Leader election configuration
struct LeaderElectionConfig {
    enabled: bool,
    lease_name: String,
    lease_namespace: String,
    identity: String,
    lease_duration: u64,
    retry_period: u64,
}

/// Load leader election configuration from environment variables
fn load_leader_election_config() -> LeaderElectionConfig {
    let enabled = std::env::var("STRATUS_ENABLE_LEADER_ELECTION")
        .unwrap_or_else(|_| "true".to_string())
        .parse::<bool>()
        .unwrap_or(true);

    let lease_name =
        std::env::var("STRATUS_LEASE_NAME").unwrap_or_else(|_| "stratus-detector-leader".to_string());

    let lease_namespace = std::env::var("STRATUS_LEASE_NAMESPACE")
        .or_else(|_| std::env::var("POD_NAMESPACE"))
        .unwrap_or_else(|_| "stratus-system".to_string());

    let lease_duration = std::env::var("STRATUS_LEASE_DURATION_SECONDS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(DEFAULT_LEASE_DURATION_SECS);

    let retry_period = std::env::var("STRATUS_LEASE_RETRY_PERIOD_SECONDS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(DEFAULT_LEASE_RETRY_PERIOD_SECS);

    let identity = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("stratus-detector-{}", rand::random::<u32>()));

    LeaderElectionConfig {
        enabled,
        lease_name,
        lease_namespace,
        identity,
        lease_duration,
        retry_period,
    }
}

async fn async_main() -> Result<()> {
    initialize_logging();

    debug!("Initializing Kubernetes client");
    let client = Client::try_default().await?;
    let config = DetectorConfig::from_env()?;
    let detector = Arc::new(ResourceDetector::new(
        client.clone(),
        config,
        Arc::new(BuiltinInterpreter),
    ));

    let _metrics_handle = start_metrics_server();

    let leader_config = load_leader_election_config();

    if leader_config.enabled {
        info!(
            lease_name = %leader_config.lease_name,
            lease_namespace = %leader_config.lease_namespace,
            identity = %leader_config.identity,
            lease_duration_secs = leader_config.lease_duration,
            "Leader election enabled"
        );

        info!("Starting leader election, waiting to acquire leadership...");
        let lease_manager = LeaseManagerBuilder::new(client, &leader_config.lease_name)
            .with_namespace(&leader_config.lease_namespace)
            .with_identity(&leader_config.identity)
            .with_duration(leader_config.lease_duration)
            .with_grace(leader_config.retry_period)
            .build()
            .await?;

        let (leader_rx, lease_handle) = lease_manager.watch().await;

        // Wait until we become leader
        let mut rx = leader_rx.clone();
        while !*rx.borrow_and_update() {
            rx.changed().await?;
        }

        info!("Leadership acquired, starting detector");
        run_with_leader_election(detector, leader_rx, lease_handle).await?;
    } else {
        warn!("Leader election DISABLED - running without high availability");
        run_without_leader_election(detector).await?;
    }

    Ok(())
}

/// Monitor leadership status - returns when leadership is lost or an error
/// occurs
async fn monitor_leadership(
    mut leader_rx: tokio::sync::watch::Receiver<bool>,
) -> Result<(), anyhow::Error> {
    loop {
        leader_rx.changed().await?;
        if !*leader_rx.borrow() {
            // Leadership lost
            return Ok(());
        }
    }
}

/// Run the detector while monitoring leadership status and signals. If
/// leadership is lost or SIGTERM/SIGINT is received, the process exits
/// gracefully and the lease is released.
async fn run_with_leader_election(
    detector: Arc<ResourceDetector>,
    leader_rx: tokio::sync::watch::Receiver<bool>,
    _lease_handle: tokio::task::JoinHandle<
        Result<LeaseManager, kube_lease_manager::LeaseManagerError>,
    >,
) -> Result<()> {
    let shutdown_result: Result<()> = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            result.map_err(anyhow::Error::from)
        }

        result = wait_for_sigterm() => {
            info!("Received SIGTERM (pod termination), initiating graceful shutdown...");
            result
        }

        result = monitor_leadership(leader_rx) => {
            match result {
                Ok(()) => {
                    warn!("Leadership lost! Stopping detector...");
                    anyhow::bail!("leadership lost - stepping down")
                }
                Err(e) => {
                    error!("Leadership monitor error: {:?}", e);
                    anyhow::bail!("leadership monitoring failed: {e}")
                }
            }
        }

        result = detector.start() => {
            error!("CRITICAL: detector exited unexpectedly: {:?}", result);
            result?;
            anyhow::bail!("detector exited unexpectedly without error")
        }
    };

    shutdown_result?;
    info!("Graceful shutdown completed successfully, leader election lease released");
    Ok(())
}

/// Run the detector with signal handling only.
async fn run_without_leader_election(detector: Arc<ResourceDetector>) -> Result<()> {
    let shutdown_result: Result<()> = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            result.map_err(anyhow::Error::from)
        }

        result = wait_for_sigterm() => {
            info!("Received SIGTERM (pod termination), initiating graceful shutdown...");
            result
        }

        result = detector.start() => {
            error!("CRITICAL: detector exited unexpectedly: {:?}", result);
            result?;
            anyhow::bail!("detector exited unexpectedly without error")
        }
    };

    shutdown_result?;
    info!("Graceful shutdown completed successfully");
    Ok(())
}

/// Wait for SIGTERM (Kubernetes sends this when deleting pods).
async fn wait_for_sigterm() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        sigterm.recv().await;
        Ok(())
    }
    #[cfg(not(unix))]
    {
        // On non-Unix platforms, just wait forever
        std::future::pending::<()>().await;
        Ok(())
    }
}
