//! Controller entrypoint: parses flags, wires up the watch cache, work
//! queue, worker pool, and probe server, and runs the reconcile loop —
//! behind the leader election gate when enabled.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use pod_timestamp_controller::constants;
use pod_timestamp_controller::controller::leader::LeaderElector;
use pod_timestamp_controller::controller::queue::RateLimitingQueue;
use pod_timestamp_controller::controller::reconciler::{ApiPodUpdater, PodReconciler};
use pod_timestamp_controller::controller::watch::PodWatcher;
use pod_timestamp_controller::observability::metrics;
use pod_timestamp_controller::server::{start_server, ServerState};

/// Pod timestamp annotation controller
#[derive(Parser, Debug)]
#[command(name = "pod-timestamp-controller", about = "Annotates Pods with a capture timestamp")]
struct Args {
    /// Add the timestamp only to Pods created in the specified namespace.
    /// Defaults to all namespaces.
    #[arg(long, value_name = "NAMESPACE")]
    namespace: Option<String>,

    /// Only add the timestamp annotation to Pods that are annotated with
    /// `add-timestamp`
    #[arg(long)]
    require_annotation: bool,

    /// Number of concurrent reconcile workers
    #[arg(long, default_value_t = constants::DEFAULT_WORKERS)]
    workers: usize,

    /// Enable leader election
    #[arg(long)]
    leader_election: bool,

    /// Namespace holding the leader election Lease
    #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
    leader_election_namespace: String,

    /// HTTP port for metrics and probes
    #[arg(long, env = "METRICS_PORT", default_value_t = constants::DEFAULT_METRICS_PORT)]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pod_timestamp_controller=info".into()),
        )
        .init();

    info!("Starting Pod timestamp annotation controller");

    metrics::register_metrics()?;

    let server_state = Arc::new(ServerState::default());
    let probe_state = Arc::clone(&server_state);
    let metrics_port = args.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = start_server(metrics_port, probe_state).await {
            error!("HTTP server error: {}", e);
        }
    });

    // In-cluster credentials (or local kubeconfig); failure here is fatal.
    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        info!("received shutdown signal");
        signal_token.cancel();
    });

    let queue = Arc::new(RateLimitingQueue::new(
        Duration::from_millis(constants::QUEUE_BASE_DELAY_MS),
        Duration::from_secs(constants::QUEUE_MAX_DELAY_SECS),
    ));

    let watcher = PodWatcher::start(
        client.clone(),
        args.namespace.as_deref(),
        Arc::clone(&queue),
        shutdown.clone(),
    )
    .await
    .context("failed to initialize Pod watch cache")?;

    let reconciler = Arc::new(PodReconciler::new(
        watcher.store(),
        Arc::new(ApiPodUpdater::new(client.clone())),
        Arc::clone(&queue),
        args.require_annotation,
    ));

    server_state.is_ready.store(true, Ordering::Relaxed);

    if args.leader_election {
        let elector = LeaderElector::new(
            client,
            &args.leader_election_namespace,
            constants::LEASE_LOCK_NAME,
        );
        let workers = args.workers;
        elector
            .run(shutdown.clone(), move |token| reconciler.run(token, workers))
            .await?;
    } else {
        reconciler.run(shutdown.clone(), args.workers).await;
    }

    // Stop the watch pump too if we got here through leadership loss rather
    // than a signal.
    shutdown.cancel();
    watcher.join().await;

    info!("Controller stopped");

    Ok(())
}
