//! Node annotator - keeps GCE instance ids on Kubernetes nodes

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::Client;
use tokio_util::sync::CancellationToken;

use node_annotator::informer::watch_nodes;
use node_annotator::inventory::{
    MetadataTokenSource, StaticTokenSource, TokenSource, DEFAULT_COMPUTE_ENDPOINT,
    DEFAULT_METADATA_ENDPOINT,
};
use node_annotator::{GceInventory, KubeNodeClient, NodeAnnotator, NodeInformer};
use node_annotator_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use node_annotator_common::CONTROLLER_NAME;

/// Node annotator - writes the GCE instance id onto each node as an annotation
#[derive(Parser, Debug)]
#[command(name = "node-annotator", version, about, long_about = None)]
struct Cli {
    /// Number of concurrent reconciliation workers
    #[arg(long, env = "NODE_ANNOTATOR_WORKERS", default_value_t = 2)]
    workers: usize,

    /// Log output format (json or text)
    #[arg(long, env = "NODE_ANNOTATOR_LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,

    /// Compute Engine API base URL
    #[arg(long, env = "NODE_ANNOTATOR_COMPUTE_ENDPOINT", default_value = DEFAULT_COMPUTE_ENDPOINT)]
    compute_endpoint: String,

    /// GCE metadata server base URL, used to obtain access tokens
    #[arg(long, env = "NODE_ANNOTATOR_METADATA_ENDPOINT", default_value = DEFAULT_METADATA_ENDPOINT)]
    metadata_endpoint: String,

    /// Pre-issued access token; skips the metadata server when set
    #[arg(long, env = "NODE_ANNOTATOR_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    /// Seconds to wait for the initial node list before giving up (0 = forever)
    #[arg(long, env = "NODE_ANNOTATOR_CACHE_SYNC_TIMEOUT_SECS", default_value_t = 300)]
    cache_sync_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(&TelemetryConfig {
        format: cli.log_format,
        ..Default::default()
    })?;

    if cli.workers == 0 {
        anyhow::bail!("--workers must be at least 1");
    }

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let tokens: Arc<dyn TokenSource> = match cli.access_token {
        Some(token) => Arc::new(StaticTokenSource::new(token)),
        None => Arc::new(MetadataTokenSource::new(cli.metadata_endpoint)?),
    };
    let inventory = Arc::new(GceInventory::new(cli.compute_endpoint, tokens)?);

    let informer = NodeInformer::new();
    let annotator = Arc::new(NodeAnnotator::new(
        Arc::new(KubeNodeClient::new(client.clone())),
        Arc::new(informer.store()),
        inventory,
    ));

    let shutdown = CancellationToken::new();
    let informer_task = tokio::spawn(informer.run(
        watch_nodes(client),
        annotator.clone(),
        shutdown.clone(),
    ));

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = shutdown_signal().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
            shutdown.cancel();
        });
    }

    let cache_sync_timeout =
        (cli.cache_sync_timeout_secs > 0).then(|| Duration::from_secs(cli.cache_sync_timeout_secs));

    tracing::info!(controller = CONTROLLER_NAME, workers = cli.workers, "Starting");
    let result = annotator
        .run(cli.workers, cache_sync_timeout, shutdown.clone())
        .await;

    shutdown.cancel();
    if let Err(e) = informer_task.await {
        tracing::error!(error = %e, "Node informer task failed");
    }

    result?;
    tracing::info!(controller = CONTROLLER_NAME, "Stopped");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = term.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
