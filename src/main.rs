use anyhow::Context;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use uwb_positioning::broadcast::server;
use uwb_positioning::{
    AnchorSet, BroadcastHub, FramePipeline, IngestionListener, MultilaterationSolver, Positioner, ServerConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::from_env().context("invalid configuration")?;
    tracing::debug!(?config, "configuration loaded");

    let anchors = load_anchors(&config)?;
    let hub = BroadcastHub::new(config.client_buffer);

    let positioner = match (&anchors, config.positioning) {
        (Some(anchors), true) => {
            tracing::info!(anchors = anchors.len(), solver = %config.solver, "positioning enabled");
            Some(Positioner::new(anchors.clone(), MultilaterationSolver::new(config.solver)))
        }
        _ => {
            tracing::info!("positioning disabled, relaying raw frames only");
            None
        }
    };
    let pipeline = FramePipeline::new(hub.clone(), positioner);

    let ingestion = IngestionListener::bind(&config.ingest_address(), pipeline, config.max_line_bytes).await?;

    let http_address = config.http_address();
    let http_listener = tokio::net::TcpListener::bind(&http_address)
        .await
        .with_context(|| format!("failed to bind fan-out server on {}", http_address))?;
    let app = server::router(hub, anchors, &config.cors_origin)?;

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("shutting down"),
            Err(e) => tracing::error!("failed to listen for Ctrl-C: {}", e),
        }
        let _ = stop_tx.send(true);
    });

    let (_, served) = tokio::join!(
        ingestion.serve_until(stopped(stop_rx.clone())),
        server::serve_until(http_listener, app, stopped(stop_rx)),
    );
    served.context("fan-out server failed")?;

    Ok(())
}

/// Resolves once the shutdown flag is raised
async fn stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Missing layout disables positioning; a malformed one is fatal
fn load_anchors(config: &ServerConfig) -> anyhow::Result<Option<Arc<AnchorSet>>> {
    let path = &config.anchors_path;
    if !path.exists() {
        tracing::warn!("anchor file {} not found, positioning unavailable", path.display());
        return Ok(None);
    }

    let anchors = AnchorSet::from_file(path).context("failed to load anchor layout")?;
    if anchors.is_collinear() {
        tracing::warn!("anchors are collinear, positions cannot be solved");
    }
    tracing::info!("loaded {} anchors from {}", anchors.len(), path.display());
    Ok(Some(Arc::new(anchors)))
}
