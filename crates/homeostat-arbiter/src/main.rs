//! Homeostat daemon
//!
//! Runs the beat loop until the configured beat count is reached or Ctrl-C.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use homeostat_arbiter::{export_metrics, Arbiter, BeatMetrics, HomeostatConfig};
use homeostat_common::VERSION;
use homeostat_mesh::MeshNode;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Homeostat v{}", VERSION);

    let config = HomeostatConfig::load().context("loading configuration")?;
    info!(node_id = %config.node_id, beats = ?config.arbiter.beats, "Loaded configuration");

    let registry = prometheus::Registry::new();
    let metrics = BeatMetrics::new()?;
    metrics.register(&registry)?;

    let mut arbiter = Arbiter::new(&config)
        .context("building arbiter")?
        .with_metrics(metrics);

    if config.mesh.enabled {
        let mesh = Arc::new(MeshNode::new(config.mesh_config()));
        let addr = mesh.start().await.context("starting mesh listener")?;
        info!(%addr, "Mesh listening");

        for peer in &config.mesh.peers {
            match mesh.discover_peer(peer, json!({})).await {
                Ok(record) => info!(peer_id = %record.peer_id, address = %peer, "Peer discovered"),
                Err(e) => warn!(address = %peer, error = %e, "Peer discovery failed"),
            }
        }
        arbiter = arbiter.with_mesh(mesh);
    }

    let stop = arbiter.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            stop.stop();
        }
    });

    let outcome = arbiter.run_then_shutdown(config.arbiter.beats).await;

    match export_metrics(&registry) {
        Ok(text) => info!("Final metrics\n{}", text.trim_end()),
        Err(e) => warn!(error = %e, "Could not export metrics"),
    }
    let completed = outcome.context("running beat loop")?;

    let manifest = arbiter.ledger().manifest();
    info!(
        completed,
        chain_length = manifest.chain_length,
        merkle_root = %manifest.merkle_root,
        "Homeostat stopped"
    );
    println!("{}", serde_json::to_string_pretty(&manifest)?);

    Ok(())
}
