mod config;
mod coordinator;
mod drone;
mod identity;
mod map;
mod peer;
mod pipe;
mod remote;
mod scheduler;
mod track;

use anyhow::{Context, Result};
use clap::Parser;
use config::{ConfigFile, JsonFileStore, RelayConfig, SnapshotStore};
use coordinator::{ConfigChange, Coordinator, CoordinatorHandle};
use drone::{DroneTable, Waypoint};
use identity::NodeIdentity;
use pipe::PipeListener;
use remote::ReqwestExecutor;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Remote ID scanner node publishing drone tracks to a shared map
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Snapshot file holding configuration and drone labels
    #[arg(long, default_value = "rid-relay.json")]
    state: PathBuf,

    /// Credentials or drone-label file to import at start
    #[arg(long)]
    config: Option<PathBuf>,

    /// Node name announced to peers
    #[arg(long)]
    name: Option<String>,

    /// Peer listener address
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let store = Arc::new(JsonFileStore::new(&args.state));
    let snapshot = store.load().await?;
    let (mut config, uuid, drones) = match snapshot {
        Some(s) => (s.config, Some(s.node_uuid), s.drones),
        None => (RelayConfig::default(), None, Vec::new()),
    };
    if let Some(name) = args.name {
        config.node_name = name;
    }
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    let config = config.normalize();

    // Initialize tracing
    let level = if config.debug_level > 0 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    let uuid = uuid.unwrap_or_else(|| NodeIdentity::derive_uuid(&config.device_id));
    let mut identity = NodeIdentity::new(uuid, config.node_name.clone());
    if config.addrs.is_empty() {
        identity.refresh_addrs();
    } else {
        identity.set_addrs(config.addrs.clone());
    }
    if let Some(fix) = config.position {
        identity.update_fix(fix);
    }

    info!("Relay node starting: {} ({})", identity.name(), identity.uuid());
    info!("  Snapshot: {}", args.state.display());
    info!("  Addresses: {}", identity.addrs_text());
    if !config.map_id.is_empty() {
        info!("  Map: {} / '{}'", config.map_id, config.track_folder);
    }

    let listen_addr = config.listen_addr.clone();
    let (coordinator, handle) = Coordinator::new(
        config,
        identity.clone(),
        DroneTable::from_specs(drones),
        Arc::new(ReqwestExecutor::new()),
        store,
    );
    let listener = PipeListener::bind(&listen_addr, identity.name().to_string(), coordinator.pipe_events()).await?;

    if let Some(path) = &args.config {
        let file = ConfigFile::load(path)
            .await
            .with_context(|| format!("Failed to import {}", path.display()))?;
        handle.configure(ConfigChange::Import(file))?;
    }

    let task = tokio::spawn(coordinator.run());

    // Waypoints arrive as JSON lines from the scanning layer
    let reader_handle = handle.clone();
    tokio::spawn(async move {
        if let Err(e) = read_waypoints(reader_handle).await {
            error!("Waypoint input stopped: {:#}", e);
        }
    });

    tokio::signal::ctrl_c().await.context("Failed to listen for ctrl-c")?;
    info!("Interrupted, shutting down");
    listener.stop();
    handle.shutdown().await?;
    task.await.context("Coordinator task panicked")??;
    Ok(())
}

async fn read_waypoints(handle: CoordinatorHandle) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Waypoint>(line) {
            Ok(wp) => handle.submit_waypoint(wp)?,
            Err(e) => warn!("Bad waypoint line: {}", e),
        }
    }
    debug!("Waypoint input closed");
    Ok(())
}
