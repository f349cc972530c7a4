//! Shipping Agent - Main entry point
//!
//! Ships snapshot streams to, or restores them from, a directory-backed
//! object store.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use shipping_agent::naming::Backend;
use shipping_agent::shipping::{
    ShipEvent, ShippingService, SnapshotRestore, SnapshotShipment, VolumeRestore, VolumeShipment,
};
use shipping_agent::store::{BackupStore, FsStore, MetaCache};
use shipping_agent::{config::Config, utils};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Object store directory (overrides config)
    #[arg(long)]
    store: Option<PathBuf>,

    /// Key grammar of the remote
    #[arg(long, default_value = "s3")]
    backend: Backend,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ship a snapshot, one `NR=COMMAND` per volume
    Send {
        #[arg(long)]
        rsc: String,
        #[arg(long)]
        snap: String,
        #[arg(long = "volume", value_parser = parse_volume, required = true)]
        volumes: Vec<(u32, String)>,
        #[arg(long, default_value = "")]
        layer_suffix: String,
        #[arg(long, default_value = "")]
        suffix: String,
        /// Manifest key of the backup this one is incremental to
        #[arg(long)]
        based_on: Option<String>,
        /// Expected stream size per volume in bytes
        #[arg(long, default_value_t = 0)]
        expected_size: u64,
    },
    /// Restore a backup, one `NR=COMMAND` per volume
    Restore {
        #[arg(long)]
        rsc: String,
        #[arg(long)]
        snap: String,
        /// Full backup id to restore
        #[arg(long)]
        backup: String,
        #[arg(long = "volume", value_parser = parse_volume, required = true)]
        volumes: Vec<(u32, String)>,
        #[arg(long, default_value = "")]
        layer_suffix: String,
    },
}

fn parse_volume(raw: &str) -> std::result::Result<(u32, String), String> {
    let (nr, command) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NR=COMMAND, got '{raw}'"))?;
    let nr = nr
        .trim()
        .parse()
        .map_err(|e| format!("invalid volume number '{nr}': {e}"))?;
    Ok((nr, command.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!(
        "Starting shipping-agent v{} (node: {}, cluster: {})",
        env!("CARGO_PKG_VERSION"),
        config.node.name,
        config.node.cluster_id
    );

    let root = args.store.clone().unwrap_or_else(|| config.store.root.clone());
    let fs_store = FsStore::new(&root)
        .with_context(|| format!("Failed to open store at {}", root.display()))?;
    let store = BackupStore::new(
        config.store.remote_name.clone(),
        args.backend,
        Arc::new(fs_store),
        Arc::new(MetaCache::new()),
    )
    .with_listing_timeout(config.listing_timeout());

    let service = ShippingService::new(
        config.node.name.clone(),
        config.node.cluster_id.clone(),
        config.pipeline_options(),
        config.join_timeout(),
    );
    let mut events = service.events().subscribe();

    match args.command {
        Command::Send {
            rsc,
            snap,
            volumes,
            layer_suffix,
            suffix,
            based_on,
            expected_size,
        } => {
            let plan = SnapshotShipment {
                rsc_name: rsc,
                snap_name: snap,
                remote_name: config.store.remote_name.clone(),
                start_time: Utc::now(),
                backend_suffix: suffix,
                based_on,
                snap_dfn_uuid: uuid::Uuid::new_v4().to_string(),
                volumes: volumes
                    .into_iter()
                    .map(|(vlm_nr, command)| VolumeShipment {
                        vlm_nr,
                        layer_suffix: layer_suffix.clone(),
                        command,
                        expected_size,
                    })
                    .collect(),
            };
            service.ship_snapshot(store, plan).await?;
        }
        Command::Restore {
            rsc,
            snap,
            backup,
            volumes,
            layer_suffix,
        } => {
            let plan = SnapshotRestore {
                rsc_name: rsc,
                snap_name: snap,
                remote_name: config.store.remote_name.clone(),
                backup_to_restore: backup,
                volumes: volumes
                    .into_iter()
                    .map(|(vlm_nr, command)| VolumeRestore {
                        vlm_nr,
                        layer_suffix: layer_suffix.clone(),
                        command,
                    })
                    .collect(),
            };
            service.restore_snapshot(store, plan).await?;
        }
    }

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("Received SIGINT (Ctrl+C), aborting shipment...");
                service.shutdown_all().await;
            }
            event = events.recv() => {
                let event = event.context("event bus closed")?;
                tracing::debug!("{}", serde_json::to_string(&event)?);
                if let ShipEvent::ShippingFinished { success, restoring, .. } = event {
                    let what = if restoring { "Restore" } else { "Shipment" };
                    if !success {
                        bail!("{} failed", what);
                    }
                    tracing::info!("{} complete", what);
                    return Ok(());
                }
            }
        }
    }
}
