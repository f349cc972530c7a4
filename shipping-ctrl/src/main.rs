//! Shipping Controller - Main entry point
//!
//! Lists, inspects and deletes backups in a directory-backed object store.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use shipping_ctrl::backup::{DeleteRequest, InfoRequest, ListFilter, SelectionArgs};
use shipping_ctrl::cluster::{ClusterState, LockObj, LockSpec, Notifier, PeerRegistry};
use shipping_ctrl::model::{name_key, Remote, RemoteKind};
use shipping_ctrl::remotes::{FsStoreFactory, RemoteStores, SecurityObjects};
use shipping_ctrl::{AppConfig, BackupService};
use shipping_agent::naming::Backend;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Object store root (overrides STORE_ROOT)
    #[arg(long)]
    store: Option<PathBuf>,

    /// Remote name (overrides REMOTE_NAME)
    #[arg(long)]
    remote: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List backups on the remote
    List {
        #[arg(long)]
        rsc: Option<String>,
        #[arg(long)]
        snap: Option<String>,
    },
    /// Id of the newest backup of a resource
    Latest {
        #[arg(long)]
        rsc: String,
        #[arg(long)]
        snap: Option<String>,
    },
    /// Chain, volumes and download size of a backup
    Info {
        #[arg(long)]
        rsc: Option<String>,
        #[arg(long)]
        snap: Option<String>,
        #[arg(long)]
        id: Option<String>,
    },
    /// Delete backups
    Delete {
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        id_prefix: Option<String>,
        #[arg(long)]
        key: Option<String>,
        /// Delete backups older than YYYYMMDD_HHMMSS
        #[arg(long)]
        timestamp: Option<String>,
        #[arg(long)]
        rsc: Option<String>,
        #[arg(long)]
        node: Option<String>,
        #[arg(long)]
        all: bool,
        #[arg(long)]
        all_local_cluster: bool,
        #[arg(long)]
        cascading: bool,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        keep_snaps: bool,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = AppConfig::from_env();

    let log_level = args.log_level.as_deref().unwrap_or(&config.log_level);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .init();

    let root = args.store.clone().unwrap_or_else(|| config.store_root.clone());
    let remote_name = args.remote.clone().unwrap_or_else(|| config.remote_name.clone());
    tracing::info!(
        "Starting shipping-ctrl v{} (cluster: {}, remote: {} at {})",
        env!("CARGO_PKG_VERSION"),
        config.cluster_id,
        remote_name,
        root.display()
    );

    let state = ClusterState::new(config.cluster_id.clone());
    {
        let kind = match config.backend {
            Backend::S3 => RemoteKind::S3,
            Backend::Obs => RemoteKind::Obs,
        };
        let mut tx = state
            .begin("Register remote", LockSpec::create().write(LockObj::RemoteMap))
            .await;
        tx.remotes_mut()?
            .insert(name_key(&remote_name), Remote::new(remote_name.clone(), kind));
        tx.commit();
    }

    let security = Arc::new(SecurityObjects::new());
    if let Some(key) = &config.master_key {
        security.set_master_key(key.as_bytes().to_vec());
    }
    let stores = RemoteStores::new(
        Arc::new(FsStoreFactory::new(root)),
        security,
        config.listing_timeout,
    );
    let notifier = Notifier::new(Arc::new(PeerRegistry::new()), config.peer_timeout);
    let service = BackupService::new(state, stores, notifier);

    match args.command {
        Command::List { rsc, snap } => {
            let filter = ListFilter {
                rsc_name: rsc,
                snap_name: snap,
            };
            print_json(&service.list_backups(&remote_name, &filter).await?)?;
        }
        Command::Latest { rsc, snap } => {
            let latest = service
                .latest_backup(&remote_name, &rsc, snap.as_deref())
                .await?
                .with_context(|| format!("No backup of {rsc} found on remote {remote_name}"))?;
            println!("{latest}");
        }
        Command::Info { rsc, snap, id } => {
            let request = InfoRequest {
                remote_name: remote_name.clone(),
                rsc_name: rsc,
                snap_name: snap,
                backup_id: id,
            };
            print_json(&service.backup_info(&request).await?)?;
        }
        Command::Delete {
            id,
            id_prefix,
            key,
            timestamp,
            rsc,
            node,
            all,
            all_local_cluster,
            cascading,
            dry_run,
            keep_snaps,
        } => {
            let selection = SelectionArgs {
                id,
                id_prefix,
                key,
                timestamp,
                rsc_name: rsc,
                node_name: node,
                all,
                all_local_cluster,
            }
            .into_selection()?;
            let result = service
                .delete_backup(&DeleteRequest {
                    remote_name: remote_name.clone(),
                    selection,
                    cascading,
                    dry_run,
                    keep_snaps,
                })
                .await?;
            for message in &result.messages {
                eprintln!("{message}");
            }
            print_json(&result)?;
        }
    }
    Ok(())
}
