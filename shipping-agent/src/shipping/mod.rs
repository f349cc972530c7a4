//! Satellite side of backup shipping: one daemon per volume, the manifest
//! written once every volume made it, events for the controller.

pub mod events;
pub mod tracker;

pub use events::{EventBus, ShipCommand, ShipEvent};
pub use tracker::ShipmentTracker;

use crate::manifest::{BackupEntry, BackupManifest};
use crate::naming::{Backend, ManifestKey};
use crate::pipeline::{PipelineOptions, ShipmentDaemon};
use crate::store::BackupStore;
use crate::utils::errors::{Result, ShipError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct VolumeShipment {
    pub vlm_nr: u32,
    pub layer_suffix: String,
    /// Command writing the snapshot stream of this volume to stdout.
    pub command: String,
    pub expected_size: u64,
}

#[derive(Debug, Clone)]
pub struct SnapshotShipment {
    pub rsc_name: String,
    pub snap_name: String,
    pub remote_name: String,
    pub start_time: DateTime<Utc>,
    pub backend_suffix: String,
    /// Manifest key of the previous backup for incremental shipments.
    pub based_on: Option<String>,
    pub snap_dfn_uuid: String,
    pub volumes: Vec<VolumeShipment>,
}

#[derive(Debug, Clone)]
pub struct VolumeRestore {
    pub vlm_nr: u32,
    pub layer_suffix: String,
    /// Command reading the snapshot stream of this volume from stdin.
    pub command: String,
}

#[derive(Debug, Clone)]
pub struct SnapshotRestore {
    pub rsc_name: String,
    pub snap_name: String,
    pub remote_name: String,
    /// Full backup id (or manifest key) to restore from.
    pub backup_to_restore: String,
    pub volumes: Vec<VolumeRestore>,
}

pub fn shipment_id(rsc_name: &str, snap_name: &str) -> String {
    format!("{}/{}", rsc_name, snap_name)
}

/// Everything a volume callback needs once its daemon is done.
struct ShipContext {
    id: String,
    rsc_name: String,
    snap_name: String,
    remote_name: String,
    /// Manifest to write on success; absent for restores.
    manifest: Option<(BackupStore, ManifestKey, BackupManifest)>,
}

pub struct ShippingService {
    node_name: String,
    cluster_id: String,
    options: PipelineOptions,
    join_timeout: Duration,
    events: EventBus,
    tracker: ShipmentTracker,
}

impl ShippingService {
    pub fn new(
        node_name: impl Into<String>,
        cluster_id: impl Into<String>,
        options: PipelineOptions,
        join_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_name: node_name.into(),
            cluster_id: cluster_id.into(),
            options,
            join_timeout,
            events: EventBus::new(),
            tracker: ShipmentTracker::new(),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn tracker(&self) -> &ShipmentTracker {
        &self.tracker
    }

    /// Ship every volume of a snapshot. Completion is reported through
    /// [`ShipEvent::ShippingFinished`].
    pub async fn ship_snapshot(self: &Arc<Self>, store: BackupStore, plan: SnapshotShipment) -> Result<()> {
        let id = shipment_id(&plan.rsc_name, &plan.snap_name);
        if !self.tracker.begin(&id, plan.volumes.len()).await {
            return Err(ShipError::AlreadyShipping(id));
        }

        let manifest_key = ManifestKey::new(
            plan.rsc_name.clone(),
            plan.start_time,
            plan.backend_suffix.clone(),
            &plan.snap_name,
        );
        let template = BackupManifest {
            rsc_name: plan.rsc_name.clone(),
            node_name: self.node_name.clone(),
            start_timestamp: plan.start_time.timestamp_millis(),
            finish_timestamp: 0,
            snap_dfn_uuid: plan.snap_dfn_uuid.clone(),
            cluster_id: self.cluster_id.clone(),
            based_on: plan.based_on.clone(),
            backups: Default::default(),
        };
        let ctx = Arc::new(ShipContext {
            id: id.clone(),
            rsc_name: plan.rsc_name.clone(),
            snap_name: plan.snap_name.clone(),
            remote_name: plan.remote_name.clone(),
            manifest: Some((store.clone(), manifest_key.clone(), template)),
        });
        info!(
            "Shipping {} volume(s) of {} to {} as {}",
            plan.volumes.len(),
            id,
            plan.remote_name,
            manifest_key
        );

        for volume in plan.volumes {
            let data_key = manifest_key
                .data_key(&volume.layer_suffix, volume.vlm_nr)
                .to_string();
            let callback = self.volume_callback(ctx.clone(), volume.vlm_nr, Some(data_key.clone()));
            let started = ShipmentDaemon::start_send(
                store.clone(),
                data_key.clone(),
                &volume.command,
                volume.expected_size,
                &self.options,
                callback,
            )
            .await;
            match started {
                Ok(daemon) => {
                    if let Some(upload_id) = daemon.upload_id() {
                        self.events.broadcast(ShipEvent::UploadStarted {
                            rsc_name: ctx.rsc_name.clone(),
                            snap_name: ctx.snap_name.clone(),
                            remote_name: ctx.remote_name.clone(),
                            key: data_key,
                            upload_id: upload_id.to_string(),
                        });
                    }
                    self.attach(&id, daemon).await;
                }
                Err(e) => {
                    error!("Failed to start shipping {}: {}", data_key, e);
                    self.volume_finished(ctx.clone(), volume.vlm_nr, None, false)
                        .await;
                }
            }
        }
        Ok(())
    }

    /// Restore every volume of a snapshot from a backup.
    pub async fn restore_snapshot(
        self: &Arc<Self>,
        store: BackupStore,
        plan: SnapshotRestore,
    ) -> Result<()> {
        let id = shipment_id(&plan.rsc_name, &plan.snap_name);
        let source = ManifestKey::parse_id(&plan.backup_to_restore, store.backend())?;
        if !self.tracker.begin(&id, plan.volumes.len()).await {
            return Err(ShipError::AlreadyShipping(id));
        }
        let ctx = Arc::new(ShipContext {
            id: id.clone(),
            rsc_name: plan.rsc_name.clone(),
            snap_name: plan.snap_name.clone(),
            remote_name: plan.remote_name.clone(),
            manifest: None,
        });
        info!("Restoring {} from {}", id, source.full_backup_id());

        for volume in plan.volumes {
            let restore_name = restore_key(&source, &volume.layer_suffix, volume.vlm_nr);
            let callback = self.volume_callback(ctx.clone(), volume.vlm_nr, None);
            let started = ShipmentDaemon::start_restore(
                store.clone(),
                restore_name.clone(),
                &volume.command,
                &self.options,
                callback,
            )
            .await;
            match started {
                Ok(daemon) => self.attach(&id, daemon).await,
                Err(e) => {
                    error!("Failed to start restoring {}: {}", restore_name, e);
                    self.volume_finished(ctx.clone(), volume.vlm_nr, None, false)
                        .await;
                }
            }
        }
        Ok(())
    }

    /// Stop every daemon of a shipment. Returns the number of daemons stopped.
    pub async fn abort(&self, rsc_name: &str, snap_name: &str) -> usize {
        let daemons = self.tracker.daemons(&shipment_id(rsc_name, snap_name)).await;
        for daemon in &daemons {
            daemon.shutdown();
        }
        daemons.len()
    }

    /// Stop all shipments and wait (bounded) for their workers.
    pub async fn shutdown_all(&self) {
        let daemons = self.tracker.all_daemons().await;
        for daemon in &daemons {
            daemon.shutdown();
        }
        for daemon in &daemons {
            daemon.await_shutdown(self.join_timeout).await;
        }
    }

    pub async fn notify_shipping_finished(&self, rsc_name: &str, snap_name: &str) {
        self.tracker
            .clear_started(&shipment_id(rsc_name, snap_name))
            .await;
    }

    pub async fn handle_command(&self, command: ShipCommand) {
        match command {
            ShipCommand::Abort {
                rsc_name,
                snap_name,
            } => {
                let stopped = self.abort(&rsc_name, &snap_name).await;
                info!("Aborted {} daemon(s) of {}/{}", stopped, rsc_name, snap_name);
            }
            ShipCommand::ShippingFinished {
                rsc_name,
                snap_name,
            } => self.notify_shipping_finished(&rsc_name, &snap_name).await,
        }
    }

    async fn attach(&self, id: &str, daemon: ShipmentDaemon) {
        let daemon = Arc::new(daemon);
        if !self.tracker.register(id, daemon.clone()).await {
            // A sibling failed while this one was starting.
            daemon.shutdown();
        }
    }

    fn volume_callback(
        self: &Arc<Self>,
        ctx: Arc<ShipContext>,
        vlm_nr: u32,
        data_key: Option<String>,
    ) -> impl FnOnce(bool) + Send + 'static {
        let service = Arc::clone(self);
        let runtime = Handle::current();
        move |success| {
            runtime.spawn(async move {
                service.volume_finished(ctx, vlm_nr, data_key, success).await;
            });
        }
    }

    async fn volume_finished(
        &self,
        ctx: Arc<ShipContext>,
        vlm_nr: u32,
        data_key: Option<String>,
        success: bool,
    ) {
        let entry = data_key.map(|name| BackupEntry {
            name,
            finished_timestamp: Utc::now().timestamp_millis(),
        });
        let outcome = self
            .tracker
            .volume_finished(&ctx.id, vlm_nr, entry, success)
            .await;
        self.events.broadcast(ShipEvent::VolumeFinished {
            rsc_name: ctx.rsc_name.clone(),
            snap_name: ctx.snap_name.clone(),
            vlm_nr,
            success,
        });

        if !outcome.to_stop.is_empty() {
            warn!("Volume {} of {} failed, stopping its siblings", vlm_nr, ctx.id);
            for daemon in &outcome.to_stop {
                daemon.shutdown();
            }
        }

        let Some(finished) = outcome.finished else {
            return;
        };
        let mut success = finished.success;
        if success {
            if let Some((store, key, template)) = &ctx.manifest {
                let manifest = BackupManifest {
                    finish_timestamp: Utc::now().timestamp_millis(),
                    backups: finished.entries,
                    ..template.clone()
                };
                if let Err(e) = store.put_manifest(&key.to_string(), &manifest).await {
                    error!("Failed to write manifest {}: {}", key, e);
                    success = false;
                }
            }
        }

        info!(
            "{} of {} finished (success: {})",
            if ctx.manifest.is_some() { "Shipping" } else { "Restore" },
            ctx.id,
            success
        );
        self.events.broadcast(ShipEvent::ShippingFinished {
            rsc_name: ctx.rsc_name.clone(),
            snap_name: ctx.snap_name.clone(),
            remote_name: ctx.remote_name.clone(),
            restoring: ctx.manifest.is_none(),
            success,
        });
    }
}

/// Data key holding one volume of the backup being restored.
pub fn restore_key(source: &ManifestKey, layer_suffix: &str, vlm_nr: u32) -> String {
    source.data_key(layer_suffix, vlm_nr).to_string()
}

/// Parse a restore source for `backend`, for callers validating input early.
pub fn parse_restore_source(backup: &str, backend: Backend) -> Result<ManifestKey> {
    ManifestKey::parse_id(backup, backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, MetaCache};
    use chrono::TimeZone;
    use tokio::sync::broadcast::Receiver;

    fn service() -> Arc<ShippingService> {
        ShippingService::new(
            "node-a",
            "cluster-1",
            PipelineOptions {
                compress_cmd: "cat".to_string(),
                decompress_cmd: "cat".to_string(),
                restore_settle: Duration::from_millis(10),
            },
            Duration::from_secs(5),
        )
    }

    fn backup_store(mem: Arc<MemoryStore>) -> BackupStore {
        BackupStore::new("remote", Backend::S3, mem, Arc::new(MetaCache::new()))
    }

    fn plan(volumes: Vec<(u32, &str)>) -> SnapshotShipment {
        SnapshotShipment {
            rsc_name: "myrsc".to_string(),
            snap_name: "snap1".to_string(),
            remote_name: "remote".to_string(),
            start_time: Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap(),
            backend_suffix: String::new(),
            based_on: None,
            snap_dfn_uuid: "uuid-1".to_string(),
            volumes: volumes
                .into_iter()
                .map(|(vlm_nr, command)| VolumeShipment {
                    vlm_nr,
                    layer_suffix: String::new(),
                    command: command.to_string(),
                    expected_size: 0,
                })
                .collect(),
        }
    }

    async fn wait_finished(rx: &mut Receiver<ShipEvent>) -> (bool, bool) {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("shipment finished in time")
                .unwrap();
            if let ShipEvent::ShippingFinished {
                restoring, success, ..
            } = event
            {
                return (restoring, success);
            }
        }
    }

    #[tokio::test]
    async fn test_ship_writes_manifest_after_all_volumes() {
        let svc = service();
        let mem = Arc::new(MemoryStore::new());
        let mut rx = svc.events().subscribe();

        svc.ship_snapshot(
            backup_store(mem.clone()),
            plan(vec![(0, "printf zero"), (1, "printf one")]),
        )
        .await
        .unwrap();
        assert_eq!(wait_finished(&mut rx).await, (false, true));

        let body = mem.object("myrsc_back_20240115_120000^snap1.meta").await.unwrap();
        let manifest =
            BackupManifest::from_json("k", std::str::from_utf8(&body).unwrap()).unwrap();
        assert_eq!(manifest.node_name, "node-a");
        assert_eq!(manifest.cluster_id, "cluster-1");
        assert_eq!(
            manifest.data_keys().collect::<Vec<_>>(),
            vec![
                (0, "myrsc_00000_back_20240115_120000^snap1"),
                (1, "myrsc_00001_back_20240115_120000^snap1")
            ]
        );
        assert_eq!(
            mem.object("myrsc_00001_back_20240115_120000^snap1").await.unwrap().as_ref(),
            b"one"
        );
    }

    #[tokio::test]
    async fn test_failed_volume_skips_manifest_and_aborts_uploads() {
        let svc = service();
        let mem = Arc::new(MemoryStore::new());
        let mut rx = svc.events().subscribe();

        svc.ship_snapshot(
            backup_store(mem.clone()),
            plan(vec![(0, "exit 1"), (1, "sleep 30")]),
        )
        .await
        .unwrap();
        assert_eq!(wait_finished(&mut rx).await, (false, false));
        assert!(mem.keys().await.is_empty());
        assert_eq!(mem.active_uploads().await, 0);
    }

    #[tokio::test]
    async fn test_second_start_is_rejected_until_acknowledged() {
        let svc = service();
        let mem = Arc::new(MemoryStore::new());
        let mut rx = svc.events().subscribe();

        svc.ship_snapshot(backup_store(mem.clone()), plan(vec![(0, "printf x")]))
            .await
            .unwrap();
        wait_finished(&mut rx).await;

        let again = svc
            .ship_snapshot(backup_store(mem.clone()), plan(vec![(0, "printf x")]))
            .await;
        assert!(matches!(again, Err(ShipError::AlreadyShipping(_))));

        svc.handle_command(ShipCommand::ShippingFinished {
            rsc_name: "myrsc".to_string(),
            snap_name: "snap1".to_string(),
        })
        .await;
        assert!(!svc.tracker().is_started("myrsc/snap1").await);
    }

    #[tokio::test]
    async fn test_abort_stops_running_shipment() {
        let svc = service();
        let mem = Arc::new(MemoryStore::new());
        let mut rx = svc.events().subscribe();

        svc.ship_snapshot(backup_store(mem.clone()), plan(vec![(0, "sleep 30")]))
            .await
            .unwrap();
        assert_eq!(svc.abort("myrsc", "snap1").await, 1);
        assert_eq!(wait_finished(&mut rx).await, (false, false));
        assert_eq!(mem.abort_calls(), 1);
    }

    #[tokio::test]
    async fn test_restore_uses_derived_names() {
        let svc = service();
        let mem = Arc::new(MemoryStore::new());
        mem.insert("myrsc_00000_back_20240115_120000", &b"data"[..]).await;
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("vol0");
        let mut rx = svc.events().subscribe();

        svc.restore_snapshot(
            backup_store(mem),
            SnapshotRestore {
                rsc_name: "newrsc".to_string(),
                snap_name: "restore".to_string(),
                remote_name: "remote".to_string(),
                backup_to_restore: "myrsc_back_20240115_120000".to_string(),
                volumes: vec![VolumeRestore {
                    vlm_nr: 0,
                    layer_suffix: String::new(),
                    command: format!("cat > {}", target.display()),
                }],
            },
        )
        .await
        .unwrap();
        assert_eq!(wait_finished(&mut rx).await, (true, true));
        assert_eq!(std::fs::read(&target).unwrap(), b"data");
    }

    #[test]
    fn test_restore_key_derivation() {
        let source =
            parse_restore_source("db_back_20240115_120000-x^daily", Backend::Obs).unwrap();
        assert_eq!(
            restore_key(&source, ".drbd", 2),
            "db.drbd_00002_back_20240115_120000-x^daily"
        );
    }
}
