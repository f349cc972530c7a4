//! Controller side of snapshot shipping: flag transitions per snapshot
//! definition, aborts across nodes and reactions to satellite reports.

pub mod registry;
pub(crate) mod snapshots;

pub use registry::{AbortInfo, AbortRegistry, AbortUpload, QueuedShipment, ShippingQueue};

use crate::cluster::{ClusterState, LockObj, LockSpec, NodeResponse, Notifier, Transaction};
use crate::error::{CtrlError, Result};
use crate::model::resource::{
    suffix_prop_key, KEY_BACKUP_SRC_REMOTE, KEY_BACKUP_START_TIMESTAMP, KEY_BACKUP_TARGET_REMOTE,
};
use crate::model::{
    name_key, ResourceConnection, ResourceDefinition, SnapDfnKey, Snapshot, SnapshotDefinition,
    SnapshotFlag, ShippingFlag,
};
use crate::remotes::{get_remote, has_shipping_to_remote, RemoteStores};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use shipping_agent::shipping::{ShipCommand, ShipEvent};
use snapshots::{notify_removed, remove_snapshot_dfn};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything needed to start shipping one snapshot to a remote.
#[derive(Debug, Clone)]
pub struct BackupStart {
    pub rsc_name: String,
    pub snap_name: String,
    pub remote_name: String,
    pub source_node: String,
    pub volume_numbers: Vec<u32>,
    pub suffix: String,
    pub start_time: DateTime<Utc>,
}

/// Restoring a backup onto one node.
#[derive(Debug, Clone)]
pub struct RestoreStart {
    pub rsc_name: String,
    pub snap_name: String,
    pub remote_name: String,
    pub target_node: String,
    pub volume_numbers: Vec<u32>,
}

/// Result of an abort request.
#[derive(Debug, Default)]
pub struct AbortOutcome {
    pub aborted: Vec<SnapDfnKey>,
    pub responses: Vec<NodeResponse>,
    pub messages: Vec<String>,
}

fn rsc_dfn_mut<'a>(tx: &'a mut Transaction, rsc_name: &str) -> Result<&'a mut ResourceDefinition> {
    tx.rsc_dfns_mut()?
        .get_mut(&name_key(rsc_name))
        .ok_or_else(|| CtrlError::NotFound(format!("Resource definition '{rsc_name}' not found.")))
}

/// A shipment always gets a fresh snapshot definition; an existing one of the
/// same name, whatever its phase, is never replaced.
fn ensure_snapshot_name_free(rsc: &ResourceDefinition, snap_name: &str) -> Result<()> {
    match rsc.snapshot_dfn(snap_name) {
        Some(existing) => Err(CtrlError::BadRequest(format!(
            "Snapshot {} of resource {} already exists with flags {}.",
            existing.snap_name, rsc.name, existing.flags
        ))),
        None => Ok(()),
    }
}

/// Move a snapshot definition to the aborted phase and clear the
/// shipping-in-progress marker on every connection between its nodes.
fn mark_aborted(rsc: &mut ResourceDefinition, snap_name: &str) -> Result<bool> {
    let Some(snap_dfn) = rsc.snapshot_dfn_mut(snap_name) else {
        return Ok(false);
    };
    snap_dfn.flags.apply(
        &[
            ShippingFlag::Shipping,
            ShippingFlag::ShippingCleanup,
            ShippingFlag::Shipped,
        ],
        &[ShippingFlag::ShippingAbort],
    )?;
    let nodes = snap_dfn.node_names();
    for a in &nodes {
        for b in &nodes {
            if a != b {
                if let Some(conn) = rsc.connection_mut(a, b) {
                    conn.snapshot_shipping_name_in_progress = None;
                }
            }
        }
    }
    Ok(true)
}

#[derive(Clone)]
pub struct ShippingController {
    state: ClusterState,
    stores: RemoteStores,
    notifier: Notifier,
    aborts: Arc<AbortRegistry>,
    queue: Arc<ShippingQueue>,
}

impl ShippingController {
    pub fn new(state: ClusterState, stores: RemoteStores, notifier: Notifier) -> Self {
        Self {
            state,
            stores,
            notifier,
            aborts: Arc::new(AbortRegistry::new()),
            queue: Arc::new(ShippingQueue::new()),
        }
    }

    pub fn aborts(&self) -> &Arc<AbortRegistry> {
        &self.aborts
    }

    pub fn queue(&self) -> &Arc<ShippingQueue> {
        &self.queue
    }

    /// Park a backup until [`Self::start_next_queued`] picks it up.
    pub fn queue_backup(&self, plan: BackupStart) {
        info!(
            "Queued backup of {}/{} to remote {}",
            plan.rsc_name, plan.snap_name, plan.remote_name
        );
        self.queue.push(plan);
    }

    pub async fn start_next_queued(&self) -> Result<Option<SnapDfnKey>> {
        match self.queue.pop_next() {
            Some(queued) => self.start_backup(&queued.plan).await.map(Some),
            None => Ok(None),
        }
    }

    /// Put a snapshot definition into the shipping phase as a backup to a
    /// remote and tell its nodes.
    pub async fn start_backup(&self, plan: &BackupStart) -> Result<SnapDfnKey> {
        let mut tx = self
            .state
            .begin(
                "Start backup shipping",
                LockSpec::create()
                    .read(LockObj::NodesMap)
                    .write(LockObj::RscDfnMap)
                    .read(LockObj::RemoteMap),
            )
            .await;
        let remote = get_remote(tx.remotes()?, &plan.remote_name)?;
        let backend = remote.backend().ok_or_else(|| {
            CtrlError::BadRequest(format!("The remote {} is not an s3 or obs remote.", remote.name))
        })?;
        let remote_name = remote.name.clone();
        if !tx.nodes()?.contains_key(&name_key(&plan.source_node)) {
            return Err(CtrlError::NotFound(format!("Node '{}' not found.", plan.source_node)));
        }

        let rsc = rsc_dfn_mut(&mut tx, &plan.rsc_name)?;
        ensure_snapshot_name_free(rsc, &plan.snap_name)?;

        let mut snap_dfn =
            SnapshotDefinition::new(rsc.name.clone(), plan.snap_name.clone(), plan.volume_numbers.clone())
                .with_flags(&[ShippingFlag::Shipping, ShippingFlag::Backup])?
                .with_prop(
                    KEY_BACKUP_START_TIMESTAMP,
                    plan.start_time.timestamp_millis().to_string(),
                )
                .with_prop(KEY_BACKUP_TARGET_REMOTE, remote_name.clone());
        if !plan.suffix.is_empty() {
            snap_dfn = snap_dfn.with_prop(&suffix_prop_key(backend), plan.suffix.clone());
        }
        snap_dfn.add_snapshot(
            Snapshot::new(plan.source_node.clone())
                .with_flag(SnapshotFlag::BackupSource)
                .with_prop(KEY_BACKUP_TARGET_REMOTE, remote_name.clone()),
        );
        let key = snap_dfn.key();
        rsc.insert_snapshot_dfn(snap_dfn.clone());
        tx.commit();

        info!("Backup shipping of {} to remote {} started", key, remote_name);
        self.notifier.update_snapshot(&snap_dfn).await;
        Ok(key)
    }

    /// Ship a snapshot from one node to another. The connection between the
    /// two remembers the snapshot while it is in flight.
    pub async fn start_snapshot_shipping(
        &self,
        rsc_name: &str,
        snap_name: &str,
        source_node: &str,
        target_node: &str,
        volume_numbers: Vec<u32>,
    ) -> Result<SnapDfnKey> {
        let mut tx = self
            .state
            .begin(
                "Start snapshot shipping",
                LockSpec::create()
                    .read(LockObj::NodesMap)
                    .write(LockObj::RscDfnMap),
            )
            .await;
        for node in [source_node, target_node] {
            if !tx.nodes()?.contains_key(&name_key(node)) {
                return Err(CtrlError::NotFound(format!("Node '{node}' not found.")));
            }
        }
        let rsc = rsc_dfn_mut(&mut tx, rsc_name)?;
        ensure_snapshot_name_free(rsc, snap_name)?;
        let snap_dfn = SnapshotDefinition::new(rsc.name.clone(), snap_name, volume_numbers)
            .with_flags(&[ShippingFlag::Shipping])?
            .with_snapshot(Snapshot::new(source_node))
            .with_snapshot(Snapshot::new(target_node));
        let key = snap_dfn.key();
        match rsc.connection_mut(source_node, target_node) {
            Some(conn) => conn.snapshot_shipping_name_in_progress = Some(snap_name.to_string()),
            None => {
                let mut conn = ResourceConnection::new(source_node, target_node);
                conn.snapshot_shipping_name_in_progress = Some(snap_name.to_string());
                rsc.connections.push(conn);
            }
        }
        rsc.insert_snapshot_dfn(snap_dfn.clone());
        tx.commit();

        self.aborts.add_peer_shipment(source_node, key.clone());
        info!("Snapshot shipping {} from {} to {} started", key, source_node, target_node);
        self.notifier.update_snapshot(&snap_dfn).await;
        Ok(key)
    }

    /// Start restoring from a remote onto `target_node`.
    pub async fn start_restore(&self, plan: &RestoreStart) -> Result<SnapDfnKey> {
        let mut tx = self
            .state
            .begin(
                "Start backup restore",
                LockSpec::create()
                    .read(LockObj::NodesMap)
                    .write(LockObj::RscDfnMap)
                    .read(LockObj::RemoteMap),
            )
            .await;
        let remote_name = get_remote(tx.remotes()?, &plan.remote_name)?.name.clone();
        if !tx.nodes()?.contains_key(&name_key(&plan.target_node)) {
            return Err(CtrlError::NotFound(format!("Node '{}' not found.", plan.target_node)));
        }
        let rsc = rsc_dfn_mut(&mut tx, &plan.rsc_name)?;
        ensure_snapshot_name_free(rsc, &plan.snap_name)?;
        let snap_dfn = SnapshotDefinition::new(rsc.name.clone(), plan.snap_name.clone(), plan.volume_numbers.clone())
            .with_flags(&[ShippingFlag::Shipping, ShippingFlag::Backup])?
            .with_prop(KEY_BACKUP_START_TIMESTAMP, Utc::now().timestamp_millis().to_string())
            .with_snapshot(
                Snapshot::new(plan.target_node.clone())
                    .with_flag(SnapshotFlag::BackupTarget)
                    .with_prop(KEY_BACKUP_SRC_REMOTE, remote_name.clone()),
            );
        let key = snap_dfn.key();
        rsc.insert_snapshot_dfn(snap_dfn.clone());
        tx.commit();

        info!("Restore of {} from remote {} started", key, remote_name);
        self.notifier.update_snapshot(&snap_dfn).await;
        Ok(key)
    }

    /// A satellite finished shipping or restoring a snapshot.
    pub async fn shipping_finished(
        &self,
        rsc_name: &str,
        snap_name: &str,
        success: bool,
    ) -> Result<Vec<NodeResponse>> {
        let mut tx = self
            .state
            .begin(
                "Finish snapshot shipping",
                LockSpec::create()
                    .read(LockObj::NodesMap)
                    .write(LockObj::RscDfnMap),
            )
            .await;
        let rsc = rsc_dfn_mut(&mut tx, rsc_name)?;
        let Some(snap_dfn) = rsc.snapshot_dfn_mut(snap_name) else {
            warn!("Shipping of {}/{} finished, but the snapshot is gone", rsc_name, snap_name);
            return Ok(Vec::new());
        };
        if success {
            snap_dfn
                .flags
                .apply(&[ShippingFlag::Shipping], &[ShippingFlag::Shipped])?;
            let nodes = snap_dfn.node_names();
            for a in &nodes {
                for b in &nodes {
                    if a != b {
                        if let Some(conn) = rsc.connection_mut(a, b) {
                            conn.snapshot_shipping_name_in_progress = None;
                        }
                    }
                }
            }
        } else {
            mark_aborted(rsc, snap_name)?;
        }
        let Some(snap_dfn) = rsc.snapshot_dfn(snap_name).cloned() else {
            return Ok(Vec::new());
        };
        tx.commit();

        let key = snap_dfn.key();
        let nodes = snap_dfn.node_names();
        for node in &nodes {
            self.aborts.remove(node, &key);
        }
        info!(
            "Shipping of {} {}, flags now {}",
            key,
            if success { "succeeded" } else { "failed" },
            snap_dfn.flags
        );

        let mut responses = self
            .notifier
            .send_command(
                &nodes,
                &ShipCommand::ShippingFinished {
                    rsc_name: snap_dfn.rsc_name.clone(),
                    snap_name: snap_dfn.snap_name.clone(),
                },
            )
            .await;
        responses.extend(self.notifier.update_snapshot(&snap_dfn).await);
        Ok(responses)
    }

    /// Abort one shipment. Satellites are told while SHIPPING_CLEANUP is set;
    /// the flag is cleared again once they all answered.
    pub async fn abort_shipping(&self, rsc_name: &str, snap_name: &str) -> Result<AbortOutcome> {
        let spec = LockSpec::create()
            .read(LockObj::NodesMap)
            .write(LockObj::RscDfnMap);
        let mut tx = self.state.begin("Abort snapshot shipping", spec).await;
        let rsc = rsc_dfn_mut(&mut tx, rsc_name)?;
        if !mark_aborted(rsc, snap_name)? {
            return Err(CtrlError::NotFound(format!(
                "Snapshot '{snap_name}' of resource '{rsc_name}' not found."
            )));
        }
        let Some(snap_dfn) = rsc.snapshot_dfn_mut(snap_name) else {
            return Ok(AbortOutcome::default());
        };
        snap_dfn.flags.enable(&[ShippingFlag::ShippingCleanup])?;
        let key = snap_dfn.key();
        let nodes = snap_dfn.node_names();
        tx.commit();

        let responses = self
            .notifier
            .send_command(
                &nodes,
                &ShipCommand::Abort {
                    rsc_name: key.rsc_name.clone(),
                    snap_name: key.snap_name.clone(),
                },
            )
            .await;

        let mut tx = self.state.begin("Finish shipping cleanup", spec).await;
        let updated = match tx.snapshot_dfn_mut(rsc_name, snap_name)? {
            Some(snap_dfn) => {
                snap_dfn.flags.disable(&[ShippingFlag::ShippingCleanup])?;
                Some(snap_dfn.clone())
            }
            None => None,
        };
        tx.commit();

        let mut outcome = AbortOutcome {
            aborted: vec![key],
            responses,
            messages: Vec::new(),
        };
        if let Some(snap_dfn) = updated {
            outcome
                .responses
                .extend(self.notifier.update_snapshot(&snap_dfn).await);
        }
        Ok(outcome)
    }

    /// Abort every node-to-node shipment leaving `node_name`, typically
    /// because the node went away.
    pub async fn abort_all_shipping(&self, node_name: &str, abort_multipart: bool) -> Result<AbortOutcome> {
        let mut tx = self
            .state
            .begin(
                "Abort all snapshot shipments to node",
                LockSpec::create()
                    .read(LockObj::NodesMap)
                    .write(LockObj::RscDfnMap)
                    .read(LockObj::RemoteMap),
            )
            .await;
        let node_key = name_key(node_name);
        let candidates: Vec<SnapDfnKey> = tx
            .rsc_dfns()?
            .values()
            .flat_map(|rsc| rsc.snapshot_dfns.values())
            .filter(|snap_dfn| {
                snap_dfn.flags.is_set(ShippingFlag::Shipping)
                    && snap_dfn.flags.is_unset(ShippingFlag::Backup)
                    && snap_dfn
                        .snapshots
                        .get(&node_key)
                        .is_some_and(|snap| !snap.has(SnapshotFlag::BackupTarget))
            })
            .map(SnapshotDefinition::key)
            .collect();

        let mut removed = Vec::new();
        for key in &candidates {
            if let Some(snap_dfn) = self.abort_backup_shippings(&mut tx, key, abort_multipart).await? {
                removed.push(snap_dfn);
            }
        }
        tx.commit();
        self.finish_removal(removed).await
    }

    /// Abort a backup in flight from this cluster.
    pub async fn abort_backup_shipping(
        &self,
        rsc_name: &str,
        snap_name: &str,
        abort_multipart: bool,
    ) -> Result<AbortOutcome> {
        let mut tx = self
            .state
            .begin(
                "Abort backup shipments of rscDfn",
                LockSpec::create()
                    .read(LockObj::NodesMap)
                    .write(LockObj::RscDfnMap)
                    .read(LockObj::RemoteMap),
            )
            .await;
        let Some(snap_dfn) = tx.snapshot_dfn(rsc_name, snap_name)? else {
            return Err(CtrlError::NotFound(format!(
                "Snapshot '{snap_name}' of resource '{rsc_name}' not found."
            )));
        };
        let eligible = snap_dfn.is_in_progress_backup()
            && snap_dfn
                .snapshots
                .values()
                .any(|snap| !snap.has(SnapshotFlag::BackupTarget));
        let key = snap_dfn.key();

        let mut removed = Vec::new();
        if eligible {
            if let Some(snap_dfn) = self.abort_backup_shippings(&mut tx, &key, abort_multipart).await? {
                removed.push(snap_dfn);
            }
        }
        tx.commit();
        self.finish_removal(removed).await
    }

    /// Remove every node-to-node shipment of a resource.
    pub async fn abort_rsc_snapshot_shipping(&self, rsc_name: &str) -> Result<AbortOutcome> {
        let mut tx = self
            .state
            .begin(
                "Abort snapshot shipments of rscDfn",
                LockSpec::create()
                    .read(LockObj::NodesMap)
                    .write(LockObj::RscDfnMap),
            )
            .await;
        let keys: Vec<SnapDfnKey> = rsc_dfn_mut(&mut tx, rsc_name)?
            .snapshot_dfns
            .values()
            .filter(|s| s.flags.is_set(ShippingFlag::Shipping) && s.flags.is_unset(ShippingFlag::Backup))
            .map(SnapshotDefinition::key)
            .collect();
        let mut removed = Vec::new();
        for key in &keys {
            if let Some(snap_dfn) = remove_snapshot_dfn(&mut tx, key)? {
                removed.push(snap_dfn);
            }
        }
        tx.commit();
        self.finish_removal(removed).await
    }

    async fn finish_removal(&self, removed: Vec<SnapshotDefinition>) -> Result<AbortOutcome> {
        let responses = notify_removed(&self.notifier, &removed).await;
        Ok(AbortOutcome {
            aborted: removed.iter().map(SnapshotDefinition::key).collect(),
            responses,
            messages: Vec::new(),
        })
    }

    /// Undo what the abort registry recorded for a snapshot on each of its
    /// nodes, then drop the snapshot definition. Nothing happens when no
    /// node has anything recorded.
    async fn abort_backup_shippings(
        &self,
        tx: &mut Transaction,
        key: &SnapDfnKey,
        abort_multipart: bool,
    ) -> Result<Option<SnapshotDefinition>> {
        let Some(snap_dfn) = tx.snapshot_dfn(&key.rsc_name, &key.snap_name)? else {
            return Ok(None);
        };
        let nodes = snap_dfn.node_names();

        let mut should_abort = false;
        for node in &nodes {
            let Some(info) = self.aborts.get(node, key).filter(|info| !info.is_empty()) else {
                continue;
            };
            should_abort = true;
            if abort_multipart {
                for upload in &info.uploads {
                    let Some(remote) = tx.remote(&upload.remote_name)? else {
                        warn!(
                            "Remote {} of upload {} is gone, not aborting it",
                            upload.remote_name, upload.key
                        );
                        continue;
                    };
                    let store = self.stores.backup_store(remote)?;
                    if let Err(e) = store.abort_multipart(&upload.key, &upload.upload_id).await {
                        warn!("Failed to abort upload {} of {}: {}", upload.upload_id, upload.key, e);
                    }
                }
            }
            self.aborts.remove(node, key);
        }

        if !should_abort {
            return Ok(None);
        }
        if let Some(snap_dfn) = tx.snapshot_dfn_mut(&key.rsc_name, &key.snap_name)? {
            snap_dfn
                .flags
                .apply(&[ShippingFlag::Shipping], &[ShippingFlag::ShippingAbort])?;
        }
        remove_snapshot_dfn(tx, key)
    }

    /// Abort in-flight backups and restores of a resource. Without either
    /// direction given both are aborted.
    pub async fn backup_abort(
        &self,
        rsc_name: &str,
        restore: bool,
        create: bool,
        remote_name: Option<&str>,
    ) -> Result<AbortOutcome> {
        let mut tx = self
            .state
            .begin(
                "Abort backup",
                LockSpec::create()
                    .read(LockObj::NodesMap)
                    .write(LockObj::RscDfnMap)
                    .read(LockObj::RemoteMap),
            )
            .await;
        let remote_name = remote_name.filter(|r| !r.is_empty());
        let (restore, create) = if !restore && !create {
            (true, true)
        } else {
            (restore, create)
        };

        let remotes = tx.remotes()?.clone();
        if create {
            let removed_from_queue = self.queue.remove_where(|plan| {
                plan.rsc_name.eq_ignore_ascii_case(rsc_name)
                    && remote_name.map_or(true, |expected| {
                        has_shipping_to_remote(&remotes, &plan.remote_name, expected)
                    })
            });
            if removed_from_queue > 0 {
                debug!("Removed {} queued backup(s) of {}", removed_from_queue, rsc_name);
            }
        }
        let rsc = rsc_dfn_mut(&mut tx, rsc_name)?;
        let in_progress: Vec<String> = rsc
            .snapshot_dfns
            .values()
            .filter(|s| s.is_in_progress_backup())
            .map(|s| s.snap_name.clone())
            .collect();
        if in_progress.is_empty() {
            return Ok(AbortOutcome::default());
        }

        let mut updated = Vec::new();
        for snap_name in &in_progress {
            let Some(snap_dfn) = rsc.snapshot_dfn_mut(snap_name) else {
                continue;
            };
            let abort = snap_dfn.snapshots.values().any(|snap| {
                let crt = create
                    && snap.has(SnapshotFlag::BackupSource)
                    && remote_name.map_or(true, |expected| {
                        has_shipping_to_remote(
                            &remotes,
                            snap.prop(KEY_BACKUP_TARGET_REMOTE).unwrap_or_default(),
                            expected,
                        )
                    });
                let rst = restore
                    && snap.has(SnapshotFlag::BackupTarget)
                    && remote_name.map_or(true, |expected| {
                        has_shipping_to_remote(
                            &remotes,
                            snap.prop(KEY_BACKUP_SRC_REMOTE).unwrap_or_default(),
                            expected,
                        )
                    });
                crt || rst
            });
            if abort {
                snap_dfn
                    .flags
                    .apply(&[ShippingFlag::Shipping], &[ShippingFlag::ShippingAbort])?;
                updated.push(snap_dfn.clone());
            }
        }
        tx.commit();

        let mut outcome = AbortOutcome::default();
        for snap_dfn in &updated {
            outcome
                .responses
                .extend(self.notifier.update_snapshot(snap_dfn).await);
            outcome.aborted.push(snap_dfn.key());
        }
        let what = match (create, restore) {
            (true, true) => "in-progress backup-shipments and restores",
            (true, false) => "in-progress backup-shipments",
            _ => "in-progress backup-restores",
        };
        outcome
            .messages
            .push(format!("Successfully aborted all {what} of resource {rsc_name}"));
        Ok(outcome)
    }

    /// Delete a satellite remote: mark it deleting, let every connected
    /// satellite know, then remove it.
    pub async fn cleanup_satellite_remote(&self, remote_name: &str) -> Result<Vec<NodeResponse>> {
        let spec = LockSpec::create().write(LockObj::RemoteMap);
        let mut tx = self.state.begin("Cleanup satellite remote", spec).await;
        let remote = tx
            .remotes_mut()?
            .get_mut(&name_key(remote_name))
            .ok_or_else(|| CtrlError::RemoteNotFound(remote_name.to_string()))?;
        if !remote.is_satellite() {
            return Err(CtrlError::BadRequest(format!(
                "The remote {} is not a satellite remote.",
                remote.name
            )));
        }
        remote.deleting = true;
        let remote = remote.clone();
        tx.commit();

        let nodes: Vec<String> = self
            .notifier
            .peers()
            .connected_peers()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        let responses = self.notifier.update_remote(&nodes, &remote).await;

        let mut tx = self.state.begin("Delete satellite remote", spec).await;
        tx.remotes_mut()?.remove(&name_key(remote_name));
        tx.commit();
        info!("Satellite remote {} removed", remote.name);
        Ok(responses)
    }

    /// Delete one snapshot definition and tell its nodes.
    pub async fn delete_snapshot(&self, rsc_name: &str, snap_name: &str) -> Result<Vec<NodeResponse>> {
        let mut tx = self
            .state
            .begin(
                "Delete snapshot",
                LockSpec::create()
                    .read(LockObj::NodesMap)
                    .write(LockObj::RscDfnMap),
            )
            .await;
        let key = SnapDfnKey {
            rsc_name: rsc_name.to_string(),
            snap_name: snap_name.to_string(),
        };
        let Some(removed) = remove_snapshot_dfn(&mut tx, &key)? else {
            return Err(CtrlError::NotFound(format!(
                "Snapshot '{snap_name}' of resource '{rsc_name}' not found."
            )));
        };
        tx.commit();
        Ok(notify_removed(&self.notifier, &[removed]).await)
    }

    /// React to an event reported by a satellite.
    pub async fn handle_satellite_event(&self, node_name: &str, event: ShipEvent) -> Result<()> {
        match event {
            ShipEvent::UploadStarted {
                rsc_name,
                snap_name,
                remote_name,
                key,
                upload_id,
            } => {
                debug!("{} started upload {} of {}", node_name, upload_id, key);
                self.aborts.add_upload(
                    node_name,
                    SnapDfnKey { rsc_name, snap_name },
                    AbortUpload {
                        remote_name,
                        key,
                        upload_id,
                    },
                );
            }
            ShipEvent::VolumeFinished {
                rsc_name,
                snap_name,
                vlm_nr,
                success,
            } => {
                if success {
                    debug!("{}: volume {} of {}/{} done", node_name, vlm_nr, rsc_name, snap_name);
                } else {
                    warn!("{}: volume {} of {}/{} failed", node_name, vlm_nr, rsc_name, snap_name);
                }
            }
            ShipEvent::ShippingFinished {
                rsc_name,
                snap_name,
                remote_name,
                restoring,
                success,
            } => {
                info!(
                    "{} finished {} {}/{} ({}): success={}",
                    node_name,
                    if restoring { "restoring" } else { "shipping" },
                    rsc_name,
                    snap_name,
                    remote_name,
                    success
                );
                self.shipping_finished(&rsc_name, &snap_name, success).await?;
            }
        }
        Ok(())
    }

    /// Raw text from a satellite connection. Responses to pending requests
    /// are resolved by the peer registry; shipping events are handled here.
    pub async fn handle_peer_message(&self, node_name: &str, text: &str) -> Result<()> {
        let Some((msg_type, payload)) = self.notifier.peers().handle_message(text) else {
            return Ok(());
        };
        let framed: Value = json!({"type": msg_type, "payload": payload});
        match serde_json::from_value::<ShipEvent>(framed) {
            Ok(event) => self.handle_satellite_event(node_name, event).await,
            Err(_) => {
                debug!("Ignoring message {} from {}", msg_type, node_name);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::test_support::{notifier, stores};
    use crate::cluster::notify::test_support::{connect_satellite, types};
    use crate::cluster::PeerRegistry;
    use crate::model::{Node, Remote, RemoteKind};
    use shipping_agent::store::MemoryStore;
    use std::time::Duration;

    async fn seeded_state() -> ClusterState {
        let state = ClusterState::new("c1");
        let mut tx = state
            .begin(
                "seed",
                LockSpec::create()
                    .write(LockObj::NodesMap)
                    .write(LockObj::RscDfnMap)
                    .write(LockObj::RemoteMap),
            )
            .await;
        for node in ["n1", "n2"] {
            tx.nodes_mut().unwrap().insert(node.into(), Node::new(node));
        }
        tx.rsc_dfns_mut()
            .unwrap()
            .insert("rsc".into(), ResourceDefinition::new("rsc"));
        tx.remotes_mut()
            .unwrap()
            .insert("s3".into(), Remote::new("s3", RemoteKind::S3));
        tx.remotes_mut().unwrap().insert(
            "stlt".into(),
            Remote::new(
                "stlt",
                RemoteKind::Satellite {
                    linked_remote: "s3".into(),
                },
            ),
        );
        tx.commit();
        state
    }

    fn plan(snap: &str) -> BackupStart {
        BackupStart {
            rsc_name: "rsc".into(),
            snap_name: snap.into(),
            remote_name: "s3".into(),
            source_node: "n1".into(),
            volume_numbers: vec![0],
            suffix: "-x".into(),
            start_time: Utc::now(),
        }
    }

    async fn controller() -> (ShippingController, Arc<MemoryStore>) {
        let mem = Arc::new(MemoryStore::new());
        let ctrl = ShippingController::new(seeded_state().await, stores(mem.clone(), true), notifier());
        (ctrl, mem)
    }

    async fn snap_dfn(ctrl: &ShippingController, snap: &str) -> Option<SnapshotDefinition> {
        let tx = ctrl
            .state
            .begin("read", LockSpec::create().read(LockObj::RscDfnMap))
            .await;
        tx.snapshot_dfn("rsc", snap).unwrap().cloned()
    }

    #[tokio::test]
    async fn test_start_backup_sets_flags_and_props() {
        let (ctrl, _) = controller().await;
        ctrl.start_backup(&plan("snap1")).await.unwrap();
        let snap_dfn = snap_dfn(&ctrl, "snap1").await.unwrap();
        assert!(snap_dfn.is_in_progress_backup());
        assert_eq!(snap_dfn.target_remote(), Some("s3"));
        assert_eq!(snap_dfn.backend_suffix(shipping_agent::naming::Backend::S3), "-x");
        assert!(snap_dfn.backup_start().is_some());
        assert_eq!(snap_dfn.backup_source().unwrap().node_name, "n1");

        assert!(matches!(
            ctrl.start_backup(&plan("snap1")).await,
            Err(CtrlError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_restore_onto_inflight_backup_is_rejected() {
        let (ctrl, _) = controller().await;
        ctrl.start_backup(&plan("snap1")).await.unwrap();
        let before = snap_dfn(&ctrl, "snap1").await.unwrap();

        let result = ctrl
            .start_restore(&RestoreStart {
                rsc_name: "rsc".into(),
                snap_name: "SNAP1".into(),
                remote_name: "s3".into(),
                target_node: "n2".into(),
                volume_numbers: vec![0],
            })
            .await;
        assert!(matches!(result, Err(CtrlError::BadRequest(_))));

        let after = snap_dfn(&ctrl, "snap1").await.unwrap();
        assert_eq!(after.uuid, before.uuid);
        assert_eq!(after.backup_source().unwrap().node_name, "n1");
    }

    #[tokio::test]
    async fn test_start_reuses_no_existing_snapshot_name() {
        let (ctrl, _) = controller().await;
        ctrl.start_backup(&plan("snap1")).await.unwrap();
        ctrl.shipping_finished("rsc", "snap1", true).await.unwrap();
        let shipped = snap_dfn(&ctrl, "snap1").await.unwrap();

        assert!(matches!(
            ctrl.start_backup(&plan("snap1")).await,
            Err(CtrlError::BadRequest(_))
        ));
        assert!(matches!(
            ctrl.start_snapshot_shipping("rsc", "snap1", "n1", "n2", vec![0]).await,
            Err(CtrlError::BadRequest(_))
        ));
        assert_eq!(snap_dfn(&ctrl, "snap1").await.unwrap(), shipped);
    }

    #[tokio::test]
    async fn test_shipping_finished_marks_shipped_and_notifies() {
        let peers = Arc::new(PeerRegistry::new());
        let seen = connect_satellite(&peers, "n1", true);
        let mem = Arc::new(MemoryStore::new());
        let ctrl = ShippingController::new(
            seeded_state().await,
            stores(mem, true),
            Notifier::new(peers, Duration::from_secs(2)),
        );
        ctrl.start_backup(&plan("snap1")).await.unwrap();
        ctrl.handle_satellite_event(
            "n1",
            ShipEvent::UploadStarted {
                rsc_name: "rsc".into(),
                snap_name: "snap1".into(),
                remote_name: "s3".into(),
                key: "rsc_00000_back_20240115_120000-x^snap1".into(),
                upload_id: "u1".into(),
            },
        )
        .await
        .unwrap();

        ctrl.handle_satellite_event(
            "n1",
            ShipEvent::ShippingFinished {
                rsc_name: "rsc".into(),
                snap_name: "snap1".into(),
                remote_name: "s3".into(),
                restoring: false,
                success: true,
            },
        )
        .await
        .unwrap();

        let snap_dfn = snap_dfn(&ctrl, "snap1").await.unwrap();
        assert!(snap_dfn.flags.is_set(ShippingFlag::Shipped));
        assert!(snap_dfn.flags.is_unset(ShippingFlag::Shipping));
        assert!(snap_dfn.flags.is_set(ShippingFlag::Backup));
        assert!(ctrl.aborts().entries("n1").is_empty());
        let seen_types = types(&seen);
        assert!(seen_types.contains(&"backup:shipping-finished".to_string()));
    }

    #[tokio::test]
    async fn test_failed_shipping_is_aborted() {
        let (ctrl, _) = controller().await;
        ctrl.start_backup(&plan("snap1")).await.unwrap();
        ctrl.shipping_finished("rsc", "snap1", false).await.unwrap();
        let snap_dfn = snap_dfn(&ctrl, "snap1").await.unwrap();
        assert!(snap_dfn.flags.is_set(ShippingFlag::ShippingAbort));
        assert!(snap_dfn.flags.is_unset(ShippingFlag::Shipping));
    }

    #[tokio::test]
    async fn test_abort_shipping_clears_markers_and_cleanup() {
        let peers = Arc::new(PeerRegistry::new());
        let seen = connect_satellite(&peers, "n1", true);
        connect_satellite(&peers, "n2", true);
        let ctrl = ShippingController::new(
            seeded_state().await,
            stores(Arc::new(MemoryStore::new()), true),
            Notifier::new(peers, Duration::from_secs(2)),
        );
        ctrl.start_snapshot_shipping("rsc", "snap1", "n1", "n2", vec![0])
            .await
            .unwrap();

        let outcome = ctrl.abort_shipping("rsc", "snap1").await.unwrap();
        assert_eq!(outcome.aborted.len(), 1);
        assert!(outcome.responses.iter().all(|r| r.success));

        let snap_dfn = snap_dfn(&ctrl, "snap1").await.unwrap();
        assert!(snap_dfn.flags.is_set(ShippingFlag::ShippingAbort));
        assert!(snap_dfn.flags.is_unset(ShippingFlag::ShippingCleanup));
        assert!(snap_dfn.flags.is_unset(ShippingFlag::Shipping));

        let tx = ctrl
            .state
            .begin("read", LockSpec::create().read(LockObj::RscDfnMap))
            .await;
        let rsc = &tx.rsc_dfns().unwrap()["rsc"];
        assert!(rsc.connections[0].snapshot_shipping_name_in_progress.is_none());
        assert!(types(&seen).contains(&"backup:abort".to_string()));
    }

    #[tokio::test]
    async fn test_abort_all_shipping_of_node() {
        let (ctrl, _) = controller().await;
        ctrl.start_snapshot_shipping("rsc", "snap1", "n1", "n2", vec![0])
            .await
            .unwrap();
        ctrl.start_backup(&plan("backup1")).await.unwrap();

        let outcome = ctrl.abort_all_shipping("n1", true).await.unwrap();
        assert_eq!(outcome.aborted.len(), 1);
        assert_eq!(outcome.aborted[0].snap_name, "snap1");
        assert!(snap_dfn(&ctrl, "snap1").await.is_none());
        // Backups are left alone.
        assert!(snap_dfn(&ctrl, "backup1").await.is_some());
    }

    #[tokio::test]
    async fn test_abort_backup_shipping_aborts_uploads() {
        let (ctrl, mem) = controller().await;
        ctrl.start_backup(&plan("snap1")).await.unwrap();
        ctrl.aborts().add_upload(
            "n1",
            SnapDfnKey {
                rsc_name: "rsc".into(),
                snap_name: "snap1".into(),
            },
            AbortUpload {
                remote_name: "s3".into(),
                key: "k".into(),
                upload_id: "does-not-exist".into(),
            },
        );
        let outcome = ctrl.abort_backup_shipping("rsc", "snap1", true).await.unwrap();
        assert_eq!(outcome.aborted.len(), 1);
        assert_eq!(mem.abort_calls(), 1);
        assert!(snap_dfn(&ctrl, "snap1").await.is_none());
    }

    #[tokio::test]
    async fn test_abort_requires_master_key_for_uploads() {
        let ctrl = ShippingController::new(
            seeded_state().await,
            stores(Arc::new(MemoryStore::new()), false),
            notifier(),
        );
        ctrl.start_backup(&plan("snap1")).await.unwrap();
        ctrl.aborts().add_upload(
            "n1",
            SnapDfnKey {
                rsc_name: "rsc".into(),
                snap_name: "snap1".into(),
            },
            AbortUpload {
                remote_name: "s3".into(),
                key: "k".into(),
                upload_id: "u".into(),
            },
        );
        assert!(matches!(
            ctrl.abort_backup_shipping("rsc", "snap1", true).await,
            Err(CtrlError::CryptoKeyUnavailable)
        ));
        // Nothing was committed.
        assert!(snap_dfn(&ctrl, "snap1").await.unwrap().is_in_progress_backup());
    }

    #[tokio::test]
    async fn test_backup_abort_by_direction_and_remote() {
        let (ctrl, _) = controller().await;
        ctrl.start_backup(&plan("create1")).await.unwrap();
        ctrl.start_restore(&RestoreStart {
            rsc_name: "rsc".into(),
            snap_name: "restore1".into(),
            remote_name: "s3".into(),
            target_node: "n2".into(),
            volume_numbers: vec![0],
        })
        .await
        .unwrap();
        ctrl.queue_backup(plan("queued"));

        let outcome = ctrl.backup_abort("rsc", true, false, Some("S3")).await.unwrap();
        assert_eq!(outcome.aborted.len(), 1);
        assert_eq!(outcome.aborted[0].snap_name, "restore1");
        assert_eq!(
            outcome.messages,
            vec!["Successfully aborted all in-progress backup-restores of resource rsc"]
        );
        // Only restores were aborted.
        assert_eq!(ctrl.queue().len(), 1);

        let restore = snap_dfn(&ctrl, "restore1").await.unwrap();
        assert!(restore.flags.is_set(ShippingFlag::ShippingAbort));
        assert!(snap_dfn(&ctrl, "create1").await.unwrap().is_in_progress_backup());

        let outcome = ctrl.backup_abort("rsc", false, false, None).await.unwrap();
        assert_eq!(outcome.aborted.len(), 1);
        assert_eq!(
            outcome.messages,
            vec!["Successfully aborted all in-progress backup-shipments and restores of resource rsc"]
        );
        assert!(ctrl.queue().is_empty());
    }

    #[tokio::test]
    async fn test_abort_rsc_snapshot_shipping() {
        let (ctrl, _) = controller().await;
        ctrl.start_snapshot_shipping("rsc", "snap1", "n1", "n2", vec![0])
            .await
            .unwrap();
        ctrl.start_backup(&plan("backup1")).await.unwrap();
        let outcome = ctrl.abort_rsc_snapshot_shipping("rsc").await.unwrap();
        assert_eq!(outcome.aborted.len(), 1);
        assert!(snap_dfn(&ctrl, "snap1").await.is_none());
        assert!(snap_dfn(&ctrl, "backup1").await.is_some());
    }

    #[tokio::test]
    async fn test_cleanup_satellite_remote() {
        let peers = Arc::new(PeerRegistry::new());
        let seen = connect_satellite(&peers, "n1", true);
        let ctrl = ShippingController::new(
            seeded_state().await,
            stores(Arc::new(MemoryStore::new()), true),
            Notifier::new(peers, Duration::from_secs(2)),
        );
        assert!(matches!(
            ctrl.cleanup_satellite_remote("s3").await,
            Err(CtrlError::BadRequest(_))
        ));
        let responses = ctrl.cleanup_satellite_remote("STLT").await.unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(types(&seen), vec!["remote:update"]);
        let deleting = seen.lock().unwrap()[0]["payload"]["deleting"].as_bool();
        assert_eq!(deleting, Some(true));

        let tx = ctrl
            .state
            .begin("read", LockSpec::create().read(LockObj::RemoteMap))
            .await;
        assert!(tx.remote("stlt").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_peer_message_routes_events() {
        let (ctrl, _) = controller().await;
        let text = json!({
            "type": "backup:upload-started",
            "payload": {
                "rsc_name": "rsc",
                "snap_name": "s",
                "remote_name": "s3",
                "key": "k",
                "upload_id": "u"
            }
        })
        .to_string();
        ctrl.handle_peer_message("n1", &text).await.unwrap();
        assert_eq!(ctrl.aborts().entries("n1").len(), 1);
        ctrl.handle_peer_message("n1", r#"{"type":"heartbeat","payload":{}}"#)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_queued_backup_starts_later() {
        let (ctrl, _) = controller().await;
        ctrl.queue_backup(plan("snap1"));
        assert!(snap_dfn(&ctrl, "snap1").await.is_none());
        let started = ctrl.start_next_queued().await.unwrap().unwrap();
        assert_eq!(started.snap_name, "snap1");
        assert!(ctrl.start_next_queued().await.unwrap().is_none());
    }
}
