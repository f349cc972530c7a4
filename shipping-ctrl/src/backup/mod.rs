//! Backup queries and deletion against one remote.

pub mod delete;
pub mod graph;
pub mod list;

pub use delete::{compute_delete_set, DeleteSelection, DeleteSet, SelectionArgs};
pub use graph::{ObjectGraph, ObjectNode};
pub use list::{
    backup_info, get_latest_backup, list_backups, resolve_chain, BackupInfo, BackupList,
    BackupSummary, BackupVolume, ChainLink, ListFilter,
};

use crate::cluster::{ClusterState, LockObj, LockSpec, Notifier};
use crate::error::{CtrlError, Result};
use crate::remotes::{get_remote, RemoteStores};
use crate::shipping::snapshots::{notify_removed, remove_snapshot_dfn};
use serde::Serialize;
use shipping_agent::naming::ManifestKey;
use std::collections::BTreeSet;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct DeleteRequest {
    pub remote_name: String,
    pub selection: DeleteSelection,
    pub cascading: bool,
    /// Only report what would be deleted.
    pub dry_run: bool,
    /// Delete objects but keep the local snapshot definitions.
    pub keep_snaps: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeleteResult {
    pub dry_run: bool,
    pub deleted: Vec<String>,
    pub failed: Vec<String>,
    pub keys_not_found: BTreeSet<String>,
    pub snapshots_deleted: Vec<String>,
    pub messages: Vec<String>,
}

/// Which backup [`BackupService::backup_info`] describes. Without an id the
/// latest backup of the resource is used.
#[derive(Debug, Clone, Default)]
pub struct InfoRequest {
    pub remote_name: String,
    pub rsc_name: Option<String>,
    pub snap_name: Option<String>,
    pub backup_id: Option<String>,
}

fn block(title: &str, lines: impl IntoIterator<Item = String>) -> String {
    let mut out = format!("{title}\n");
    for line in lines {
        out.push_str("  ");
        out.push_str(&line);
        out.push('\n');
    }
    out
}

#[derive(Clone)]
pub struct BackupService {
    state: ClusterState,
    stores: RemoteStores,
    notifier: Notifier,
}

impl BackupService {
    pub fn new(state: ClusterState, stores: RemoteStores, notifier: Notifier) -> Self {
        Self {
            state,
            stores,
            notifier,
        }
    }

    pub async fn list_backups(&self, remote_name: &str, filter: &ListFilter) -> Result<BackupList> {
        let tx = self
            .state
            .begin(
                "List backups",
                LockSpec::create()
                    .read(LockObj::RscDfnMap)
                    .read(LockObj::RemoteMap),
            )
            .await;
        let remote = get_remote(tx.remotes()?, remote_name)?;
        let store = self.stores.backup_store(remote)?;
        let prefix = filter.rsc_name.as_deref().filter(|r| !r.is_empty());
        let graph = ObjectGraph::build(&store, prefix, tx.rsc_dfns()?).await?;
        for warning in &graph.warnings {
            warn!("{}", warning);
        }
        Ok(list_backups(&graph, tx.rsc_dfns()?, &remote.name, filter))
    }

    /// Full id of the newest backup of a resource, optionally of one snapshot.
    pub async fn latest_backup(
        &self,
        remote_name: &str,
        rsc_name: &str,
        snap_name: Option<&str>,
    ) -> Result<Option<String>> {
        let tx = self
            .state
            .begin("Latest backup", LockSpec::create().read(LockObj::RemoteMap))
            .await;
        let remote = get_remote(tx.remotes()?, remote_name)?;
        let store = self.stores.backup_store(remote)?;
        let listing = store.list_objects(Some(rsc_name)).await?;
        let latest = get_latest_backup(
            listing.iter().map(|o| o.key.as_str()),
            snap_name,
            store.backend(),
        );
        Ok(latest.map(|key| key.full_backup_id()))
    }

    pub async fn backup_info(&self, request: &InfoRequest) -> Result<BackupInfo> {
        let tx = self
            .state
            .begin(
                "Backup info",
                LockSpec::create()
                    .read(LockObj::NodesMap)
                    .read(LockObj::RscDfnMap)
                    .read(LockObj::RemoteMap),
            )
            .await;
        let remote = get_remote(tx.remotes()?, &request.remote_name)?;
        let store = self.stores.backup_store(remote)?;
        let backend = store.backend();

        let target = match request.backup_id.as_deref().filter(|id| !id.is_empty()) {
            Some(id) => Some(ManifestKey::parse_id(id, backend).map_err(|_| {
                CtrlError::BadRequest(format!(
                    "The target backup {id} is invalid since it does not match the pattern of \
                     '<rscName>_back_YYYYMMDD_HHMMSS[optional-backup-obj-suffix][^snapshot-name][.meta]' \
                     (e.g. my-rsc_back_20210824_072543). Please provide a valid target backup, or provide \
                     only the source resource name to restore to the latest backup of that resource."
                ))
            })?),
            None => None,
        };
        let prefix = match (&target, request.rsc_name.as_deref()) {
            (Some(target), _) => Some(target.rsc_name.clone()),
            (None, Some(rsc)) if !rsc.is_empty() => Some(rsc.to_string()),
            _ => {
                return Err(CtrlError::BadRequest(
                    "Either a backup id or a source resource name is required.".to_string(),
                ))
            }
        };

        let graph = ObjectGraph::build(&store, prefix.as_deref(), tx.rsc_dfns()?).await?;
        let target = match target {
            Some(target) => Some(target),
            None => get_latest_backup(
                graph.manifests().map(|node| node.key.as_str()),
                request.snap_name.as_deref(),
                backend,
            ),
        };
        let Some(target) = target else {
            return Err(CtrlError::BackupNotFound(format!(
                "resource '{}', snapshot '{}' in remote '{}'",
                request.rsc_name.as_deref().unwrap_or_default(),
                request.snap_name.as_deref().unwrap_or_default(),
                remote.name
            )));
        };
        if !graph.get(&target.to_string()).is_some_and(|node| node.exists) {
            return Err(CtrlError::BackupNotFound(format!(
                "{} in remote '{}'",
                target, remote.name
            )));
        }
        backup_info(&graph, &target)
    }

    /// Delete backups from a remote together with the snapshot definitions
    /// they were shipped from.
    pub async fn delete_backup(&self, request: &DeleteRequest) -> Result<DeleteResult> {
        let mut tx = self
            .state
            .begin(
                "Delete backup",
                LockSpec::create()
                    .read(LockObj::NodesMap)
                    .write(LockObj::RscDfnMap)
                    .read(LockObj::RemoteMap),
            )
            .await;
        let remote = get_remote(tx.remotes()?, &request.remote_name)?.clone();
        let store = self.stores.backup_store(&remote)?;
        let graph = ObjectGraph::build(&store, None, tx.rsc_dfns()?).await?;

        let cascading = request.cascading
            || matches!(
                request.selection,
                DeleteSelection::All | DeleteSelection::AllLocalCluster
            );
        let mut set = compute_delete_set(
            &graph,
            &request.selection,
            cascading,
            self.state.cluster_id(),
            &remote.name,
        )?;
        if request.keep_snaps {
            set.snapshots_to_delete.clear();
        }

        let mut result = DeleteResult {
            dry_run: request.dry_run,
            ..Default::default()
        };

        if request.dry_run {
            if !set.keys_to_delete.is_empty() {
                result.messages.push(block(
                    "Would delete s3/obs objects:",
                    set.keys_to_delete.iter().cloned(),
                ));
            }
            if !set.snapshots_to_delete.is_empty() {
                result.messages.push(block(
                    "Would delete Snapshots:",
                    set.snapshots_to_delete.iter().map(|key| {
                        format!("Resource: {}, Snapshot: {}", key.rsc_name, key.snap_name)
                    }),
                ));
            }
            if set.keys_to_delete.is_empty() && set.snapshots_to_delete.is_empty() {
                result
                    .messages
                    .push("Dryrun mode. Although nothing selected for deletion".to_string());
            }
        } else {
            if set.keys_to_delete.is_empty() {
                return Err(CtrlError::BadRequest(
                    "Could not find any backups to delete.".to_string(),
                ));
            }
            let keys: Vec<String> = set.keys_to_delete.iter().cloned().collect();
            let report = store.delete_objects(&keys).await?;
            if !report.failed.is_empty() {
                result
                    .messages
                    .push(format!("Could not delete {:?}", report.failed));
            }
            result
                .messages
                .push(format!("Successfully deleted {:?}", report.deleted));
            set.keys_not_found.extend(report.not_found);
            result.deleted = report.deleted;
            result.failed = report.failed;
        }

        if !set.keys_not_found.is_empty() {
            result.messages.push(block(
                "The following S3/OBS keys were not found in the given remote:",
                set.keys_not_found.iter().cloned(),
            ));
        }
        result.messages.extend(graph.warnings.iter().cloned());
        result.messages.extend(set.warnings.iter().cloned());
        result.keys_not_found = set.keys_not_found;

        if request.dry_run {
            return Ok(result);
        }

        let mut removed = Vec::new();
        for key in &set.snapshots_to_delete {
            if let Some(snap_dfn) = remove_snapshot_dfn(&mut tx, key)? {
                removed.push(snap_dfn);
            }
        }
        tx.commit();

        result.snapshots_deleted = removed
            .iter()
            .map(|snap_dfn| snap_dfn.key().to_string())
            .collect();
        for response in notify_removed(&self.notifier, &removed).await {
            if !response.success {
                result.messages.push(format!(
                    "Node {} did not confirm the snapshot deletion: {}",
                    response.node_name, response.message
                ));
            }
        }
        info!(
            "Deleted {} object(s) and {} snapshot definition(s) from remote {}",
            result.deleted.len(),
            result.snapshots_deleted.len(),
            remote.name
        );
        Ok(result)
    }
}
