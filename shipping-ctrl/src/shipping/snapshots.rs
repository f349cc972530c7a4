//! Snapshot definition removal shared by backup deletion and aborts.

use crate::cluster::{Notifier, NodeResponse, Transaction};
use crate::error::Result;
use crate::model::{name_key, SnapDfnKey, SnapshotDefinition};
use tracing::info;

/// Remove a snapshot definition inside `tx`. Its flags are reset so the
/// returned copy no longer reads as shipping.
pub(crate) fn remove_snapshot_dfn(
    tx: &mut Transaction,
    key: &SnapDfnKey,
) -> Result<Option<SnapshotDefinition>> {
    let removed = tx
        .rsc_dfns_mut()?
        .get_mut(&name_key(&key.rsc_name))
        .and_then(|rsc| rsc.remove_snapshot_dfn(&key.snap_name))
        .map(|mut snap_dfn| {
            snap_dfn.flags.reset();
            snap_dfn
        });
    if removed.is_some() {
        info!("Snapshot definition {} removed in scope '{}'", key, tx.name());
    }
    Ok(removed)
}

/// Tell the nodes that hosted removed snapshot definitions. Call after commit.
pub(crate) async fn notify_removed(
    notifier: &Notifier,
    removed: &[SnapshotDefinition],
) -> Vec<NodeResponse> {
    let mut responses = Vec::new();
    for snap_dfn in removed {
        responses.extend(
            notifier
                .snapshot_deleted(&snap_dfn.node_names(), &snap_dfn.rsc_name, &snap_dfn.snap_name)
                .await,
        );
    }
    responses
}
