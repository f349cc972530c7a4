use super::{name_key, RscDfnMap, SnapshotDefinition};

/// Snapshot definition by resource and snapshot name, if the resource
/// definition exists at all.
pub fn find_snapshot_dfn<'a>(
    rsc_dfns: &'a RscDfnMap,
    rsc_name: &str,
    snap_name: &str,
) -> Option<&'a SnapshotDefinition> {
    rsc_dfns
        .get(&name_key(rsc_name))
        .and_then(|rsc| rsc.snapshot_dfn(snap_name))
}

pub fn all_snapshot_dfns(rsc_dfns: &RscDfnMap) -> impl Iterator<Item = &SnapshotDefinition> {
    rsc_dfns.values().flat_map(|rsc| rsc.snapshot_dfns.values())
}
