use super::flags::{ShippingFlag, ShippingFlags};
use super::name_key;
use crate::error::Result;
use chrono::{DateTime, TimeZone, Utc};
use shipping_agent::naming::Backend;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

pub const NAMESPC_BACKUP_SHIPPING: &str = "BackupShipping";
pub const KEY_BACKUP_START_TIMESTAMP: &str = "BackupShipping/BackupStartTimestamp";
pub const KEY_BACKUP_TARGET_REMOTE: &str = "BackupShipping/BackupTargetRemote";
pub const KEY_BACKUP_SRC_REMOTE: &str = "BackupShipping/BackupSrcRemote";

/// Property holding the backend suffix of a snapshot definition.
pub fn suffix_prop_key(backend: Backend) -> String {
    format!("{}/{}", NAMESPC_BACKUP_SHIPPING, backend.suffix_prop())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SnapshotFlag {
    BackupSource,
    BackupTarget,
}

/// A snapshot on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub node_name: String,
    pub flags: BTreeSet<SnapshotFlag>,
    pub props: BTreeMap<String, String>,
}

impl Snapshot {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            flags: BTreeSet::new(),
            props: BTreeMap::new(),
        }
    }

    pub fn with_flag(mut self, flag: SnapshotFlag) -> Self {
        self.flags.insert(flag);
        self
    }

    pub fn with_prop(mut self, key: &str, value: impl Into<String>) -> Self {
        self.props.insert(key.to_string(), value.into());
        self
    }

    pub fn has(&self, flag: SnapshotFlag) -> bool {
        self.flags.contains(&flag)
    }

    pub fn prop(&self, key: &str) -> Option<&str> {
        self.props.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapDfnKey {
    pub rsc_name: String,
    pub snap_name: String,
}

impl std::fmt::Display for SnapDfnKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.rsc_name, self.snap_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotDefinition {
    pub rsc_name: String,
    pub snap_name: String,
    pub uuid: Uuid,
    pub flags: ShippingFlags,
    pub volume_numbers: Vec<u32>,
    pub props: BTreeMap<String, String>,
    /// Keyed by lower-cased node name.
    pub snapshots: BTreeMap<String, Snapshot>,
}

impl SnapshotDefinition {
    pub fn new(rsc_name: impl Into<String>, snap_name: impl Into<String>, volume_numbers: Vec<u32>) -> Self {
        Self {
            rsc_name: rsc_name.into(),
            snap_name: snap_name.into(),
            uuid: Uuid::new_v4(),
            flags: ShippingFlags::empty(),
            volume_numbers,
            props: BTreeMap::new(),
            snapshots: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> SnapDfnKey {
        SnapDfnKey {
            rsc_name: self.rsc_name.clone(),
            snap_name: self.snap_name.clone(),
        }
    }

    pub fn add_snapshot(&mut self, snapshot: Snapshot) {
        self.snapshots.insert(name_key(&snapshot.node_name), snapshot);
    }

    pub fn with_snapshot(mut self, snapshot: Snapshot) -> Self {
        self.add_snapshot(snapshot);
        self
    }

    pub fn with_flags(mut self, flags: &[ShippingFlag]) -> Result<Self> {
        self.flags.enable(flags)?;
        Ok(self)
    }

    pub fn with_prop(mut self, key: &str, value: impl Into<String>) -> Self {
        self.props.insert(key.to_string(), value.into());
        self
    }

    pub fn prop(&self, key: &str) -> Option<&str> {
        self.props.get(key).map(String::as_str)
    }

    /// Backup start time recorded when shipping was scheduled.
    pub fn backup_start(&self) -> Option<DateTime<Utc>> {
        let millis = self.prop(KEY_BACKUP_START_TIMESTAMP)?.parse::<i64>().ok()?;
        Utc.timestamp_millis_opt(millis).single()
    }

    pub fn backend_suffix(&self, backend: Backend) -> &str {
        self.props
            .get(&suffix_prop_key(backend))
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn target_remote(&self) -> Option<&str> {
        self.prop(KEY_BACKUP_TARGET_REMOTE)
    }

    pub fn is_in_progress_backup(&self) -> bool {
        self.flags
            .is_set_all(&[ShippingFlag::Shipping, ShippingFlag::Backup])
    }

    /// The node shipping this backup, if any.
    pub fn backup_source(&self) -> Option<&Snapshot> {
        self.snapshots
            .values()
            .find(|snap| snap.has(SnapshotFlag::BackupSource))
    }

    pub fn node_names(&self) -> Vec<String> {
        self.snapshots.values().map(|s| s.node_name.clone()).collect()
    }
}

/// Connection between the resources of two nodes; direction does not matter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceConnection {
    pub node_a: String,
    pub node_b: String,
    pub snapshot_shipping_name_in_progress: Option<String>,
}

impl ResourceConnection {
    pub fn new(node_a: impl Into<String>, node_b: impl Into<String>) -> Self {
        Self {
            node_a: node_a.into(),
            node_b: node_b.into(),
            snapshot_shipping_name_in_progress: None,
        }
    }

    pub fn connects(&self, a: &str, b: &str) -> bool {
        let (x, y) = (self.node_a.as_str(), self.node_b.as_str());
        (x.eq_ignore_ascii_case(a) && y.eq_ignore_ascii_case(b))
            || (x.eq_ignore_ascii_case(b) && y.eq_ignore_ascii_case(a))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDefinition {
    pub name: String,
    pub connections: Vec<ResourceConnection>,
    /// Keyed by lower-cased snapshot name.
    pub snapshot_dfns: BTreeMap<String, SnapshotDefinition>,
}

impl ResourceDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connections: Vec::new(),
            snapshot_dfns: BTreeMap::new(),
        }
    }

    pub fn snapshot_dfn(&self, snap_name: &str) -> Option<&SnapshotDefinition> {
        self.snapshot_dfns.get(&name_key(snap_name))
    }

    pub fn snapshot_dfn_mut(&mut self, snap_name: &str) -> Option<&mut SnapshotDefinition> {
        self.snapshot_dfns.get_mut(&name_key(snap_name))
    }

    pub fn insert_snapshot_dfn(&mut self, snap_dfn: SnapshotDefinition) {
        self.snapshot_dfns
            .insert(name_key(&snap_dfn.snap_name), snap_dfn);
    }

    /// Remove a snapshot definition; its flags go with it.
    pub fn remove_snapshot_dfn(&mut self, snap_name: &str) -> Option<SnapshotDefinition> {
        self.snapshot_dfns.remove(&name_key(snap_name))
    }

    pub fn connection_mut(&mut self, a: &str, b: &str) -> Option<&mut ResourceConnection> {
        self.connections.iter_mut().find(|c| c.connects(a, b))
    }

    pub fn with_connection(mut self, conn: ResourceConnection) -> Self {
        self.connections.push(conn);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_is_unordered() {
        let conn = ResourceConnection::new("alpha", "beta");
        assert!(conn.connects("beta", "alpha"));
        assert!(conn.connects("ALPHA", "beta"));
        assert!(!conn.connects("alpha", "gamma"));
    }

    #[test]
    fn test_snapshot_lookup_ignores_case() {
        let mut rsc = ResourceDefinition::new("Data");
        rsc.insert_snapshot_dfn(SnapshotDefinition::new("Data", "Snap1", vec![0]));
        assert!(rsc.snapshot_dfn("snap1").is_some());
        assert!(rsc.remove_snapshot_dfn("SNAP1").is_some());
        assert!(rsc.snapshot_dfns.is_empty());
    }

    #[test]
    fn test_backup_props() {
        let snap_dfn = SnapshotDefinition::new("rsc", "s", vec![0, 1])
            .with_prop(KEY_BACKUP_START_TIMESTAMP, "1705320000000")
            .with_prop(&suffix_prop_key(Backend::S3), "-x")
            .with_prop(KEY_BACKUP_TARGET_REMOTE, "bucket");
        assert_eq!(
            snap_dfn.backup_start().unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()
        );
        assert_eq!(snap_dfn.backend_suffix(Backend::S3), "-x");
        assert_eq!(snap_dfn.backend_suffix(Backend::Obs), "");
        assert_eq!(snap_dfn.target_remote(), Some("bucket"));
    }
}
