//! Cluster objects the shipping state machine works on.

pub mod flags;
pub mod lookup;
pub mod remote;
pub mod resource;

pub use flags::{ShippingFlag, ShippingFlags, ShippingPhase};
pub use lookup::{all_snapshot_dfns, find_snapshot_dfn};
pub use remote::{Remote, RemoteKind};
pub use resource::{
    ResourceConnection, ResourceDefinition, SnapDfnKey, Snapshot, SnapshotDefinition,
    SnapshotFlag,
};

use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub name: String,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Object names are case-insensitive; maps are keyed by this form.
pub fn name_key(name: &str) -> String {
    name.to_ascii_lowercase()
}

pub type NodesMap = BTreeMap<String, Node>;
pub type RscDfnMap = BTreeMap<String, ResourceDefinition>;
pub type RemoteMap = BTreeMap<String, Remote>;
