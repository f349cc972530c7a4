//! In-memory bookkeeping for shipments: outstanding multipart uploads per
//! node (used to clean up on a forced abort) and the queue of backups
//! waiting to start.

use super::BackupStart;
use crate::model::{name_key, SnapDfnKey};
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortUpload {
    pub remote_name: String,
    pub key: String,
    pub upload_id: String,
}

/// What has to be undone when a shipment of one snapshot is aborted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AbortInfo {
    pub uploads: Vec<AbortUpload>,
    /// Node-to-node shipments; these have nothing remote to clean up.
    pub peer_shipments: usize,
}

impl AbortInfo {
    pub fn is_empty(&self) -> bool {
        self.uploads.is_empty() && self.peer_shipments == 0
    }
}

#[derive(Default)]
pub struct AbortRegistry {
    entries: DashMap<String, HashMap<SnapDfnKey, AbortInfo>>,
}

impl AbortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_upload(&self, node_name: &str, snap: SnapDfnKey, upload: AbortUpload) {
        self.entries
            .entry(name_key(node_name))
            .or_default()
            .entry(snap)
            .or_default()
            .uploads
            .push(upload);
    }

    pub fn add_peer_shipment(&self, node_name: &str, snap: SnapDfnKey) {
        self.entries
            .entry(name_key(node_name))
            .or_default()
            .entry(snap)
            .or_default()
            .peer_shipments += 1;
    }

    /// Everything recorded for a node.
    pub fn entries(&self, node_name: &str) -> HashMap<SnapDfnKey, AbortInfo> {
        self.entries
            .get(&name_key(node_name))
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    pub fn get(&self, node_name: &str, snap: &SnapDfnKey) -> Option<AbortInfo> {
        self.entries
            .get(&name_key(node_name))
            .and_then(|e| e.get(snap).cloned())
    }

    pub fn remove(&self, node_name: &str, snap: &SnapDfnKey) -> Option<AbortInfo> {
        let node = name_key(node_name);
        let removed = self.entries.get_mut(&node).and_then(|mut e| e.remove(snap));
        self.entries.remove_if(&node, |_, e| e.is_empty());
        removed
    }
}

/// A backup waiting for a free shipping slot.
#[derive(Debug, Clone)]
pub struct QueuedShipment {
    pub plan: BackupStart,
}

impl QueuedShipment {
    fn matches(&self, rsc_name: &str, remote_name: Option<&str>) -> bool {
        self.plan.rsc_name.eq_ignore_ascii_case(rsc_name)
            && remote_name.map_or(true, |r| self.plan.remote_name.eq_ignore_ascii_case(r))
    }
}

#[derive(Default)]
pub struct ShippingQueue {
    queue: Mutex<VecDeque<QueuedShipment>>,
}

impl ShippingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, plan: BackupStart) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(QueuedShipment { plan });
        }
    }

    /// Drop queued backups of a resource, optionally only those to one remote.
    /// Returns how many were removed.
    pub fn remove_for(&self, rsc_name: &str, remote_name: Option<&str>) -> usize {
        let Ok(mut queue) = self.queue.lock() else {
            return 0;
        };
        let before = queue.len();
        queue.retain(|q| !q.matches(rsc_name, remote_name));
        before - queue.len()
    }

    pub fn remove_where(&self, mut pred: impl FnMut(&BackupStart) -> bool) -> usize {
        let Ok(mut queue) = self.queue.lock() else {
            return 0;
        };
        let before = queue.len();
        queue.retain(|q| !pred(&q.plan));
        before - queue.len()
    }

    pub fn pop_next(&self) -> Option<QueuedShipment> {
        self.queue.lock().ok().and_then(|mut q| q.pop_front())
    }

    pub fn len(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
