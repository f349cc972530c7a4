//! Tracks running shipments and their per-volume daemons.

use crate::manifest::BackupEntry;
use crate::pipeline::ShipmentDaemon;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

struct Shipment {
    daemons: Vec<Arc<ShipmentDaemon>>,
    remaining: usize,
    failed: bool,
    entries: BTreeMap<u32, Vec<BackupEntry>>,
}

/// What a finished volume means for its shipment.
#[derive(Default)]
pub struct VolumeOutcome {
    /// Siblings to stop because this volume failed.
    pub to_stop: Vec<Arc<ShipmentDaemon>>,
    /// Set once every volume has reported.
    pub finished: Option<FinishedShipment>,
}

pub struct FinishedShipment {
    pub success: bool,
    pub entries: BTreeMap<u32, Vec<BackupEntry>>,
}

#[derive(Clone, Default)]
pub struct ShipmentTracker {
    active: Arc<RwLock<HashMap<String, Shipment>>>,
    started: Arc<RwLock<HashSet<String>>>,
}

impl ShipmentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a shipment. Fails if it was started before and the controller
    /// has not yet acknowledged its end.
    pub async fn begin(&self, id: &str, volumes: usize) -> bool {
        if !self.started.write().await.insert(id.to_string()) {
            return false;
        }
        self.active.write().await.insert(
            id.to_string(),
            Shipment {
                daemons: Vec::new(),
                remaining: volumes,
                failed: false,
                entries: BTreeMap::new(),
            },
        );
        true
    }

    /// Attach a started daemon. Returns false when the shipment already failed
    /// or is gone, in which case the caller must stop the daemon itself.
    pub async fn register(&self, id: &str, daemon: Arc<ShipmentDaemon>) -> bool {
        let mut active = self.active.write().await;
        match active.get_mut(id) {
            Some(shipment) if !shipment.failed => {
                shipment.daemons.push(daemon);
                true
            }
            _ => false,
        }
    }

    pub async fn volume_finished(
        &self,
        id: &str,
        vlm_nr: u32,
        entry: Option<BackupEntry>,
        success: bool,
    ) -> VolumeOutcome {
        let mut active = self.active.write().await;
        let Some(shipment) = active.get_mut(id) else {
            return VolumeOutcome::default();
        };

        let mut outcome = VolumeOutcome::default();
        if success {
            if let Some(entry) = entry {
                shipment.entries.entry(vlm_nr).or_default().push(entry);
            }
        } else if !shipment.failed {
            shipment.failed = true;
            outcome.to_stop = shipment.daemons.clone();
        }
        shipment.remaining = shipment.remaining.saturating_sub(1);

        if shipment.remaining == 0 {
            if let Some(done) = active.remove(id) {
                outcome.finished = Some(FinishedShipment {
                    success: !done.failed,
                    entries: done.entries,
                });
            }
        }
        outcome
    }

    pub async fn daemons(&self, id: &str) -> Vec<Arc<ShipmentDaemon>> {
        self.active
            .read()
            .await
            .get(id)
            .map(|s| s.daemons.clone())
            .unwrap_or_default()
    }

    pub async fn all_daemons(&self) -> Vec<Arc<ShipmentDaemon>> {
        self.active
            .read()
            .await
            .values()
            .flat_map(|s| s.daemons.iter().cloned())
            .collect()
    }

    /// Forget that a shipment was started, allowing it to run again.
    pub async fn clear_started(&self, id: &str) -> bool {
        self.started.write().await.remove(id)
    }

    pub async fn is_started(&self, id: &str) -> bool {
        self.started.read().await.contains(id)
    }

    pub async fn running_count(&self) -> usize {
        self.active.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str) -> Option<BackupEntry> {
        Some(BackupEntry {
            name: name.to_string(),
            finished_timestamp: 1,
        })
    }

    #[tokio::test]
    async fn test_begin_twice_is_rejected() {
        let tracker = ShipmentTracker::new();
        assert!(tracker.begin("rsc/snap", 1).await);
        assert!(!tracker.begin("rsc/snap", 1).await);
        assert!(tracker.clear_started("rsc/snap").await);
        assert!(!tracker.is_started("rsc/snap").await);
    }

    #[tokio::test]
    async fn test_all_volumes_succeed() {
        let tracker = ShipmentTracker::new();
        tracker.begin("s", 2).await;
        let first = tracker.volume_finished("s", 0, entry("a"), true).await;
        assert!(first.finished.is_none());
        let second = tracker.volume_finished("s", 1, entry("b"), true).await;
        let done = second.finished.unwrap();
        assert!(done.success);
        assert_eq!(done.entries.len(), 2);
        assert_eq!(tracker.running_count().await, 0);
        // Still claimed until the controller acknowledges the end.
        assert!(tracker.is_started("s").await);
    }

    #[tokio::test]
    async fn test_one_failure_fails_the_shipment() {
        let tracker = ShipmentTracker::new();
        tracker.begin("s", 2).await;
        tracker.volume_finished("s", 0, None, false).await;
        let done = tracker
            .volume_finished("s", 1, entry("b"), true)
            .await
            .finished
            .unwrap();
        assert!(!done.success);
    }
}
