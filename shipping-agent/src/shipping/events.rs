//! Messages exchanged between the satellite and the controller.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Maximum number of queued events per subscriber
const BROADCAST_CAPACITY: usize = 1000;

/// Events reported by the satellite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ShipEvent {
    /// A multipart upload was created for one volume.
    #[serde(rename = "backup:upload-started")]
    UploadStarted {
        rsc_name: String,
        snap_name: String,
        remote_name: String,
        key: String,
        upload_id: String,
    },

    #[serde(rename = "backup:volume-finished")]
    VolumeFinished {
        rsc_name: String,
        snap_name: String,
        vlm_nr: u32,
        success: bool,
    },

    /// Every volume of a snapshot has been shipped or restored.
    #[serde(rename = "backup:shipped")]
    ShippingFinished {
        rsc_name: String,
        snap_name: String,
        remote_name: String,
        restoring: bool,
        success: bool,
    },
}

/// Commands the controller sends to a satellite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ShipCommand {
    #[serde(rename = "backup:abort")]
    Abort { rsc_name: String, snap_name: String },

    /// The controller has processed the end of a shipment.
    #[serde(rename = "backup:shipping-finished")]
    ShippingFinished { rsc_name: String, snap_name: String },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ShipEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    pub fn broadcast(&self, event: ShipEvent) {
        match self.tx.send(event) {
            Ok(count) => debug!("Broadcast event to {} subscriber(s)", count),
            Err(e) => warn!("Failed to broadcast event (no subscribers): {:?}", e.0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShipEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
