//! Backup manifest (`.meta` object body).

use crate::utils::errors::{Result, ShipError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One data object belonging to a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupEntry {
    pub name: String,
    pub finished_timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    pub rsc_name: String,
    pub node_name: String,
    /// Epoch millis.
    pub start_timestamp: i64,
    pub finish_timestamp: i64,
    pub snap_dfn_uuid: String,
    pub cluster_id: String,
    /// Manifest key (with `.meta`) of the backup this one is incremental to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub based_on: Option<String>,
    pub backups: BTreeMap<u32, Vec<BackupEntry>>,
}

impl BackupManifest {
    /// Decode a manifest body. Any body that does not match the current
    /// format is reported as invalid and treated as "not a manifest" by
    /// callers.
    pub fn from_json(key: &str, body: &str) -> Result<Self> {
        serde_json::from_str(body).map_err(|e| ShipError::InvalidManifest {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// All data object names, in volume order.
    pub fn data_keys(&self) -> impl Iterator<Item = (u32, &str)> {
        self.backups
            .iter()
            .flat_map(|(vlm, entries)| entries.iter().map(move |e| (*vlm, e.name.as_str())))
    }

    pub fn is_full(&self) -> bool {
        self.based_on.is_none()
    }
}
