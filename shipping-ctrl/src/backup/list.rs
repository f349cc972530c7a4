//! Listing, latest-backup lookup and chain resolution.

use super::graph::ObjectGraph;
use crate::error::{CtrlError, Result};
use crate::model::{all_snapshot_dfns, find_snapshot_dfn, RscDfnMap, ShippingFlag, SnapshotDefinition};
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use shipping_agent::manifest::BackupManifest;
use shipping_agent::naming::{format_backup_time, Backend, DataKey, ManifestKey, META_SUFFIX};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupVolume {
    pub vlm_nr: u32,
    pub finished_time: Option<String>,
    pub finished_timestamp: Option<i64>,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupSummary {
    /// Full backup id (manifest key without `.meta`).
    pub id: String,
    pub rsc_name: String,
    pub snap_name: String,
    pub start_time: String,
    pub start_timestamp: i64,
    pub finish_time: Option<String>,
    pub finish_timestamp: Option<i64>,
    pub node_name: Option<String>,
    /// `None` when unknown.
    pub shipping: Option<bool>,
    pub success: Option<bool>,
    pub restorable: bool,
    pub volumes: BTreeMap<u32, BackupVolume>,
    pub based_on_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackupList {
    pub backups: BTreeMap<String, BackupSummary>,
    /// Listed keys that no backup accounts for.
    pub unclaimed: BTreeSet<String>,
}

/// Optional resource and snapshot filters, both compared case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub rsc_name: Option<String>,
    pub snap_name: Option<String>,
}

impl ListFilter {
    fn matches(&self, rsc_name: &str, snap_name: &str) -> bool {
        let rsc_ok = self
            .rsc_name
            .as_deref()
            .filter(|r| !r.is_empty())
            .map_or(true, |r| r.eq_ignore_ascii_case(rsc_name));
        let snap_ok = self
            .snap_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .map_or(true, |s| s.eq_ignore_ascii_case(snap_name));
        rsc_ok && snap_ok
    }
}

fn millis_to_time(millis: i64) -> Option<String> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|time| format_backup_time(&time))
}

/// Everything known about the backups on one remote: finished backups from
/// their manifests, data objects without a manifest and shipments that are
/// still in flight towards `remote_name`.
pub fn list_backups(
    graph: &ObjectGraph,
    rsc_dfns: &RscDfnMap,
    remote_name: &str,
    filter: &ListFilter,
) -> BackupList {
    let backend = graph.backend().unwrap_or(Backend::S3);
    let listed: BTreeSet<String> = graph
        .keys()
        .filter(|key| graph.get(key).is_some_and(|node| node.exists))
        .chain(graph.foreign.iter().map(String::as_str))
        .map(str::to_string)
        .collect();

    let mut list = BackupList::default();
    let mut used: BTreeSet<String> = BTreeSet::new();
    let mut skipped: BTreeSet<String> = BTreeSet::new();

    for node in graph.manifests() {
        let Some(manifest) = node.manifest.as_ref() else {
            continue;
        };
        let Ok(info) = ManifestKey::parse(&node.key, backend) else {
            continue;
        };
        if !filter.matches(&info.rsc_name, &info.snap_name) {
            skipped.insert(node.key.clone());
            skipped.extend(manifest.data_keys().map(|(_, name)| name.to_string()));
            continue;
        }
        let (summary, associated) = summary_from_manifest(graph, backend, &info, manifest);
        used.insert(node.key.clone());
        used.extend(associated);
        list.backups.insert(summary.id.clone(), summary);
    }

    for key in &listed {
        if used.contains(key) || skipped.contains(key) {
            continue;
        }
        let Ok(info) = DataKey::parse(key, backend) else {
            continue;
        };
        if !filter.matches(&info.rsc_name, &info.snap_name) {
            skipped.insert(key.clone());
            continue;
        }
        let snap_dfn = find_snapshot_dfn(rsc_dfns, &info.rsc_name, &info.snap_name);
        let id = info.manifest_key().full_backup_id();
        let summary = list
            .backups
            .entry(id.clone())
            .or_insert_with(|| summary_from_data_key(&id, &info, snap_dfn));
        summary.volumes.insert(
            info.vlm_nr,
            BackupVolume {
                vlm_nr: info.vlm_nr,
                finished_time: None,
                finished_timestamp: None,
                key: key.clone(),
            },
        );
        used.insert(key.clone());
    }

    // Uploads may only become visible in a listing once they complete.
    for snap_dfn in all_snapshot_dfns(rsc_dfns) {
        if !snap_dfn.is_in_progress_backup()
            || !filter.matches(&snap_dfn.rsc_name, &snap_dfn.snap_name)
        {
            continue;
        }
        let targets_remote = snap_dfn
            .target_remote()
            .is_some_and(|target| target.eq_ignore_ascii_case(remote_name));
        let Some(start) = snap_dfn.backup_start() else {
            continue;
        };
        if !targets_remote {
            continue;
        }
        let suffix = snap_dfn.backend_suffix(backend).to_string();
        for vlm_nr in &snap_dfn.volume_numbers {
            let info = DataKey::new(
                snap_dfn.rsc_name.clone(),
                "",
                *vlm_nr,
                start,
                suffix.clone(),
                &snap_dfn.snap_name,
            );
            let id = info.manifest_key().full_backup_id();
            let key = info.to_string();
            let summary = list
                .backups
                .entry(id.clone())
                .or_insert_with(|| summary_from_data_key(&id, &info, Some(snap_dfn)));
            summary.volumes.entry(*vlm_nr).or_insert(BackupVolume {
                vlm_nr: *vlm_nr,
                finished_time: None,
                finished_timestamp: None,
                key: key.clone(),
            });
            used.insert(key);
        }
    }

    list.unclaimed = listed
        .into_iter()
        .filter(|key| !used.contains(key) && !skipped.contains(key))
        .collect();
    list
}

fn summary_from_manifest(
    graph: &ObjectGraph,
    backend: Backend,
    info: &ManifestKey,
    manifest: &BackupManifest,
) -> (BackupSummary, BTreeSet<String>) {
    let mut restorable = true;
    let mut volumes = BTreeMap::new();
    let mut associated = BTreeSet::new();

    for (vlm_nr, entries) in &manifest.backups {
        for entry in entries {
            if !graph.get(&entry.name).is_some_and(|node| node.exists) {
                restorable = false;
                continue;
            }
            match DataKey::parse(&entry.name, backend) {
                Ok(data) if data.vlm_nr == *vlm_nr => {
                    volumes.insert(
                        *vlm_nr,
                        BackupVolume {
                            vlm_nr: *vlm_nr,
                            finished_time: millis_to_time(entry.finished_timestamp),
                            finished_timestamp: Some(entry.finished_timestamp),
                            key: entry.name.clone(),
                        },
                    );
                    associated.insert(entry.name.clone());
                }
                // Volume index in the manifest does not match the key, or the
                // key is not a data key at all.
                _ => restorable = false,
            }
        }
    }

    let based_on_id = manifest
        .based_on
        .as_deref()
        .map(|key| key.strip_suffix(META_SUFFIX).unwrap_or(key).to_string());

    let summary = BackupSummary {
        id: info.full_backup_id(),
        rsc_name: info.rsc_name.clone(),
        snap_name: info.snap_name.clone(),
        start_time: millis_to_time(manifest.start_timestamp).unwrap_or_default(),
        start_timestamp: manifest.start_timestamp,
        finish_time: millis_to_time(manifest.finish_timestamp),
        finish_timestamp: Some(manifest.finish_timestamp),
        node_name: Some(manifest.node_name.clone()),
        shipping: Some(false),
        success: Some(true),
        restorable,
        volumes,
        based_on_id,
    };
    (summary, associated)
}

fn summary_from_data_key(
    id: &str,
    info: &DataKey,
    snap_dfn: Option<&SnapshotDefinition>,
) -> BackupSummary {
    let mut node_name = None;
    let (shipping, success) = match snap_dfn {
        Some(snap_dfn) if snap_dfn.flags.is_set(ShippingFlag::Backup) => {
            let is_shipping = snap_dfn.flags.is_set(ShippingFlag::Shipping);
            let is_shipped = snap_dfn.flags.is_set(ShippingFlag::Shipped);
            if is_shipping || is_shipped {
                node_name = snap_dfn.backup_source().map(|snap| snap.node_name.clone());
            }
            if is_shipping {
                (Some(true), None)
            } else if is_shipped {
                (Some(false), Some(true))
            } else {
                (Some(false), Some(false))
            }
        }
        _ => (None, None),
    };

    BackupSummary {
        id: id.to_string(),
        rsc_name: info.rsc_name.clone(),
        snap_name: info.snap_name.clone(),
        start_time: format_backup_time(&info.backup_time),
        start_timestamp: info.backup_time.timestamp_millis(),
        finish_time: None,
        finish_timestamp: None,
        node_name,
        shipping,
        success,
        restorable: false,
        volumes: BTreeMap::new(),
        based_on_id: None,
    }
}

/// Newest manifest key among `keys`, optionally for one snapshot only.
pub fn get_latest_backup<'a>(
    keys: impl IntoIterator<Item = &'a str>,
    snap_name: Option<&str>,
    backend: Backend,
) -> Option<ManifestKey> {
    let snap_name = snap_name.filter(|s| !s.is_empty());
    let mut latest: Option<ManifestKey> = None;
    for key in keys {
        let Ok(current) = ManifestKey::parse(key, backend) else {
            continue;
        };
        if snap_name.is_some_and(|snap| snap != current.snap_name) {
            continue;
        }
        if latest
            .as_ref()
            .map_or(true, |l| l.backup_time < current.backup_time)
        {
            latest = Some(current);
        }
    }
    latest
}

/// One manifest on the way from a backup to its full backup.
#[derive(Debug, Clone)]
pub struct ChainLink {
    pub key: String,
    pub manifest: BackupManifest,
}

/// Follow `basedOn` from `manifest_key` to the full backup. The walk is
/// bounded by the number of manifests in the graph.
pub fn resolve_chain(graph: &ObjectGraph, manifest_key: &str) -> Result<Vec<ChainLink>> {
    let start = graph
        .get(manifest_key)
        .filter(|node| node.exists && node.is_manifest())
        .ok_or_else(|| CtrlError::BackupNotFound(manifest_key.to_string()))?;
    let limit = graph.manifests().count();

    let mut chain: Vec<ChainLink> = Vec::new();
    let mut current = start;
    loop {
        if chain.len() >= limit {
            return Err(CtrlError::ChainBroken {
                key: manifest_key.to_string(),
                reason: format!("basedOn does not reach a full backup within {limit} steps"),
            });
        }
        let Some(manifest) = current.manifest.clone() else {
            return Err(CtrlError::ChainBroken {
                key: manifest_key.to_string(),
                reason: format!("{} is not a manifest", current.key),
            });
        };
        let based_on = manifest.based_on.clone();
        chain.push(ChainLink {
            key: current.key.clone(),
            manifest,
        });
        let Some(parent) = based_on else {
            return Ok(chain);
        };
        current = graph
            .get(&parent)
            .filter(|node| node.exists && node.is_manifest())
            .ok_or_else(|| CtrlError::ChainBroken {
                key: manifest_key.to_string(),
                reason: format!("{parent} is missing from the remote"),
            })?;
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VolumeDownload {
    pub vlm_nr: u32,
    pub dl_size_bytes: u64,
}

/// What restoring a backup would involve.
#[derive(Debug, Clone, Serialize)]
pub struct BackupInfo {
    pub rsc_name: String,
    pub snap_name: String,
    pub full_backup: String,
    pub latest_backup: String,
    /// Manifest keys from the requested backup down to the full backup.
    pub chain: Vec<String>,
    pub volumes: BTreeMap<u32, VolumeDownload>,
    pub total_dl_size_bytes: u64,
    pub backup_time: DateTime<Utc>,
}

pub fn backup_info(graph: &ObjectGraph, info: &ManifestKey) -> Result<BackupInfo> {
    let key = info.to_string();
    let chain = resolve_chain(graph, &key)?;

    let mut volumes: BTreeMap<u32, VolumeDownload> = BTreeMap::new();
    for link in &chain {
        for (vlm_nr, name) in link.manifest.data_keys() {
            let size = graph.get(name).map_or(0, |node| node.size);
            let volume = volumes.entry(vlm_nr).or_insert_with(|| VolumeDownload {
                vlm_nr,
                dl_size_bytes: 0,
            });
            volume.dl_size_bytes += size;
        }
    }

    let full_backup = chain
        .last()
        .map(|link| link.key.strip_suffix(META_SUFFIX).unwrap_or(&link.key).to_string())
        .unwrap_or_default();
    Ok(BackupInfo {
        rsc_name: info.rsc_name.clone(),
        snap_name: info.snap_name.clone(),
        full_backup,
        latest_backup: info.full_backup_id(),
        chain: chain.into_iter().map(|link| link.key).collect(),
        total_dl_size_bytes: volumes.values().map(|v| v.dl_size_bytes).sum(),
        volumes,
        backup_time: info.backup_time,
    })
}
