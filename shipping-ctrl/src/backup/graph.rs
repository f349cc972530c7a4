//! Reference graph over the objects of one remote.
//!
//! Nodes live in an arena indexed by key. A manifest node references its
//! data objects and the manifest it is based on; `referenced_by` holds the
//! inverse edges. Keys that are named by a manifest but not listed get a
//! node with `exists == false`.

use crate::model::{find_snapshot_dfn, RscDfnMap, SnapDfnKey};
use shipping_agent::manifest::BackupManifest;
use shipping_agent::naming::{Backend, DataKey, ManifestKey};
use shipping_agent::store::BackupStore;
use shipping_agent::ShipError;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

pub type NodeId = usize;

#[derive(Debug, Clone, Default)]
pub struct ObjectNode {
    pub key: String,
    pub exists: bool,
    pub size: u64,
    pub manifest: Option<BackupManifest>,
    pub snap_dfn: Option<SnapDfnKey>,
    pub references: BTreeSet<NodeId>,
    pub referenced_by: BTreeSet<NodeId>,
}

impl ObjectNode {
    pub fn is_manifest(&self) -> bool {
        self.manifest.is_some()
    }
}

#[derive(Debug, Default)]
pub struct ObjectGraph {
    backend: Option<Backend>,
    nodes: Vec<ObjectNode>,
    index: BTreeMap<String, NodeId>,
    /// Listed keys that are neither manifests nor data objects.
    pub foreign: BTreeSet<String>,
    /// Problems worth reporting to the caller.
    pub warnings: Vec<String>,
}

impl ObjectGraph {
    /// List the remote (optionally below `prefix`) and build the graph.
    pub async fn build(
        store: &BackupStore,
        prefix: Option<&str>,
        rsc_dfns: &RscDfnMap,
    ) -> shipping_agent::Result<Self> {
        let backend = store.backend();
        let listing = store.list_objects(prefix).await?;
        let mut graph = ObjectGraph {
            backend: Some(backend),
            ..Default::default()
        };

        for object in &listing {
            let key = object.key.as_str();
            let mut recognized = false;

            if let Ok(info) = ManifestKey::parse(key, backend) {
                match store.get_manifest(key).await {
                    Ok(manifest) => {
                        recognized = true;
                        graph.add_manifest(key, object.size, &info, manifest, rsc_dfns);
                    }
                    Err(ShipError::InvalidManifest { .. }) => {
                        // Most likely written in an older manifest format.
                        debug!("Ignoring {}: not a current manifest", key);
                    }
                    Err(e) => {
                        warn!("Failed to read manifest {}: {}", key, e);
                        graph
                            .warnings
                            .push(format!("IO exception while parsing metafile {key}: {e}"));
                    }
                }
            }

            if let Ok(info) = DataKey::parse(key, backend) {
                recognized = true;
                let id = graph.node_id(key);
                let node = &mut graph.nodes[id];
                node.exists = true;
                node.size = object.size;
                node.snap_dfn = find_snapshot_dfn(rsc_dfns, &info.rsc_name, &info.snap_name)
                    .map(|snap_dfn| snap_dfn.key());
            }

            if !recognized {
                graph.foreign.insert(key.to_string());
            }
        }

        debug!(
            "Built object graph for remote {}: {} node(s), {} foreign key(s)",
            store.remote_name(),
            graph.nodes.len(),
            graph.foreign.len()
        );
        Ok(graph)
    }

    fn add_manifest(
        &mut self,
        key: &str,
        size: u64,
        info: &ManifestKey,
        manifest: BackupManifest,
        rsc_dfns: &RscDfnMap,
    ) {
        let meta_id = self.node_id(key);

        let children: Vec<String> = manifest.data_keys().map(|(_, name)| name.to_string()).collect();
        for child in children {
            let child_id = self.node_id(&child);
            self.link(meta_id, child_id);
        }

        let mut snap_dfn = None;
        if let Some(local) = find_snapshot_dfn(rsc_dfns, &info.rsc_name, &info.snap_name) {
            if local.uuid.to_string() == manifest.snap_dfn_uuid {
                snap_dfn = Some(local.key());
            } else {
                self.warnings.push(format!(
                    "Not marking snapshot definition {} / {} for exclusion as the UUID does not match with the backup",
                    info.rsc_name, info.snap_name
                ));
            }
        }

        if let Some(based_on) = manifest.based_on.clone() {
            let parent_id = self.node_id(&based_on);
            self.link(meta_id, parent_id);
        }

        let node = &mut self.nodes[meta_id];
        node.exists = true;
        node.size = size;
        node.manifest = Some(manifest);
        node.snap_dfn = snap_dfn;
    }

    fn node_id(&mut self, key: &str) -> NodeId {
        if let Some(id) = self.index.get(key) {
            return *id;
        }
        let id = self.nodes.len();
        self.nodes.push(ObjectNode {
            key: key.to_string(),
            ..Default::default()
        });
        self.index.insert(key.to_string(), id);
        id
    }

    fn link(&mut self, from: NodeId, to: NodeId) {
        self.nodes[from].references.insert(to);
        self.nodes[to].referenced_by.insert(from);
    }

    pub fn backend(&self) -> Option<Backend> {
        self.backend
    }

    pub fn id(&self, key: &str) -> Option<NodeId> {
        self.index.get(key).copied()
    }

    pub fn get(&self, key: &str) -> Option<&ObjectNode> {
        self.id(key).map(|id| &self.nodes[id])
    }

    pub fn node(&self, id: NodeId) -> &ObjectNode {
        &self.nodes[id]
    }

    /// Every known key, listed or referenced, in key order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.index.keys().map(String::as_str)
    }

    pub fn manifests(&self) -> impl Iterator<Item = &ObjectNode> {
        self.index
            .values()
            .map(|id| &self.nodes[*id])
            .filter(|node| node.exists && node.is_manifest())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use shipping_agent::manifest::{BackupEntry, BackupManifest};
    use shipping_agent::store::MemoryStore;
    use std::collections::BTreeMap;

    pub fn manifest(
        rsc: &str,
        node: &str,
        cluster: &str,
        uuid: &str,
        based_on: Option<&str>,
        data: &[(u32, &str)],
    ) -> BackupManifest {
        let mut backups: BTreeMap<u32, Vec<BackupEntry>> = BTreeMap::new();
        for (vlm, name) in data {
            backups.entry(*vlm).or_default().push(BackupEntry {
                name: name.to_string(),
                finished_timestamp: 1_705_320_100_000,
            });
        }
        BackupManifest {
            rsc_name: rsc.to_string(),
            node_name: node.to_string(),
            start_timestamp: 1_705_320_000_000,
            finish_timestamp: 1_705_320_100_000,
            snap_dfn_uuid: uuid.to_string(),
            cluster_id: cluster.to_string(),
            based_on: based_on.map(str::to_string),
            backups,
        }
    }

    pub async fn put_manifest(mem: &MemoryStore, key: &str, manifest: &BackupManifest) {
        mem.insert(key, manifest.to_json().unwrap()).await;
    }

    /// Full backup plus one increment of `myrsc`, volume 0 each.
    pub async fn seed_chain(mem: &MemoryStore) {
        put_manifest(
            mem,
            "myrsc_back_20240115_120000.meta",
            &manifest("myrsc", "n1", "c1", "u-full", None, &[(0, "myrsc_00000_back_20240115_120000")]),
        )
        .await;
        mem.insert("myrsc_00000_back_20240115_120000", &b"full-data"[..]).await;
        put_manifest(
            mem,
            "myrsc_back_20240116_120000.meta",
            &manifest(
                "myrsc",
                "n1",
                "c1",
                "u-inc",
                Some("myrsc_back_20240115_120000.meta"),
                &[(0, "myrsc_00000_back_20240116_120000")],
            ),
        )
        .await;
        mem.insert("myrsc_00000_back_20240116_120000", &b"inc"[..]).await;
    }
}
