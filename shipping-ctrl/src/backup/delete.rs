//! Selecting what to delete from a remote.

use super::graph::{NodeId, ObjectGraph};
use crate::error::{CtrlError, Result};
use crate::model::SnapDfnKey;
use shipping_agent::naming::{parse_backup_time, Backend, ManifestKey, META_SUFFIX};
use std::collections::BTreeSet;

/// Which backups a delete request is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteSelection {
    /// Exactly one backup; `.meta` is appended when missing.
    Id(String),
    /// Every key starting with the prefix.
    IdPrefix(String),
    /// One raw object key, whether it belongs to a backup or not.
    ObjectKey(String),
    /// Manifests started before `timestamp`, from `rsc_name`, shipped by `node_name`.
    Filter {
        timestamp: Option<String>,
        rsc_name: Option<String>,
        node_name: Option<String>,
    },
    All,
    AllLocalCluster,
}

/// Raw selection arguments as a caller passes them.
#[derive(Debug, Clone, Default)]
pub struct SelectionArgs {
    pub id: Option<String>,
    pub id_prefix: Option<String>,
    pub key: Option<String>,
    pub timestamp: Option<String>,
    pub rsc_name: Option<String>,
    pub node_name: Option<String>,
    pub all: bool,
    pub all_local_cluster: bool,
}

fn given(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.is_empty()).cloned()
}

impl SelectionArgs {
    /// The first selection that was given, in order of precedence.
    pub fn into_selection(self) -> Result<DeleteSelection> {
        if let Some(id) = given(&self.id) {
            return Ok(DeleteSelection::Id(id));
        }
        if let Some(prefix) = given(&self.id_prefix) {
            return Ok(DeleteSelection::IdPrefix(prefix));
        }
        if let Some(key) = given(&self.key) {
            return Ok(DeleteSelection::ObjectKey(key));
        }
        let timestamp = given(&self.timestamp);
        let rsc_name = given(&self.rsc_name);
        let node_name = given(&self.node_name);
        if timestamp.is_some() || rsc_name.is_some() || node_name.is_some() {
            return Ok(DeleteSelection::Filter {
                timestamp,
                rsc_name,
                node_name,
            });
        }
        if self.all {
            return Ok(DeleteSelection::All);
        }
        if self.all_local_cluster {
            return Ok(DeleteSelection::AllLocalCluster);
        }
        Err(CtrlError::BadRequest(
            "Nothing selected for deletion. Provide an id, id prefix, key, filter, all or all-local-cluster."
                .to_string(),
        ))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteSet {
    pub keys_to_delete: BTreeSet<String>,
    pub keys_not_found: BTreeSet<String>,
    pub snapshots_to_delete: BTreeSet<SnapDfnKey>,
    pub warnings: Vec<String>,
}

struct Collector<'g> {
    graph: &'g ObjectGraph,
    visited: BTreeSet<NodeId>,
    set: DeleteSet,
}

impl<'g> Collector<'g> {
    fn by_keys(&mut self, keys: &BTreeSet<String>, cascading: bool) -> Result<()> {
        for key in keys {
            match self.graph.id(key) {
                Some(id) if self.graph.node(id).exists => self.add(id, cascading)?,
                _ => {
                    self.set.keys_not_found.insert(key.clone());
                }
            }
        }
        Ok(())
    }

    /// Add a manifest with its data keys. Descendants follow when cascading;
    /// ancestors never do.
    fn add(&mut self, id: NodeId, cascading: bool) -> Result<()> {
        let graph = self.graph;
        let node = graph.node(id);
        if !node.is_manifest() || !self.visited.insert(id) {
            return Ok(());
        }
        self.set.keys_to_delete.insert(node.key.clone());

        for child in &node.references {
            let child = graph.node(*child);
            if !child.exists {
                self.set.keys_not_found.insert(child.key.clone());
            } else if !child.is_manifest() {
                self.set.keys_to_delete.insert(child.key.clone());
            }
        }

        for dependent_id in &node.referenced_by {
            let dependent = graph.node(*dependent_id);
            if !dependent.exists {
                self.set.keys_not_found.insert(dependent.key.clone());
            } else if dependent.is_manifest() {
                if !cascading {
                    return Err(CtrlError::DependentBackupExists {
                        key: node.key.clone(),
                        dependent: dependent.key.clone(),
                    });
                }
                self.add(*dependent_id, cascading)?;
            }
        }

        if let Some(snap_dfn) = &node.snap_dfn {
            self.set.snapshots_to_delete.insert(snap_dfn.clone());
        }
        Ok(())
    }
}

/// Work out which objects and snapshot definitions a selection removes.
pub fn compute_delete_set(
    graph: &ObjectGraph,
    selection: &DeleteSelection,
    cascading: bool,
    local_cluster_id: &str,
    remote_name: &str,
) -> Result<DeleteSet> {
    let mut collector = Collector {
        graph,
        visited: BTreeSet::new(),
        set: DeleteSet::default(),
    };

    match selection {
        DeleteSelection::Id(id) => {
            let id = if id.ends_with(META_SUFFIX) {
                id.clone()
            } else {
                format!("{id}{META_SUFFIX}")
            };
            // With `.meta` appended only keys carrying a trailing extension
            // after `.meta` can collide, so AmbiguousId only shows up for those.
            by_prefix(&mut collector, &id, false, cascading, remote_name)?;
        }
        DeleteSelection::IdPrefix(prefix) => {
            by_prefix(&mut collector, prefix, true, cascading, remote_name)?;
        }
        DeleteSelection::ObjectKey(key) => {
            collector.by_keys(&BTreeSet::from([key.clone()]), cascading)?;
            collector.set.keys_to_delete.insert(key.clone());
            collector.set.keys_not_found.remove(key);
        }
        DeleteSelection::Filter {
            timestamp,
            rsc_name,
            node_name,
        } => {
            let before = match timestamp.as_deref() {
                Some(raw) => Some(parse_backup_time(raw).map_err(|_| {
                    CtrlError::BadRequest(format!(
                        "Failed to parse '{raw}'. Expected format: YYYYMMDD_HHMMSS (e.g. 20210824_072543)"
                    ))
                })?),
                None => None,
            };
            let backend = graph.backend().unwrap_or(Backend::S3);
            let keys: BTreeSet<String> = graph
                .manifests()
                .filter(|node| {
                    let Some(manifest) = node.manifest.as_ref() else {
                        return false;
                    };
                    let Ok(info) = ManifestKey::parse(&node.key, backend) else {
                        return false;
                    };
                    let node_ok = node_name
                        .as_deref()
                        .map_or(true, |n| n.eq_ignore_ascii_case(&manifest.node_name));
                    let rsc_ok = rsc_name
                        .as_deref()
                        .map_or(true, |r| r.eq_ignore_ascii_case(&manifest.rsc_name));
                    let time_ok = before.map_or(true, |before| info.backup_time < before);
                    node_ok && rsc_ok && time_ok
                })
                .map(|node| node.key.clone())
                .collect();
            collector.by_keys(&keys, cascading)?;
        }
        DeleteSelection::All => {
            let keys: BTreeSet<String> = graph.keys().map(str::to_string).collect();
            collector.by_keys(&keys, true)?;
        }
        DeleteSelection::AllLocalCluster => {
            let keys: BTreeSet<String> = graph
                .manifests()
                .filter(|node| {
                    node.manifest
                        .as_ref()
                        .is_some_and(|m| m.cluster_id == local_cluster_id)
                })
                .map(|node| node.key.clone())
                .collect();
            collector.by_keys(&keys, true)?;
        }
    }
    Ok(collector.set)
}

fn by_prefix(
    collector: &mut Collector<'_>,
    prefix: &str,
    multi_select: bool,
    cascading: bool,
    remote_name: &str,
) -> Result<()> {
    let matches: BTreeSet<String> = collector
        .graph
        .keys()
        .filter(|key| key.starts_with(prefix))
        .map(str::to_string)
        .collect();

    if matches.is_empty() {
        collector.set.warnings.push(format!(
            "No backup with id {}'{}' found on remote '{}'",
            if multi_select { "prefix " } else { "" },
            prefix,
            remote_name
        ));
        return Ok(());
    }
    if matches.len() > 1 && !multi_select {
        return Err(CtrlError::AmbiguousId {
            prefix: prefix.to_string(),
            remote: remote_name.to_string(),
            matches: matches.into_iter().collect(),
        });
    }
    collector.by_keys(&matches, cascading)
}

#[cfg(test)]
mod tests {
    use super::super::graph::test_support::*;
    use super::*;
    use crate::model::{ResourceDefinition, RscDfnMap, SnapshotDefinition};
    use shipping_agent::store::{BackupStore, MemoryStore, MetaCache};
    use std::sync::Arc;

    async fn graph_of(mem: Arc<MemoryStore>, rsc_dfns: &RscDfnMap) -> ObjectGraph {
        let store = BackupStore::new("remote", Backend::S3, mem, Arc::new(MetaCache::new()));
        ObjectGraph::build(&store, None, rsc_dfns).await.unwrap()
    }

    async fn chain_graph() -> ObjectGraph {
        let mem = Arc::new(MemoryStore::new());
        seed_chain(&mem).await;
        graph_of(mem, &RscDfnMap::new()).await
    }

    fn keys(set: &BTreeSet<String>) -> Vec<&str> {
        set.iter().map(String::as_str).collect()
    }

    #[tokio::test]
    async fn test_id_prefix_selects_manifest_and_data() {
        let mem = Arc::new(MemoryStore::new());
        put_manifest(
            &mem,
            "myrsc_back_20240115_120000.meta",
            &manifest("myrsc", "n1", "c1", "u", None, &[(0, "myrsc_00000_back_20240115_120000")]),
        )
        .await;
        mem.insert("myrsc_00000_back_20240115_120000", &b"d"[..]).await;
        let graph = graph_of(mem, &RscDfnMap::new()).await;

        let set = compute_delete_set(
            &graph,
            &DeleteSelection::IdPrefix("myrsc_back_20240115".into()),
            false,
            "c1",
            "remote",
        )
        .unwrap();
        assert_eq!(
            keys(&set.keys_to_delete),
            vec!["myrsc_00000_back_20240115_120000", "myrsc_back_20240115_120000.meta"]
        );
        assert!(set.keys_not_found.is_empty());
        assert!(set.snapshots_to_delete.is_empty());
        assert!(set.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_dependent_backup_blocks_without_cascading() {
        let graph = chain_graph().await;
        let err = compute_delete_set(
            &graph,
            &DeleteSelection::Id("myrsc_back_20240115_120000".into()),
            false,
            "c1",
            "remote",
        )
        .unwrap_err();
        match err {
            CtrlError::DependentBackupExists { key, dependent } => {
                assert_eq!(key, "myrsc_back_20240115_120000.meta");
                assert_eq!(dependent, "myrsc_back_20240116_120000.meta");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_cascading_includes_dependents() {
        let graph = chain_graph().await;
        let set = compute_delete_set(
            &graph,
            &DeleteSelection::Id("myrsc_back_20240115_120000".into()),
            true,
            "c1",
            "remote",
        )
        .unwrap();
        assert_eq!(set.keys_to_delete.len(), 4);
    }

    #[tokio::test]
    async fn test_incremental_never_pulls_in_ancestors() {
        let graph = chain_graph().await;
        let set = compute_delete_set(
            &graph,
            &DeleteSelection::Id("myrsc_back_20240116_120000.meta".into()),
            false,
            "c1",
            "remote",
        )
        .unwrap();
        assert_eq!(
            keys(&set.keys_to_delete),
            vec!["myrsc_00000_back_20240116_120000", "myrsc_back_20240116_120000.meta"]
        );
    }

    #[tokio::test]
    async fn test_single_select_prefix_must_be_unique() {
        let graph = chain_graph().await;
        let mut collector = Collector {
            graph: &graph,
            visited: BTreeSet::new(),
            set: DeleteSet::default(),
        };
        match by_prefix(&mut collector, "myrsc_back_2024011", false, false, "remote") {
            Err(CtrlError::AmbiguousId { matches, remote, .. }) => {
                assert_eq!(remote, "remote");
                assert_eq!(
                    matches,
                    vec!["myrsc_back_20240115_120000.meta", "myrsc_back_20240116_120000.meta"]
                );
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_id_prefix_takes_every_match() {
        let graph = chain_graph().await;
        let set = compute_delete_set(
            &graph,
            &DeleteSelection::IdPrefix("myrsc_back_2024011".into()),
            true,
            "c1",
            "remote",
        )
        .unwrap();
        assert_eq!(set.keys_to_delete.len(), 4);
        assert!(set.warnings.is_empty());

        // The same prefix does not name one backup when given as an id.
        let set = compute_delete_set(
            &graph,
            &DeleteSelection::Id("myrsc_back_2024011".into()),
            true,
            "c1",
            "remote",
        )
        .unwrap();
        assert!(set.keys_to_delete.is_empty());
        assert_eq!(set.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_id_only_warns() {
        let graph = chain_graph().await;
        let set = compute_delete_set(
            &graph,
            &DeleteSelection::IdPrefix("zzz".into()),
            false,
            "c1",
            "remote",
        )
        .unwrap();
        assert!(set.keys_to_delete.is_empty());
        assert_eq!(set.warnings, vec!["No backup with id prefix 'zzz' found on remote 'remote'"]);

        let set = compute_delete_set(
            &graph,
            &DeleteSelection::Id("myrsc_back_20240101_000000".into()),
            false,
            "c1",
            "remote",
        )
        .unwrap();
        assert_eq!(
            set.warnings,
            vec!["No backup with id 'myrsc_back_20240101_000000.meta' found on remote 'remote'"]
        );
    }

    #[tokio::test]
    async fn test_missing_data_key_is_reported_not_found() {
        let mem = Arc::new(MemoryStore::new());
        put_manifest(
            &mem,
            "myrsc_back_20240115_120000.meta",
            &manifest("myrsc", "n1", "c1", "u", None, &[(0, "myrsc_00000_back_20240115_120000")]),
        )
        .await;
        let graph = graph_of(mem, &RscDfnMap::new()).await;
        let set = compute_delete_set(&graph, &DeleteSelection::All, false, "c1", "remote").unwrap();
        assert_eq!(keys(&set.keys_to_delete), vec!["myrsc_back_20240115_120000.meta"]);
        assert_eq!(keys(&set.keys_not_found), vec!["myrsc_00000_back_20240115_120000"]);
    }

    #[tokio::test]
    async fn test_object_key_is_always_deleted() {
        let graph = chain_graph().await;
        let set = compute_delete_set(
            &graph,
            &DeleteSelection::ObjectKey("stray-object".into()),
            false,
            "c1",
            "remote",
        )
        .unwrap();
        assert_eq!(keys(&set.keys_to_delete), vec!["stray-object"]);
        assert!(set.keys_not_found.is_empty());
    }

    #[tokio::test]
    async fn test_filter_by_time_and_node() {
        let graph = chain_graph().await;
        let set = compute_delete_set(
            &graph,
            &DeleteSelection::Filter {
                timestamp: Some("20240116_120000".into()),
                rsc_name: Some("MYRSC".into()),
                node_name: None,
            },
            true,
            "c1",
            "remote",
        )
        .unwrap();
        // Only the full backup started strictly before; its dependent follows.
        assert_eq!(set.keys_to_delete.len(), 4);

        let set = compute_delete_set(
            &graph,
            &DeleteSelection::Filter {
                timestamp: None,
                rsc_name: None,
                node_name: Some("other-node".into()),
            },
            false,
            "c1",
            "remote",
        )
        .unwrap();
        assert!(set.keys_to_delete.is_empty());

        assert!(matches!(
            compute_delete_set(
                &graph,
                &DeleteSelection::Filter {
                    timestamp: Some("yesterday".into()),
                    rsc_name: None,
                    node_name: None
                },
                false,
                "c1",
                "remote"
            ),
            Err(CtrlError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_all_local_cluster_only_takes_own_manifests() {
        let graph = chain_graph().await;
        let set =
            compute_delete_set(&graph, &DeleteSelection::AllLocalCluster, false, "c2", "remote").unwrap();
        assert!(set.keys_to_delete.is_empty());
        let set =
            compute_delete_set(&graph, &DeleteSelection::AllLocalCluster, false, "c1", "remote").unwrap();
        assert_eq!(set.keys_to_delete.len(), 4);
    }

    #[tokio::test]
    async fn test_linked_snapshot_is_marked() {
        let mem = Arc::new(MemoryStore::new());
        let snap_dfn = SnapshotDefinition::new("myrsc", "back_20240115_120000", vec![0]);
        put_manifest(
            &mem,
            "myrsc_back_20240115_120000.meta",
            &manifest(
                "myrsc",
                "n1",
                "c1",
                &snap_dfn.uuid.to_string(),
                None,
                &[(0, "myrsc_00000_back_20240115_120000")],
            ),
        )
        .await;
        mem.insert("myrsc_00000_back_20240115_120000", &b"d"[..]).await;
        let mut rsc = ResourceDefinition::new("myrsc");
        rsc.insert_snapshot_dfn(snap_dfn.clone());
        let mut rsc_dfns = RscDfnMap::new();
        rsc_dfns.insert("myrsc".into(), rsc);
        let graph = graph_of(mem, &rsc_dfns).await;

        let set = compute_delete_set(
            &graph,
            &DeleteSelection::Id("myrsc_back_20240115_120000".into()),
            false,
            "c1",
            "remote",
        )
        .unwrap();
        assert_eq!(set.snapshots_to_delete.into_iter().collect::<Vec<_>>(), vec![snap_dfn.key()]);
    }

    #[test]
    fn test_selection_precedence() {
        let selection = SelectionArgs {
            id_prefix: Some("a".into()),
            rsc_name: Some("r".into()),
            all: true,
            ..Default::default()
        }
        .into_selection()
        .unwrap();
        assert_eq!(selection, DeleteSelection::IdPrefix("a".into()));

        let selection = SelectionArgs {
            id: Some(String::new()),
            all_local_cluster: true,
            ..Default::default()
        }
        .into_selection()
        .unwrap();
        assert_eq!(selection, DeleteSelection::AllLocalCluster);
        assert!(SelectionArgs::default().into_selection().is_err());
    }
}
