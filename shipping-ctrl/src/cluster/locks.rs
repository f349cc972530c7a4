//! Named read/write locks over the cluster maps and the transactions that
//! run under them.
//!
//! A [`Transaction`] takes its locks in a fixed order (nodes, resource
//! definitions, remotes) when it begins. Write-locked maps are edited on a
//! working copy that replaces the shared map on [`Transaction::commit`];
//! dropping an uncommitted transaction discards the copy.

use crate::error::{CtrlError, Result};
use crate::model::{name_key, NodesMap, Remote, RemoteMap, RscDfnMap, SnapshotDefinition};
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockObj {
    NodesMap,
    RscDfnMap,
    RemoteMap,
}

impl LockObj {
    pub fn name(self) -> &'static str {
        match self {
            LockObj::NodesMap => "NODES_MAP",
            LockObj::RscDfnMap => "RSC_DFN_MAP",
            LockObj::RemoteMap => "REMOTE_MAP",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockMode {
    #[default]
    None,
    Read,
    Write,
}

/// Which maps a unit of work locks, and how.
#[derive(Debug, Clone, Copy, Default)]
pub struct LockSpec {
    nodes: LockMode,
    rsc_dfns: LockMode,
    remotes: LockMode,
}

impl LockSpec {
    pub fn create() -> Self {
        Self::default()
    }

    pub fn read(self, obj: LockObj) -> Self {
        self.with(obj, LockMode::Read)
    }

    pub fn write(self, obj: LockObj) -> Self {
        self.with(obj, LockMode::Write)
    }

    fn with(mut self, obj: LockObj, mode: LockMode) -> Self {
        let slot = match obj {
            LockObj::NodesMap => &mut self.nodes,
            LockObj::RscDfnMap => &mut self.rsc_dfns,
            LockObj::RemoteMap => &mut self.remotes,
        };
        // Never downgrade a lock already requested for writing.
        *slot = (*slot).max(mode);
        self
    }

    pub fn mode(&self, obj: LockObj) -> LockMode {
        match obj {
            LockObj::NodesMap => self.nodes,
            LockObj::RscDfnMap => self.rsc_dfns,
            LockObj::RemoteMap => self.remotes,
        }
    }
}

enum Section<T> {
    Unlocked,
    Read(OwnedRwLockReadGuard<T>),
    Write {
        guard: OwnedRwLockWriteGuard<T>,
        draft: T,
    },
}

impl<T: Clone> Section<T> {
    async fn acquire(lock: &Arc<RwLock<T>>, mode: LockMode) -> Self {
        match mode {
            LockMode::None => Section::Unlocked,
            LockMode::Read => Section::Read(lock.clone().read_owned().await),
            LockMode::Write => {
                let guard = lock.clone().write_owned().await;
                let draft = guard.clone();
                Section::Write { guard, draft }
            }
        }
    }

    fn get(&self, obj: LockObj) -> Result<&T> {
        match self {
            Section::Unlocked => Err(CtrlError::LockNotHeld(obj.name())),
            Section::Read(guard) => Ok(&**guard),
            Section::Write { draft, .. } => Ok(draft),
        }
    }

    fn get_mut(&mut self, obj: LockObj) -> Result<&mut T> {
        match self {
            Section::Write { draft, .. } => Ok(draft),
            _ => Err(CtrlError::LockNotHeld(obj.name())),
        }
    }

    fn commit(self) {
        if let Section::Write { mut guard, draft } = self {
            *guard = draft;
        }
    }
}

/// Shared cluster maps plus the local cluster id.
#[derive(Clone)]
pub struct ClusterState {
    cluster_id: String,
    nodes: Arc<RwLock<NodesMap>>,
    rsc_dfns: Arc<RwLock<RscDfnMap>>,
    remotes: Arc<RwLock<RemoteMap>>,
}

impl ClusterState {
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            nodes: Arc::new(RwLock::new(NodesMap::new())),
            rsc_dfns: Arc::new(RwLock::new(RscDfnMap::new())),
            remotes: Arc::new(RwLock::new(RemoteMap::new())),
        }
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// Start a named unit of work holding the requested locks.
    pub async fn begin(&self, name: &str, spec: LockSpec) -> Transaction {
        debug!("Scope '{}' acquiring locks {:?}", name, spec);
        let nodes = Section::acquire(&self.nodes, spec.mode(LockObj::NodesMap)).await;
        let rsc_dfns = Section::acquire(&self.rsc_dfns, spec.mode(LockObj::RscDfnMap)).await;
        let remotes = Section::acquire(&self.remotes, spec.mode(LockObj::RemoteMap)).await;
        Transaction {
            name: name.to_string(),
            nodes,
            rsc_dfns,
            remotes,
        }
    }
}

pub struct Transaction {
    name: String,
    nodes: Section<NodesMap>,
    rsc_dfns: Section<RscDfnMap>,
    remotes: Section<RemoteMap>,
}

impl Transaction {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> Result<&NodesMap> {
        self.nodes.get(LockObj::NodesMap)
    }

    pub fn nodes_mut(&mut self) -> Result<&mut NodesMap> {
        self.nodes.get_mut(LockObj::NodesMap)
    }

    pub fn rsc_dfns(&self) -> Result<&RscDfnMap> {
        self.rsc_dfns.get(LockObj::RscDfnMap)
    }

    pub fn rsc_dfns_mut(&mut self) -> Result<&mut RscDfnMap> {
        self.rsc_dfns.get_mut(LockObj::RscDfnMap)
    }

    pub fn remotes(&self) -> Result<&RemoteMap> {
        self.remotes.get(LockObj::RemoteMap)
    }

    pub fn remotes_mut(&mut self) -> Result<&mut RemoteMap> {
        self.remotes.get_mut(LockObj::RemoteMap)
    }

    pub fn snapshot_dfn(&self, rsc_name: &str, snap_name: &str) -> Result<Option<&SnapshotDefinition>> {
        Ok(self
            .rsc_dfns()?
            .get(&name_key(rsc_name))
            .and_then(|rsc| rsc.snapshot_dfn(snap_name)))
    }

    pub fn snapshot_dfn_mut(
        &mut self,
        rsc_name: &str,
        snap_name: &str,
    ) -> Result<Option<&mut SnapshotDefinition>> {
        Ok(self
            .rsc_dfns_mut()?
            .get_mut(&name_key(rsc_name))
            .and_then(|rsc| rsc.snapshot_dfn_mut(snap_name)))
    }

    pub fn remote(&self, name: &str) -> Result<Option<&Remote>> {
        Ok(self.remotes()?.get(&name_key(name)))
    }

    /// Publish the write-locked maps and release every lock.
    pub fn commit(self) {
        debug!("Scope '{}' committed", self.name);
        self.nodes.commit();
        self.rsc_dfns.commit();
        self.remotes.commit();
    }
}
