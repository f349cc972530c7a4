use shipping_agent::naming::Backend;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteKind {
    S3,
    Obs,
    /// Temporary remote used by a satellite during a cluster-to-cluster
    /// shipment; stands in for the linked remote.
    Satellite { linked_remote: String },
}

#[derive(Debug, Clone)]
pub struct Remote {
    pub name: String,
    pub kind: RemoteKind,
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    /// Encrypted with the controller master key.
    pub access_key: Vec<u8>,
    pub secret_key: Vec<u8>,
    multi_delete_supported: Arc<AtomicBool>,
    /// Set while a satellite remote is being torn down.
    pub deleting: bool,
}

impl Remote {
    pub fn new(name: impl Into<String>, kind: RemoteKind) -> Self {
        Self {
            name: name.into(),
            kind,
            endpoint: String::new(),
            bucket: String::new(),
            region: String::new(),
            access_key: Vec::new(),
            secret_key: Vec::new(),
            multi_delete_supported: Arc::new(AtomicBool::new(true)),
            deleting: false,
        }
    }

    pub fn with_bucket(mut self, endpoint: &str, bucket: &str, region: &str) -> Self {
        self.endpoint = endpoint.to_string();
        self.bucket = bucket.to_string();
        self.region = region.to_string();
        self
    }

    /// Key grammar used for this remote's bucket.
    pub fn backend(&self) -> Option<Backend> {
        match self.kind {
            RemoteKind::S3 => Some(Backend::S3),
            RemoteKind::Obs => Some(Backend::Obs),
            RemoteKind::Satellite { .. } => None,
        }
    }

    pub fn is_satellite(&self) -> bool {
        matches!(self.kind, RemoteKind::Satellite { .. })
    }

    /// Shared across clones so a bulk-delete fallback sticks to the remote.
    pub fn multi_delete_flag(&self) -> Arc<AtomicBool> {
        self.multi_delete_supported.clone()
    }

    pub fn multi_delete_supported(&self) -> bool {
        self.multi_delete_supported.load(Ordering::Relaxed)
    }
}

