//! Remote lookup, the controller master key and opening object stores for
//! a remote.

use crate::error::{CtrlError, Result};
use crate::model::{name_key, Remote, RemoteKind, RemoteMap};
use shipping_agent::store::{BackupStore, FsStore, MetaCache, ObjectStore};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Holds the master key that decrypts remote credentials.
#[derive(Default)]
pub struct SecurityObjects {
    master_key: RwLock<Option<Vec<u8>>>,
}

impl SecurityObjects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_master_key(&self, key: Vec<u8>) {
        if let Ok(mut guard) = self.master_key.write() {
            *guard = Some(key);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut guard) = self.master_key.write() {
            *guard = None;
        }
    }

    /// The unlocked master key. Every operation touching remote credentials
    /// fails without it.
    pub fn master_key(&self) -> Result<Vec<u8>> {
        let guard = self
            .master_key
            .read()
            .map_err(|_| CtrlError::CryptoKeyUnavailable)?;
        match guard.as_ref() {
            Some(key) if !key.is_empty() => Ok(key.clone()),
            _ => Err(CtrlError::CryptoKeyUnavailable),
        }
    }
}

/// Opens the object store behind a remote.
pub trait StoreFactory: Send + Sync {
    fn open(&self, remote: &Remote, master_key: &[u8]) -> Result<Arc<dyn ObjectStore>>;
}

/// Buckets as directories below a root.
pub struct FsStoreFactory {
    root: PathBuf,
}

impl FsStoreFactory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl StoreFactory for FsStoreFactory {
    fn open(&self, remote: &Remote, _master_key: &[u8]) -> Result<Arc<dyn ObjectStore>> {
        let bucket = if remote.bucket.is_empty() {
            &remote.name
        } else {
            &remote.bucket
        };
        let store = FsStore::new(self.root.join(bucket))
            .map_err(|e| CtrlError::Internal(anyhow::anyhow!("Failed to open bucket {}: {}", bucket, e)))?;
        Ok(Arc::new(store))
    }
}

/// Turns remotes into [`BackupStore`]s sharing one metadata cache.
#[derive(Clone)]
pub struct RemoteStores {
    factory: Arc<dyn StoreFactory>,
    security: Arc<SecurityObjects>,
    cache: Arc<MetaCache>,
    listing_timeout: Duration,
}

impl RemoteStores {
    pub fn new(
        factory: Arc<dyn StoreFactory>,
        security: Arc<SecurityObjects>,
        listing_timeout: Duration,
    ) -> Self {
        Self {
            factory,
            security,
            cache: Arc::new(MetaCache::new()),
            listing_timeout,
        }
    }

    pub fn security(&self) -> &Arc<SecurityObjects> {
        &self.security
    }

    pub fn cache(&self) -> &Arc<MetaCache> {
        &self.cache
    }

    pub fn backup_store(&self, remote: &Remote) -> Result<BackupStore> {
        let backend = remote.backend().ok_or_else(|| {
            CtrlError::BadRequest(format!("The remote {} is not an s3 or obs remote.", remote.name))
        })?;
        let master_key = self.security.master_key()?;
        let store = self.factory.open(remote, &master_key)?;
        Ok(BackupStore::new(remote.name.clone(), backend, store, self.cache.clone())
            .with_multi_delete_flag(remote.multi_delete_flag())
            .with_listing_timeout(self.listing_timeout))
    }
}

/// Look up a remote by name, case-insensitively.
pub fn get_remote<'a>(remotes: &'a RemoteMap, name: &str) -> Result<&'a Remote> {
    if name.is_empty() {
        return Err(CtrlError::BadRequest(
            "No remote name was given. Please provide a valid remote name.".to_string(),
        ));
    }
    remotes
        .get(&name_key(name))
        .ok_or_else(|| CtrlError::RemoteNotFound(name.to_string()))
}

/// Whether a snapshot recorded as shipping to `remote_to_check` ships to
/// `expected`. A satellite remote counts as the remote it is linked to.
pub fn has_shipping_to_remote(remotes: &RemoteMap, remote_to_check: &str, expected: &str) -> bool {
    if expected.eq_ignore_ascii_case(remote_to_check) {
        return true;
    }
    match remotes.get(&name_key(remote_to_check)).map(|r| &r.kind) {
        Some(RemoteKind::Satellite { linked_remote }) => linked_remote.eq_ignore_ascii_case(expected),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remotes() -> RemoteMap {
        let mut map = RemoteMap::new();
        map.insert("bucket".into(), Remote::new("Bucket", RemoteKind::S3));
        map.insert(
            "stlt-1".into(),
            Remote::new(
                "stlt-1",
                RemoteKind::Satellite {
                    linked_remote: "Other".into(),
                },
            ),
        );
        map
    }

    #[test]
    fn test_master_key_required() {
        let security = SecurityObjects::new();
        assert!(matches!(security.master_key(), Err(CtrlError::CryptoKeyUnavailable)));
        security.set_master_key(Vec::new());
        assert!(security.master_key().is_err());
        security.set_master_key(b"secret".to_vec());
        assert_eq!(security.master_key().unwrap(), b"secret");
    }

    #[test]
    fn test_get_remote() {
        let map = remotes();
        assert_eq!(get_remote(&map, "BUCKET").unwrap().name, "Bucket");
        assert!(matches!(get_remote(&map, "nope"), Err(CtrlError::RemoteNotFound(_))));
        assert!(matches!(get_remote(&map, ""), Err(CtrlError::BadRequest(_))));
    }

    #[test]
    fn test_satellite_remote_resolves_to_linked() {
        let map = remotes();
        assert!(has_shipping_to_remote(&map, "bucket", "BUCKET"));
        assert!(has_shipping_to_remote(&map, "stlt-1", "other"));
        assert!(!has_shipping_to_remote(&map, "stlt-1", "bucket"));
        assert!(!has_shipping_to_remote(&map, "bucket", "other"));
    }

    #[test]
    fn test_backup_store_needs_key_and_backend() {
        let dir = tempfile::TempDir::new().unwrap();
        let stores = RemoteStores::new(
            Arc::new(FsStoreFactory::new(dir.path())),
            Arc::new(SecurityObjects::new()),
            Duration::from_secs(5),
        );
        let s3 = Remote::new("bucket", RemoteKind::S3);
        assert!(matches!(stores.backup_store(&s3), Err(CtrlError::CryptoKeyUnavailable)));

        stores.security().set_master_key(b"k".to_vec());
        assert_eq!(stores.backup_store(&s3).unwrap().remote_name(), "bucket");
        let stlt = Remote::new("s", RemoteKind::Satellite { linked_remote: "x".into() });
        assert!(matches!(stores.backup_store(&stlt), Err(CtrlError::BadRequest(_))));
    }
}
