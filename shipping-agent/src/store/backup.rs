//! Backup-aware view of one remote: cached manifest reads, timed listings and
//! bulk deletes with a per-key fallback.

use super::{
    CompletedPart, MetaCache, ObjectReader, ObjectStore, ObjectSummary, StoreError,
};
use crate::manifest::BackupManifest;
use crate::naming::Backend;
use crate::utils::errors::{Result, ShipError};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

pub const DEFAULT_LISTING_TIMEOUT: Duration = Duration::from_secs(5);

/// Keys grouped by what happened to them during a delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteReport {
    pub deleted: Vec<String>,
    pub not_found: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Clone)]
pub struct BackupStore {
    remote_name: String,
    backend: Backend,
    store: Arc<dyn ObjectStore>,
    cache: Arc<MetaCache>,
    multi_delete: Arc<AtomicBool>,
    listing_timeout: Duration,
}

impl BackupStore {
    pub fn new(
        remote_name: impl Into<String>,
        backend: Backend,
        store: Arc<dyn ObjectStore>,
        cache: Arc<MetaCache>,
    ) -> Self {
        Self {
            remote_name: remote_name.into(),
            backend,
            store,
            cache,
            multi_delete: Arc::new(AtomicBool::new(true)),
            listing_timeout: DEFAULT_LISTING_TIMEOUT,
        }
    }

    /// Share the remote's "bulk delete supported" flag so a fallback is
    /// remembered across stores opened for the same remote.
    pub fn with_multi_delete_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.multi_delete = flag;
        self
    }

    pub fn with_listing_timeout(mut self, timeout: Duration) -> Self {
        self.listing_timeout = timeout;
        self
    }

    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn multi_delete_supported(&self) -> bool {
        self.multi_delete.load(Ordering::SeqCst)
    }

    /// List every object under `prefix`, following continuation tokens. The
    /// timeout covers the whole walk, not a single page.
    pub async fn list_objects(&self, prefix: Option<&str>) -> Result<Vec<ObjectSummary>> {
        let prefix = prefix.unwrap_or_default();
        let walk = async {
            let mut objects = Vec::new();
            let mut continuation = None;
            loop {
                let page = self.store.list_objects(prefix, continuation).await?;
                objects.extend(page.objects);
                match page.next {
                    Some(token) => continuation = Some(token),
                    None => break,
                }
            }
            Ok::<_, StoreError>(objects)
        };

        let objects = tokio::time::timeout(self.listing_timeout, walk)
            .await
            .map_err(|_| ShipError::ListingTimeout {
                remote: self.remote_name.clone(),
                timeout: self.listing_timeout,
            })??;

        self.cache.refresh(&self.remote_name, prefix, &objects);
        debug!(
            "Listed {} objects on remote {} (prefix '{}')",
            objects.len(),
            self.remote_name,
            prefix
        );
        Ok(objects)
    }

    /// Fetch and decode a manifest, reusing the cached body while the ETag is
    /// unchanged. The body is decoded on every call.
    pub async fn get_manifest(&self, key: &str) -> Result<BackupManifest> {
        let body = match self
            .cache
            .get(&self.remote_name, key)
            .and_then(|cached| cached.content)
        {
            Some(body) => body,
            None => {
                let mut reader = self.store.get_object(key).await?;
                let mut body = String::new();
                reader.read_to_string(&mut body).await?;
                self.cache.fill(&self.remote_name, key, body.clone());
                body
            }
        };
        BackupManifest::from_json(key, &body)
    }

    pub async fn put_manifest(&self, key: &str, manifest: &BackupManifest) -> Result<()> {
        let body = manifest.to_json()?;
        self.store.put_object(key, Bytes::from(body)).await?;
        Ok(())
    }

    pub async fn get_object(&self, key: &str) -> Result<ObjectReader> {
        Ok(self.store.get_object(key).await?)
    }

    pub async fn init_multipart(&self, key: &str) -> Result<String> {
        Ok(self.store.init_multipart(key).await?)
    }

    pub async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String> {
        Ok(self
            .store
            .upload_part(key, upload_id, part_number, data)
            .await?)
    }

    pub async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<()> {
        Ok(self.store.complete_multipart(key, upload_id, parts).await?)
    }

    /// Abort an upload. An upload the store no longer knows is already clean.
    pub async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()> {
        match self.store.abort_multipart(key, upload_id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!("Upload {} of {} already gone", upload_id, key);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete keys in one bulk call when the remote supports it. A bulk
    /// failure that is not a service error marks the remote as not supporting
    /// bulk delete and retries key by key.
    pub async fn delete_objects(&self, keys: &[String]) -> Result<DeleteReport> {
        if keys.is_empty() {
            return Ok(DeleteReport::default());
        }

        let report = if self.multi_delete_supported() {
            match self.store.delete_objects(keys).await {
                Ok(outcome) => DeleteReport {
                    deleted: outcome.deleted,
                    not_found: outcome.not_found,
                    failed: outcome.failed,
                },
                Err(e) if e.is_service_error() => return Err(e.into()),
                Err(e) => {
                    warn!(
                        "Remote {} does not support multi-object delete ({}), deleting one by one",
                        self.remote_name, e
                    );
                    self.multi_delete.store(false, Ordering::SeqCst);
                    self.delete_one_by_one(keys).await
                }
            }
        } else {
            self.delete_one_by_one(keys).await
        };

        self.cache.evict(&self.remote_name, &report.deleted);
        if !report.failed.is_empty() {
            warn!(
                "Failed to delete {} object(s) on remote {}: {:?}",
                report.failed.len(),
                self.remote_name,
                report.failed
            );
        }
        Ok(report)
    }

    async fn delete_one_by_one(&self, keys: &[String]) -> DeleteReport {
        let mut report = DeleteReport::default();
        for key in keys {
            match self.store.delete_object(key).await {
                Ok(()) => report.deleted.push(key.clone()),
                Err(e) if e.is_not_found() => report.not_found.push(key.clone()),
                Err(e) => {
                    warn!("Failed to delete {}: {}", key, e);
                    report.failed.push(key.clone());
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DeleteOutcome, ListPage, MemoryStore, StoreResult};
    use async_trait::async_trait;

    fn backup_store(mem: Arc<MemoryStore>) -> BackupStore {
        BackupStore::new("remote", Backend::S3, mem, Arc::new(MetaCache::new()))
    }

    const MANIFEST: &str = r#"{"rscName":"r","nodeName":"n","startTimestamp":1,"finishTimestamp":2,"snapDfnUuid":"u","clusterId":"c","backups":{}}"#;

    #[tokio::test]
    async fn test_listing_follows_pages() {
        let mem = Arc::new(MemoryStore::new());
        mem.set_page_size(1);
        for key in ["a", "b", "c"] {
            mem.insert(key, Bytes::from_static(b"x")).await;
        }
        let store = backup_store(mem);
        assert_eq!(store.list_objects(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_manifest_served_from_cache_until_etag_changes() {
        let mem = Arc::new(MemoryStore::new());
        mem.insert("r_back_20240115_120000.meta", MANIFEST).await;
        let store = backup_store(mem.clone());

        store.list_objects(None).await.unwrap();
        let first = store.get_manifest("r_back_20240115_120000.meta").await.unwrap();
        assert_eq!(first.node_name, "n");

        // Rewritten body, same listing: the cached body is still used.
        let rewritten = MANIFEST.replace("\"n\"", "\"m\"");
        mem.insert("r_back_20240115_120000.meta", rewritten).await;
        let cached = store.get_manifest("r_back_20240115_120000.meta").await.unwrap();
        assert_eq!(cached.node_name, "n");

        // A new listing sees the new ETag and drops the stale body.
        store.list_objects(None).await.unwrap();
        let fresh = store.get_manifest("r_back_20240115_120000.meta").await.unwrap();
        assert_eq!(fresh.node_name, "m");
    }

    #[tokio::test]
    async fn test_delete_absent_key_reported_not_found() {
        let mem = Arc::new(MemoryStore::new());
        mem.insert("present", Bytes::from_static(b"x")).await;
        let store = backup_store(mem);
        let report = store
            .delete_objects(&["present".to_string(), "absent".to_string()])
            .await
            .unwrap();
        assert_eq!(report.deleted, vec!["present".to_string()]);
        assert_eq!(report.not_found, vec!["absent".to_string()]);
    }

    #[tokio::test]
    async fn test_bulk_delete_falls_back_to_single_deletes() {
        let mem = Arc::new(MemoryStore::new());
        mem.set_bulk_delete_unsupported(true);
        mem.insert("a", Bytes::from_static(b"x")).await;
        let store = backup_store(mem.clone());

        let report = store
            .delete_objects(&["a".to_string(), "gone".to_string()])
            .await
            .unwrap();
        assert_eq!(report.deleted, vec!["a".to_string()]);
        assert_eq!(report.not_found, vec!["gone".to_string()]);
        assert!(!store.multi_delete_supported());
        assert!(mem.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_abort_of_unknown_upload_is_clean() {
        let store = backup_store(Arc::new(MemoryStore::new()));
        store.abort_multipart("k", "unknown").await.unwrap();
    }

    struct StalledStore;

    #[async_trait]
    impl ObjectStore for StalledStore {
        async fn list_objects(
            &self,
            _prefix: &str,
            _continuation: Option<String>,
        ) -> StoreResult<ListPage> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(ListPage::default())
        }
        async fn init_multipart(&self, _: &str) -> StoreResult<String> {
            unimplemented!()
        }
        async fn upload_part(
            &self,
            _: &str,
            _: &str,
            _: u32,
            _: Bytes,
        ) -> StoreResult<String> {
            unimplemented!()
        }
        async fn complete_multipart(
            &self,
            _: &str,
            _: &str,
            _: Vec<CompletedPart>,
        ) -> StoreResult<()> {
            unimplemented!()
        }
        async fn abort_multipart(&self, _: &str, _: &str) -> StoreResult<()> {
            unimplemented!()
        }
        async fn put_object(&self, _: &str, _: Bytes) -> StoreResult<()> {
            unimplemented!()
        }
        async fn get_object(&self, _: &str) -> StoreResult<ObjectReader> {
            unimplemented!()
        }
        async fn delete_objects(
            &self,
            _: &[String],
        ) -> StoreResult<DeleteOutcome> {
            unimplemented!()
        }
        async fn delete_object(&self, _: &str) -> StoreResult<()> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn test_listing_timeout() {
        let store = BackupStore::new(
            "slow",
            Backend::S3,
            Arc::new(StalledStore),
            Arc::new(MetaCache::new()),
        )
        .with_listing_timeout(Duration::from_millis(50));
        let err = store.list_objects(None).await.unwrap_err();
        assert!(matches!(err, ShipError::ListingTimeout { .. }));
    }
}
