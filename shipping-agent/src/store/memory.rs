//! In-memory object store with fault injection.

use super::{
    CompletedPart, DeleteOutcome, ListPage, ObjectReader, ObjectStore, ObjectSummary, StoreError,
    StoreResult,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    etag: String,
}

#[derive(Debug, Default)]
struct Upload {
    key: String,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<String, StoredObject>,
    uploads: HashMap<String, Upload>,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    page_size: AtomicUsize,
    /// Part numbers >= this value fail with a broken pipe. 0 disables.
    fail_parts_from: AtomicU32,
    bulk_delete_unsupported: AtomicBool,
    abort_failing: AtomicBool,
    abort_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            page_size: AtomicUsize::new(DEFAULT_PAGE_SIZE),
            fail_parts_from: AtomicU32::new(0),
            bulk_delete_unsupported: AtomicBool::new(false),
            abort_failing: AtomicBool::new(false),
            abort_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_page_size(&self, size: usize) {
        self.page_size.store(size.max(1), Ordering::SeqCst);
    }

    pub fn fail_upload_part_from(&self, part_number: u32) {
        self.fail_parts_from.store(part_number, Ordering::SeqCst);
    }

    pub fn set_bulk_delete_unsupported(&self, unsupported: bool) {
        self.bulk_delete_unsupported
            .store(unsupported, Ordering::SeqCst);
    }

    /// Make every abort fail with a service error.
    pub fn set_abort_failing(&self, failing: bool) {
        self.abort_failing.store(failing, Ordering::SeqCst);
    }

    pub fn abort_calls(&self) -> usize {
        self.abort_calls.load(Ordering::SeqCst)
    }

    pub async fn insert(&self, key: &str, data: impl Into<Bytes>) {
        let mut inner = self.inner.lock().await;
        inner.objects.insert(
            key.to_string(),
            StoredObject {
                data: data.into(),
                etag: new_etag(),
            },
        );
    }

    pub async fn object(&self, key: &str) -> Option<Bytes> {
        let inner = self.inner.lock().await;
        inner.objects.get(key).map(|o| o.data.clone())
    }

    pub async fn keys(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner.objects.keys().cloned().collect()
    }

    pub async fn active_uploads(&self) -> usize {
        self.inner.lock().await.uploads.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn new_etag() -> String {
    Uuid::new_v4().simple().to_string()
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list_objects(
        &self,
        prefix: &str,
        continuation: Option<String>,
    ) -> StoreResult<ListPage> {
        let page_size = self.page_size.load(Ordering::SeqCst);
        let inner = self.inner.lock().await;
        let mut objects: Vec<ObjectSummary> = inner
            .objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .filter(|(key, _)| continuation.as_deref().map_or(true, |after| key.as_str() > after))
            .take(page_size + 1)
            .map(|(key, obj)| ObjectSummary {
                key: key.clone(),
                etag: obj.etag.clone(),
                size: obj.data.len() as u64,
            })
            .collect();

        let next = if objects.len() > page_size {
            objects.truncate(page_size);
            objects.last().map(|o| o.key.clone())
        } else {
            None
        };
        Ok(ListPage { objects, next })
    }

    async fn init_multipart(&self, key: &str) -> StoreResult<String> {
        let upload_id = Uuid::new_v4().to_string();
        let mut inner = self.inner.lock().await;
        inner.uploads.insert(
            upload_id.clone(),
            Upload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> StoreResult<String> {
        let fail_from = self.fail_parts_from.load(Ordering::SeqCst);
        if fail_from != 0 && part_number >= fail_from {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                format!("injected failure uploading part {part_number} of {key}"),
            )));
        }
        let mut inner = self.inner.lock().await;
        let upload = inner
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| StoreError::NotFound(format!("upload {upload_id}")))?;
        let etag = new_etag();
        upload.parts.insert(part_number, (etag.clone(), data));
        Ok(etag)
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let upload = inner
            .uploads
            .remove(upload_id)
            .ok_or_else(|| StoreError::NotFound(format!("upload {upload_id}")))?;
        if upload.key != key {
            return Err(StoreError::Service {
                status: 400,
                message: format!("upload {upload_id} belongs to {}", upload.key),
            });
        }

        let mut data = BytesMut::new();
        for part in &parts {
            match upload.parts.get(&part.part_number) {
                Some((etag, bytes)) if *etag == part.etag => data.extend_from_slice(bytes),
                _ => {
                    return Err(StoreError::Service {
                        status: 400,
                        message: format!("invalid part {}", part.part_number),
                    })
                }
            }
        }
        inner.objects.insert(
            key.to_string(),
            StoredObject {
                data: data.freeze(),
                etag: new_etag(),
            },
        );
        Ok(())
    }

    async fn abort_multipart(&self, _key: &str, upload_id: &str) -> StoreResult<()> {
        self.abort_calls.fetch_add(1, Ordering::SeqCst);
        if self.abort_failing.load(Ordering::SeqCst) {
            return Err(StoreError::Service {
                status: 500,
                message: "InternalError".into(),
            });
        }
        let mut inner = self.inner.lock().await;
        inner
            .uploads
            .remove(upload_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("upload {upload_id}")))
    }

    async fn put_object(&self, key: &str, data: Bytes) -> StoreResult<()> {
        self.insert(key, data).await;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> StoreResult<ObjectReader> {
        let data = self
            .object(key)
            .await
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        Ok(Box::new(std::io::Cursor::new(data.to_vec())))
    }

    async fn delete_objects(&self, keys: &[String]) -> StoreResult<DeleteOutcome> {
        if self.bulk_delete_unsupported.load(Ordering::SeqCst) {
            return Err(StoreError::Unsupported("multi-object delete".to_string()));
        }
        let mut inner = self.inner.lock().await;
        let mut outcome = DeleteOutcome::default();
        for key in keys {
            if inner.objects.remove(key).is_some() {
                outcome.deleted.push(key.clone());
            } else {
                outcome.not_found.push(key.clone());
            }
        }
        Ok(outcome)
    }

    async fn delete_object(&self, key: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .objects
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_multipart_roundtrip() {
        let store = MemoryStore::new();
        let id = store.init_multipart("obj").await.unwrap();
        let e1 = store
            .upload_part("obj", &id, 1, Bytes::from_static(b"hello "))
            .await
            .unwrap();
        let e2 = store
            .upload_part("obj", &id, 2, Bytes::from_static(b"world"))
            .await
            .unwrap();
        store
            .complete_multipart(
                "obj",
                &id,
                vec![
                    CompletedPart { part_number: 1, etag: e1 },
                    CompletedPart { part_number: 2, etag: e2 },
                ],
            )
            .await
            .unwrap();

        let mut reader = store.get_object("obj").await.unwrap();
        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
        assert_eq!(store.active_uploads().await, 0);
    }

    #[tokio::test]
    async fn test_listing_pages() {
        let store = MemoryStore::new();
        store.set_page_size(2);
        for key in ["a1", "a2", "a3", "b1"] {
            store.insert(key, Bytes::from_static(b"x")).await;
        }
        let first = store.list_objects("a", None).await.unwrap();
        assert_eq!(first.objects.len(), 2);
        let second = store.list_objects("a", first.next).await.unwrap();
        assert_eq!(second.objects.len(), 1);
        assert_eq!(second.objects[0].key, "a3");
        assert!(second.next.is_none());
    }

    #[tokio::test]
    async fn test_abort_unknown_upload_is_not_found() {
        let store = MemoryStore::new();
        let err = store.abort_multipart("k", "nope").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(store.abort_calls(), 1);
    }

    #[tokio::test]
    async fn test_bulk_delete_reports_missing() {
        let store = MemoryStore::new();
        store.insert("present", Bytes::from_static(b"x")).await;
        let outcome = store
            .delete_objects(&["present".to_string(), "absent".to_string()])
            .await
            .unwrap();
        assert_eq!(outcome.deleted, vec!["present".to_string()]);
        assert_eq!(outcome.not_found, vec!["absent".to_string()]);
    }
}
