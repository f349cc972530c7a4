//! Directory-backed object store.
//!
//! Objects are plain files below the root. In-flight multipart uploads live
//! under `.uploads/<upload id>/` until they are completed or aborted.

use super::{
    CompletedPart, DeleteOutcome, ListPage, ObjectReader, ObjectStore, ObjectSummary, StoreError,
    StoreResult,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;
use walkdir::WalkDir;

const UPLOADS_DIR: &str = ".uploads";
const KEY_FILE: &str = "key";
const PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join(UPLOADS_DIR))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> StoreResult<PathBuf> {
        let rel = Path::new(key);
        let valid = !key.is_empty()
            && !key.starts_with(UPLOADS_DIR)
            && rel.components().all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(StoreError::Service {
                status: 400,
                message: format!("invalid object key '{key}'"),
            });
        }
        Ok(self.root.join(rel))
    }

    fn upload_dir(&self, upload_id: &str) -> PathBuf {
        self.root.join(UPLOADS_DIR).join(upload_id)
    }

    fn part_path(&self, upload_id: &str, part_number: u32) -> PathBuf {
        self.upload_dir(upload_id).join(format!("{part_number:05}"))
    }

    async fn check_upload(&self, key: &str, upload_id: &str) -> StoreResult<()> {
        let recorded = fs::read_to_string(self.upload_dir(upload_id).join(KEY_FILE))
            .await
            .map_err(|e| not_found_or_io(e, &format!("upload {upload_id}")))?;
        if recorded != key {
            return Err(StoreError::Service {
                status: 400,
                message: format!("upload {upload_id} belongs to {recorded}"),
            });
        }
        Ok(())
    }

    fn scan(root: &Path) -> Vec<ObjectSummary> {
        let mut objects: Vec<ObjectSummary> = WalkDir::new(root)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| e.depth() != 1 || e.file_name() != UPLOADS_DIR)
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|entry| {
                let metadata = entry.metadata().ok()?;
                let rel = entry.path().strip_prefix(root).ok()?;
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                let mtime = metadata
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_nanos())
                    .unwrap_or_default();
                Some(ObjectSummary {
                    key,
                    etag: format!("{:x}-{:x}", metadata.len(), mtime),
                    size: metadata.len(),
                })
            })
            .collect();
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        objects
    }
}

fn not_found_or_io(err: std::io::Error, what: &str) -> StoreError {
    if err.kind() == std::io::ErrorKind::NotFound {
        StoreError::NotFound(what.to_string())
    } else {
        StoreError::Io(err)
    }
}

async fn write_atomically(path: &Path, data: &[u8]) -> StoreResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
    fs::write(&tmp, data).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl ObjectStore for FsStore {
    async fn list_objects(
        &self,
        prefix: &str,
        continuation: Option<String>,
    ) -> StoreResult<ListPage> {
        let root = self.root.clone();
        let all = tokio::task::spawn_blocking(move || FsStore::scan(&root))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))?;

        let mut objects: Vec<ObjectSummary> = all
            .into_iter()
            .filter(|o| o.key.starts_with(prefix))
            .filter(|o| continuation.as_deref().map_or(true, |after| o.key.as_str() > after))
            .take(PAGE_SIZE + 1)
            .collect();
        let next = if objects.len() > PAGE_SIZE {
            objects.truncate(PAGE_SIZE);
            objects.last().map(|o| o.key.clone())
        } else {
            None
        };
        Ok(ListPage { objects, next })
    }

    async fn init_multipart(&self, key: &str) -> StoreResult<String> {
        self.object_path(key)?;
        let upload_id = Uuid::new_v4().to_string();
        let dir = self.upload_dir(&upload_id);
        fs::create_dir_all(&dir).await?;
        fs::write(dir.join(KEY_FILE), key).await?;
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> StoreResult<String> {
        self.check_upload(key, upload_id).await?;
        let etag = Uuid::new_v4().simple().to_string();
        write_atomically(&self.part_path(upload_id, part_number), &data).await?;
        fs::write(
            self.part_path(upload_id, part_number).with_extension("etag"),
            &etag,
        )
        .await?;
        Ok(etag)
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> StoreResult<()> {
        self.check_upload(key, upload_id).await?;
        let target = self.object_path(key)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = self.upload_dir(upload_id).join("assembled");
        let mut out = fs::File::create(&tmp).await?;
        for part in &parts {
            let path = self.part_path(upload_id, part.part_number);
            let etag = fs::read_to_string(path.with_extension("etag"))
                .await
                .unwrap_or_default();
            if etag != part.etag {
                return Err(StoreError::Service {
                    status: 400,
                    message: format!("invalid part {}", part.part_number),
                });
            }
            out.write_all(&fs::read(&path).await?).await?;
        }
        out.flush().await?;
        drop(out);
        fs::rename(&tmp, &target).await?;
        fs::remove_dir_all(self.upload_dir(upload_id)).await?;
        Ok(())
    }

    async fn abort_multipart(&self, _key: &str, upload_id: &str) -> StoreResult<()> {
        fs::remove_dir_all(self.upload_dir(upload_id))
            .await
            .map_err(|e| not_found_or_io(e, &format!("upload {upload_id}")))
    }

    async fn put_object(&self, key: &str, data: Bytes) -> StoreResult<()> {
        write_atomically(&self.object_path(key)?, &data).await
    }

    async fn get_object(&self, key: &str) -> StoreResult<ObjectReader> {
        let file = fs::File::open(self.object_path(key)?)
            .await
            .map_err(|e| not_found_or_io(e, key))?;
        Ok(Box::new(file))
    }

    async fn delete_objects(&self, keys: &[String]) -> StoreResult<DeleteOutcome> {
        let mut outcome = DeleteOutcome::default();
        for key in keys {
            match self.delete_object(key).await {
                Ok(()) => outcome.deleted.push(key.clone()),
                Err(e) if e.is_not_found() => outcome.not_found.push(key.clone()),
                Err(e) => {
                    tracing::warn!("Failed to delete {}: {}", key, e);
                    outcome.failed.push(key.clone());
                }
            }
        }
        Ok(outcome)
    }

    async fn delete_object(&self, key: &str) -> StoreResult<()> {
        fs::remove_file(self.object_path(key)?)
            .await
            .map_err(|e| not_found_or_io(e, key))
    }
}
