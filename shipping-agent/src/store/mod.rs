//! Object store capability and its implementations.
//!
//! The wire client for a real S3/OBS endpoint lives outside this crate; it
//! only has to implement [`ObjectStore`]. Two local implementations are
//! provided: an in-memory store (tests, fault injection) and a directory
//! backed store used by the command line tools.

pub mod backup;
pub mod cache;
pub mod fs;
pub mod memory;

pub use backup::{BackupStore, DeleteReport};
pub use cache::{CachedMeta, MetaCache};
pub use fs::FsStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::AsyncRead;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    /// Error response returned by the remote service.
    #[error("Service error ({status}): {message}")]
    Service { status: u16, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
            || matches!(self, StoreError::Service { status: 404, .. })
    }

    pub fn is_service_error(&self) -> bool {
        matches!(self, StoreError::Service { .. })
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub etag: String,
    pub size: u64,
}

/// One page of a listing; `next` is the continuation token, if any.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectSummary>,
    pub next: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Result of a bulk delete call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub deleted: Vec<String>,
    pub not_found: Vec<String>,
    pub failed: Vec<String>,
}

pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list_objects(&self, prefix: &str, continuation: Option<String>)
        -> StoreResult<ListPage>;

    /// Returns the upload id.
    async fn init_multipart(&self, key: &str) -> StoreResult<String>;

    /// Returns the ETag of the uploaded part. Part numbers start at 1.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> StoreResult<String>;

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> StoreResult<()>;

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> StoreResult<()>;

    async fn put_object(&self, key: &str, data: Bytes) -> StoreResult<()>;

    async fn get_object(&self, key: &str) -> StoreResult<ObjectReader>;

    async fn delete_objects(&self, keys: &[String]) -> StoreResult<DeleteOutcome>;

    async fn delete_object(&self, key: &str) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        assert!(StoreError::NotFound("k".into()).is_not_found());
        assert!(StoreError::Service {
            status: 404,
            message: "NoSuchUpload".into()
        }
        .is_not_found());
        assert!(!StoreError::Service {
            status: 500,
            message: "boom".into()
        }
        .is_not_found());
        assert!(!StoreError::Unsupported("bulk".into()).is_service_error());
    }
}
