//! Per-remote cache of manifest bodies keyed by ETag.
//!
//! Each remote owns one immutable segment. Updates build a new segment and
//! swap it in, so readers never see a half-updated map.

use super::ObjectSummary;
use crate::naming::META_SUFFIX;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedMeta {
    pub etag: String,
    /// Body, once it has been fetched for the current ETag.
    pub content: Option<String>,
}

type Segment = Arc<HashMap<String, CachedMeta>>;

#[derive(Default)]
pub struct MetaCache {
    segments: DashMap<String, Segment>,
}

impl MetaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a fresh listing of `prefix`: keep only `.meta` keys, drop keys
    /// under the prefix that vanished and forget bodies whose ETag changed.
    /// Keys outside the prefix are left alone.
    pub fn refresh(&self, remote: &str, prefix: &str, listing: &[ObjectSummary]) {
        let mut segment = self.segments.entry(remote.to_string()).or_default();
        let mut next: HashMap<String, CachedMeta> = segment
            .iter()
            .filter(|(key, _)| !key.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for obj in listing.iter().filter(|o| o.key.ends_with(META_SUFFIX)) {
            let content = segment
                .get(&obj.key)
                .filter(|cached| cached.etag == obj.etag)
                .and_then(|cached| cached.content.clone());
            next.insert(
                obj.key.clone(),
                CachedMeta {
                    etag: obj.etag.clone(),
                    content,
                },
            );
        }
        *segment = Arc::new(next);
    }

    pub fn get(&self, remote: &str, key: &str) -> Option<CachedMeta> {
        self.segments
            .get(remote)
            .and_then(|segment| segment.get(key).cloned())
    }

    /// Remember a fetched body. Ignored unless the key is already known,
    /// which means a listing has seen it.
    pub fn fill(&self, remote: &str, key: &str, content: String) {
        if let Some(mut segment) = self.segments.get_mut(remote) {
            if let Some(cached) = segment.get(key) {
                let etag = cached.etag.clone();
                let mut next = (**segment).clone();
                next.insert(
                    key.to_string(),
                    CachedMeta {
                        etag,
                        content: Some(content),
                    },
                );
                *segment = Arc::new(next);
            }
        }
    }

    pub fn evict(&self, remote: &str, keys: &[String]) {
        let deleted: HashSet<&str> = keys.iter().map(String::as_str).collect();
        if let Some(mut segment) = self.segments.get_mut(remote) {
            let next: HashMap<String, CachedMeta> = segment
                .iter()
                .filter(|(key, _)| !deleted.contains(key.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            *segment = Arc::new(next);
        }
    }

    pub fn drop_remote(&self, remote: &str) {
        self.segments.remove(remote);
    }

    pub fn len(&self, remote: &str) -> usize {
        self.segments.get(remote).map(|s| s.len()).unwrap_or(0)
    }
}
