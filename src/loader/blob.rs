/*!
 * Blob Store
 * Module bodies published under revocable `blob:ntweb/<uuid>` urls
 */

use crate::core::limits::BLOB_URL_PREFIX;
use ahash::RandomState;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct BlobStore {
    blobs: Arc<DashMap<String, Bytes, RandomState>>,
}

impl BlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `data` and return its url
    pub fn publish(&self, data: Bytes) -> String {
        let url = format!("{}{}", BLOB_URL_PREFIX, Uuid::new_v4());
        self.blobs.insert(url.clone(), data);
        url
    }

    pub fn resolve(&self, url: &str) -> Option<Bytes> {
        self.blobs.get(url).map(|entry| entry.value().clone())
    }

    pub fn revoke(&self, url: &str) -> bool {
        self.blobs.remove(url).is_some()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}
