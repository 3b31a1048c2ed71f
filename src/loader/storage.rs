/*!
 * Module Storage
 * Byte source the loader resolves candidate paths against
 */

use super::search::normalize_path;
use super::types::{LoaderError, LoaderResult};
use ahash::RandomState;
use bytes::Bytes;
use dashmap::DashMap;
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Storage backend
///
/// The on-disk adapter lives outside the kernel; anything that can open a
/// path and hand back a readable, sized file plugs in here.
pub trait Storage: Send + Sync {
    /// Open a file for reading
    fn open(&self, path: &str) -> LoaderResult<Box<dyn StorageFile>>;

    /// Backend name for logs
    fn name(&self) -> &str;
}

/// Open file handle; closed when dropped
pub trait StorageFile: Read + Send {
    fn size(&self) -> LoaderResult<u64>;
}

/// Volatile storage keyed by normalized path
#[derive(Debug, Clone, Default)]
pub struct MemStorage {
    files: Arc<DashMap<String, Bytes, RandomState>>,
    opens: Arc<AtomicUsize>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: &str, data: impl Into<Bytes>) {
        self.files.insert(normalize_path(path), data.into());
    }

    pub fn remove(&self, path: &str) -> bool {
        self.files.remove(&normalize_path(path)).is_some()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(&normalize_path(path))
    }

    /// Successful opens so far
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl Storage for MemStorage {
    fn open(&self, path: &str) -> LoaderResult<Box<dyn StorageFile>> {
        let data = self
            .files
            .get(&normalize_path(path))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| LoaderError::NotFound(path.to_string()))?;
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemFile {
            cursor: Cursor::new(data),
        }))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

struct MemFile {
    cursor: Cursor<Bytes>,
}

impl Read for MemFile {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl StorageFile for MemFile {
    fn size(&self) -> LoaderResult<u64> {
        Ok(self.cursor.get_ref().len() as u64)
    }
}
