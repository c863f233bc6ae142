//! Entry backend abstraction
//!
//! The cache engine stores every request/response pair as one backend entry
//! addressed by a string key. Each entry carries three independent byte
//! streams (see [`StreamIndex`]). Two backends are provided:
//! - **memory** ([`MemoryBackend`]): entries live in process memory
//! - **disk** ([`DiskBackend`]): one file per stream under a cache directory
//!
//! Entries handed out by a backend stay readable after they are doomed; the
//! backend only forgets the key. Storage is reclaimed once the last handle
//! drops.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::BackendError;

pub use self::disk::DiskBackend;
pub use self::memory::MemoryBackend;

mod disk;
mod memory;

#[cfg(test)]
pub(crate) mod mock_backend;

/// The three streams of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamIndex {
    /// Serialized request/response metadata
    Headers = 0,
    /// Response body bytes
    Body = 1,
    /// Auxiliary payload such as a code cache
    SideData = 2,
}

impl StreamIndex {
    pub const ALL: [StreamIndex; 3] = [StreamIndex::Headers, StreamIndex::Body, StreamIndex::SideData];

    pub fn as_usize(self) -> usize {
        self as usize
    }
}

/// An open entry
#[async_trait]
pub trait BackendEntry: Send + Sync {
    /// Key the entry was created with
    fn key(&self) -> &str;

    /// Current length of a stream in bytes
    async fn data_size(&self, stream: StreamIndex) -> Result<u64, BackendError>;

    /// Read up to `len` bytes starting at `offset`; short reads mean end of stream
    async fn read_data(
        &self,
        stream: StreamIndex,
        offset: u64,
        len: usize,
    ) -> Result<Bytes, BackendError>;

    /// Write `data` at `offset`, optionally truncating the stream after it.
    /// Returns the number of bytes written.
    async fn write_data(
        &self,
        stream: StreamIndex,
        offset: u64,
        data: Bytes,
        truncate: bool,
    ) -> Result<usize, BackendError>;

    /// Remove this entry from the backend index
    async fn doom(&self) -> Result<(), BackendError>;
}

/// Shared handle to an open entry
pub type EntryHandle = Arc<dyn BackendEntry>;

/// Enumerates entries in creation order
#[async_trait]
pub trait EntryIterator: Send {
    async fn next_entry(&mut self) -> Result<Option<EntryHandle>, BackendError>;
}

/// Key-addressed entry store
#[async_trait]
pub trait Backend: Send + Sync {
    /// Create a fresh entry; fails with `EntryExists` if the key is taken
    async fn create_entry(&self, key: &str) -> Result<EntryHandle, BackendError>;

    /// Open an existing entry; fails with `EntryNotFound` if absent
    async fn open_entry(&self, key: &str) -> Result<EntryHandle, BackendError>;

    /// Remove an entry by key; fails with `EntryNotFound` if absent
    async fn doom_entry(&self, key: &str) -> Result<(), BackendError>;

    /// Iterate all live entries, oldest first
    async fn iter_entries(&self) -> Result<Box<dyn EntryIterator>, BackendError>;

    /// Total bytes held by live entries
    async fn calculate_size(&self) -> Result<u64, BackendError>;

    /// Number of live entries
    async fn entry_count(&self) -> Result<u64, BackendError>;
}

/// Creates the backend for a cache on its first operation
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn create_backend(&self) -> Result<Box<dyn Backend>, BackendError>;
}

/// Produces an empty [`MemoryBackend`]
#[derive(Debug, Default, Clone)]
pub struct MemoryBackendFactory;

#[async_trait]
impl BackendFactory for MemoryBackendFactory {
    async fn create_backend(&self) -> Result<Box<dyn Backend>, BackendError> {
        Ok(Box::new(MemoryBackend::new()))
    }
}

/// Opens (or creates) a [`DiskBackend`] rooted at `path`
#[derive(Debug, Clone)]
pub struct DiskBackendFactory {
    pub path: PathBuf,
}

impl DiskBackendFactory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl BackendFactory for DiskBackendFactory {
    async fn create_backend(&self) -> Result<Box<dyn Backend>, BackendError> {
        Ok(Box::new(DiskBackend::open(&self.path).await?))
    }
}

/// Read a whole stream into memory
pub async fn read_stream(entry: &dyn BackendEntry, stream: StreamIndex) -> Result<Bytes, BackendError> {
    let size = entry.data_size(stream).await?;
    if size == 0 {
        return Ok(Bytes::new());
    }
    let len = usize::try_from(size).map_err(|_| BackendError::Unavailable)?;
    entry.read_data(stream, 0, len).await
}

/// Write a whole buffer to a stream, replacing previous content.
/// A short write is an error.
pub async fn write_stream(
    entry: &dyn BackendEntry,
    stream: StreamIndex,
    data: Bytes,
) -> Result<(), BackendError> {
    let expected = data.len();
    let written = entry.write_data(stream, 0, data, true).await?;
    if written != expected {
        return Err(BackendError::ShortWrite { expected, written });
    }
    Ok(())
}

/// Apply a positional write to an in-memory stream buffer
pub(crate) fn apply_write(buf: &mut Vec<u8>, offset: usize, data: &[u8], truncate: bool) {
    let end = offset + data.len();
    if buf.len() < end {
        buf.resize(end, 0);
    }
    buf[offset..end].copy_from_slice(data);
    if truncate {
        buf.truncate(end);
    }
}
