//! In-memory entry backend

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use super::{apply_write, Backend, BackendEntry, EntryHandle, EntryIterator, StreamIndex};
use crate::error::BackendError;

type Index = RwLock<HashMap<String, Arc<MemoryEntry>>>;

/// Backend keeping all entries in process memory
pub struct MemoryBackend {
    index: Arc<Index>,
    next_seq: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            index: Arc::new(RwLock::new(HashMap::new())),
            next_seq: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> Vec<Arc<MemoryEntry>> {
        let mut entries: Vec<Arc<MemoryEntry>> = self.index.read().values().cloned().collect();
        entries.sort_by_key(|e| e.seq);
        entries
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// One in-memory entry with its three streams
pub struct MemoryEntry {
    key: String,
    seq: u64,
    streams: RwLock<[Vec<u8>; 3]>,
    index: Weak<Index>,
}

impl MemoryEntry {
    fn stored_bytes(&self) -> u64 {
        let streams = self.streams.read();
        streams.iter().map(|s| s.len() as u64).sum()
    }
}

#[async_trait]
impl BackendEntry for MemoryEntry {
    fn key(&self) -> &str {
        &self.key
    }

    async fn data_size(&self, stream: StreamIndex) -> Result<u64, BackendError> {
        Ok(self.streams.read()[stream.as_usize()].len() as u64)
    }

    async fn read_data(
        &self,
        stream: StreamIndex,
        offset: u64,
        len: usize,
    ) -> Result<Bytes, BackendError> {
        let streams = self.streams.read();
        let buf = &streams[stream.as_usize()];
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(buf.len());
        let end = start.saturating_add(len).min(buf.len());
        Ok(Bytes::copy_from_slice(&buf[start..end]))
    }

    async fn write_data(
        &self,
        stream: StreamIndex,
        offset: u64,
        data: Bytes,
        truncate: bool,
    ) -> Result<usize, BackendError> {
        let offset = usize::try_from(offset).map_err(|_| BackendError::Unavailable)?;
        let mut streams = self.streams.write();
        apply_write(&mut streams[stream.as_usize()], offset, &data, truncate);
        Ok(data.len())
    }

    async fn doom(&self) -> Result<(), BackendError> {
        if let Some(index) = self.index.upgrade() {
            let mut index = index.write();
            // Only forget the key if it still points at this entry
            if index.get(&self.key).map(|e| e.seq) == Some(self.seq) {
                index.remove(&self.key);
            }
        }
        Ok(())
    }
}

struct MemoryEntryIterator {
    entries: std::vec::IntoIter<Arc<MemoryEntry>>,
    index: Weak<Index>,
}

#[async_trait]
impl EntryIterator for MemoryEntryIterator {
    async fn next_entry(&mut self) -> Result<Option<EntryHandle>, BackendError> {
        let index = self.index.upgrade().ok_or(BackendError::Unavailable)?;
        for entry in self.entries.by_ref() {
            // Skip entries doomed since the snapshot was taken
            let live = index.read().get(&entry.key).map(|e| e.seq) == Some(entry.seq);
            if live {
                return Ok(Some(entry as EntryHandle));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn create_entry(&self, key: &str) -> Result<EntryHandle, BackendError> {
        let mut index = self.index.write();
        if index.contains_key(key) {
            return Err(BackendError::EntryExists(key.to_string()));
        }
        let entry = Arc::new(MemoryEntry {
            key: key.to_string(),
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            streams: RwLock::new([Vec::new(), Vec::new(), Vec::new()]),
            index: Arc::downgrade(&self.index),
        });
        index.insert(key.to_string(), entry.clone());
        Ok(entry)
    }

    async fn open_entry(&self, key: &str) -> Result<EntryHandle, BackendError> {
        self.index
            .read()
            .get(key)
            .cloned()
            .map(|e| e as EntryHandle)
            .ok_or_else(|| BackendError::EntryNotFound(key.to_string()))
    }

    async fn doom_entry(&self, key: &str) -> Result<(), BackendError> {
        self.index
            .write()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| BackendError::EntryNotFound(key.to_string()))
    }

    async fn iter_entries(&self) -> Result<Box<dyn EntryIterator>, BackendError> {
        Ok(Box::new(MemoryEntryIterator {
            entries: self.snapshot().into_iter(),
            index: Arc::downgrade(&self.index),
        }))
    }

    async fn calculate_size(&self) -> Result<u64, BackendError> {
        Ok(self.index.read().values().map(|e| e.stored_bytes()).sum())
    }

    async fn entry_count(&self) -> Result<u64, BackendError> {
        Ok(self.index.read().len() as u64)
    }
}
