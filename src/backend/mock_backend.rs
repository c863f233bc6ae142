//! Failure-injecting backend for testing (wraps MemoryBackend)

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::{
    Backend, BackendEntry, BackendFactory, EntryHandle, EntryIterator, MemoryBackend, StreamIndex,
};
use crate::error::BackendError;

/// Failure switches shared between a backend and the entries it hands out
#[derive(Default)]
pub struct Faults {
    fail_create: RwLock<bool>,
    fail_doom: RwLock<bool>,
    fail_iterate: RwLock<bool>,
    fail_size: RwLock<bool>,
    fail_writes: RwLock<HashSet<StreamIndex>>,
    short_writes: RwLock<HashSet<StreamIndex>>,
}

impl Faults {
    fn io_error(what: &str) -> BackendError {
        BackendError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("Simulated {} failure", what),
        ))
    }
}

/// Backend that fails on demand
#[derive(Clone)]
pub struct FailingBackend {
    inner: Arc<MemoryBackend>,
    faults: Arc<Faults>,
}

impl FailingBackend {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryBackend::new()),
            faults: Arc::new(Faults::default()),
        }
    }

    pub fn set_fail_create(&self, enabled: bool) {
        *self.faults.fail_create.write() = enabled;
    }

    pub fn set_fail_doom(&self, enabled: bool) {
        *self.faults.fail_doom.write() = enabled;
    }

    pub fn set_fail_iterate(&self, enabled: bool) {
        *self.faults.fail_iterate.write() = enabled;
    }

    pub fn set_fail_size(&self, enabled: bool) {
        *self.faults.fail_size.write() = enabled;
    }

    pub fn set_fail_writes(&self, stream: StreamIndex, enabled: bool) {
        let mut set = self.faults.fail_writes.write();
        if enabled {
            set.insert(stream);
        } else {
            set.remove(&stream);
        }
    }

    pub fn set_short_writes(&self, stream: StreamIndex, enabled: bool) {
        let mut set = self.faults.short_writes.write();
        if enabled {
            set.insert(stream);
        } else {
            set.remove(&stream);
        }
    }

    fn wrap(&self, entry: EntryHandle) -> EntryHandle {
        Arc::new(FailingEntry {
            inner: entry,
            faults: self.faults.clone(),
        })
    }
}

struct FailingEntry {
    inner: EntryHandle,
    faults: Arc<Faults>,
}

#[async_trait]
impl BackendEntry for FailingEntry {
    fn key(&self) -> &str {
        self.inner.key()
    }

    async fn data_size(&self, stream: StreamIndex) -> Result<u64, BackendError> {
        self.inner.data_size(stream).await
    }

    async fn read_data(
        &self,
        stream: StreamIndex,
        offset: u64,
        len: usize,
    ) -> Result<Bytes, BackendError> {
        self.inner.read_data(stream, offset, len).await
    }

    async fn write_data(
        &self,
        stream: StreamIndex,
        offset: u64,
        data: Bytes,
        truncate: bool,
    ) -> Result<usize, BackendError> {
        if self.faults.fail_writes.read().contains(&stream) {
            return Err(Faults::io_error("write"));
        }
        if self.faults.short_writes.read().contains(&stream) && !data.is_empty() {
            let half = data.slice(..data.len() / 2);
            return self.inner.write_data(stream, offset, half, truncate).await;
        }
        self.inner.write_data(stream, offset, data, truncate).await
    }

    async fn doom(&self) -> Result<(), BackendError> {
        if *self.faults.fail_doom.read() {
            return Err(Faults::io_error("doom"));
        }
        self.inner.doom().await
    }
}

struct FailingIterator {
    inner: Box<dyn EntryIterator>,
    backend: FailingBackend,
}

#[async_trait]
impl EntryIterator for FailingIterator {
    async fn next_entry(&mut self) -> Result<Option<EntryHandle>, BackendError> {
        if *self.backend.faults.fail_iterate.read() {
            return Err(Faults::io_error("iterate"));
        }
        Ok(self.inner.next_entry().await?.map(|e| self.backend.wrap(e)))
    }
}

#[async_trait]
impl Backend for FailingBackend {
    async fn create_entry(&self, key: &str) -> Result<EntryHandle, BackendError> {
        if *self.faults.fail_create.read() {
            return Err(Faults::io_error("create"));
        }
        let entry = self.inner.create_entry(key).await?;
        Ok(self.wrap(entry))
    }

    async fn open_entry(&self, key: &str) -> Result<EntryHandle, BackendError> {
        let entry = self.inner.open_entry(key).await?;
        Ok(self.wrap(entry))
    }

    async fn doom_entry(&self, key: &str) -> Result<(), BackendError> {
        if *self.faults.fail_doom.read() {
            return Err(Faults::io_error("doom"));
        }
        self.inner.doom_entry(key).await
    }

    async fn iter_entries(&self) -> Result<Box<dyn EntryIterator>, BackendError> {
        if *self.faults.fail_iterate.read() {
            return Err(Faults::io_error("iterate"));
        }
        Ok(Box::new(FailingIterator {
            inner: self.inner.iter_entries().await?,
            backend: self.clone(),
        }))
    }

    async fn calculate_size(&self) -> Result<u64, BackendError> {
        if *self.faults.fail_size.read() {
            return Err(Faults::io_error("size"));
        }
        self.inner.calculate_size().await
    }

    async fn entry_count(&self) -> Result<u64, BackendError> {
        self.inner.entry_count().await
    }
}

/// Factory handing out clones of one shared `FailingBackend`
#[derive(Clone)]
pub struct FailingBackendFactory {
    pub backend: FailingBackend,
    fail_open: Arc<RwLock<bool>>,
    pub creations: Arc<AtomicUsize>,
}

impl FailingBackendFactory {
    pub fn new() -> Self {
        Self {
            backend: FailingBackend::new(),
            fail_open: Arc::new(RwLock::new(false)),
            creations: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make backend creation itself fail
    pub fn set_fail_open(&self, enabled: bool) {
        *self.fail_open.write() = enabled;
    }
}

#[async_trait]
impl BackendFactory for FailingBackendFactory {
    async fn create_backend(&self) -> Result<Box<dyn Backend>, BackendError> {
        self.creations.fetch_add(1, Ordering::SeqCst);
        // Yield so concurrent callers really do overlap with creation
        tokio::task::yield_now().await;
        if *self.fail_open.read() {
            return Err(BackendError::Unavailable);
        }
        Ok(Box::new(self.backend.clone()))
    }
}
