//! Disk entry backend using tokio::fs
//!
//! Layout under the cache directory:
//!
//! ```text
//! entries/<stem>.meta   JSON record { key, seq }
//! entries/<stem>.0      headers stream
//! entries/<stem>.1      body stream
//! entries/<stem>.2      side data stream
//! ```
//!
//! `stem` is a short SHA-256 prefix of the key followed by the entry's
//! creation sequence number, so a replaced entry never shares files with its
//! successor. Dooming an entry deletes its `.meta` record right away; the
//! stream files go once the last open handle is dropped.
//!
//! Open handles are tracked per stem in a process-wide registry, so a handle
//! from one `DiskBackend` keeps its files alive when the same directory is
//! reopened and the entry is deleted or replaced through another instance.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::{Backend, BackendEntry, EntryHandle, EntryIterator, StreamIndex};
use crate::error::BackendError;

const META_EXTENSION: &str = "meta";
const TEMP_EXTENSION: &str = "tmp";

type Index = RwLock<HashMap<String, Arc<DiskEntry>>>;
type Registry = Mutex<HashMap<PathBuf, Weak<StemFiles>>>;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Persisted identity of an entry
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryRecord {
    key: String,
    seq: u64,
}

/// Backend persisting entries as files
pub struct DiskBackend {
    entries_dir: PathBuf,
    index: Arc<Index>,
    next_seq: AtomicU64,
}

/// Derive the file stem for an entry
fn entry_stem(key: &str, seq: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let hash = hex::encode(hasher.finalize());
    format!("{}-{:016x}", &hash[..16], seq)
}

/// Sequence number encoded in a file stem
fn stem_seq(stem: &str) -> Option<u64> {
    let (_, seq) = stem.rsplit_once('-')?;
    u64::from_str_radix(seq, 16).ok()
}

/// Write a file atomically (temp file + rename)
async fn write_file_atomic(path: &Path, data: &[u8]) -> Result<(), BackendError> {
    let temp_path = path.with_extension(TEMP_EXTENSION);
    tokio::fs::write(&temp_path, data).await?;
    tokio::fs::rename(&temp_path, path).await?;
    Ok(())
}

/// Remove a file, treating "already gone" as success
async fn remove_file_if_exists(path: &Path) -> Result<(), BackendError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn remove_stream_files(paths: &[PathBuf]) {
    for path in paths {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to remove doomed stream file"
                );
            }
        }
    }
}

/// Stream files of one stem, shared by every handle open on it
struct StemFiles {
    dir: PathBuf,
    stem: String,
    doomed: AtomicBool,
}

impl StemFiles {
    fn registry_key(dir: &Path, stem: &str) -> PathBuf {
        dir.join(stem)
    }

    fn new(dir: &Path, stem: String) -> Arc<Self> {
        Arc::new(Self {
            dir: dir.to_path_buf(),
            stem,
            doomed: AtomicBool::new(false),
        })
    }

    /// Join the live files for `stem`, registering them if nobody holds them
    fn shared(dir: &Path, stem: String) -> Arc<Self> {
        let mut registry = registry().lock();
        let slot = registry
            .entry(Self::registry_key(dir, &stem))
            .or_insert_with(Weak::new);
        if let Some(files) = slot.upgrade() {
            return files;
        }
        let files = Self::new(dir, stem);
        *slot = Arc::downgrade(&files);
        files
    }

    /// Register files for a new stem; `None` if the stem is still held open
    fn claim(dir: &Path, stem: String) -> Option<Arc<Self>> {
        let mut registry = registry().lock();
        let slot = registry
            .entry(Self::registry_key(dir, &stem))
            .or_insert_with(Weak::new);
        if slot.strong_count() > 0 {
            return None;
        }
        let files = Self::new(dir, stem);
        *slot = Arc::downgrade(&files);
        Some(files)
    }

    fn live(dir: &Path, stem: &str) -> Option<Arc<Self>> {
        registry()
            .lock()
            .get(&Self::registry_key(dir, stem))
            .and_then(Weak::upgrade)
    }

    fn is_doomed(&self) -> bool {
        self.doomed.load(Ordering::SeqCst)
    }

    fn stream_path(&self, stream: StreamIndex) -> PathBuf {
        self.dir.join(format!("{}.{}", self.stem, stream.as_usize()))
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join(format!("{}.{}", self.stem, META_EXTENSION))
    }
}

impl Drop for StemFiles {
    fn drop(&mut self) {
        {
            let mut registry = registry().lock();
            let key = Self::registry_key(&self.dir, &self.stem);
            if registry.get(&key).map_or(false, |w| w.strong_count() == 0) {
                registry.remove(&key);
            }
        }

        if !self.is_doomed() {
            return;
        }
        let paths: Vec<PathBuf> = StreamIndex::ALL
            .iter()
            .map(|stream| self.stream_path(*stream))
            .collect();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || remove_stream_files(&paths));
            }
            Err(_) => remove_stream_files(&paths),
        }
    }
}

impl DiskBackend {
    /// Open the cache directory, creating it if needed, and rebuild the index
    /// from the `.meta` records found there.
    pub async fn open(cache_dir: impl AsRef<Path>) -> Result<Self, BackendError> {
        let entries_dir = cache_dir.as_ref().join("entries");
        tokio::fs::create_dir_all(&entries_dir).await?;
        let entries_dir = tokio::fs::canonicalize(&entries_dir).await?;

        let mut records: HashMap<String, EntryRecord> = HashMap::new();
        let mut stale_stems: Vec<String> = Vec::new();
        let mut stream_stems: HashSet<String> = HashSet::new();

        let mut dir = tokio::fs::read_dir(&entries_dir).await?;
        while let Some(file) = dir.next_entry().await? {
            let path = file.path();
            let (Some(stem), Some(ext)) = (
                path.file_stem().and_then(|s| s.to_str()).map(str::to_string),
                path.extension().and_then(|s| s.to_str()).map(str::to_string),
            ) else {
                continue;
            };

            match ext.as_str() {
                META_EXTENSION => {
                    let data = tokio::fs::read(&path).await?;
                    let record: EntryRecord = match serde_json::from_slice(&data) {
                        Ok(record) => record,
                        Err(e) => {
                            tracing::warn!(
                                path = %path.display(),
                                error = %e,
                                "Discarding unreadable entry record"
                            );
                            stale_stems.push(stem);
                            continue;
                        }
                    };
                    // Keep the newest record per key; older ones were mid-replacement
                    match records.get(&record.key) {
                        Some(existing) if existing.seq > record.seq => {
                            stale_stems.push(entry_stem(&record.key, record.seq));
                        }
                        Some(existing) => {
                            stale_stems.push(entry_stem(&existing.key, existing.seq));
                            records.insert(record.key.clone(), record);
                        }
                        None => {
                            records.insert(record.key.clone(), record);
                        }
                    }
                }
                TEMP_EXTENSION => {
                    remove_file_if_exists(&path).await?;
                }
                _ => {
                    stream_stems.insert(stem);
                }
            }
        }

        // Never reuse a sequence number whose files may still be on disk
        let next_seq = records
            .values()
            .map(|r| r.seq)
            .chain(stream_stems.iter().filter_map(|s| stem_seq(s)))
            .chain(stale_stems.iter().filter_map(|s| stem_seq(s)))
            .map(|seq| seq + 1)
            .max()
            .unwrap_or(0);

        let backend = Self {
            entries_dir,
            index: Arc::new(RwLock::new(HashMap::new())),
            next_seq: AtomicU64::new(next_seq),
        };

        for stem in &stale_stems {
            remove_file_if_exists(&backend.entries_dir.join(format!("{}.{}", stem, META_EXTENSION)))
                .await?;
        }

        let live_stems: HashSet<String> = records
            .values()
            .map(|r| entry_stem(&r.key, r.seq))
            .collect();
        let mut orphans = 0;
        for stem in stream_stems.iter().filter(|s| !live_stems.contains(*s)) {
            if let Some(files) = StemFiles::live(&backend.entries_dir, stem) {
                // Held open elsewhere; goes with its last handle
                files.doomed.store(true, Ordering::SeqCst);
                continue;
            }
            orphans += 1;
            for stream in StreamIndex::ALL {
                remove_file_if_exists(&backend.entries_dir.join(format!("{}.{}", stem, stream.as_usize())))
                    .await?;
            }
        }

        {
            let mut index = backend.index.write();
            for record in records.into_values() {
                let files = StemFiles::shared(&backend.entries_dir, entry_stem(&record.key, record.seq));
                let entry = backend.new_entry(record.key.clone(), record.seq, files);
                index.insert(record.key, entry);
            }
        }

        tracing::debug!(
            entries_dir = %backend.entries_dir.display(),
            entries = backend.index.read().len(),
            discarded = stale_stems.len(),
            orphans,
            "Opened disk cache backend"
        );

        Ok(backend)
    }

    pub fn entries_dir(&self) -> &Path {
        &self.entries_dir
    }

    fn new_entry(&self, key: String, seq: u64, files: Arc<StemFiles>) -> Arc<DiskEntry> {
        Arc::new(DiskEntry {
            key,
            seq,
            files,
            index: Arc::downgrade(&self.index),
        })
    }

    fn snapshot(&self) -> Vec<Arc<DiskEntry>> {
        let mut entries: Vec<Arc<DiskEntry>> = self.index.read().values().cloned().collect();
        entries.sort_by_key(|e| e.seq);
        entries
    }
}

/// One entry persisted under the entries directory
pub struct DiskEntry {
    key: String,
    seq: u64,
    files: Arc<StemFiles>,
    index: Weak<Index>,
}

impl DiskEntry {
    fn stream_path(&self, stream: StreamIndex) -> PathBuf {
        self.files.stream_path(stream)
    }

    fn meta_path(&self) -> PathBuf {
        self.files.meta_path()
    }

    async fn mark_doomed(&self) -> Result<(), BackendError> {
        if !self.files.doomed.swap(true, Ordering::SeqCst) {
            remove_file_if_exists(&self.meta_path()).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl BackendEntry for DiskEntry {
    fn key(&self) -> &str {
        &self.key
    }

    async fn data_size(&self, stream: StreamIndex) -> Result<u64, BackendError> {
        match tokio::fs::metadata(self.stream_path(stream)).await {
            Ok(metadata) => Ok(metadata.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_data(
        &self,
        stream: StreamIndex,
        offset: u64,
        len: usize,
    ) -> Result<Bytes, BackendError> {
        let mut file = match tokio::fs::File::open(self.stream_path(stream)).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Bytes::new()),
            Err(e) => return Err(e.into()),
        };
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn write_data(
        &self,
        stream: StreamIndex,
        offset: u64,
        data: Bytes,
        truncate: bool,
    ) -> Result<usize, BackendError> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(self.stream_path(stream))
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(&data).await?;
        if truncate {
            file.set_len(offset + data.len() as u64).await?;
        }
        file.flush().await?;
        Ok(data.len())
    }

    async fn doom(&self) -> Result<(), BackendError> {
        let removed = match self.index.upgrade() {
            Some(index) => {
                let mut index = index.write();
                if index.get(&self.key).map(|e| e.seq) == Some(self.seq) {
                    index.remove(&self.key)
                } else {
                    None
                }
            }
            None => None,
        };
        self.mark_doomed().await?;
        drop(removed);
        Ok(())
    }
}

struct DiskEntryIterator {
    entries: std::vec::IntoIter<Arc<DiskEntry>>,
}

#[async_trait]
impl EntryIterator for DiskEntryIterator {
    async fn next_entry(&mut self) -> Result<Option<EntryHandle>, BackendError> {
        for entry in self.entries.by_ref() {
            if !entry.files.is_doomed() {
                return Ok(Some(entry as EntryHandle));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Backend for DiskBackend {
    async fn create_entry(&self, key: &str) -> Result<EntryHandle, BackendError> {
        if self.index.read().contains_key(key) {
            return Err(BackendError::EntryExists(key.to_string()));
        }
        let (seq, files) = loop {
            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
            if let Some(files) = StemFiles::claim(&self.entries_dir, entry_stem(key, seq)) {
                break (seq, files);
            }
        };
        let entry = self.new_entry(key.to_string(), seq, files);

        let record = EntryRecord {
            key: key.to_string(),
            seq,
        };
        write_file_atomic(&entry.meta_path(), &serde_json::to_vec(&record)?).await?;

        let lost_race = {
            let mut index = self.index.write();
            if index.contains_key(key) {
                true
            } else {
                index.insert(key.to_string(), entry.clone());
                false
            }
        };
        if lost_race {
            // Another creator won; leave no files behind
            entry.files.doomed.store(true, Ordering::SeqCst);
            if let Err(e) = remove_file_if_exists(&entry.meta_path()).await {
                tracing::warn!(key = %key, error = %e, "Failed to remove abandoned entry record");
            }
            return Err(BackendError::EntryExists(key.to_string()));
        }
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
        let entry = self
            .index
            .write()
            .remove(key)
            .ok_or_else(|| BackendError::EntryNotFound(key.to_string()))?;
        entry.mark_doomed().await
    }

    async fn iter_entries(&self) -> Result<Box<dyn EntryIterator>, BackendError> {
        Ok(Box::new(DiskEntryIterator {
            entries: self.snapshot().into_iter(),
        }))
    }

    async fn calculate_size(&self) -> Result<u64, BackendError> {
        let mut total = 0;
        for entry in self.snapshot() {
            for stream in StreamIndex::ALL {
                total += entry.data_size(stream).await?;
            }
        }
        Ok(total)
    }

    async fn entry_count(&self) -> Result<u64, BackendError> {
        Ok(self.index.read().len() as u64)
    }
}
