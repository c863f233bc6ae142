//! Blob handles for response bodies and side data
//!
//! A `BlobHandle` is a cheap, cloneable reference to a body. Handles created
//! by callers wrap in-memory bytes; handles produced by a query read lazily
//! from the stored entry and keep that entry open for as long as they live,
//! so they stay valid after the cache operation (or the cache) is gone.

use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use std::fmt;

use crate::backend::{BackendEntry, EntryHandle, StreamIndex};
use crate::error::CacheStorageError;

/// Default chunk size for streaming reads
pub const DEFAULT_CHUNK_SIZE: usize = crate::constants::DEFAULT_BODY_CHUNK_SIZE;

#[derive(Clone)]
enum BlobSource {
    Memory(Bytes),
    Entry {
        entry: EntryHandle,
        stream: StreamIndex,
    },
}

/// Readable body handle
#[derive(Clone)]
pub struct BlobHandle {
    source: BlobSource,
    size: u64,
}

impl fmt::Debug for BlobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match &self.source {
            BlobSource::Memory(_) => "memory".to_string(),
            BlobSource::Entry { entry, stream } => format!("entry({}, {:?})", entry.key(), stream),
        };
        f.debug_struct("BlobHandle")
            .field("source", &source)
            .field("size", &self.size)
            .finish()
    }
}

impl BlobHandle {
    /// Wrap in-memory bytes
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            size: data.len() as u64,
            source: BlobSource::Memory(data),
        }
    }

    /// Reference one stream of a stored entry
    pub(crate) fn from_entry(entry: EntryHandle, stream: StreamIndex, size: u64) -> Self {
        Self {
            source: BlobSource::Entry { entry, stream },
            size,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    async fn read_range(&self, offset: u64, len: usize) -> Result<Bytes, CacheStorageError> {
        match &self.source {
            BlobSource::Memory(data) => {
                let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
                let end = start.saturating_add(len).min(data.len());
                Ok(data.slice(start..end))
            }
            BlobSource::Entry { entry, stream } => {
                Ok(entry.read_data(*stream, offset, len).await?)
            }
        }
    }

    /// Stream the body in chunks of at most `chunk_size` bytes
    pub fn read_chunks(&self, chunk_size: usize) -> BoxStream<'static, Result<Bytes, CacheStorageError>> {
        let chunk_size = chunk_size.max(1);
        futures::stream::try_unfold((self.clone(), 0u64), move |(blob, offset)| async move {
            if offset >= blob.size {
                return Ok::<_, CacheStorageError>(None);
            }
            let chunk = blob.read_range(offset, chunk_size).await?;
            if chunk.is_empty() {
                return Err(CacheStorageError::storage(format!(
                    "blob truncated: expected {}, read {}",
                    blob.size, offset
                )));
            }
            let next = offset + chunk.len() as u64;
            Ok(Some((chunk, (blob, next))))
        })
        .boxed()
    }

    /// Read the whole body into memory
    pub async fn read_all(&self) -> Result<Bytes, CacheStorageError> {
        if let BlobSource::Memory(data) = &self.source {
            return Ok(data.clone());
        }
        let mut buf = BytesMut::with_capacity(usize::try_from(self.size).unwrap_or(0));
        let mut chunks = self.read_chunks(DEFAULT_CHUNK_SIZE);
        while let Some(chunk) = chunks.try_next().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }
}

/// Copy a blob into one stream of an entry, chunk by chunk.
/// Returns the number of bytes written.
pub(crate) async fn write_blob_to_entry(
    blob: &BlobHandle,
    entry: &dyn BackendEntry,
    stream: StreamIndex,
    chunk_size: usize,
) -> Result<u64, CacheStorageError> {
    let mut offset = 0u64;
    let mut chunks = blob.read_chunks(chunk_size);
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        let expected = chunk.len();
        let written = entry.write_data(stream, offset, chunk, false).await?;
        if written != expected {
            return Err(CacheStorageError::storage(format!(
                "short body write: expected {} bytes, wrote {}",
                expected, written
            )));
        }
        offset += written as u64;
    }
    if offset != blob.size() {
        return Err(CacheStorageError::storage(format!(
            "body truncated: expected {} bytes, read {}",
            blob.size(),
            offset
        )));
    }
    Ok(offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, DiskBackend, MemoryBackend};

    #[tokio::test]
    async fn test_memory_blob_read_all() {
        let blob = BlobHandle::from_bytes(Bytes::from("hello"));
        assert_eq!(blob.size(), 5);
        assert_eq!(blob.read_all().await.unwrap(), Bytes::from("hello"));
    }

    #[tokio::test]
    async fn test_read_chunks_splits_body() {
        let blob = BlobHandle::from_bytes(Bytes::from("abcdefg"));
        let chunks: Vec<Bytes> = blob.read_chunks(3).try_collect().await.unwrap();
        assert_eq!(
            chunks,
            vec![Bytes::from("abc"), Bytes::from("def"), Bytes::from("g")]
        );
    }

    #[tokio::test]
    async fn test_empty_blob_yields_no_chunks() {
        let blob = BlobHandle::from_bytes(Bytes::new());
        let chunks: Vec<Bytes> = blob.read_chunks(8).try_collect().await.unwrap();
        assert!(chunks.is_empty());
        assert!(blob.is_empty());
    }

    #[tokio::test]
    async fn test_write_blob_to_entry_in_chunks() {
        let backend = MemoryBackend::new();
        let entry = backend.create_entry("k").await.unwrap();
        let blob = BlobHandle::from_bytes(Bytes::from("streamed body"));

        let written = write_blob_to_entry(&blob, entry.as_ref(), StreamIndex::Body, 4)
            .await
            .unwrap();
        assert_eq!(written, 13);

        let stored = BlobHandle::from_entry(entry, StreamIndex::Body, written);
        assert_eq!(stored.read_all().await.unwrap(), Bytes::from("streamed body"));
    }

    #[tokio::test]
    async fn test_entry_blob_outlives_backend() {
        let backend = MemoryBackend::new();
        let entry = backend.create_entry("k").await.unwrap();
        entry
            .write_data(StreamIndex::Body, 0, Bytes::from("kept"), true)
            .await
            .unwrap();
        let blob = BlobHandle::from_entry(entry, StreamIndex::Body, 4);
        drop(backend);

        assert_eq!(blob.read_all().await.unwrap(), Bytes::from("kept"));
    }

    #[tokio::test]
    async fn test_read_all_fails_when_stream_is_shorter_than_size() {
        let backend = MemoryBackend::new();
        let entry = backend.create_entry("k").await.unwrap();
        entry
            .write_data(StreamIndex::Body, 0, Bytes::from("hello world"), true)
            .await
            .unwrap();
        let blob = BlobHandle::from_entry(entry.clone(), StreamIndex::Body, 11);
        entry
            .write_data(StreamIndex::Body, 0, Bytes::from("hello"), true)
            .await
            .unwrap();

        let err = blob.read_all().await.unwrap_err();
        assert_eq!(
            err,
            CacheStorageError::Storage("blob truncated: expected 11, read 5".to_string())
        );
    }

    #[tokio::test]
    async fn test_read_all_fails_when_stream_files_are_gone() {
        // Test: an entry-backed handle whose body file vanished reports an
        // error instead of an empty body
        let temp_dir = tempfile::TempDir::new().unwrap();
        let backend = DiskBackend::open(temp_dir.path()).await.unwrap();
        let entry = backend.create_entry("https://x/a").await.unwrap();
        entry
            .write_data(StreamIndex::Body, 0, Bytes::from("hello world"), true)
            .await
            .unwrap();
        let blob = BlobHandle::from_entry(entry, StreamIndex::Body, 11);

        for file in std::fs::read_dir(backend.entries_dir()).unwrap() {
            let path = file.unwrap().path();
            if path.extension().and_then(|e| e.to_str()) == Some("1") {
                std::fs::remove_file(path).unwrap();
            }
        }

        let err = blob.read_all().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Storage);
        assert!(err.to_string().contains("blob truncated: expected 11, read 0"));

        let chunks: Result<Vec<Bytes>, _> = blob.read_chunks(4).try_collect().await;
        assert!(chunks.is_err());
    }
}
