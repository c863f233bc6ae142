//! Query engine
//!
//! Resolves an optional request plus [`QueryParams`] into the matching
//! entries of a backend. What gets built for each match is chosen by a
//! [`QueryMode`] strategy:
//! - [`Requests`]: the stored requests only (Keys)
//! - [`RequestsAndResponses`]: request/response pairs with body handles (Match, MatchAll)
//! - [`CacheEntries`]: the open backend entries (Delete)
//!
//! Lookup uses the single-entry fast path when the request URL is compared
//! exactly; otherwise every entry is enumerated and filtered. Results keep
//! the backend's enumeration order.

use async_trait::async_trait;

use crate::backend::{read_stream, Backend, EntryHandle, StreamIndex};
use crate::blob::BlobHandle;
use crate::error::{BackendError, CacheStorageError};
use crate::key::{comparable_url, entry_key, is_valid_url};
use crate::metadata::CacheMetadata;
use crate::types::{find_header, FetchRequest, QueryParams, Response};

/// Strategy deciding what a query materializes per matching entry
#[async_trait]
pub trait QueryMode: Send + Sync {
    type Output: Send;

    async fn materialize(
        &self,
        entry: EntryHandle,
        metadata: CacheMetadata,
    ) -> Result<Self::Output, CacheStorageError>;
}

/// Materialize stored requests
pub struct Requests;

/// Materialize request/response pairs; bodies are lazy entry-backed blobs
pub struct RequestsAndResponses;

/// Materialize the open entries themselves
pub struct CacheEntries;

/// A matched request/response pair
#[derive(Debug, Clone)]
pub struct MatchedResponse {
    pub request: FetchRequest,
    pub response: Response,
}

/// A matched entry, still open
pub struct MatchedEntry {
    pub entry: EntryHandle,
    pub metadata: CacheMetadata,
}

#[async_trait]
impl QueryMode for Requests {
    type Output = FetchRequest;

    async fn materialize(
        &self,
        _entry: EntryHandle,
        metadata: CacheMetadata,
    ) -> Result<FetchRequest, CacheStorageError> {
        Ok(metadata.to_request())
    }
}

#[async_trait]
impl QueryMode for RequestsAndResponses {
    type Output = MatchedResponse;

    async fn materialize(
        &self,
        entry: EntryHandle,
        metadata: CacheMetadata,
    ) -> Result<MatchedResponse, CacheStorageError> {
        let mut response = metadata.to_response();

        let body_size = entry.data_size(StreamIndex::Body).await?;
        if body_size > 0 {
            response.body = Some(BlobHandle::from_entry(entry.clone(), StreamIndex::Body, body_size));
        }
        let side_data_size = entry.data_size(StreamIndex::SideData).await?;
        if side_data_size > 0 {
            response.side_data = Some(BlobHandle::from_entry(
                entry.clone(),
                StreamIndex::SideData,
                side_data_size,
            ));
        }

        Ok(MatchedResponse {
            request: metadata.to_request(),
            response,
        })
    }
}

#[async_trait]
impl QueryMode for CacheEntries {
    type Output = MatchedEntry;

    async fn materialize(
        &self,
        entry: EntryHandle,
        metadata: CacheMetadata,
    ) -> Result<MatchedEntry, CacheStorageError> {
        Ok(MatchedEntry { entry, metadata })
    }
}

/// Whether a stored entry satisfies `request` under `params`
pub fn request_matches(metadata: &CacheMetadata, request: &FetchRequest, params: &QueryParams) -> bool {
    if comparable_url(&metadata.url, params.ignore_search) != comparable_url(&request.url, params.ignore_search) {
        return false;
    }

    if !params.ignore_method && metadata.request.method != request.method {
        return false;
    }

    if !params.ignore_vary {
        let Some(vary_names) = metadata.vary_header_names() else {
            return false;
        };
        for name in vary_names {
            let stored = find_header(&metadata.request.headers, &name);
            if stored != request.header(&name) {
                return false;
            }
        }
    }

    true
}

struct Candidate {
    entry: EntryHandle,
    metadata: CacheMetadata,
}

/// Runs queries against one backend
pub struct QueryEngine<'a> {
    backend: &'a dyn Backend,
    max_query_size_bytes: u64,
}

impl<'a> QueryEngine<'a> {
    pub fn new(backend: &'a dyn Backend, max_query_size_bytes: u64) -> Self {
        Self {
            backend,
            max_query_size_bytes,
        }
    }

    /// Resolve matching entries. `None` matches every entry.
    pub async fn query<M: QueryMode>(
        &self,
        request: Option<&FetchRequest>,
        params: &QueryParams,
        mode: &M,
    ) -> Result<Vec<M::Output>, CacheStorageError> {
        if let Some(request) = request {
            if !params.ignore_method && !request.method.eq_ignore_ascii_case("GET") {
                return Ok(Vec::new());
            }
        }

        let candidates = match request {
            Some(request) if !params.ignore_search => self.open_exact(request).await?,
            _ => self.open_all().await?,
        };

        let matched: Vec<Candidate> = candidates
            .into_iter()
            .filter(|c| request.map_or(true, |r| request_matches(&c.metadata, r, params)))
            .collect();

        let mut total_size = 0u64;
        let mut results = Vec::with_capacity(matched.len());
        for candidate in matched {
            total_size = total_size.saturating_add(candidate.metadata.estimated_size());
            if total_size > self.max_query_size_bytes {
                tracing::warn!(
                    limit = self.max_query_size_bytes,
                    "Query result exceeds size limit"
                );
                return Err(CacheStorageError::QueryTooLarge);
            }
            results.push(mode.materialize(candidate.entry, candidate.metadata).await?);
        }

        tracing::trace!(matches = results.len(), "Query complete");
        Ok(results)
    }

    async fn open_exact(&self, request: &FetchRequest) -> Result<Vec<Candidate>, CacheStorageError> {
        let entry = match self.backend.open_entry(&entry_key(&request.url)).await {
            Ok(entry) => entry,
            Err(BackendError::EntryNotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(self.read_candidate(entry).await?.into_iter().collect())
    }

    async fn open_all(&self) -> Result<Vec<Candidate>, CacheStorageError> {
        let mut iter = self.backend.iter_entries().await?;
        let mut candidates = Vec::new();
        while let Some(entry) = iter.next_entry().await? {
            if let Some(candidate) = self.read_candidate(entry).await? {
                candidates.push(candidate);
            }
        }
        Ok(candidates)
    }

    /// Read and check an entry's metadata. Entries whose metadata cannot be
    /// decoded, or whose URL is malformed, are skipped.
    async fn read_candidate(&self, entry: EntryHandle) -> Result<Option<Candidate>, CacheStorageError> {
        let headers = read_stream(entry.as_ref(), StreamIndex::Headers).await?;
        let metadata = match CacheMetadata::decode(&headers) {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::warn!(key = entry.key(), error = %e, "Skipping entry with unreadable metadata");
                return Ok(None);
            }
        };
        if !is_valid_url(&metadata.url) {
            tracing::debug!(key = entry.key(), "Skipping entry with malformed URL");
            return Ok(None);
        }
        Ok(Some(Candidate { entry, metadata }))
    }
}
