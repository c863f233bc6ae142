//! Batch executor
//!
//! Applies Put and Delete batches and side-data writes to an open backend.
//! A batch is either any number of puts or exactly one delete.
//!
//! Puts are not transactional: when one put of a batch fails, the puts that
//! already succeeded stay in place and the batch reports the failure.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;

use crate::backend::{read_stream, write_stream, Backend, EntryHandle, StreamIndex};
use crate::blob::write_blob_to_entry;
use crate::error::{BackendError, CacheStorageError};
use crate::key::{entry_key, is_valid_url};
use crate::metadata::CacheMetadata;
use crate::query::{CacheEntries, QueryEngine};
use crate::quota::QuotaManager;
use crate::types::{BatchOperation, FetchRequest, QueryParams, Response};

/// Everything a batch needs from its cache
pub(crate) struct BatchContext<'a> {
    pub backend: &'a dyn Backend,
    pub quota: &'a dyn QuotaManager,
    pub origin: &'a str,
    pub max_query_size_bytes: u64,
    pub body_chunk_size: usize,
}

/// A validated batch
#[derive(Debug)]
pub(crate) enum ValidatedBatch {
    Put(Vec<(FetchRequest, Response)>),
    Delete(FetchRequest, QueryParams),
}

/// Check the shape of a batch: non-empty, a single operation type, at most
/// one delete, and absolute URLs for every put
pub(crate) fn validate_batch(operations: Vec<BatchOperation>) -> Result<ValidatedBatch, CacheStorageError> {
    if operations.is_empty() {
        return Err(CacheStorageError::Invalid("empty batch".to_string()));
    }
    let put_count = operations.iter().filter(|op| op.is_put()).count();
    if put_count != 0 && put_count != operations.len() {
        return Err(CacheStorageError::Invalid("batch mixes put and delete".to_string()));
    }
    if put_count == 0 {
        if operations.len() > 1 {
            return Err(CacheStorageError::Invalid("batch holds more than one delete".to_string()));
        }
        return match operations.into_iter().next() {
            Some(BatchOperation::Delete { request, params }) => Ok(ValidatedBatch::Delete(request, params)),
            _ => Err(CacheStorageError::Invalid("empty batch".to_string())),
        };
    }

    let mut puts = Vec::with_capacity(put_count);
    for op in operations {
        if let BatchOperation::Put { request, response } = op {
            if !is_valid_url(&request.url) {
                return Err(CacheStorageError::Invalid(format!("invalid URL: {}", request.url)));
            }
            puts.push((request, response));
        }
    }
    Ok(ValidatedBatch::Put(puts))
}

impl<'a> BatchContext<'a> {
    /// Run a validated batch
    pub async fn execute(&self, batch: ValidatedBatch) -> Result<(), CacheStorageError> {
        match batch {
            ValidatedBatch::Put(puts) => self.put_all(puts).await,
            ValidatedBatch::Delete(request, params) => self.delete(&request, &params).await,
        }
    }

    async fn check_quota(&self, space_required: u64) -> Result<(), CacheStorageError> {
        let usage_and_quota = self.quota.get_usage_and_quota(self.origin).await?;
        if !usage_and_quota.allows(space_required) {
            tracing::warn!(
                origin = self.origin,
                space_required = space_required,
                usage = usage_and_quota.usage,
                quota = usage_and_quota.quota,
                "Quota exceeded"
            );
            return Err(CacheStorageError::QuotaExceeded);
        }
        Ok(())
    }

    /// Write every put; the quota is checked once for the whole batch before
    /// any entry is touched. All puts are attempted and the first failure is
    /// reported.
    async fn put_all(&self, puts: Vec<(FetchRequest, Response)>) -> Result<(), CacheStorageError> {
        let space_required = puts
            .iter()
            .fold(0u64, |total, (_, response)| total.saturating_add(response.body_size()));
        self.check_quota(space_required).await?;

        let mut first_error = None;
        for (request, response) in puts {
            let url = request.url.clone();
            match PutOperation::new(self, request, response).run().await {
                Ok(()) => tracing::debug!(url = %url, "Put complete"),
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn delete(&self, request: &FetchRequest, params: &QueryParams) -> Result<(), CacheStorageError> {
        let engine = QueryEngine::new(self.backend, self.max_query_size_bytes);
        let matches = engine.query(Some(request), params, &CacheEntries).await?;
        if matches.is_empty() {
            return Err(CacheStorageError::NotFound);
        }

        let count = matches.len();
        for matched in matches {
            if let Err(e) = matched.entry.doom().await {
                tracing::warn!(key = matched.entry.key(), error = %e, "Failed to doom matched entry");
            }
        }
        tracing::debug!(url = %request.url, removed = count, "Delete complete");
        Ok(())
    }

    /// Replace the side data of the entry stored for `url`, provided it still
    /// holds the response received at `expected_response_time`
    pub async fn write_side_data(
        &self,
        url: &str,
        expected_response_time: DateTime<Utc>,
        data: Bytes,
    ) -> Result<(), CacheStorageError> {
        self.check_quota(data.len() as u64).await?;

        let entry = self.backend.open_entry(&entry_key(url)).await?;
        let headers = read_stream(entry.as_ref(), StreamIndex::Headers).await?;
        let metadata = CacheMetadata::decode(&headers)?;
        if metadata.response.response_time != expected_response_time {
            tracing::debug!(
                url = url,
                stored = %metadata.response.response_time,
                expected = %expected_response_time,
                "Side data is stale"
            );
            return Err(CacheStorageError::NotFound);
        }

        if let Err(e) = write_stream(entry.as_ref(), StreamIndex::SideData, data).await {
            tracing::warn!(url = url, error = %e, "Side data write failed; dooming entry");
            doom_quietly(&entry).await;
            return Err(CacheStorageError::storage(e.to_string()));
        }
        Ok(())
    }
}

async fn doom_quietly(entry: &EntryHandle) {
    if let Err(e) = entry.doom().await {
        tracing::warn!(key = entry.key(), error = %e, "Failed to doom entry");
    }
}

/// Progress of a single put
enum PutStep {
    DoomingExisting,
    CreatingEntry,
    WritingHeaders(EntryHandle),
    WritingBody(EntryHandle),
    Done,
}

impl fmt::Display for PutStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PutStep::DoomingExisting => "dooming existing entry",
            PutStep::CreatingEntry => "creating entry",
            PutStep::WritingHeaders(_) => "writing headers",
            PutStep::WritingBody(_) => "writing body",
            PutStep::Done => "done",
        };
        f.write_str(name)
    }
}

/// One put, driven step by step. Headers are committed before the body; an
/// entry that fails after creation is doomed.
struct PutOperation<'c, 'a> {
    ctx: &'c BatchContext<'a>,
    key: String,
    request: FetchRequest,
    response: Response,
}

impl<'c, 'a> PutOperation<'c, 'a> {
    fn new(ctx: &'c BatchContext<'a>, request: FetchRequest, response: Response) -> Self {
        Self {
            ctx,
            key: entry_key(&request.url),
            request,
            response,
        }
    }

    async fn run(self) -> Result<(), CacheStorageError> {
        let mut step = PutStep::DoomingExisting;
        loop {
            step = match step {
                PutStep::DoomingExisting => {
                    self.doom_existing().await;
                    PutStep::CreatingEntry
                }
                PutStep::CreatingEntry => match self.ctx.backend.create_entry(&self.key).await {
                    Ok(entry) => PutStep::WritingHeaders(entry),
                    Err(e) => return Err(self.failed(&PutStep::CreatingEntry, e.into())),
                },
                PutStep::WritingHeaders(entry) => match self.write_headers(&entry).await {
                    Ok(()) => PutStep::WritingBody(entry),
                    Err(e) => return Err(self.abandon(PutStep::WritingHeaders(entry), e).await),
                },
                PutStep::WritingBody(entry) => match self.write_body(&entry).await {
                    Ok(()) => PutStep::Done,
                    Err(e) => return Err(self.abandon(PutStep::WritingBody(entry), e).await),
                },
                PutStep::Done => return Ok(()),
            };
        }
    }

    /// A missing or undoomable previous entry is not fatal
    async fn doom_existing(&self) {
        match self.ctx.backend.doom_entry(&self.key).await {
            Ok(()) => tracing::trace!(key = %self.key, "Doomed previous entry"),
            Err(BackendError::EntryNotFound(_)) => {}
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "Could not doom previous entry; continuing")
            }
        }
    }

    async fn write_headers(&self, entry: &EntryHandle) -> Result<(), CacheStorageError> {
        let metadata = CacheMetadata::new(&self.request, &self.response, Utc::now());
        write_stream(entry.as_ref(), StreamIndex::Headers, Bytes::from(metadata.encode()?)).await?;
        Ok(())
    }

    async fn write_body(&self, entry: &EntryHandle) -> Result<(), CacheStorageError> {
        let Some(body) = self.response.body.as_ref().filter(|b| !b.is_empty()) else {
            return Ok(());
        };
        write_blob_to_entry(body, entry.as_ref(), StreamIndex::Body, self.ctx.body_chunk_size).await?;
        Ok(())
    }

    async fn abandon(&self, step: PutStep, err: CacheStorageError) -> CacheStorageError {
        if let PutStep::WritingHeaders(entry) | PutStep::WritingBody(entry) = &step {
            doom_quietly(entry).await;
        }
        self.failed(&step, err)
    }

    fn failed(&self, step: &PutStep, err: CacheStorageError) -> CacheStorageError {
        tracing::warn!(key = %self.key, step = %step, error = %err, "Put failed");
        CacheStorageError::storage(format!("put failed while {}: {}", step, err))
    }
}
