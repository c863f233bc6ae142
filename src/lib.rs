// Cache Storage Library
//
// An asynchronous request/response cache: per-cache FIFO operation
// scheduling, quota checks before writes, and three-stream entries over a
// pluggable memory or disk backend.

pub mod backend;
mod batch;
pub mod blob;
pub mod cache;
pub mod config;
pub mod constants;
pub mod error;
pub mod key;
pub mod logging;
pub mod metadata;
pub mod query;
pub mod quota;
pub mod scheduler;
pub mod types;

pub use blob::BlobHandle;
pub use cache::{CacheDependencies, CacheObserver, CacheStorageCache};
pub use error::{CacheStorageError, ErrorKind};
pub use query::MatchedResponse;
pub use quota::{QuotaManager, StaticQuotaManager, UsageAndQuota};
pub use scheduler::Scheduled;
pub use types::{BatchOperation, FetchRequest, QueryParams, Response, ResponseType};
