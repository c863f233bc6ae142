// Constants module - default values for configuration

// =============================================================================
// Storage defaults
// =============================================================================

/// Default directory for persistent caches
pub const DEFAULT_CACHE_DIR: &str = "./cache_storage";

/// Default cap on the estimated size of one query's results (10 MB)
pub const DEFAULT_MAX_QUERY_SIZE_BYTES: u64 = 10 * 1024 * 1024;

/// Default chunk size when streaming a body into an entry (64 KB)
pub const DEFAULT_BODY_CHUNK_SIZE: usize = 64 * 1024;

// =============================================================================
// Quota defaults
// =============================================================================

/// Default per-origin quota of the built-in quota manager (100 MB)
pub const DEFAULT_QUOTA_BYTES: u64 = 100 * 1024 * 1024;

// =============================================================================
// Logging defaults
// =============================================================================

/// Default log level when RUST_LOG is unset
pub const DEFAULT_LOG_LEVEL: &str = "info";
