//! Quota manager interface
//!
//! The engine asks the quota manager for `(usage, quota)` before any write
//! that can grow storage, and reports size deltas after mutations.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::error::CacheStorageError;

/// Usage and budget of one origin, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsageAndQuota {
    pub usage: u64,
    pub quota: u64,
}

impl UsageAndQuota {
    /// Bytes that may still be written
    pub fn remaining(&self) -> u64 {
        self.quota.saturating_sub(self.usage)
    }

    /// Whether `space_required` more bytes fit
    pub fn allows(&self, space_required: u64) -> bool {
        space_required <= self.remaining()
    }
}

/// Per-origin storage accounting
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QuotaManager: Send + Sync {
    async fn get_usage_and_quota(&self, origin: &str) -> Result<UsageAndQuota, CacheStorageError>;

    /// Report that an origin's usage changed by `delta` bytes
    fn notify_storage_modified(&self, origin: &str, delta: i64);
}

/// Quota manager with one fixed budget per origin, tracking usage from the
/// deltas it is notified of
pub struct StaticQuotaManager {
    default_quota: u64,
    quotas: RwLock<HashMap<String, u64>>,
    usage: RwLock<HashMap<String, u64>>,
}

impl StaticQuotaManager {
    pub fn new(default_quota: u64) -> Self {
        Self {
            default_quota,
            quotas: RwLock::new(HashMap::new()),
            usage: RwLock::new(HashMap::new()),
        }
    }

    /// Override the budget of one origin
    pub fn set_quota(&self, origin: &str, quota: u64) {
        self.quotas.write().insert(origin.to_string(), quota);
    }

    /// Seed usage, e.g. storage held by other caches of the origin
    pub fn set_usage(&self, origin: &str, usage: u64) {
        self.usage.write().insert(origin.to_string(), usage);
    }

    pub fn usage(&self, origin: &str) -> u64 {
        self.usage.read().get(origin).copied().unwrap_or(0)
    }
}

#[async_trait]
impl QuotaManager for StaticQuotaManager {
    async fn get_usage_and_quota(&self, origin: &str) -> Result<UsageAndQuota, CacheStorageError> {
        let quota = self
            .quotas
            .read()
            .get(origin)
            .copied()
            .unwrap_or(self.default_quota);
        Ok(UsageAndQuota {
            usage: self.usage(origin),
            quota,
        })
    }

    fn notify_storage_modified(&self, origin: &str, delta: i64) {
        let mut usage = self.usage.write();
        let current = usage.entry(origin.to_string()).or_insert(0);
        *current = if delta >= 0 {
            current.saturating_add(delta as u64)
        } else {
            current.saturating_sub(delta.unsigned_abs())
        };
        tracing::trace!(origin = origin, delta = delta, usage = *current, "Storage modified");
    }
}
