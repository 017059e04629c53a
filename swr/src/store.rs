//! Response store abstraction for the stale-while-revalidate adapter.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

use loadstone_types::Cause;

/// A cached HTTP response body plus the metadata needed to revalidate it.
///
/// Validators are stored verbatim and echoed back in conditional requests,
/// so no HTTP-date parsing is ever needed; freshness is computed from
/// `stored_at` and the response's own `Cache-Control`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredResponse {
    /// Raw response body.
    pub body: Vec<u8>,
    /// `ETag` response header, if the origin sent one.
    pub etag: Option<String>,
    /// `Last-Modified` response header, verbatim.
    pub last_modified: Option<String>,
    /// `Cache-Control` response header, verbatim.
    pub cache_control: Option<String>,
    /// Local wall-clock time the response was stored.
    pub stored_at: SystemTime,
}

/// Storage backend for cached responses.
///
/// Implementations must be cheap and non-blocking: lookups happen on the
/// request path. Failures are surfaced as [`Cause`]s; the adapter reports
/// and suppresses them whenever a network fallback exists.
pub trait HttpCacheStore: Send + Sync {
    /// Fetch the stored response for a cache key, if any.
    fn lookup(&self, key: &str) -> Result<Option<StoredResponse>, Cause>;

    /// Persist a response under a cache key, replacing any previous entry.
    fn store(&self, key: &str, response: StoredResponse) -> Result<(), Cause>;
}

/// In-memory, per-process store. The default backend, and the one the test
/// suites use.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, StoredResponse>>,
}

impl MemoryStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries (diagnostics).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the store holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HttpCacheStore for MemoryStore {
    fn lookup(&self, key: &str) -> Result<Option<StoredResponse>, Cause> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn store(&self, key: &str, response: StoredResponse) -> Result<(), Cause> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), response);
        Ok(())
    }
}
