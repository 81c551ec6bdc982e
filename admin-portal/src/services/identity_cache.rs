//! The last known authorized identity for a visitor.
//!
//! The slot outlives page reloads and process restarts and is explicitly
//! clearable. Only the reconciler writes it.

use super::kv_store::{KeyValueStore, StoreError};
use crate::models::{Identity, IdentitySource};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Identity cache store error: {0}")]
    Store(#[from] StoreError),

    #[error("Identity cache entry is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[async_trait]
pub trait IdentityCache: Send + Sync {
    async fn read(&self) -> Result<Option<Identity>, CacheError>;
    async fn write(&self, identity: &Identity) -> Result<(), CacheError>;
    async fn clear(&self) -> Result<(), CacheError>;
}

/// Identity cache stored as JSON in a key/value store, one key per visitor.
pub struct StoredIdentityCache {
    store: Arc<dyn KeyValueStore>,
    key: String,
    ttl_seconds: u64,
}

impl StoredIdentityCache {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        key_prefix: &str,
        visitor_id: &str,
        ttl_seconds: u64,
    ) -> Self {
        Self {
            store,
            key: format!("{}:identity:{}", key_prefix, visitor_id),
            ttl_seconds,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
impl IdentityCache for StoredIdentityCache {
    async fn read(&self) -> Result<Option<Identity>, CacheError> {
        let Some(raw) = self.store.get(&self.key).await? else {
            return Ok(None);
        };

        match serde_json::from_str::<Identity>(&raw) {
            Ok(identity) => Ok(Some(Identity {
                source: IdentitySource::LocalCache,
                ..identity
            })),
            Err(e) => {
                // An unreadable slot is as good as an empty one; drop it
                tracing::warn!(key = %self.key, error = %e, "Discarding malformed identity cache entry");
                self.store.delete(&self.key).await?;
                Ok(None)
            }
        }
    }

    async fn write(&self, identity: &Identity) -> Result<(), CacheError> {
        let raw = serde_json::to_string(identity)?;
        self.store.set(&self.key, &raw, self.ttl_seconds).await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.store.delete(&self.key).await?;
        Ok(())
    }
}

/// In-memory identity cache that counts mutations, for tests.
#[derive(Default)]
pub struct MemoryIdentityCache {
    slot: Mutex<Option<Identity>>,
    writes: AtomicUsize,
    clears: AtomicUsize,
    fail_reads: AtomicBool,
}

impl MemoryIdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identity(identity: Identity) -> Self {
        let cache = Self::default();
        cache.seed(Some(identity));
        cache
    }

    /// Replace the slot without counting it as a write.
    pub fn seed(&self, identity: Option<Identity>) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = identity;
        }
    }

    pub fn current(&self) -> Option<Identity> {
        self.slot.lock().ok().and_then(|slot| slot.clone())
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn clear_count(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl IdentityCache for MemoryIdentityCache {
    async fn read(&self) -> Result<Option<Identity>, CacheError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(CacheError::Store(StoreError::Unavailable(
                "cache read disabled".to_string(),
            )));
        }
        Ok(self.current())
    }

    async fn write(&self, identity: &Identity) -> Result<(), CacheError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.seed(Some(identity.clone()));
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        self.seed(None);
        Ok(())
    }
}
