//! Statement cache keyed by entity identifier.
//!
//! Entries live until the statement's own `exp`. Concurrent misses for one
//! key share a single fetch; a miss for one key never waits on a fetch for
//! another. Entries are replaced wholesale, never patched.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use time::OffsetDateTime;
use tokio::sync::{OnceCell, RwLock};
use tracing::debug;

use crate::clock::Clock;
use crate::error::Error;
use crate::jws::SignedStatement;
use crate::statement::{EntityStatement, IdpList};

/// Documents that carry their own expiry.
pub trait Expiring {
    fn expires_at(&self) -> OffsetDateTime;
}

impl Expiring for EntityStatement {
    fn expires_at(&self) -> OffsetDateTime {
        self.expires_at
    }
}

impl Expiring for IdpList {
    fn expires_at(&self) -> OffsetDateTime {
        self.expires_at
    }
}

type Slot<T> = Arc<OnceCell<Arc<SignedStatement<T>>>>;

/// Cache statistics for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub fetches: u64,
    pub entries: usize,
}

pub struct StatementCache<T> {
    slots: RwLock<HashMap<String, Slot<T>>>,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    fetches: AtomicU64,
}

impl<T> StatementCache<T>
where
    T: Expiring + Send + Sync + 'static,
{
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            clock,
            hits: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
        }
    }

    /// Return the cached statement for `key`, or run `fetch` to obtain it.
    ///
    /// `fetch` must only return statements it has verified. A failed fetch
    /// leaves nothing behind, so the next caller fetches again.
    ///
    /// # Errors
    ///
    /// Propagates the error returned by `fetch` unchanged.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        fetch: F,
    ) -> Result<Arc<SignedStatement<T>>, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SignedStatement<T>, Error>>,
    {
        let mut slot = self.slot(key).await;
        if let Some(cached) = slot.get() {
            if !self.is_expired(cached) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(key, "Statement cache hit");
                return Ok(cached.clone());
            }
            debug!(key, "Cached statement expired");
            slot = self.replace_stale(key, &slot).await;
        }

        let statement = slot
            .get_or_try_init(|| async {
                self.fetches.fetch_add(1, Ordering::Relaxed);
                debug!(key, "Statement cache miss, fetching");
                fetch().await.map(Arc::new)
            })
            .await?;
        Ok(statement.clone())
    }

    /// Drop the entry for `key`; the next lookup fetches.
    pub async fn invalidate(&self, key: &str) {
        if self.slots.write().await.remove(key).is_some() {
            debug!(key, "Statement cache entry invalidated");
        }
    }

    pub async fn clear(&self) {
        self.slots.write().await.clear();
    }

    pub async fn stats(&self) -> CacheStats {
        let slots = self.slots.read().await;
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            entries: slots.values().filter(|s| s.initialized()).count(),
        }
    }

    fn is_expired(&self, statement: &SignedStatement<T>) -> bool {
        self.clock.now() >= statement.body().expires_at()
    }

    async fn slot(&self, key: &str) -> Slot<T> {
        if let Some(slot) = self.slots.read().await.get(key) {
            return slot.clone();
        }
        self.slots
            .write()
            .await
            .entry(key.to_owned())
            .or_default()
            .clone()
    }

    /// Swap out `stale` unless another caller already did.
    async fn replace_stale(&self, key: &str, stale: &Slot<T>) -> Slot<T> {
        let mut slots = self.slots.write().await;
        let current = slots.entry(key.to_owned()).or_default();
        if Arc::ptr_eq(current, stale) {
            *current = Arc::new(OnceCell::new());
        }
        current.clone()
    }
}

impl<T> std::fmt::Debug for StatementCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementCache")
            .field("hits", &self.hits.load(Ordering::Relaxed))
            .field("fetches", &self.fetches.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
