//! In-memory result cache with single-flight fetches.
//!
//! Entries are keyed by provider and the translated [`NativeRequest`], so
//! queries that differ only in values the adapter fills in by default share
//! one entry. Entries expire by TTL.
//! Concurrent misses for one key collapse into a single detached fetch task
//! whose result is shared with every waiter. Dropping a waiter never cancels
//! the shared fetch; it still completes and populates the cache.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::{NativeRequest, NormalizedRecord, ProviderId, SourceError};

/// `(provider, native request key)`.
pub type CacheKey = (ProviderId, String);

type SharedFetch = Shared<BoxFuture<'static, Result<CacheEntry, SourceError>>>;

/// Records produced by one successful upstream fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedBatch {
    pub records: Vec<NormalizedRecord>,
    /// Upstream rows dropped as malformed.
    pub skipped: usize,
    pub ttl: Duration,
}

/// Memoized fetch result.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub records: Arc<[NormalizedRecord]>,
    pub skipped: usize,
    pub fetched_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    fn from_batch(batch: FetchedBatch) -> Self {
        Self {
            records: batch.records.into(),
            skipped: batch.skipped,
            fetched_at: Instant::now(),
            ttl: batch.ttl,
        }
    }

    pub fn is_fresh_at(&self, now: Instant) -> bool {
        now < self.fetched_at + self.ttl
    }

    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.fetched_at)
    }
}

/// How a cache lookup was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOutcome {
    /// Served from a fresh entry.
    Hit,
    /// Waited on a fetch already in flight for the same key.
    Joined,
    /// This call started the upstream fetch.
    Fresh,
}

struct InFlight {
    id: u64,
    shared: SharedFetch,
    abort: AbortHandle,
}

#[derive(Default)]
struct CacheInner {
    entries: DashMap<CacheKey, CacheEntry>,
    in_flight: DashMap<CacheKey, InFlight>,
    next_flight: AtomicU64,
}

impl CacheInner {
    fn fresh(&self, key: &CacheKey) -> Option<CacheEntry> {
        let now = Instant::now();
        let entry = self.entries.get(key)?;
        if entry.is_fresh_at(now) {
            return Some(entry.value().clone());
        }
        drop(entry);
        self.entries.remove_if(key, |_, entry| !entry.is_fresh_at(now));
        None
    }

    fn finish_flight(&self, key: &CacheKey, id: u64) {
        self.in_flight.remove_if(key, |_, flight| flight.id == id);
    }
}

/// Process-wide result cache. Cloning shares the same storage.
#[derive(Clone, Default)]
pub struct ResultCache {
    inner: Arc<CacheInner>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, provider: ProviderId, request: &NativeRequest) -> Option<CacheEntry> {
        self.inner.fresh(&(provider, request.cache_key()))
    }

    /// Stores records for `ttl`. A zero TTL is not cached.
    pub fn put(
        &self,
        provider: ProviderId,
        request: &NativeRequest,
        records: Vec<NormalizedRecord>,
        ttl: Duration,
    ) {
        if ttl.is_zero() {
            return;
        }
        let entry = CacheEntry::from_batch(FetchedBatch {
            records,
            skipped: 0,
            ttl,
        });
        self.inner.entries.insert((provider, request.cache_key()), entry);
    }

    /// Returns a fresh entry, joins an in-flight fetch for the same key, or
    /// starts `fetch` on a detached task.
    ///
    /// Only successful fetches are cached. Failures are shared with the
    /// waiters of that flight and the next call fetches again.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        provider: ProviderId,
        request: &NativeRequest,
        fetch: F,
    ) -> (Result<CacheEntry, SourceError>, CacheOutcome)
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<FetchedBatch, SourceError>> + Send + 'static,
    {
        let key: CacheKey = (provider, request.cache_key());
        if let Some(entry) = self.inner.fresh(&key) {
            debug!(%provider, key = %key.1, "cache hit");
            return (Ok(entry), CacheOutcome::Hit);
        }

        let (shared, outcome) = match self.inner.in_flight.entry(key.clone()) {
            Entry::Occupied(flight) => {
                debug!(%provider, key = %key.1, "joining in-flight fetch");
                (flight.get().shared.clone(), CacheOutcome::Joined)
            }
            Entry::Vacant(slot) => {
                // A flight may have landed between the first lookup and the slot lock.
                if let Some(entry) = self.inner.fresh(&key) {
                    return (Ok(entry), CacheOutcome::Hit);
                }

                let id = self.inner.next_flight.fetch_add(1, Ordering::Relaxed);
                let task = tokio::spawn(run_flight(
                    Arc::clone(&self.inner),
                    key.clone(),
                    id,
                    fetch(),
                ));
                let abort = task.abort_handle();

                let inner = Arc::clone(&self.inner);
                let flight_key = key.clone();
                let shared = async move {
                    match task.await {
                        Ok(result) => result,
                        Err(join_error) => {
                            inner.finish_flight(&flight_key, id);
                            Err(if join_error.is_cancelled() {
                                SourceError::internal("fetch was cancelled")
                            } else {
                                SourceError::internal("fetch task panicked")
                            })
                        }
                    }
                }
                .boxed()
                .shared();

                slot.insert(InFlight {
                    id,
                    shared: shared.clone(),
                    abort,
                });
                (shared, CacheOutcome::Fresh)
            }
        };

        (shared.await, outcome)
    }

    /// Drops expired entries.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.inner.entries.len();
        self.inner.entries.retain(|_, entry| entry.is_fresh_at(now));
        before.saturating_sub(self.inner.entries.len())
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }

    pub fn clear(&self) {
        self.inner.entries.clear();
    }

    /// Aborts every detached fetch; their waiters observe an internal error.
    pub fn abort_in_flight(&self) {
        self.inner.in_flight.retain(|_, flight| {
            flight.abort.abort();
            false
        });
    }
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("entries", &self.inner.entries.len())
            .field("in_flight", &self.inner.in_flight.len())
            .finish()
    }
}

async fn run_flight<Fut>(
    inner: Arc<CacheInner>,
    key: CacheKey,
    id: u64,
    fetch: Fut,
) -> Result<CacheEntry, SourceError>
where
    Fut: Future<Output = Result<FetchedBatch, SourceError>> + Send + 'static,
{
    let result = fetch.await.map(CacheEntry::from_batch);
    if let Ok(entry) = &result {
        if !entry.ttl.is_zero() {
            inner.entries.insert(key.clone(), entry.clone());
        }
    }
    inner.finish_flight(&key, id);
    result
}
