//! Aggregation engine.
//!
//! Fans one normalized query out to every selected provider in parallel,
//! bounds the whole request by a deadline and assembles a best-effort
//! [`AggregateResult`]. One provider's failure never fails the request.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, CacheOutcome, FetchedBatch, ResultCache};
use crate::data_source::{ProviderAdapter, ProviderDescriptor};
use crate::envelope::{AggregateResult, ProviderDiagnostics, ProviderStatus};
use crate::retry::RetryPolicy;
use crate::throttling::{Permit, QuotaSnapshot, RateGovernor};
use crate::{
    FetchContext, NativeRequest, NormalizedQuery, NormalizedRecord, ProviderId, SourceError,
    SourceErrorKind,
};

/// Upper bound on credential rotations within a single flight.
const MAX_KEY_ROTATIONS: u32 = 8;

/// Which providers an aggregate request targets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ProviderSelection {
    /// Every registered provider that can honor the query. When none can
    /// honor all of it, the providers that understand at least one field
    /// are asked and report what they cannot do.
    #[default]
    Matching,
    /// Exactly these providers, each reported even when unsupported or
    /// unregistered.
    Only(Vec<ProviderId>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregatorConfig {
    /// Overall budget for one aggregate request.
    pub request_deadline: Duration,
    /// Ceiling for a single upstream call; a provider's own timeout wins when
    /// shorter.
    pub provider_timeout: Duration,
    /// Provider calls allowed to run at once across all requests.
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            request_deadline: Duration::from_secs(8),
            provider_timeout: Duration::from_secs(5),
            max_concurrency: 8,
            retry: RetryPolicy::default(),
        }
    }
}

/// Adapter registry plus the shared governor and cache.
///
/// Cloning is cheap and shares every piece of state.
#[derive(Clone)]
pub struct Aggregator {
    adapters: Arc<BTreeMap<ProviderId, Arc<dyn ProviderAdapter>>>,
    governor: RateGovernor,
    cache: ResultCache,
    config: AggregatorConfig,
    workers: Arc<Semaphore>,
}

impl Aggregator {
    pub fn builder() -> AggregatorBuilder {
        AggregatorBuilder::default()
    }

    pub const fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn governor(&self) -> &RateGovernor {
        &self.governor
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn registered(&self) -> Vec<ProviderId> {
        self.adapters.keys().copied().collect()
    }

    pub fn descriptors(&self) -> Vec<ProviderDescriptor> {
        self.adapters
            .values()
            .map(|adapter| adapter.describe())
            .collect()
    }

    pub fn quota_snapshots(&self) -> Vec<QuotaSnapshot> {
        self.governor.snapshots()
    }

    /// Providers `selection` resolves to for `query`, in id order.
    pub fn plan(&self, query: &NormalizedQuery, selection: &ProviderSelection) -> Vec<ProviderId> {
        match selection {
            ProviderSelection::Only(providers) => {
                let mut providers = providers.clone();
                providers.sort();
                providers.dedup();
                providers
            }
            ProviderSelection::Matching => {
                let covering = self
                    .adapters
                    .iter()
                    .filter(|(_, adapter)| adapter.describe().capabilities.covers(query))
                    .map(|(provider, _)| *provider)
                    .collect::<Vec<_>>();
                if !covering.is_empty() {
                    return covering;
                }

                self.adapters
                    .iter()
                    .filter(|(_, adapter)| {
                        let capabilities = adapter.describe().capabilities;
                        query.fields().any(|field| capabilities.supports(field))
                    })
                    .map(|(provider, _)| *provider)
                    .collect()
            }
        }
    }

    /// Runs `query` against the selected providers within the configured
    /// request deadline.
    pub async fn aggregate(
        &self,
        query: &NormalizedQuery,
        selection: &ProviderSelection,
    ) -> AggregateResult {
        self.aggregate_within(query, selection, self.config.request_deadline)
            .await
    }

    /// Same as [`Aggregator::aggregate`] with an explicit overall budget.
    ///
    /// Providers still running when the budget runs out are reported as
    /// `timeout`. Their shared upstream fetch keeps running in the background
    /// and still populates the cache.
    pub async fn aggregate_within(
        &self,
        query: &NormalizedQuery,
        selection: &ProviderSelection,
        budget: Duration,
    ) -> AggregateResult {
        let started = Instant::now();
        let deadline = started + budget;
        let plan = self.plan(query, selection);
        debug!(providers = ?plan, query = %query.cache_key(), "aggregating");

        let mut outcomes = BTreeMap::new();
        let mut running = Vec::with_capacity(plan.len());
        let mut pending = FuturesUnordered::new();

        for provider in plan {
            let Some(adapter) = self.adapters.get(&provider) else {
                let error = SourceError::adapter_not_registered(provider);
                outcomes.insert(provider, ProviderOutcome::failed(&error, started, None, 0));
                continue;
            };

            let call = ProviderCall {
                provider,
                adapter: Arc::clone(adapter),
                query: query.clone(),
                timeout: adapter.describe().timeout.min(self.config.provider_timeout),
                governor: self.governor.clone(),
                cache: self.cache.clone(),
                retry: self.config.retry,
                workers: Arc::clone(&self.workers),
            };
            let handle = tokio::spawn(call.run());
            running.push((provider, handle.abort_handle()));
            pending.push(async move { (provider, handle.await) });
        }

        while let Ok(Some((provider, joined))) =
            tokio::time::timeout_at(deadline, pending.next()).await
        {
            let outcome = joined.unwrap_or_else(|join_error| {
                warn!(%provider, error = %join_error, "provider task failed");
                let error = SourceError::internal("provider task failed");
                ProviderOutcome::failed(&error, started, None, 0)
            });
            outcomes.insert(provider, outcome);
        }

        for (provider, task) in running {
            if outcomes.contains_key(&provider) {
                continue;
            }
            task.abort();
            warn!(%provider, budget_ms = duration_ms(budget), "request deadline reached");
            let error = SourceError::timeout(format!(
                "'{provider}' did not finish within the {}ms request deadline",
                duration_ms(budget)
            ));
            outcomes.insert(provider, ProviderOutcome::failed(&error, started, None, 0));
        }

        let result = assemble(outcomes);
        info!(
            providers = result.providers.len(),
            records = result.records.len(),
            partial = result.partial,
            latency_ms = duration_ms(started.elapsed()),
            "aggregate request finished"
        );
        result
    }

    /// Cancels in-flight fetches, drops cached results and refuses further
    /// provider calls. Requests made afterwards report `error:internal`.
    pub fn shutdown(&self) {
        self.workers.close();
        self.cache.abort_in_flight();
        self.cache.clear();
        info!("aggregator shut down");
    }
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("providers", &self.registered())
            .field("governor", &self.governor)
            .field("cache", &self.cache)
            .field("config", &self.config)
            .finish()
    }
}

#[derive(Default)]
pub struct AggregatorBuilder {
    adapters: BTreeMap<ProviderId, Arc<dyn ProviderAdapter>>,
    governor: Option<RateGovernor>,
    cache: Option<ResultCache>,
    config: AggregatorConfig,
}

impl AggregatorBuilder {
    /// Registers an adapter under the id it describes. A later registration
    /// for the same id replaces the earlier one.
    pub fn adapter(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.insert(adapter.describe().id, adapter);
        self
    }

    pub fn governor(mut self, governor: RateGovernor) -> Self {
        self.governor = Some(governor);
        self
    }

    pub fn cache(mut self, cache: ResultCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn config(mut self, config: AggregatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Aggregator {
        Aggregator {
            adapters: Arc::new(self.adapters),
            governor: self
                .governor
                .unwrap_or_else(|| RateGovernor::builder().build()),
            cache: self.cache.unwrap_or_default(),
            workers: Arc::new(Semaphore::new(self.config.max_concurrency.max(1))),
            config: self.config,
        }
    }
}

struct ProviderOutcome {
    status: ProviderStatus,
    records: Vec<NormalizedRecord>,
    diagnostics: ProviderDiagnostics,
}

impl ProviderOutcome {
    fn failed(
        error: &SourceError,
        started: Instant,
        cache: Option<CacheOutcome>,
        attempts: u32,
    ) -> Self {
        Self {
            status: ProviderStatus::from_error(error),
            records: Vec::new(),
            diagnostics: ProviderDiagnostics {
                cache,
                latency_ms: duration_ms(started.elapsed()),
                attempts,
                retry_after_ms: error.retry_after().map(duration_ms),
                message: Some(error.to_string()),
                ..ProviderDiagnostics::default()
            },
        }
    }
}

fn assemble(outcomes: BTreeMap<ProviderId, ProviderOutcome>) -> AggregateResult {
    let mut result = AggregateResult::default();
    for (provider, outcome) in outcomes {
        result.partial |= !outcome.status.is_success();
        result.providers.insert(provider, outcome.status);
        result.records.extend(outcome.records);
        result.diagnostics.insert(provider, outcome.diagnostics);
    }
    result
}

/// One provider's share of an aggregate request, run on its own task.
struct ProviderCall {
    provider: ProviderId,
    adapter: Arc<dyn ProviderAdapter>,
    query: NormalizedQuery,
    timeout: Duration,
    governor: RateGovernor,
    cache: ResultCache,
    retry: RetryPolicy,
    workers: Arc<Semaphore>,
}

impl ProviderCall {
    async fn run(self) -> ProviderOutcome {
        let started = Instant::now();
        let request = match self.adapter.translate(&self.query) {
            Ok(request) => request,
            Err(error) => {
                debug!(provider = %self.provider, error = %error, "provider skipped");
                return ProviderOutcome::failed(&error, started, None, 0);
            }
        };

        // Hits never wait for a worker slot.
        if let Some(entry) = self.cache.get(self.provider, &request) {
            return self.served(&entry, CacheOutcome::Hit, started, 0);
        }

        let Ok(_slot) = Arc::clone(&self.workers).acquire_owned().await else {
            let error = SourceError::internal("aggregator is shut down");
            return ProviderOutcome::failed(&error, started, None, 0);
        };

        let attempts = Arc::new(AtomicU32::new(0));
        let key = request.clone();
        let flight = Flight {
            provider: self.provider,
            adapter: Arc::clone(&self.adapter),
            request,
            timeout: self.timeout,
            ttl: self.adapter.cache_ttl(&self.query),
            governor: self.governor.clone(),
            retry: self.retry,
            attempts: Arc::clone(&attempts),
        };

        let (result, cache) = self
            .cache
            .get_or_fetch(self.provider, &key, move || flight.run())
            .await;
        let attempts = attempts.load(Ordering::Relaxed);

        match result {
            Ok(entry) => self.served(&entry, cache, started, attempts),
            Err(error) => {
                warn!(provider = %self.provider, code = error.code(), error = %error, "provider failed");
                ProviderOutcome::failed(&error, started, Some(cache), attempts)
            }
        }
    }

    fn served(
        &self,
        entry: &CacheEntry,
        cache: CacheOutcome,
        started: Instant,
        attempts: u32,
    ) -> ProviderOutcome {
        let status = if entry.skipped > 0 {
            ProviderStatus::Partial
        } else {
            ProviderStatus::Success
        };
        debug!(
            provider = %self.provider,
            records = entry.records.len(),
            cache = ?cache,
            "provider finished"
        );
        ProviderOutcome {
            status,
            records: entry.records.to_vec(),
            diagnostics: ProviderDiagnostics {
                records: entry.records.len(),
                skipped: entry.skipped,
                cache: Some(cache),
                latency_ms: duration_ms(started.elapsed()),
                attempts,
                ..ProviderDiagnostics::default()
            },
        }
    }
}

/// The upstream work behind a cache miss. Runs detached from any single
/// request so that joined waiters and later callers can share its result.
struct Flight {
    provider: ProviderId,
    adapter: Arc<dyn ProviderAdapter>,
    request: NativeRequest,
    timeout: Duration,
    ttl: Duration,
    governor: RateGovernor,
    retry: RetryPolicy,
    attempts: Arc<AtomicU32>,
}

impl Flight {
    async fn run(self) -> Result<FetchedBatch, SourceError> {
        let mut attempt = 0;
        let mut rotations = 0;

        loop {
            let permit = self.governor.acquire(self.provider).await?;
            self.attempts.fetch_add(1, Ordering::Relaxed);

            let error = match self.call(&permit).await {
                Ok(batch) => return Ok(batch),
                Err(error) => error,
            };

            if error.kind() == SourceErrorKind::RateLimited {
                self.governor.report_exhausted(&permit, error.retry_after());
                if permit.key_index().is_some() && rotations < MAX_KEY_ROTATIONS {
                    rotations += 1;
                    continue;
                }
                return Err(error);
            }

            if !self.retry.should_retry(&error, attempt) {
                return Err(error);
            }
            let delay = self.retry.delay_for_attempt(attempt);
            warn!(
                provider = %self.provider,
                attempt,
                delay_ms = duration_ms(delay),
                error = %error,
                "retrying provider call"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn call(&self, permit: &Permit) -> Result<FetchedBatch, SourceError> {
        let context =
            FetchContext::new(self.timeout).with_credential(permit.credential().cloned());
        let fetch = self.adapter.fetch(self.request.clone(), context);
        let response = match tokio::time::timeout(self.timeout, fetch).await {
            Ok(response) => response?,
            Err(_) => {
                return Err(SourceError::timeout(format!(
                    "'{}' did not answer within {}ms",
                    self.provider,
                    duration_ms(self.timeout)
                )))
            }
        };

        if let Some(remaining) = response.rate_limit_remaining() {
            self.governor.observe_remaining(permit, remaining);
        }

        let payload_bytes = response.payload_bytes();
        let parsed = self.adapter.parse(response).inspect_err(|error| {
            if error.kind() == SourceErrorKind::MalformedResponse {
                warn!(provider = %self.provider, payload_bytes, error = %error, "malformed upstream payload");
            }
        })?;
        if parsed.skipped > 0 {
            warn!(provider = %self.provider, skipped = parsed.skipped, "dropped malformed rows");
        }

        Ok(FetchedBatch {
            records: parsed.records,
            skipped: parsed.skipped,
            ttl: self.ttl,
        })
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
