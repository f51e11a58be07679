//! Rate/key governor.
//!
//! Gates every outbound provider call. Token-bucket providers share one
//! `governor` limiter; fixed-window providers keep a counter per credential
//! and rotate between credentials round-robin. State lives behind the
//! governor's own locks, which are never held across an `.await`.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use governor::clock::Clock;
use governor::middleware::NoOpMiddleware;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::provider_policy::{ProviderPolicy, QuotaPolicy};
use crate::{Credential, ProviderId, SourceError};

type DirectRateLimiter =
    RateLimiter<NotKeyed, InMemoryState, TokioClock, NoOpMiddleware<std::time::Instant>>;

/// Limiter clock read from tokio's timer, so the bucket and the wait loop in
/// [`RateGovernor::acquire`] agree on time, including under a paused runtime.
#[derive(Debug, Clone, Copy, Default)]
struct TokioClock;

impl Clock for TokioClock {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        Instant::now().into_std()
    }
}

/// Fallback lockout for a credential rejected without a `Retry-After` hint.
const DEFAULT_EXHAUSTED_BACKOFF: Duration = Duration::from_secs(60);

/// Permission to make one upstream call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permit {
    provider: ProviderId,
    credential: Option<Credential>,
    key_index: Option<usize>,
}

impl Permit {
    pub const fn provider(&self) -> ProviderId {
        self.provider
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    pub const fn key_index(&self) -> Option<usize> {
        self.key_index
    }
}

/// Read-only view of one provider's quota, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaSnapshot {
    pub provider: ProviderId,
    pub policy: &'static str,
    pub limit: u32,
    pub window_ms: u64,
    /// Calls left in the current window of the active credential. `None` for
    /// token buckets, which do not expose their level.
    pub remaining: Option<u32>,
    pub reset_in_ms: Option<u64>,
    pub credentials: usize,
    pub active_key_index: Option<usize>,
    pub exhausted_keys: Vec<usize>,
}

/// Window counter for one credential.
#[derive(Debug)]
struct QuotaState {
    credential: Option<Credential>,
    limit: u32,
    remaining: u32,
    reset_at: Instant,
    exhausted_until: Option<Instant>,
}

impl QuotaState {
    fn new(credential: Option<Credential>, limit: u32, window: Duration, now: Instant) -> Self {
        Self {
            credential,
            limit,
            remaining: limit,
            reset_at: now + window,
            exhausted_until: None,
        }
    }

    fn refresh(&mut self, window: Duration, now: Instant) {
        if now >= self.reset_at {
            self.remaining = self.limit;
            while self.reset_at <= now {
                self.reset_at += window;
            }
        }
        if self.exhausted_until.is_some_and(|until| now >= until) {
            self.exhausted_until = None;
        }
    }

    fn available_at(&self, now: Instant) -> Option<Instant> {
        if let Some(until) = self.exhausted_until {
            return Some(until);
        }
        (self.remaining == 0).then_some(self.reset_at).filter(|at| *at > now)
    }
}

#[derive(Debug)]
struct KeyRing {
    states: Vec<QuotaState>,
    next: usize,
}

struct ProviderQuota {
    policy: ProviderPolicy,
    bucket: Option<DirectRateLimiter>,
    ring: Mutex<KeyRing>,
}

impl ProviderQuota {
    fn new(policy: ProviderPolicy, credentials: Vec<Credential>) -> Self {
        let now = Instant::now();
        let window = policy.quota.window();
        let bucket = match policy.quota {
            QuotaPolicy::TokenBucket { window, limit } => Some(token_bucket(window, limit)),
            QuotaPolicy::FixedWindow { .. } => None,
        };

        let states = if credentials.is_empty() {
            vec![QuotaState::new(None, policy.window_limit_for(None), window, now)]
        } else {
            credentials
                .into_iter()
                .map(|credential| {
                    let limit = policy.window_limit_for(Some(&credential));
                    QuotaState::new(Some(credential), limit, window, now)
                })
                .collect()
        };

        Self {
            policy,
            bucket,
            ring: Mutex::new(KeyRing { states, next: 0 }),
        }
    }

    fn lock_ring(&self) -> MutexGuard<'_, KeyRing> {
        self.ring.lock().unwrap_or_else(|poisoned| {
            warn!(
                provider = %self.policy.provider_id,
                "quota state mutex was poisoned, recovering"
            );
            poisoned.into_inner()
        })
    }

    /// Attempts to take a permit without waiting. On failure returns how long
    /// until one could be available.
    fn try_acquire(&self) -> Result<Permit, Duration> {
        let provider = self.policy.provider_id;

        if let Some(limiter) = &self.bucket {
            if let Err(not_until) = limiter.check() {
                return Err(not_until.wait_time_from(TokioClock.now()));
            }
        }

        let now = Instant::now();
        let window = self.policy.quota.window();
        let counted = matches!(self.policy.quota, QuotaPolicy::FixedWindow { .. });
        let mut ring = self.lock_ring();
        let len = ring.states.len();

        for offset in 0..len {
            let index = (ring.next + offset) % len;
            let state = &mut ring.states[index];
            state.refresh(window, now);

            if state.exhausted_until.is_some() || (counted && state.remaining == 0) {
                continue;
            }
            if counted {
                state.remaining -= 1;
            }

            let credential = state.credential.clone();
            ring.next = (index + 1) % len;
            return Ok(Permit {
                provider,
                key_index: credential.as_ref().map(|_| index),
                credential,
            });
        }

        let retry_after = ring
            .states
            .iter()
            .filter_map(|state| state.available_at(now))
            .min()
            .map_or(window, |at| at.saturating_duration_since(now));
        Err(retry_after)
    }

    fn snapshot(&self) -> QuotaSnapshot {
        let now = Instant::now();
        let window = self.policy.quota.window();
        let counted = matches!(self.policy.quota, QuotaPolicy::FixedWindow { .. });
        let mut ring = self.lock_ring();
        for state in &mut ring.states {
            state.refresh(window, now);
        }

        let len = ring.states.len();
        let active = (0..len)
            .map(|offset| (ring.next + offset) % len)
            .find(|index| ring.states[*index].available_at(now).is_none());
        let active_state = active.map(|index| &ring.states[index]);
        let has_credentials = ring.states.iter().any(|state| state.credential.is_some());

        QuotaSnapshot {
            provider: self.policy.provider_id,
            policy: self.policy.quota.kind(),
            limit: self.policy.quota.limit(),
            window_ms: duration_ms(window),
            remaining: active_state
                .filter(|_| counted)
                .map(|state| state.remaining),
            reset_in_ms: active_state
                .filter(|_| counted)
                .map(|state| duration_ms(state.reset_at.saturating_duration_since(now))),
            credentials: if has_credentials { len } else { 0 },
            active_key_index: active.filter(|_| has_credentials),
            exhausted_keys: ring
                .states
                .iter()
                .enumerate()
                .filter(|(_, state)| state.credential.is_some() && state.available_at(now).is_some())
                .map(|(index, _)| index)
                .collect(),
        }
    }
}

/// Per-provider quota tracking and credential rotation.
///
/// `acquire` waits at most `max_wait` for budget to free up; beyond that it
/// fails fast with `RateLimited` so the aggregator can report the provider
/// without holding up its siblings.
#[derive(Clone)]
pub struct RateGovernor {
    providers: Arc<HashMap<ProviderId, ProviderQuota>>,
    max_wait: Duration,
}

impl RateGovernor {
    pub fn builder() -> RateGovernorBuilder {
        RateGovernorBuilder::default()
    }

    pub const fn max_wait(&self) -> Duration {
        self.max_wait
    }

    /// Obtains a permit for one call to `provider`.
    ///
    /// Providers without a registered policy are not throttled.
    ///
    /// # Errors
    ///
    /// Returns a `RateLimited` [`SourceError`] carrying `retry_after` when no
    /// budget frees up within the governor's bounded wait.
    pub async fn acquire(&self, provider: ProviderId) -> Result<Permit, SourceError> {
        let Some(quota) = self.providers.get(&provider) else {
            return Ok(Permit {
                provider,
                credential: None,
                key_index: None,
            });
        };

        let deadline = Instant::now() + self.max_wait;
        loop {
            match quota.try_acquire() {
                Ok(permit) => {
                    debug!(%provider, key_index = ?permit.key_index, "acquired rate permit");
                    return Ok(permit);
                }
                Err(retry_after) => {
                    let now = Instant::now();
                    let available_at = now + retry_after;
                    if available_at > deadline {
                        warn!(
                            %provider,
                            retry_after_ms = duration_ms(retry_after),
                            "rate limit exhausted"
                        );
                        return Err(SourceError::rate_limited(
                            format!("rate limit for '{provider}' exhausted"),
                            Some(retry_after),
                        ));
                    }
                    tokio::time::sleep_until(available_at).await;
                }
            }
        }
    }

    /// Marks the permit's credential exhausted after a 429-equivalent
    /// response, so the next `acquire` rotates to another key.
    pub fn report_exhausted(&self, permit: &Permit, retry_after: Option<Duration>) {
        let Some((quota, index)) = self.locate(permit) else {
            return;
        };

        let now = Instant::now();
        let mut ring = quota.lock_ring();
        if let Some(state) = ring.states.get_mut(index) {
            let backoff = retry_after.unwrap_or_else(|| {
                let until_reset = state.reset_at.saturating_duration_since(now);
                if until_reset.is_zero() {
                    DEFAULT_EXHAUSTED_BACKOFF
                } else {
                    until_reset
                }
            });
            state.remaining = 0;
            state.exhausted_until = Some(now + backoff);
            warn!(
                provider = %permit.provider,
                key_index = index,
                backoff_ms = duration_ms(backoff),
                "credential exhausted, rotating"
            );
        }
    }

    /// Synchronizes the permit's window counter with the upstream's
    /// `X-RateLimit-Remaining` report.
    pub fn observe_remaining(&self, permit: &Permit, remaining: u32) {
        let Some((quota, index)) = self.locate(permit) else {
            return;
        };

        let mut ring = quota.lock_ring();
        if let Some(state) = ring.states.get_mut(index) {
            state.remaining = remaining.min(state.limit);
        }
    }

    pub fn snapshot(&self, provider: ProviderId) -> Option<QuotaSnapshot> {
        self.providers.get(&provider).map(ProviderQuota::snapshot)
    }

    /// Snapshots for every registered provider, in provider-id order.
    pub fn snapshots(&self) -> Vec<QuotaSnapshot> {
        let mut snapshots = self
            .providers
            .values()
            .map(ProviderQuota::snapshot)
            .collect::<Vec<_>>();
        snapshots.sort_by_key(|snapshot| snapshot.provider);
        snapshots
    }

    fn locate(&self, permit: &Permit) -> Option<(&ProviderQuota, usize)> {
        let quota = self.providers.get(&permit.provider)?;
        if !matches!(quota.policy.quota, QuotaPolicy::FixedWindow { .. }) {
            return None;
        }
        Some((quota, permit.key_index.unwrap_or(0)))
    }
}

impl std::fmt::Debug for RateGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut providers = self.providers.keys().copied().collect::<Vec<_>>();
        providers.sort();
        f.debug_struct("RateGovernor")
            .field("providers", &providers)
            .field("max_wait", &self.max_wait)
            .finish()
    }
}

#[derive(Default)]
pub struct RateGovernorBuilder {
    providers: HashMap<ProviderId, ProviderQuota>,
    max_wait: Option<Duration>,
}

impl RateGovernorBuilder {
    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    /// Registers a provider policy with its credential rotation list.
    pub fn provider(mut self, policy: ProviderPolicy, credentials: Vec<Credential>) -> Self {
        self.providers
            .insert(policy.provider_id, ProviderQuota::new(policy, credentials));
        self
    }

    pub fn build(self) -> RateGovernor {
        RateGovernor {
            providers: Arc::new(self.providers),
            max_wait: self.max_wait.unwrap_or(Duration::from_millis(250)),
        }
    }
}

fn token_bucket(window: Duration, limit: u32) -> DirectRateLimiter {
    let burst = NonZeroU32::new(limit).unwrap_or(NonZeroU32::MIN);
    let period = Duration::from_secs_f64((window.as_secs_f64() / f64::from(burst.get())).max(0.001));
    let quota = Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_second(burst))
        .allow_burst(burst);
    RateLimiter::direct_with_clock(quota, &TokioClock)
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
