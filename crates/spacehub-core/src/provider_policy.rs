use std::time::Duration;

use crate::{Credential, ProviderId};

/// NASA's shared demonstration key, throttled far below personal keys.
pub const DEMO_KEY: &str = "DEMO_KEY";

/// Quota semantics documented by an upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaPolicy {
    /// Continuously refilled budget shared by all callers of the provider.
    TokenBucket { window: Duration, limit: u32 },
    /// Per-credential counter that resets at the end of each window.
    FixedWindow { window: Duration, limit: u32 },
}

impl QuotaPolicy {
    pub const fn window(self) -> Duration {
        match self {
            Self::TokenBucket { window, .. } | Self::FixedWindow { window, .. } => window,
        }
    }

    pub const fn limit(self) -> u32 {
        match self {
            Self::TokenBucket { limit, .. } | Self::FixedWindow { limit, .. } => limit,
        }
    }

    pub const fn kind(self) -> &'static str {
        match self {
            Self::TokenBucket { .. } => "token_bucket",
            Self::FixedWindow { .. } => "fixed_window",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderPolicy {
    pub provider_id: ProviderId,
    pub quota: QuotaPolicy,
    /// Window limit applied to [`DEMO_KEY`] instead of `quota.limit()`.
    pub demo_key_limit: Option<u32>,
}

impl ProviderPolicy {
    pub fn exoplanets_default() -> Self {
        Self {
            provider_id: ProviderId::Exoplanets,
            quota: QuotaPolicy::TokenBucket {
                window: Duration::from_secs(60),
                limit: 60,
            },
            demo_key_limit: None,
        }
    }

    pub fn iss_default() -> Self {
        Self {
            provider_id: ProviderId::Iss,
            quota: QuotaPolicy::TokenBucket {
                window: Duration::from_secs(1),
                limit: 1,
            },
            demo_key_limit: None,
        }
    }

    pub fn mars_default() -> Self {
        Self {
            provider_id: ProviderId::Mars,
            quota: QuotaPolicy::FixedWindow {
                window: Duration::from_secs(3_600),
                limit: 1_000,
            },
            demo_key_limit: Some(30),
        }
    }

    pub fn default_for(provider_id: ProviderId) -> Self {
        match provider_id {
            ProviderId::Exoplanets => Self::exoplanets_default(),
            ProviderId::Iss => Self::iss_default(),
            ProviderId::Mars => Self::mars_default(),
        }
    }

    /// Per-window call budget for one credential.
    pub fn window_limit_for(&self, credential: Option<&Credential>) -> u32 {
        match (credential, self.demo_key_limit) {
            (Some(credential), Some(limit)) if credential.expose() == DEMO_KEY => limit,
            _ => self.quota.limit(),
        }
    }
}
