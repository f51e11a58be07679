//! Process configuration and engine assembly.
//!
//! Configuration is read once at startup into [`HubConfig`]; [`HubBuilder`]
//! turns it into a ready [`Aggregator`] with one shared HTTP client.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::adapters::{
    ExoplanetArchiveAdapter, IssPositionAdapter, MarsRoverAdapter, RoverRoster,
    EXOPLANETS_BASE_URL, ISS_BASE_URL, MARS_BASE_URL,
};
use crate::aggregator::{Aggregator, AggregatorConfig};
use crate::cache::ResultCache;
use crate::http_client::{HttpClient, ReqwestHttpClient};
use crate::provider_policy::{ProviderPolicy, DEMO_KEY};
use crate::retry::RetryPolicy;
use crate::throttling::RateGovernor;
use crate::{ConfigError, Credential, ProviderId};

pub const NASA_API_KEYS_VAR: &str = "SPACEHUB_NASA_API_KEYS";
pub const NASA_API_KEY_VAR: &str = "NASA_API_KEY";
pub const EXOPLANETS_BASE_URL_VAR: &str = "SPACEHUB_EXOPLANETS_BASE_URL";
pub const ISS_BASE_URL_VAR: &str = "SPACEHUB_ISS_BASE_URL";
pub const MARS_BASE_URL_VAR: &str = "SPACEHUB_MARS_BASE_URL";
pub const REQUEST_DEADLINE_VAR: &str = "SPACEHUB_REQUEST_DEADLINE_MS";
pub const PROVIDER_TIMEOUT_VAR: &str = "SPACEHUB_PROVIDER_TIMEOUT_MS";

#[derive(Debug, Clone, PartialEq)]
pub struct HubConfig {
    pub request_deadline: Duration,
    pub provider_timeout: Duration,
    /// Longest the governor waits for budget before reporting `rate_limited`.
    pub max_wait: Duration,
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
    pub exoplanets_base_url: String,
    pub iss_base_url: String,
    pub mars_base_url: String,
    /// Rotation list for api.nasa.gov, in rotation order.
    pub nasa_keys: Vec<Credential>,
    pub roster: RoverRoster,
}

impl Default for HubConfig {
    fn default() -> Self {
        let engine = AggregatorConfig::default();
        Self {
            request_deadline: engine.request_deadline,
            provider_timeout: engine.provider_timeout,
            max_wait: Duration::from_millis(250),
            max_concurrency: engine.max_concurrency,
            retry: engine.retry,
            exoplanets_base_url: EXOPLANETS_BASE_URL.to_owned(),
            iss_base_url: ISS_BASE_URL.to_owned(),
            mars_base_url: MARS_BASE_URL.to_owned(),
            nasa_keys: vec![Credential::new(DEMO_KEY)],
            roster: RoverRoster::default(),
        }
    }
}

impl HubConfig {
    /// Reads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Reads configuration through `lookup`, which returns the raw value of
    /// an environment variable when it is set.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(keys) = nasa_keys(&lookup)? {
            config.nasa_keys = keys;
        }
        if let Some(url) = non_empty(&lookup, EXOPLANETS_BASE_URL_VAR)? {
            config.exoplanets_base_url = url;
        }
        if let Some(url) = non_empty(&lookup, ISS_BASE_URL_VAR)? {
            config.iss_base_url = url;
        }
        if let Some(url) = non_empty(&lookup, MARS_BASE_URL_VAR)? {
            config.mars_base_url = url;
        }
        if let Some(deadline) = millis(&lookup, REQUEST_DEADLINE_VAR)? {
            config.request_deadline = deadline;
        }
        if let Some(timeout) = millis(&lookup, PROVIDER_TIMEOUT_VAR)? {
            config.provider_timeout = timeout;
        }

        debug!(
            nasa_keys = config.nasa_keys.len(),
            deadline = ?config.request_deadline,
            "configuration loaded"
        );
        Ok(config)
    }

    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            request_deadline: self.request_deadline,
            provider_timeout: self.provider_timeout,
            max_concurrency: self.max_concurrency,
            retry: self.retry,
        }
    }
}

fn nasa_keys<F>(lookup: &F) -> Result<Option<Vec<Credential>>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(NASA_API_KEYS_VAR) {
        let keys = raw
            .split(',')
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(Credential::new)
            .collect::<Vec<_>>();
        if keys.is_empty() {
            return Err(ConfigError::EmptyValue {
                name: NASA_API_KEYS_VAR,
            });
        }
        return Ok(Some(keys));
    }

    Ok(non_empty(lookup, NASA_API_KEY_VAR)?.map(|key| vec![Credential::new(key)]))
}

fn non_empty<F>(lookup: &F, name: &'static str) -> Result<Option<String>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(value) if value.trim().is_empty() => Err(ConfigError::EmptyValue { name }),
        Some(value) => Ok(Some(value.trim().to_owned())),
    }
}

fn millis<F>(lookup: &F, name: &'static str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(name) else {
        return Ok(None);
    };
    match value.trim().parse::<u64>() {
        Ok(millis) if millis > 0 => Ok(Some(Duration::from_millis(millis))),
        _ => Err(ConfigError::InvalidNumber { name, value }),
    }
}

/// Wires adapters, governor and cache into an [`Aggregator`].
pub struct HubBuilder {
    config: HubConfig,
    http_client: Option<Arc<dyn HttpClient>>,
    cache: Option<ResultCache>,
}

impl HubBuilder {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            http_client: None,
            cache: None,
        }
    }

    /// Replaces the `reqwest` transport shared by every adapter.
    pub fn with_http_client(mut self, http_client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(http_client);
        self
    }

    pub fn with_cache(mut self, cache: ResultCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn build(self) -> Aggregator {
        let config = self.config;
        let http_client = self
            .http_client
            .unwrap_or_else(|| Arc::new(ReqwestHttpClient::new()) as Arc<dyn HttpClient>);

        let governor = RateGovernor::builder()
            .max_wait(config.max_wait)
            .provider(ProviderPolicy::default_for(ProviderId::Exoplanets), Vec::new())
            .provider(ProviderPolicy::default_for(ProviderId::Iss), Vec::new())
            .provider(
                ProviderPolicy::default_for(ProviderId::Mars),
                config.nasa_keys.clone(),
            )
            .build();

        Aggregator::builder()
            .adapter(Arc::new(ExoplanetArchiveAdapter::with_base_url(
                Arc::clone(&http_client),
                config.exoplanets_base_url.as_str(),
            )))
            .adapter(Arc::new(IssPositionAdapter::with_base_url(
                Arc::clone(&http_client),
                config.iss_base_url.as_str(),
            )))
            .adapter(Arc::new(MarsRoverAdapter::with_config(
                http_client,
                config.mars_base_url.as_str(),
                config.roster.clone(),
            )))
            .governor(governor)
            .cache(self.cache.unwrap_or_default())
            .config(config.aggregator_config())
            .build()
    }
}
