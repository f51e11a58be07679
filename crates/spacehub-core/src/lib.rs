//! Core engine for spacehub.
//!
//! This crate contains:
//! - Query normalization over a fixed field vocabulary
//! - Canonical records and provider identifiers
//! - Provider adapters for the exoplanet archive, ISS position and Mars rover photos
//! - Rate/key governing, result caching with single-flight fetches
//! - The aggregation engine and its response envelope

pub mod adapters;
pub mod aggregator;
pub mod cache;
pub mod config;
pub mod data_source;
pub mod domain;
pub mod envelope;
pub mod error;
pub mod http_client;
pub mod normalizer;
pub mod provider_policy;
pub mod retry;
pub mod source;
pub mod throttling;

pub use adapters::{ExoplanetArchiveAdapter, IssPositionAdapter, MarsRoverAdapter, RoverRoster};
pub use aggregator::{Aggregator, AggregatorBuilder, AggregatorConfig, ProviderSelection};
pub use cache::{CacheEntry, CacheOutcome, FetchedBatch, ResultCache};
pub use config::{HubBuilder, HubConfig};
pub use data_source::{
    AuthRequirement, CapabilitySet, Credential, FetchContext, FetchFuture, NativeRequest,
    ParsedRecords, ProviderAdapter, ProviderDescriptor, RawResponse, SourceError, SourceErrorKind,
};
pub use domain::{
    FieldValue, NormalizedQuery, NormalizedRecord, QueryField, QueryValue, RawParams, UtcDateTime,
};
pub use envelope::{
    AggregateResult, Envelope, EnvelopeMeta, ErrorReason, ProviderDiagnostics, ProviderStatus,
};
pub use error::{ConfigError, CoreError, InvalidQuery, ValidationError};
pub use http_client::{HttpClient, HttpError, HttpRequest, HttpResponse, ReqwestHttpClient};
pub use normalizer::{normalize, QueryNormalizer};
pub use provider_policy::{ProviderPolicy, QuotaPolicy};
pub use retry::{Backoff, RetryPolicy};
pub use source::ProviderId;
pub use throttling::{Permit, QuotaSnapshot, RateGovernor};
