use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Serialize, Serializer};

use crate::cache::CacheOutcome;
use crate::{NormalizedRecord, ProviderId, QueryField, SourceError, SourceErrorKind, UtcDateTime, ValidationError};

pub const SCHEMA_VERSION: &str = "v1.0.0";

/// Failure reason carried by `error:<reason>` statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorReason {
    UpstreamPermanent,
    UpstreamTransient,
    MalformedResponse,
    NotRegistered,
    Internal,
}

impl ErrorReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UpstreamPermanent => "upstream_permanent",
            Self::UpstreamTransient => "upstream_transient",
            Self::MalformedResponse => "malformed_response",
            Self::NotRegistered => "not_registered",
            Self::Internal => "internal",
        }
    }
}

/// Outcome of one provider within an aggregate request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderStatus {
    Success,
    /// The provider answered but some upstream rows were dropped as malformed.
    Partial,
    RateLimited,
    Timeout,
    Unsupported(QueryField),
    Error(ErrorReason),
}

impl ProviderStatus {
    pub fn from_error(error: &SourceError) -> Self {
        match error.kind() {
            SourceErrorKind::UnsupportedFilter => error
                .field()
                .map_or(Self::Error(ErrorReason::Internal), Self::Unsupported),
            SourceErrorKind::RateLimited => Self::RateLimited,
            SourceErrorKind::Timeout => Self::Timeout,
            SourceErrorKind::Transient => Self::Error(ErrorReason::UpstreamTransient),
            SourceErrorKind::Permanent => Self::Error(ErrorReason::UpstreamPermanent),
            SourceErrorKind::MalformedResponse => Self::Error(ErrorReason::MalformedResponse),
            SourceErrorKind::AdapterNotRegistered => Self::Error(ErrorReason::NotRegistered),
            SourceErrorKind::Internal => Self::Error(ErrorReason::Internal),
        }
    }

    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl Display for ProviderStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Partial => f.write_str("partial"),
            Self::RateLimited => f.write_str("rate_limited"),
            Self::Timeout => f.write_str("timeout"),
            Self::Unsupported(field) => write!(f, "unsupported:{field}"),
            Self::Error(reason) => write!(f, "error:{}", reason.as_str()),
        }
    }
}

impl Serialize for ProviderStatus {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

/// Per-provider detail that never changes the meaning of the status map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProviderDiagnostics {
    pub records: usize,
    #[serde(skip_serializing_if = "is_zero")]
    pub skipped: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheOutcome>,
    pub latency_ms: u64,
    /// Upstream calls made by this request; zero when served from cache or a
    /// joined flight.
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Best-effort result of one aggregate request.
///
/// Always produced, even when every provider failed; `providers` is the
/// authoritative account of what happened.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateResult {
    pub providers: BTreeMap<ProviderId, ProviderStatus>,
    /// Concatenated in provider-id order, upstream order within a provider.
    pub records: Vec<NormalizedRecord>,
    /// True whenever at least one requested provider did not succeed.
    pub partial: bool,
    pub diagnostics: BTreeMap<ProviderId, ProviderDiagnostics>,
}

impl AggregateResult {
    pub fn status(&self, provider: ProviderId) -> Option<ProviderStatus> {
        self.providers.get(&provider).copied()
    }

    pub fn records_from(&self, provider: ProviderId) -> impl Iterator<Item = &NormalizedRecord> + '_ {
        self.records
            .iter()
            .filter(move |record| record.provider == provider)
    }
}

/// Standard wrapper for machine-readable output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope<T> {
    pub meta: EnvelopeMeta,
    pub data: T,
}

impl<T> Envelope<T> {
    pub fn new(meta: EnvelopeMeta, data: T) -> Self {
        Self { meta, data }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvelopeMeta {
    pub request_id: String,
    pub schema_version: String,
    pub generated_at: UtcDateTime,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub providers: Vec<ProviderId>,
}

impl EnvelopeMeta {
    pub fn new(
        request_id: impl Into<String>,
        providers: Vec<ProviderId>,
        latency_ms: u64,
    ) -> Result<Self, ValidationError> {
        let meta = Self {
            request_id: request_id.into(),
            schema_version: String::from(SCHEMA_VERSION),
            generated_at: UtcDateTime::now(),
            latency_ms,
            providers,
        };
        meta.validate()?;
        Ok(meta)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.request_id.trim().len() < 8 {
            return Err(ValidationError::InvalidRequestId);
        }
        if !is_valid_schema_version(&self.schema_version) {
            return Err(ValidationError::InvalidSchemaVersion {
                value: self.schema_version.clone(),
            });
        }
        Ok(())
    }
}

fn is_valid_schema_version(value: &str) -> bool {
    let Some(version) = value.strip_prefix('v') else {
        return false;
    };

    let parts = version.split('.').collect::<Vec<_>>();
    parts.len() == 3
        && parts
            .iter()
            .all(|part| !part.is_empty() && part.chars().all(|ch| ch.is_ascii_digit()))
}

fn is_zero(value: &usize) -> bool {
    *value == 0
}
