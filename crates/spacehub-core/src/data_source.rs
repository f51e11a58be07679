//! Provider adapter trait and request/response types.
//!
//! Every upstream source is wrapped by a [`ProviderAdapter`] that is driven by
//! the aggregator in four steps:
//!
//! | Step | Input | Output | Failure |
//! |------|-------|--------|---------|
//! | [`describe`](ProviderAdapter::describe) | | [`ProviderDescriptor`] | |
//! | [`translate`](ProviderAdapter::translate) | [`NormalizedQuery`] | [`NativeRequest`] | `UnsupportedFilter` |
//! | [`fetch`](ProviderAdapter::fetch) | [`NativeRequest`] | [`RawResponse`] | transient / permanent / rate limited / timeout |
//! | [`parse`](ProviderAdapter::parse) | [`RawResponse`] | [`ParsedRecords`] | `MalformedResponse` |
//!
//! `translate` and `parse` are pure; only `fetch` performs I/O.

use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::Serialize;

use crate::{NormalizedQuery, NormalizedRecord, ProviderId, QueryField};

/// Query fields a provider knows how to honor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CapabilitySet(&'static [QueryField]);

impl CapabilitySet {
    pub const fn new(fields: &'static [QueryField]) -> Self {
        Self(fields)
    }

    pub fn supports(self, field: QueryField) -> bool {
        self.0.contains(&field)
    }

    /// First query field this provider cannot honor, in vocabulary order.
    pub fn first_unsupported(self, query: &NormalizedQuery) -> Option<QueryField> {
        query.fields().find(|field| !self.supports(*field))
    }

    pub fn covers(self, query: &NormalizedQuery) -> bool {
        self.first_unsupported(query).is_none()
    }

    pub fn fields(self) -> &'static [QueryField] {
        self.0
    }
}

/// How a provider authenticates outbound calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthRequirement {
    None,
    ApiKey,
    RotatingKey,
}

/// Static capability declaration of one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderDescriptor {
    pub id: ProviderId,
    pub name: &'static str,
    pub capabilities: CapabilitySet,
    pub auth: AuthRequirement,
    /// Per-call timeout budget.
    pub timeout: Duration,
    /// Default cache lifetime for this provider's results.
    pub cache_ttl: Duration,
    pub base_url: String,
}

/// API credential handed out by the governor.
///
/// `Debug` and `Display` never print the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Short, non-reversible label safe for logs and snapshots.
    pub fn redacted(&self) -> String {
        let prefix: String = self.0.chars().take(4).collect();
        format!("{prefix}***")
    }
}

impl Debug for Credential {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Credential({})", self.redacted())
    }
}

impl Display for Credential {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.redacted())
    }
}

/// Provider-native request produced by `translate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeRequest {
    pub url: String,
    pub params: Vec<(String, String)>,
}

impl NativeRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            params: Vec::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Result cache key. Credentials are attached at fetch time and never
    /// appear here.
    pub fn cache_key(&self) -> String {
        self.to_url()
    }

    /// Full URL with percent-encoded query parameters.
    pub fn to_url(&self) -> String {
        if self.params.is_empty() {
            return self.url.clone();
        }

        let query = self
            .params
            .iter()
            .map(|(key, value)| {
                format!(
                    "{}={}",
                    urlencoding::encode(key),
                    urlencoding::encode(value)
                )
            })
            .collect::<Vec<_>>()
            .join("&");
        format!("{}?{query}", self.url)
    }
}

/// Per-call inputs supplied by the aggregator.
#[derive(Debug, Clone)]
pub struct FetchContext {
    pub timeout: Duration,
    pub credential: Option<Credential>,
}

impl FetchContext {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            credential: None,
        }
    }

    pub fn with_credential(mut self, credential: Option<Credential>) -> Self {
        self.credential = credential;
        self
    }
}

/// Successful upstream payload, before parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub body: String,
    /// Lowercased header names.
    pub headers: BTreeMap<String, String>,
}

impl RawResponse {
    pub fn json(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Remaining calls reported by `X-RateLimit-Remaining`, if present.
    pub fn rate_limit_remaining(&self) -> Option<u32> {
        self.header("x-ratelimit-remaining")?.trim().parse().ok()
    }

    pub fn payload_bytes(&self) -> usize {
        self.body.len()
    }
}

/// Parsed records plus the number of upstream rows dropped as malformed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedRecords {
    pub records: Vec<NormalizedRecord>,
    pub skipped: usize,
}

impl ParsedRecords {
    pub fn new(records: Vec<NormalizedRecord>, skipped: usize) -> Self {
        Self { records, skipped }
    }
}

/// Adapter-level error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceErrorKind {
    UnsupportedFilter,
    RateLimited,
    Transient,
    Timeout,
    Permanent,
    MalformedResponse,
    AdapterNotRegistered,
    Internal,
}

/// Structured source error reported per provider by the aggregator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceError {
    kind: SourceErrorKind,
    message: String,
    retryable: bool,
    field: Option<QueryField>,
    retry_after: Option<Duration>,
    payload_bytes: Option<usize>,
}

impl SourceError {
    fn new(kind: SourceErrorKind, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable,
            field: None,
            retry_after: None,
            payload_bytes: None,
        }
    }

    pub fn unsupported_filter(field: QueryField) -> Self {
        Self {
            field: Some(field),
            ..Self::new(
                SourceErrorKind::UnsupportedFilter,
                format!("query field '{field}' is not supported by this provider"),
                false,
            )
        }
    }

    /// Unsupported value for a field the provider otherwise understands.
    pub fn unsupported_value(field: QueryField, message: impl Into<String>) -> Self {
        Self {
            field: Some(field),
            ..Self::new(SourceErrorKind::UnsupportedFilter, message, false)
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            ..Self::new(SourceErrorKind::RateLimited, message, false)
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::Transient, message, true)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::Timeout, message, true)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::Permanent, message, false)
    }

    pub fn malformed_response(message: impl Into<String>, payload_bytes: usize) -> Self {
        Self {
            payload_bytes: Some(payload_bytes),
            ..Self::new(SourceErrorKind::MalformedResponse, message, false)
        }
    }

    pub fn adapter_not_registered(provider: ProviderId) -> Self {
        Self::new(
            SourceErrorKind::AdapterNotRegistered,
            format!("provider adapter '{provider}' is not registered"),
            false,
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::Internal, message, false)
    }

    pub const fn kind(&self) -> SourceErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Only transient failures and timeouts are retry-eligible.
    pub const fn retryable(&self) -> bool {
        self.retryable
    }

    pub const fn field(&self) -> Option<QueryField> {
        self.field
    }

    pub const fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    pub const fn payload_bytes(&self) -> Option<usize> {
        self.payload_bytes
    }

    pub const fn code(&self) -> &'static str {
        match self.kind {
            SourceErrorKind::UnsupportedFilter => "source.unsupported_filter",
            SourceErrorKind::RateLimited => "source.rate_limited",
            SourceErrorKind::Transient => "source.upstream_transient",
            SourceErrorKind::Timeout => "source.timeout",
            SourceErrorKind::Permanent => "source.upstream_permanent",
            SourceErrorKind::MalformedResponse => "source.malformed_response",
            SourceErrorKind::AdapterNotRegistered => "source.adapter_not_registered",
            SourceErrorKind::Internal => "source.internal",
        }
    }
}

impl Display for SourceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code())
    }
}

impl std::error::Error for SourceError {}

/// Boxed future returned by [`ProviderAdapter::fetch`].
pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<RawResponse, SourceError>> + Send + 'a>>;

/// Provider adapter contract.
///
/// Implementations must be `Send + Sync`: a single adapter instance is shared
/// by every aggregate request and by detached single-flight fetch tasks.
pub trait ProviderAdapter: Send + Sync {
    fn describe(&self) -> ProviderDescriptor;

    /// Builds the provider-native request.
    ///
    /// # Errors
    ///
    /// Returns an `UnsupportedFilter` [`SourceError`] when the query contains a
    /// field, or a value, this provider cannot honor.
    fn translate(&self, query: &NormalizedQuery) -> Result<NativeRequest, SourceError>;

    /// Performs the network call under `context.timeout`.
    fn fetch<'a>(&'a self, request: NativeRequest, context: FetchContext) -> FetchFuture<'a>;

    /// Maps the provider-native payload onto normalized records.
    ///
    /// # Errors
    ///
    /// Returns a `MalformedResponse` [`SourceError`] when the payload as a
    /// whole cannot be interpreted. Individually malformed rows are dropped
    /// and counted in [`ParsedRecords::skipped`] instead.
    fn parse(&self, response: RawResponse) -> Result<ParsedRecords, SourceError>;

    /// Cache lifetime for results of `query`.
    fn cache_ttl(&self, query: &NormalizedQuery) -> Duration {
        let _ = query;
        self.describe().cache_ttl
    }
}
