//! Shared doubles for the integration suites. Nothing here touches the network.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use spacehub_core::{
    AuthRequirement, CapabilitySet, FetchContext, FetchFuture, HttpClient, HttpError, HttpRequest,
    HttpResponse, NativeRequest, NormalizedQuery, NormalizedRecord, ParsedRecords, ProviderAdapter,
    ProviderDescriptor, ProviderId, QueryField, QueryNormalizer, RawResponse, SourceError,
};

pub fn query(raw: Value) -> NormalizedQuery {
    QueryNormalizer::with_current_year(2025)
        .normalize(&serde_json::from_value(raw).expect("raw params must be an object"))
        .expect("query should normalize")
}

/// Upstream request for cache tests, keyed by its path.
pub fn request(path: &str) -> NativeRequest {
    NativeRequest::new(format!("https://upstream.test/{path}"))
}

/// Replays scripted HTTP responses in order and records every request URL.
#[derive(Default)]
pub struct ScriptedHttpClient {
    responses: Mutex<VecDeque<Result<HttpResponse, HttpError>>>,
    urls: Mutex<Vec<String>>,
}

impl ScriptedHttpClient {
    pub fn new(responses: Vec<Result<HttpResponse, HttpError>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            urls: Mutex::new(Vec::new()),
        })
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().expect("url log").clone()
    }
}

impl HttpClient for ScriptedHttpClient {
    fn execute<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>> {
        self.urls.lock().expect("url log").push(request.url);
        let response = self
            .responses
            .lock()
            .expect("script")
            .pop_front()
            .unwrap_or_else(|| Ok(HttpResponse::new(500, "script exhausted")));
        Box::pin(async move { response })
    }
}

/// One scripted answer of a [`FakeAdapter`].
#[derive(Clone)]
pub enum Reply {
    Records(Vec<NormalizedRecord>),
    Fail(SourceError),
}

/// In-memory provider with a configurable delay and reply script.
///
/// When the script runs out the last reply repeats.
pub struct FakeAdapter {
    id: ProviderId,
    capabilities: &'static [QueryField],
    delay: Duration,
    replies: Mutex<VecDeque<Reply>>,
    last: Mutex<Option<Reply>>,
    fetches: Arc<AtomicUsize>,
}

impl FakeAdapter {
    pub fn new(id: ProviderId, capabilities: &'static [QueryField]) -> Self {
        Self {
            id,
            capabilities,
            delay: Duration::ZERO,
            replies: Mutex::new(VecDeque::new()),
            last: Mutex::new(None),
            fetches: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn replying(self, reply: Reply) -> Self {
        self.replies.lock().expect("replies").push_back(reply);
        self
    }

    pub fn returning(self, count: usize) -> Self {
        let id = self.id;
        self.replying(Reply::Records(records(id, count)))
    }

    pub fn fetch_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.fetches)
    }

    fn next_reply(&self) -> Reply {
        let mut last = self.last.lock().expect("last reply");
        if let Some(reply) = self.replies.lock().expect("replies").pop_front() {
            *last = Some(reply);
        }
        last.clone().unwrap_or(Reply::Records(Vec::new()))
    }
}

impl ProviderAdapter for FakeAdapter {
    fn describe(&self) -> ProviderDescriptor {
        ProviderDescriptor {
            id: self.id,
            name: "fake",
            capabilities: CapabilitySet::new(self.capabilities),
            auth: AuthRequirement::None,
            timeout: Duration::from_secs(30),
            cache_ttl: Duration::from_secs(60),
            base_url: format!("https://{}.fake", self.id),
        }
    }

    fn translate(&self, query: &NormalizedQuery) -> Result<NativeRequest, SourceError> {
        match CapabilitySet::new(self.capabilities).first_unsupported(query) {
            Some(field) => Err(SourceError::unsupported_filter(field)),
            None => Ok(NativeRequest::new(format!("https://{}.fake", self.id))
                .with_param("q", query.cache_key())),
        }
    }

    fn fetch<'a>(&'a self, _request: NativeRequest, _context: FetchContext) -> FetchFuture<'a> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let reply = self.next_reply();
        let delay = self.delay;
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match reply {
                Reply::Records(records) => Ok(RawResponse::json(
                    serde_json::to_string(&records).expect("records serialize"),
                )),
                Reply::Fail(error) => Err(error),
            }
        })
    }

    fn parse(&self, response: RawResponse) -> Result<ParsedRecords, SourceError> {
        let records: Vec<NormalizedRecord> = serde_json::from_str(&response.body).map_err(|error| {
            SourceError::malformed_response(error.to_string(), response.payload_bytes())
        })?;
        Ok(ParsedRecords::new(records, 0))
    }
}

pub fn records(provider: ProviderId, count: usize) -> Vec<NormalizedRecord> {
    (0..count)
        .map(|index| {
            NormalizedRecord::new(provider).with(
                "name",
                spacehub_core::FieldValue::text(format!("{provider}-{index}")),
            )
        })
        .collect()
}
