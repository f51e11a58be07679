//! Behavior-driven tests for the aggregation engine.
//!
//! These tests verify what a caller observes from `aggregate`: status maps,
//! record ordering, deadlines, single-flight fetches and rate limiting.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use spacehub_core::{
    Aggregator, AggregatorConfig, CacheOutcome, Credential, HttpResponse, HubBuilder, HubConfig,
    ProviderId, ProviderPolicy, ProviderSelection, ProviderStatus, QueryField, QuotaPolicy,
    RateGovernor, RetryPolicy, SourceError,
};
use spacehub_tests::{query, FakeAdapter, Reply, ScriptedHttpClient};

const EXOPLANET_FIELDS: &[QueryField] = &[
    QueryField::DiscoveryYear,
    QueryField::RadiusMax,
    QueryField::HabitableZone,
];
const MARS_FIELDS: &[QueryField] = &[QueryField::Sol, QueryField::Rover, QueryField::Camera];
const ISS_FIELDS: &[QueryField] = &[QueryField::At];

fn config() -> AggregatorConfig {
    AggregatorConfig {
        request_deadline: Duration::from_secs(2),
        provider_timeout: Duration::from_secs(30),
        max_concurrency: 8,
        retry: RetryPolicy::fixed(Duration::from_millis(10), 1),
    }
}

fn planet_rows(count: usize) -> String {
    let rows = (0..count)
        .map(|index| {
            json!({
                "pl_name": format!("Planet {index} b"),
                "pl_rade": 1.1,
                "disc_year": 2023,
                "st_teff": 3_400.0,
                "sy_dist": 20.5,
                "pl_orbsmax": 1.0
            })
        })
        .collect::<Vec<_>>();
    serde_json::to_string(&rows).expect("rows serialize")
}

// =============================================================================
// Aggregation: Real adapters over a scripted transport
// =============================================================================

#[tokio::test]
async fn when_exoplanet_query_matches_twelve_planets_then_twelve_records_are_returned() {
    // Given: The archive answers with twelve planets
    let http = ScriptedHttpClient::new(vec![Ok(HttpResponse::ok_json(planet_rows(12)))]);
    let aggregator = HubBuilder::new(HubConfig::default())
        .with_http_client(http.clone())
        .build();

    // When: A caller asks for small habitable-zone planets found in 2023
    let result = aggregator
        .aggregate(
            &query(json!({"discovery_year": 2023, "radius_max": 1.5, "habitable_zone": true})),
            &ProviderSelection::Matching,
        )
        .await;

    // Then: Only the exoplanet archive is involved and every record is tagged with it
    assert_eq!(result.providers.len(), 1);
    assert_eq!(result.status(ProviderId::Exoplanets), Some(ProviderStatus::Success));
    assert_eq!(result.records.len(), 12);
    assert!(result.records.iter().all(|record| record.provider == ProviderId::Exoplanets));
    assert!(!result.partial);

    let urls = http.urls();
    assert_eq!(urls.len(), 1);
    assert!(urls[0].contains("disc_year%3D2023"));
}

#[tokio::test]
async fn when_mars_sol_has_no_photos_then_result_is_empty_success() {
    // Given: The rover API has no photos for the requested sol
    let http = ScriptedHttpClient::new(vec![Ok(HttpResponse::ok_json(r#"{"photos": []}"#))]);
    let aggregator = HubBuilder::new(HubConfig::default())
        .with_http_client(http.clone())
        .build();

    // When: A caller asks for a sol far in the future
    let result = aggregator
        .aggregate(&query(json!({"sol": 999_999})), &ProviderSelection::Matching)
        .await;

    // Then: The provider succeeded with zero records and the request is not partial
    assert_eq!(result.status(ProviderId::Mars), Some(ProviderStatus::Success));
    assert!(result.records.is_empty());
    assert!(!result.partial);
    assert!(http.urls()[0].contains("/rovers/curiosity/photos?sol=999999"));
    assert!(http.urls()[0].contains("api_key=DEMO_KEY"));
}

#[tokio::test]
async fn when_first_nasa_key_is_rejected_then_the_next_key_is_used() {
    // Given: Two NASA keys and an upstream that rejects the first with 429
    let http = ScriptedHttpClient::new(vec![
        Ok(HttpResponse::new(429, "slow down").with_header("retry-after", "120")),
        Ok(HttpResponse::ok_json(r#"{"photos": []}"#)),
    ]);
    let aggregator = HubBuilder::new(HubConfig {
        nasa_keys: vec![Credential::new("first-key"), Credential::new("second-key")],
        ..HubConfig::default()
    })
    .with_http_client(http.clone())
    .build();

    // When: A rover query is aggregated
    let result = aggregator
        .aggregate(&query(json!({"sol": 1000})), &ProviderSelection::Matching)
        .await;

    // Then: The request succeeds on the second key and the first is marked exhausted
    assert_eq!(result.status(ProviderId::Mars), Some(ProviderStatus::Success));
    let urls = http.urls();
    assert_eq!(urls.len(), 2);
    assert!(urls[0].ends_with("api_key=first-key"));
    assert!(urls[1].ends_with("api_key=second-key"));

    let snapshot = aggregator
        .governor()
        .snapshot(ProviderId::Mars)
        .expect("mars quota");
    assert_eq!(snapshot.exhausted_keys, vec![0]);
}

#[tokio::test]
async fn when_upstream_returns_garbage_then_provider_reports_malformed_response() {
    // Given: The archive is serving an HTML maintenance page
    let http = ScriptedHttpClient::new(vec![Ok(HttpResponse::ok_json("<html>down</html>"))]);
    let aggregator = HubBuilder::new(HubConfig::default())
        .with_http_client(http)
        .build();

    // When: An exoplanet query runs
    let result = aggregator
        .aggregate(&query(json!({"discovery_year": 2020})), &ProviderSelection::Matching)
        .await;

    // Then: The failure is classified, not retried, and not cached
    assert_eq!(
        result.status(ProviderId::Exoplanets).map(|status| status.to_string()).as_deref(),
        Some("error:malformed_response")
    );
    assert!(result.partial);
    assert_eq!(result.diagnostics[&ProviderId::Exoplanets].attempts, 1);
    assert!(aggregator.cache().is_empty());
}

// =============================================================================
// Aggregation: Deadlines and partial results
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_one_provider_hangs_then_request_returns_at_the_deadline_with_timeout() {
    // Given: A provider that takes ten seconds and one that answers at once
    let aggregator = Aggregator::builder()
        .adapter(Arc::new(
            FakeAdapter::new(ProviderId::Mars, MARS_FIELDS)
                .with_delay(Duration::from_secs(10))
                .returning(3),
        ))
        .adapter(Arc::new(FakeAdapter::new(ProviderId::Iss, ISS_FIELDS).returning(1)))
        .config(config())
        .build();
    let started = tokio::time::Instant::now();

    // When: Both are asked with a two second deadline
    let result = aggregator
        .aggregate(
            &query(json!({})),
            &ProviderSelection::Only(vec![ProviderId::Iss, ProviderId::Mars]),
        )
        .await;

    // Then: The call returns at the deadline and keeps the fast provider's data
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed < Duration::from_millis(2_100), "returned after {elapsed:?}");
    assert_eq!(result.status(ProviderId::Mars), Some(ProviderStatus::Timeout));
    assert_eq!(result.status(ProviderId::Iss), Some(ProviderStatus::Success));
    assert_eq!(result.records.len(), 1);
    assert!(result.partial);
}

#[tokio::test]
async fn when_one_provider_fails_permanently_then_the_other_still_contributes() {
    // Given: Exoplanets fails permanently while the ISS answers
    let aggregator = Aggregator::builder()
        .adapter(Arc::new(
            FakeAdapter::new(ProviderId::Exoplanets, EXOPLANET_FIELDS)
                .replying(Reply::Fail(SourceError::permanent("upstream responded 404"))),
        ))
        .adapter(Arc::new(FakeAdapter::new(ProviderId::Iss, ISS_FIELDS).returning(2)))
        .config(config())
        .build();

    // When: Both are aggregated
    let result = aggregator
        .aggregate(
            &query(json!({})),
            &ProviderSelection::Only(vec![ProviderId::Exoplanets, ProviderId::Iss]),
        )
        .await;

    // Then: The request is partial and carries only the ISS records
    assert!(result.partial);
    assert_eq!(
        result.status(ProviderId::Exoplanets).map(|status| status.to_string()).as_deref(),
        Some("error:upstream_permanent")
    );
    assert_eq!(result.status(ProviderId::Iss), Some(ProviderStatus::Success));
    assert_eq!(result.records.len(), 2);
    assert!(result.records.iter().all(|record| record.provider == ProviderId::Iss));
}

#[tokio::test]
async fn when_providers_succeed_then_records_follow_provider_id_order() {
    // Given: Three providers registered in reverse order
    let aggregator = Aggregator::builder()
        .adapter(Arc::new(FakeAdapter::new(ProviderId::Mars, MARS_FIELDS).returning(2)))
        .adapter(Arc::new(FakeAdapter::new(ProviderId::Iss, ISS_FIELDS).returning(1)))
        .adapter(Arc::new(
            FakeAdapter::new(ProviderId::Exoplanets, EXOPLANET_FIELDS).returning(3),
        ))
        .config(config())
        .build();

    // When: An empty query involves them all
    let result = aggregator
        .aggregate(&query(json!({})), &ProviderSelection::Matching)
        .await;

    // Then: Records are grouped by provider id, upstream order preserved within each
    let order = result
        .records
        .iter()
        .map(|record| record.get("name").as_str().unwrap_or_default().to_owned())
        .collect::<Vec<_>>();
    assert_eq!(
        order,
        vec!["exoplanets-0", "exoplanets-1", "exoplanets-2", "iss-0", "mars-0", "mars-1"]
    );
    assert!(!result.partial);
}

#[tokio::test]
async fn when_query_names_a_field_a_provider_lacks_then_it_reports_unsupported() {
    // Given: Mars and ISS adapters
    let aggregator = Aggregator::builder()
        .adapter(Arc::new(FakeAdapter::new(ProviderId::Mars, MARS_FIELDS).returning(1)))
        .adapter(Arc::new(FakeAdapter::new(ProviderId::Iss, ISS_FIELDS).returning(1)))
        .config(config())
        .build();

    // When: A camera filter is sent to both explicitly
    let result = aggregator
        .aggregate(
            &query(json!({"camera": "navcam"})),
            &ProviderSelection::Only(vec![ProviderId::Iss, ProviderId::Mars]),
        )
        .await;

    // Then: The ISS skips with the offending field and Mars answers
    assert_eq!(
        result.status(ProviderId::Iss).map(|status| status.to_string()).as_deref(),
        Some("unsupported:camera")
    );
    assert_eq!(result.status(ProviderId::Mars), Some(ProviderStatus::Success));
}

// =============================================================================
// Aggregation: Retries
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_first_attempt_is_transient_then_one_retry_recovers() {
    // Given: A provider that fails transiently once and then answers
    let adapter = FakeAdapter::new(ProviderId::Iss, ISS_FIELDS)
        .replying(Reply::Fail(SourceError::transient("connection reset")))
        .returning(1);
    let fetches = adapter.fetch_counter();
    let aggregator = Aggregator::builder()
        .adapter(Arc::new(adapter))
        .config(config())
        .build();

    // When: The ISS is queried
    let result = aggregator
        .aggregate(&query(json!({})), &ProviderSelection::Matching)
        .await;

    // Then: The second attempt succeeds
    assert_eq!(result.status(ProviderId::Iss), Some(ProviderStatus::Success));
    assert_eq!(fetches.load(Ordering::SeqCst), 2);
    assert_eq!(result.diagnostics[&ProviderId::Iss].attempts, 2);
}

#[tokio::test(start_paused = true)]
async fn when_failure_persists_then_retry_is_bounded_to_one() {
    // Given: A provider that always fails transiently
    let adapter = FakeAdapter::new(ProviderId::Iss, ISS_FIELDS)
        .replying(Reply::Fail(SourceError::transient("upstream responded 503")));
    let fetches = adapter.fetch_counter();
    let aggregator = Aggregator::builder()
        .adapter(Arc::new(adapter))
        .config(config())
        .build();

    // When: The ISS is queried
    let result = aggregator
        .aggregate(&query(json!({})), &ProviderSelection::Matching)
        .await;

    // Then: Exactly two attempts were made before reporting the error
    assert_eq!(fetches.load(Ordering::SeqCst), 2);
    assert_eq!(
        result.status(ProviderId::Iss).map(|status| status.to_string()).as_deref(),
        Some("error:upstream_transient")
    );
}

// =============================================================================
// Aggregation: Single-flight and caching
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_identical_requests_arrive_concurrently_then_upstream_is_called_once() {
    // Given: A slow provider
    let adapter = FakeAdapter::new(ProviderId::Mars, MARS_FIELDS)
        .with_delay(Duration::from_millis(200))
        .returning(4);
    let fetches = adapter.fetch_counter();
    let aggregator = Aggregator::builder()
        .adapter(Arc::new(adapter))
        .config(config())
        .build();
    let sol = query(json!({"sol": 1000}));

    // When: Five identical requests run at the same time
    let requests = (0..5).map(|_| {
        let aggregator = aggregator.clone();
        let sol = sol.clone();
        tokio::spawn(async move { aggregator.aggregate(&sol, &ProviderSelection::Matching).await })
    });
    let results = futures::future::join_all(requests).await;

    // Then: One fetch served all five, each with the same records
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    let mut fresh = 0;
    for result in results {
        let result = result.expect("request task");
        assert_eq!(result.status(ProviderId::Mars), Some(ProviderStatus::Success));
        assert_eq!(result.records.len(), 4);
        if result.diagnostics[&ProviderId::Mars].cache == Some(CacheOutcome::Fresh) {
            fresh += 1;
        }
    }
    assert_eq!(fresh, 1);
}

#[tokio::test]
async fn when_same_query_repeats_within_ttl_then_it_is_served_from_cache() {
    // Given: A provider that has answered once
    let adapter = FakeAdapter::new(ProviderId::Iss, ISS_FIELDS).returning(1);
    let fetches = adapter.fetch_counter();
    let aggregator = Aggregator::builder()
        .adapter(Arc::new(adapter))
        .config(config())
        .build();
    let live = query(json!({}));
    aggregator.aggregate(&live, &ProviderSelection::Matching).await;

    // When: The same query runs again
    let result = aggregator.aggregate(&live, &ProviderSelection::Matching).await;

    // Then: No new upstream call is made
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    assert_eq!(result.diagnostics[&ProviderId::Iss].cache, Some(CacheOutcome::Hit));
    assert_eq!(result.diagnostics[&ProviderId::Iss].attempts, 0);
}

#[tokio::test]
async fn when_queries_differ_only_by_adapter_defaults_then_they_share_one_fetch() {
    let pairs = [
        (ProviderId::Exoplanets, json!({}), json!({"habitable_zone": false}), "[]"),
        (ProviderId::Exoplanets, json!({}), json!({"limit": 100}), "[]"),
        (ProviderId::Mars, json!({}), json!({"page": 1}), r#"{"latest_photos": []}"#),
        (ProviderId::Mars, json!({}), json!({"rover": "curiosity"}), r#"{"latest_photos": []}"#),
    ];

    for (provider, plain, explicit, payload) in pairs {
        // Given: A hub whose upstream answers exactly once
        let http = ScriptedHttpClient::new(vec![Ok(HttpResponse::ok_json(payload))]);
        let aggregator = HubBuilder::new(HubConfig::default())
            .with_http_client(http.clone())
            .build();
        let only = ProviderSelection::Only(vec![provider]);

        // When: The bare query runs, then the one spelling out the default
        let first = aggregator.aggregate(&query(plain.clone()), &only).await;
        let second = aggregator.aggregate(&query(explicit.clone()), &only).await;

        // Then: The second is a cache hit and upstream saw a single request
        assert_eq!(first.status(provider), Some(ProviderStatus::Success), "{explicit}");
        assert_eq!(second.status(provider), Some(ProviderStatus::Success), "{explicit}");
        assert_eq!(
            second.diagnostics[&provider].cache,
            Some(CacheOutcome::Hit),
            "{plain} vs {explicit}"
        );
        assert_eq!(http.urls().len(), 1, "{plain} vs {explicit}");
        assert_eq!(aggregator.cache().len(), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn when_every_worker_is_busy_then_cached_results_are_still_served() {
    // Given: One worker slot, a cached ISS answer and a slow rover fetch
    let iss = FakeAdapter::new(ProviderId::Iss, ISS_FIELDS).returning(1);
    let iss_fetches = iss.fetch_counter();
    let mars = FakeAdapter::new(ProviderId::Mars, MARS_FIELDS)
        .with_delay(Duration::from_secs(10))
        .returning(1);
    let aggregator = Aggregator::builder()
        .adapter(Arc::new(iss))
        .adapter(Arc::new(mars))
        .config(AggregatorConfig {
            max_concurrency: 1,
            ..config()
        })
        .build();
    let live = query(json!({}));
    let iss_only = ProviderSelection::Only(vec![ProviderId::Iss]);
    aggregator.aggregate(&live, &iss_only).await;

    let busy = {
        let aggregator = aggregator.clone();
        tokio::spawn(async move {
            aggregator
                .aggregate_within(
                    &query(json!({"sol": 3})),
                    &ProviderSelection::Only(vec![ProviderId::Mars]),
                    Duration::from_secs(60),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    // When: The cached query repeats with a one second budget
    let result = aggregator
        .aggregate_within(&live, &iss_only, Duration::from_secs(1))
        .await;

    // Then: It is answered from cache while the rover fetch still holds the slot
    assert_eq!(result.status(ProviderId::Iss), Some(ProviderStatus::Success));
    assert_eq!(result.diagnostics[&ProviderId::Iss].cache, Some(CacheOutcome::Hit));
    assert_eq!(iss_fetches.load(Ordering::SeqCst), 1);
    assert!(!busy.is_finished());

    let busy = busy.await.expect("rover request");
    assert_eq!(busy.status(ProviderId::Mars), Some(ProviderStatus::Success));
}

#[tokio::test(start_paused = true)]
async fn when_caller_gives_up_then_the_shared_fetch_still_fills_the_cache() {
    // Given: A provider slower than the request deadline
    let adapter = FakeAdapter::new(ProviderId::Mars, MARS_FIELDS)
        .with_delay(Duration::from_secs(5))
        .returning(2);
    let fetches = adapter.fetch_counter();
    let aggregator = Aggregator::builder()
        .adapter(Arc::new(adapter))
        .config(config())
        .build();
    let sol = query(json!({"sol": 12}));

    // When: The first request times out and a later one repeats it
    let first = aggregator.aggregate(&sol, &ProviderSelection::Matching).await;
    tokio::time::sleep(Duration::from_secs(4)).await;
    let second = aggregator.aggregate(&sol, &ProviderSelection::Matching).await;

    // Then: The abandoned fetch completed in the background and serves the repeat
    assert_eq!(first.status(ProviderId::Mars), Some(ProviderStatus::Timeout));
    assert_eq!(second.status(ProviderId::Mars), Some(ProviderStatus::Success));
    assert_eq!(second.diagnostics[&ProviderId::Mars].cache, Some(CacheOutcome::Hit));
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Aggregation: Rate limiting
// =============================================================================

#[tokio::test]
async fn when_budget_is_exhausted_then_provider_is_rate_limited_without_fetching() {
    // Given: A provider allowed one call per minute
    let adapter = FakeAdapter::new(ProviderId::Exoplanets, EXOPLANET_FIELDS).returning(1);
    let fetches = adapter.fetch_counter();
    let governor = RateGovernor::builder()
        .max_wait(Duration::from_millis(50))
        .provider(
            ProviderPolicy {
                provider_id: ProviderId::Exoplanets,
                quota: QuotaPolicy::TokenBucket {
                    window: Duration::from_secs(60),
                    limit: 1,
                },
                demo_key_limit: None,
            },
            Vec::new(),
        )
        .build();
    let aggregator = Aggregator::builder()
        .adapter(Arc::new(adapter))
        .governor(governor)
        .config(config())
        .build();

    // When: Two different queries run back to back
    let first = aggregator
        .aggregate(&query(json!({"discovery_year": 2020})), &ProviderSelection::Matching)
        .await;
    let second = aggregator
        .aggregate(&query(json!({"discovery_year": 2021})), &ProviderSelection::Matching)
        .await;

    // Then: The second is rejected before any upstream call, with a retry hint
    assert_eq!(first.status(ProviderId::Exoplanets), Some(ProviderStatus::Success));
    assert_eq!(second.status(ProviderId::Exoplanets), Some(ProviderStatus::RateLimited));
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    let diagnostics = &second.diagnostics[&ProviderId::Exoplanets];
    assert_eq!(diagnostics.attempts, 0);
    assert!(diagnostics.retry_after_ms.is_some_and(|ms| ms > 0));
}

#[tokio::test]
async fn when_aggregator_shuts_down_then_cache_is_cleared() {
    // Given: A cached result
    let aggregator = Aggregator::builder()
        .adapter(Arc::new(FakeAdapter::new(ProviderId::Iss, ISS_FIELDS).returning(1)))
        .config(config())
        .build();
    aggregator
        .aggregate(&query(json!({})), &ProviderSelection::Matching)
        .await;
    assert_eq!(aggregator.cache().len(), 1);

    // When: The engine shuts down
    aggregator.shutdown();

    // Then: Nothing remains cached or in flight
    assert!(aggregator.cache().is_empty());
    assert_eq!(aggregator.cache().in_flight(), 0);
}
