//! Property-style tests for query normalization.
//!
//! Each property is checked over a fixed corpus of representative inputs
//! rather than random generation, so failures name the exact input.

use serde_json::{json, Value};
use spacehub_core::{InvalidQuery, NormalizedQuery, QueryField, QueryNormalizer, RawParams};

fn normalizer() -> QueryNormalizer {
    QueryNormalizer::with_current_year(2025)
}

fn raw(value: Value) -> RawParams {
    serde_json::from_value(value).expect("raw params must be an object")
}

fn normalize(value: Value) -> Result<NormalizedQuery, InvalidQuery> {
    normalizer().normalize(&raw(value))
}

fn valid_corpus() -> Vec<Value> {
    vec![
        json!({}),
        json!({"discovery_year": 2023}),
        json!({"discovery_year": "2023", "radius_max": "1.5", "habitable_zone": "true"}),
        json!({"min_radius": 0.5, "max_radius": 2, "limit": 25}),
        json!({"habitable_zone": 0}),
        json!({"rover": "Curiosity", "sol": 1000, "camera": "navcam", "page": 2}),
        json!({"rover": "PERSEVERANCE", "earth_date": "2021-02-18"}),
        json!({"timestamp": 1_700_000_000}),
        json!({"at": "0"}),
        json!({"radius_min": -0.0}),
        json!({"sol": null, "rover": "spirit"}),
    ]
}

// =============================================================================
// Normalizer: Idempotence and canonical form
// =============================================================================

#[test]
fn when_normalized_query_is_fed_back_then_it_is_unchanged() {
    for input in valid_corpus() {
        // Given: A valid raw query
        let once = normalize(input.clone()).unwrap_or_else(|error| panic!("{input}: {error}"));

        // When: Its canonical form is normalized again
        let twice = normalizer()
            .normalize(&once.to_raw_params())
            .unwrap_or_else(|error| panic!("{input} (second pass): {error}"));

        // Then: Both passes agree, including the cache key
        assert_eq!(once, twice, "input {input}");
        assert_eq!(once.cache_key(), twice.cache_key(), "input {input}");
    }
}

#[test]
fn when_values_arrive_as_strings_then_they_match_typed_values() {
    let pairs = [
        (json!({"sol": "1000"}), json!({"sol": 1000})),
        (json!({"radius_max": "1.50"}), json!({"radius_max": 1.5})),
        (json!({"habitable_zone": "1"}), json!({"habitable_zone": true})),
        (json!({"habitable_zone": "no"}), json!({"habitable_zone": false})),
        (json!({"discovery_year": " 2023 "}), json!({"discovery_year": 2023})),
    ];

    for (text, typed) in pairs {
        assert_eq!(
            normalize(text.clone()).expect("string form"),
            normalize(typed.clone()).expect("typed form"),
            "{text} vs {typed}"
        );
    }
}

#[test]
fn when_aliases_are_used_then_they_collapse_to_canonical_fields() {
    // Given: The same filters spelled with aliases and canonical names
    let aliased = normalize(json!({"min_radius": 1, "max_radius": 2, "timestamp": 10})).expect("valid");
    let canonical = normalize(json!({"radius_min": 1, "radius_max": 2, "at": 10})).expect("valid");

    // Then: They are indistinguishable downstream
    assert_eq!(aliased, canonical);
    assert_eq!(aliased.cache_key(), "radius_min=1&radius_max=2&at=10");
}

#[test]
fn when_rover_and_camera_differ_in_case_then_cache_keys_match() {
    let lower = normalize(json!({"rover": "curiosity", "camera": "navcam", "sol": 1}))
        .expect("valid");
    let mixed = normalize(json!({"rover": "CuRiOsItY", "camera": "NavCam", "sol": 1}))
        .expect("valid");

    assert_eq!(lower.cache_key(), mixed.cache_key());
    assert_eq!(lower.text(QueryField::Rover), Some("curiosity"));
    assert_eq!(lower.text(QueryField::Camera), Some("NAVCAM"));
}

#[test]
fn when_negative_zero_radius_is_given_then_it_keys_like_zero() {
    let negative = normalize(json!({"radius_min": -0.0})).expect("valid");
    let positive = normalize(json!({"radius_min": 0})).expect("valid");
    assert_eq!(negative.cache_key(), positive.cache_key());
}

#[test]
fn when_fields_are_supplied_in_any_order_then_cache_key_uses_vocabulary_order() {
    let query = normalize(json!({"page": 3, "sol": 5, "rover": "spirit"})).expect("valid");
    assert_eq!(query.cache_key(), "rover=spirit&sol=5&page=3");
}

#[test]
fn when_value_is_null_then_field_is_treated_as_unset() {
    let query = normalize(json!({"sol": null})).expect("valid");
    assert!(query.is_empty());
}

// =============================================================================
// Normalizer: Rejections
// =============================================================================

#[test]
fn when_field_is_unknown_then_error_names_it() {
    let error = normalize(json!({"planet_mass": 3})).expect_err("unknown field");
    assert_eq!(error.field, "planet_mass");
    assert!(error.reason.is_none());
}

#[test]
fn when_values_are_out_of_range_then_the_offending_field_is_reported() {
    let cases = [
        (json!({"discovery_year": 1988}), "discovery_year"),
        (json!({"discovery_year": 2027}), "discovery_year"),
        (json!({"discovery_year": 2023.5}), "discovery_year"),
        (json!({"radius_max": -1}), "radius_max"),
        (json!({"radius_max": "wide"}), "radius_max"),
        (json!({"habitable_zone": "maybe"}), "habitable_zone"),
        (json!({"limit": 0}), "limit"),
        (json!({"limit": 1001}), "limit"),
        (json!({"sol": -1}), "sol"),
        (json!({"page": 0}), "page"),
        (json!({"rover": "sojourner"}), "rover"),
        (json!({"camera": "selfie"}), "camera"),
        (json!({"earth_date": "2021-02-30"}), "earth_date"),
        (json!({"earth_date": "18/02/2021"}), "earth_date"),
        (json!({"at": -5}), "at"),
    ];

    for (input, field) in cases {
        let error = normalize(input.clone()).expect_err(&format!("{input} should be rejected"));
        assert_eq!(error.field, field, "input {input}");
        assert!(error.reason.is_some(), "input {input}");
    }
}

#[test]
fn when_discovery_year_is_next_year_then_it_is_still_accepted() {
    let query = normalize(json!({"discovery_year": 2026})).expect("next year is allowed");
    assert_eq!(query.integer(QueryField::DiscoveryYear), Some(2026));
}

#[test]
fn when_radius_bounds_are_inverted_then_radius_min_is_rejected() {
    let error = normalize(json!({"radius_min": 3, "radius_max": 1})).expect_err("inverted");
    assert_eq!(error.field, "radius_min");
}

#[test]
fn when_sol_and_earth_date_are_combined_then_query_is_rejected() {
    let error = normalize(json!({"sol": 10, "earth_date": "2015-06-03"})).expect_err("exclusive");
    assert_eq!(error.field, "earth_date");
}

#[test]
fn when_alias_and_canonical_name_are_both_given_then_query_is_rejected() {
    let error = normalize(json!({"min_radius": 1, "radius_min": 1})).expect_err("duplicate");
    assert_eq!(error.field, "radius_min");
}
