use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use super::{decode_json, send};
use crate::data_source::{
    AuthRequirement, CapabilitySet, FetchContext, FetchFuture, NativeRequest, ParsedRecords,
    ProviderAdapter, ProviderDescriptor, RawResponse, SourceError,
};
use crate::http_client::HttpClient;
use crate::{FieldValue, NormalizedQuery, NormalizedRecord, ProviderId, QueryField};

pub const DEFAULT_BASE_URL: &str = "https://exoplanetarchive.ipac.caltech.edu/TAP/sync";
const DEFAULT_LIMIT: i64 = 100;
const COLUMNS: &str = "pl_name,pl_rade,disc_year,st_teff,sy_dist,pl_orbsmax";

/// Orbital band, in AU, treated as the conservative habitable zone.
const HABITABLE_ZONE_AU: (f64, f64) = (0.7, 1.5);

const CAPABILITIES: &[QueryField] = &[
    QueryField::DiscoveryYear,
    QueryField::RadiusMin,
    QueryField::RadiusMax,
    QueryField::HabitableZone,
    QueryField::Limit,
];

/// NASA Exoplanet Archive adapter querying the `ps` table over TAP.
#[derive(Clone)]
pub struct ExoplanetArchiveAdapter {
    http_client: Arc<dyn HttpClient>,
    base_url: String,
}

impl ExoplanetArchiveAdapter {
    pub fn new(http_client: Arc<dyn HttpClient>) -> Self {
        Self::with_base_url(http_client, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(http_client: Arc<dyn HttpClient>, base_url: impl Into<String>) -> Self {
        Self {
            http_client,
            base_url: base_url.into(),
        }
    }

    fn adql(query: &NormalizedQuery) -> String {
        let limit = query.integer(QueryField::Limit).unwrap_or(DEFAULT_LIMIT);
        let mut conditions = Vec::new();

        if let Some(year) = query.integer(QueryField::DiscoveryYear) {
            conditions.push(format!("disc_year={year}"));
        }
        if let Some(min) = query.number(QueryField::RadiusMin) {
            conditions.push(format!("pl_rade>={min}"));
        }
        if let Some(max) = query.number(QueryField::RadiusMax) {
            conditions.push(format!("pl_rade<={max}"));
        }
        if query.flag(QueryField::HabitableZone) == Some(true) {
            let (inner, outer) = HABITABLE_ZONE_AU;
            conditions.push(format!("pl_orbsmax>{inner} and pl_orbsmax<{outer}"));
        }

        let mut adql = format!("select top {limit} {COLUMNS} from ps");
        if !conditions.is_empty() {
            adql.push_str(" where ");
            adql.push_str(&conditions.join(" and "));
        }
        adql.push_str(" order by disc_year desc");
        adql
    }
}

impl ProviderAdapter for ExoplanetArchiveAdapter {
    fn describe(&self) -> ProviderDescriptor {
        ProviderDescriptor {
            id: ProviderId::Exoplanets,
            name: "NASA Exoplanet Archive",
            capabilities: CapabilitySet::new(CAPABILITIES),
            auth: AuthRequirement::None,
            timeout: Duration::from_secs(5),
            cache_ttl: Duration::from_secs(3_600),
            base_url: self.base_url.clone(),
        }
    }

    fn translate(&self, query: &NormalizedQuery) -> Result<NativeRequest, SourceError> {
        if let Some(field) = CapabilitySet::new(CAPABILITIES).first_unsupported(query) {
            return Err(SourceError::unsupported_filter(field));
        }

        Ok(NativeRequest::new(self.base_url.as_str())
            .with_param("query", Self::adql(query))
            .with_param("format", "json"))
    }

    fn fetch<'a>(&'a self, request: NativeRequest, context: FetchContext) -> FetchFuture<'a> {
        Box::pin(async move { send(self.http_client.as_ref(), &request, &context).await })
    }

    fn parse(&self, response: RawResponse) -> Result<ParsedRecords, SourceError> {
        let rows: Vec<Value> = decode_json(ProviderId::Exoplanets, &response)?;

        let mut records = Vec::with_capacity(rows.len());
        let mut skipped = 0;
        for row in rows {
            match serde_json::from_value::<PlanetRow>(row).ok().and_then(normalize_planet) {
                Some(record) => records.push(record),
                None => skipped += 1,
            }
        }

        Ok(ParsedRecords::new(records, skipped))
    }
}

#[derive(Debug, Clone, Deserialize)]
struct PlanetRow {
    pl_name: Option<String>,
    pl_rade: Option<f64>,
    disc_year: Option<i64>,
    st_teff: Option<f64>,
    sy_dist: Option<f64>,
    pl_orbsmax: Option<f64>,
}

fn normalize_planet(row: PlanetRow) -> Option<NormalizedRecord> {
    let name = row.pl_name.filter(|name| !name.trim().is_empty())?;

    Some(
        NormalizedRecord::new(ProviderId::Exoplanets)
            .with("name", FieldValue::text(name))
            .with("radius_earth", FieldValue::optional_number("radius_earth", row.pl_rade).ok()?)
            .with("discovery_year", FieldValue::optional_integer(row.disc_year))
            .with(
                "star_temperature_k",
                FieldValue::optional_number("star_temperature_k", row.st_teff).ok()?,
            )
            .with("distance_pc", FieldValue::optional_number("distance_pc", row.sy_dist).ok()?)
            .with(
                "semi_major_axis_au",
                FieldValue::optional_number("semi_major_axis_au", row.pl_orbsmax).ok()?,
            ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::test_support::RecordingHttpClient;
    use crate::{QueryNormalizer, SourceErrorKind};
    use serde_json::json;

    fn query(raw: Value) -> NormalizedQuery {
        QueryNormalizer::with_current_year(2025)
            .normalize(&serde_json::from_value(raw).expect("object"))
            .expect("valid query")
    }

    fn adapter() -> ExoplanetArchiveAdapter {
        ExoplanetArchiveAdapter::new(Arc::new(RecordingHttpClient::default()))
    }

    #[test]
    fn translates_filters_into_adql() {
        let request = adapter()
            .translate(&query(json!({
                "discovery_year": 2023,
                "radius_max": 1.5,
                "habitable_zone": true
            })))
            .expect("supported");

        assert_eq!(
            request.param("query"),
            Some(
                "select top 100 pl_name,pl_rade,disc_year,st_teff,sy_dist,pl_orbsmax from ps \
                 where disc_year=2023 and pl_rade<=1.5 and pl_orbsmax>0.7 and pl_orbsmax<1.5 \
                 order by disc_year desc"
            )
        );
        assert_eq!(request.param("format"), Some("json"));
    }

    #[test]
    fn empty_query_has_no_where_clause() {
        let request = adapter()
            .translate(&NormalizedQuery::empty())
            .expect("supported");
        assert_eq!(
            request.param("query"),
            Some("select top 100 pl_name,pl_rade,disc_year,st_teff,sy_dist,pl_orbsmax from ps order by disc_year desc")
        );
    }

    #[test]
    fn rover_filters_are_unsupported() {
        let error = adapter()
            .translate(&query(json!({"discovery_year": 2023, "sol": 1000})))
            .expect_err("sol is not an exoplanet filter");

        assert_eq!(error.kind(), SourceErrorKind::UnsupportedFilter);
        assert_eq!(error.field(), Some(QueryField::Sol));
    }

    #[test]
    fn parse_marks_nulls_absent_and_drops_unnamed_rows() {
        let body = json!([
            {"pl_name": "TOI-715 b", "pl_rade": 1.55, "disc_year": 2023, "st_teff": 3075.0, "sy_dist": 42.0, "pl_orbsmax": null},
            {"pl_name": null, "pl_rade": 2.0, "disc_year": 2023},
            {"pl_name": "K2-18 b", "pl_rade": "wide", "disc_year": 2015}
        ])
        .to_string();

        let parsed = adapter().parse(RawResponse::json(body)).expect("array payload");

        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.skipped, 2);
        let record = &parsed.records[0];
        assert_eq!(record.get("name").as_str(), Some("TOI-715 b"));
        assert_eq!(record.get("discovery_year"), &FieldValue::Integer(2023));
        assert!(record.get("semi_major_axis_au").is_absent());
        assert_eq!(record.provider, ProviderId::Exoplanets);
    }

    #[test]
    fn non_array_payload_is_malformed() {
        let error = adapter()
            .parse(RawResponse::json("<html>maintenance</html>"))
            .expect_err("not json");

        assert_eq!(error.kind(), SourceErrorKind::MalformedResponse);
        assert_eq!(error.payload_bytes(), Some(24));
    }

    #[tokio::test]
    async fn fetch_sends_encoded_adql() {
        let client = Arc::new(RecordingHttpClient::replying("[]"));
        let adapter = ExoplanetArchiveAdapter::with_base_url(client.clone(), "https://tap.test/sync");
        let request = adapter
            .translate(&query(json!({"discovery_year": 2023, "limit": 5})))
            .expect("supported");

        let response = adapter
            .fetch(request, FetchContext::new(Duration::from_secs(5)))
            .await
            .expect("scripted success");

        assert_eq!(response.body, "[]");
        let urls = client.recorded_urls();
        assert_eq!(urls.len(), 1);
        assert!(urls[0].starts_with("https://tap.test/sync?query=select%20top%205%20"));
        assert!(urls[0].ends_with("&format=json"));
    }
}
