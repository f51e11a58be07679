use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use super::{decode_json, send, validation_to_error};
use crate::data_source::{
    AuthRequirement, CapabilitySet, FetchContext, FetchFuture, NativeRequest, ParsedRecords,
    ProviderAdapter, ProviderDescriptor, RawResponse, SourceError,
};
use crate::http_client::HttpClient;
use crate::{FieldValue, NormalizedQuery, NormalizedRecord, ProviderId, QueryField, UtcDateTime};

pub const DEFAULT_BASE_URL: &str = "https://api.wheretheiss.at/v1/satellites";
pub const ISS_NORAD_ID: u32 = 25_544;

const KM_PER_MILE: f64 = 1.609_344;
const LIVE_TTL: Duration = Duration::from_secs(5);
/// Positions at a fixed past instant never change.
const HISTORICAL_TTL: Duration = Duration::from_secs(3_600);

const CAPABILITIES: &[QueryField] = &[QueryField::At];

/// Live and historical ISS orbital position.
#[derive(Clone)]
pub struct IssPositionAdapter {
    http_client: Arc<dyn HttpClient>,
    base_url: String,
    satellite_id: u32,
}

impl IssPositionAdapter {
    pub fn new(http_client: Arc<dyn HttpClient>) -> Self {
        Self::with_base_url(http_client, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(http_client: Arc<dyn HttpClient>, base_url: impl Into<String>) -> Self {
        Self {
            http_client,
            base_url: base_url.into(),
            satellite_id: ISS_NORAD_ID,
        }
    }
}

impl ProviderAdapter for IssPositionAdapter {
    fn describe(&self) -> ProviderDescriptor {
        ProviderDescriptor {
            id: ProviderId::Iss,
            name: "Where the ISS at?",
            capabilities: CapabilitySet::new(CAPABILITIES),
            auth: AuthRequirement::None,
            timeout: Duration::from_secs(5),
            cache_ttl: LIVE_TTL,
            base_url: self.base_url.clone(),
        }
    }

    fn translate(&self, query: &NormalizedQuery) -> Result<NativeRequest, SourceError> {
        if let Some(field) = CapabilitySet::new(CAPABILITIES).first_unsupported(query) {
            return Err(SourceError::unsupported_filter(field));
        }

        let satellite = format!("{}/{}", self.base_url.trim_end_matches('/'), self.satellite_id);
        let request = match query.integer(QueryField::At) {
            Some(at) => NativeRequest::new(format!("{satellite}/positions"))
                .with_param("timestamps", at.to_string()),
            None => NativeRequest::new(satellite),
        };
        Ok(request.with_param("units", "kilometers"))
    }

    fn fetch<'a>(&'a self, request: NativeRequest, context: FetchContext) -> FetchFuture<'a> {
        Box::pin(async move { send(self.http_client.as_ref(), &request, &context).await })
    }

    fn parse(&self, response: RawResponse) -> Result<ParsedRecords, SourceError> {
        let rows = match decode_json::<Value>(ProviderId::Iss, &response)? {
            Value::Array(rows) => rows,
            row @ Value::Object(_) => vec![row],
            _ => {
                return Err(SourceError::malformed_response(
                    "iss payload is neither an object nor an array",
                    response.payload_bytes(),
                ))
            }
        };

        let mut records = Vec::with_capacity(rows.len());
        let mut skipped = 0;
        for row in rows {
            let Ok(position) = serde_json::from_value::<Position>(row) else {
                skipped += 1;
                continue;
            };
            match normalize_position(position) {
                Ok(record) => records.push(record),
                Err(_) => skipped += 1,
            }
        }

        Ok(ParsedRecords::new(records, skipped))
    }

    fn cache_ttl(&self, query: &NormalizedQuery) -> Duration {
        if query.contains(QueryField::At) {
            HISTORICAL_TTL
        } else {
            LIVE_TTL
        }
    }
}

#[derive(Debug, Deserialize)]
struct Position {
    name: Option<String>,
    id: Option<i64>,
    latitude: f64,
    longitude: f64,
    altitude: Option<f64>,
    velocity: Option<f64>,
    visibility: Option<String>,
    timestamp: i64,
    units: Option<String>,
}

fn normalize_position(position: Position) -> Result<NormalizedRecord, SourceError> {
    let scale = match position.units.as_deref() {
        Some("miles") => KM_PER_MILE,
        _ => 1.0,
    };
    let observed_at = UtcDateTime::from_unix_seconds(position.timestamp).map_err(validation_to_error)?;

    Ok(NormalizedRecord::new(ProviderId::Iss)
        .with("name", FieldValue::optional_text(position.name))
        .with("norad_id", FieldValue::optional_integer(position.id))
        .with(
            "latitude",
            FieldValue::number("latitude", position.latitude).map_err(validation_to_error)?,
        )
        .with(
            "longitude",
            FieldValue::number("longitude", position.longitude).map_err(validation_to_error)?,
        )
        .with(
            "altitude_km",
            FieldValue::optional_number("altitude_km", position.altitude.map(|value| value * scale))
                .map_err(validation_to_error)?,
        )
        .with(
            "velocity_kmh",
            FieldValue::optional_number("velocity_kmh", position.velocity.map(|value| value * scale))
                .map_err(validation_to_error)?,
        )
        .with("visibility", FieldValue::optional_text(position.visibility))
        .with("observed_at", FieldValue::timestamp(observed_at)))
}
