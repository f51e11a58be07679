use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use super::{decode_json, send};
use crate::data_source::{
    AuthRequirement, CapabilitySet, FetchContext, FetchFuture, NativeRequest, ParsedRecords,
    ProviderAdapter, ProviderDescriptor, RawResponse, SourceError,
};
use crate::domain::{format_calendar_date, parse_calendar_date, RecordFields};
use crate::http_client::HttpClient;
use crate::{
    ConfigError, FieldValue, NormalizedQuery, NormalizedRecord, ProviderId, QueryField, UtcDateTime,
};

pub const DEFAULT_BASE_URL: &str = "https://api.nasa.gov/mars-photos/api/v1";
pub const DEFAULT_ROVER: &str = "curiosity";

const SOL_TTL: Duration = Duration::from_secs(24 * 3_600);
const LATEST_TTL: Duration = Duration::from_secs(10 * 60);

const CAPABILITIES: &[QueryField] = &[
    QueryField::Rover,
    QueryField::Sol,
    QueryField::EarthDate,
    QueryField::Camera,
    QueryField::Page,
];

/// Cameras mounted on each rover, keyed by lowercase rover name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoverRoster {
    rovers: BTreeMap<String, Vec<String>>,
}

impl Default for RoverRoster {
    fn default() -> Self {
        let rovers = [
            (
                "curiosity",
                &["FHAZ", "RHAZ", "MAST", "CHEMCAM", "MAHLI", "MARDI", "NAVCAM"][..],
            ),
            ("opportunity", &["FHAZ", "RHAZ", "NAVCAM", "PANCAM", "MINITES"][..]),
            ("spirit", &["FHAZ", "RHAZ", "NAVCAM", "PANCAM", "MINITES"][..]),
            (
                "perseverance",
                &[
                    "EDL_RUCAM",
                    "EDL_RDCAM",
                    "EDL_DDCAM",
                    "NAVCAM_LEFT",
                    "NAVCAM_RIGHT",
                    "MCZ_LEFT",
                    "MCZ_RIGHT",
                    "FRONT_HAZCAM_LEFT_A",
                    "REAR_HAZCAM_LEFT",
                    "SKYCAM",
                    "SHERLOC_WATSON",
                ][..],
            ),
        ];

        Self {
            rovers: rovers
                .into_iter()
                .map(|(rover, cameras)| {
                    (
                        rover.to_owned(),
                        cameras.iter().map(|camera| (*camera).to_owned()).collect(),
                    )
                })
                .collect(),
        }
    }
}

impl RoverRoster {
    /// Builds a roster from configuration; every rover needs at least one camera.
    pub fn new<I, C>(rovers: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, C)>,
        C: IntoIterator<Item = String>,
    {
        let mut roster = BTreeMap::new();
        for (rover, cameras) in rovers {
            let rover = rover.trim().to_ascii_lowercase();
            let cameras = cameras
                .into_iter()
                .map(|camera| camera.trim().to_ascii_uppercase())
                .filter(|camera| !camera.is_empty())
                .collect::<Vec<_>>();
            if cameras.is_empty() {
                return Err(ConfigError::EmptyRoster { rover });
            }
            roster.insert(rover, cameras);
        }
        Ok(Self { rovers: roster })
    }

    pub fn cameras(&self, rover: &str) -> Option<&[String]> {
        self.rovers.get(rover).map(Vec::as_slice)
    }

    pub fn rovers(&self) -> impl Iterator<Item = &str> + '_ {
        self.rovers.keys().map(String::as_str)
    }
}

/// Mars Rover Photos adapter. Requires an API key from the governor's
/// rotation list.
#[derive(Clone)]
pub struct MarsRoverAdapter {
    http_client: Arc<dyn HttpClient>,
    base_url: String,
    roster: RoverRoster,
}

impl MarsRoverAdapter {
    pub fn new(http_client: Arc<dyn HttpClient>) -> Self {
        Self::with_config(http_client, DEFAULT_BASE_URL, RoverRoster::default())
    }

    pub fn with_config(
        http_client: Arc<dyn HttpClient>,
        base_url: impl Into<String>,
        roster: RoverRoster,
    ) -> Self {
        Self {
            http_client,
            base_url: base_url.into(),
            roster,
        }
    }

    pub fn roster(&self) -> &RoverRoster {
        &self.roster
    }

    fn is_latest(query: &NormalizedQuery) -> bool {
        !query.contains(QueryField::Sol) && !query.contains(QueryField::EarthDate)
    }
}

impl ProviderAdapter for MarsRoverAdapter {
    fn describe(&self) -> ProviderDescriptor {
        ProviderDescriptor {
            id: ProviderId::Mars,
            name: "NASA Mars Rover Photos",
            capabilities: CapabilitySet::new(CAPABILITIES),
            auth: AuthRequirement::RotatingKey,
            timeout: Duration::from_secs(5),
            cache_ttl: SOL_TTL,
            base_url: self.base_url.clone(),
        }
    }

    fn translate(&self, query: &NormalizedQuery) -> Result<NativeRequest, SourceError> {
        if let Some(field) = CapabilitySet::new(CAPABILITIES).first_unsupported(query) {
            return Err(SourceError::unsupported_filter(field));
        }

        let rover = query.text(QueryField::Rover).unwrap_or(DEFAULT_ROVER);
        let cameras = self.roster.cameras(rover).ok_or_else(|| {
            SourceError::unsupported_value(
                QueryField::Rover,
                format!("rover '{rover}' is not on the configured roster"),
            )
        })?;

        let base = format!("{}/rovers/{rover}", self.base_url.trim_end_matches('/'));
        let mut request = if let Some(sol) = query.integer(QueryField::Sol) {
            NativeRequest::new(format!("{base}/photos")).with_param("sol", sol.to_string())
        } else if let Some(date) = query.date(QueryField::EarthDate) {
            NativeRequest::new(format!("{base}/photos"))
                .with_param("earth_date", format_calendar_date(date))
        } else {
            NativeRequest::new(format!("{base}/latest_photos"))
        };

        if let Some(camera) = query.text(QueryField::Camera) {
            if !cameras.iter().any(|known| known == camera) {
                return Err(SourceError::unsupported_value(
                    QueryField::Camera,
                    format!("camera '{camera}' is not mounted on {rover}"),
                ));
            }
            request = request.with_param("camera", camera.to_ascii_lowercase());
        }

        let page = query.integer(QueryField::Page).unwrap_or(1);
        Ok(request.with_param("page", page.to_string()))
    }

    fn fetch<'a>(&'a self, request: NativeRequest, context: FetchContext) -> FetchFuture<'a> {
        Box::pin(async move {
            let credential = context.credential.as_ref().ok_or_else(|| {
                SourceError::internal("mars rover photos require an API key permit")
            })?;
            let request = request.with_param("api_key", credential.expose());
            send(self.http_client.as_ref(), &request, &context).await
        })
    }

    fn parse(&self, response: RawResponse) -> Result<ParsedRecords, SourceError> {
        let payload: PhotosResponse = decode_json(ProviderId::Mars, &response)?;
        let rows = payload.photos.or(payload.latest_photos).ok_or_else(|| {
            SourceError::malformed_response(
                "mars payload has neither 'photos' nor 'latest_photos'",
                response.payload_bytes(),
            )
        })?;

        let mut records = Vec::with_capacity(rows.len());
        let mut skipped = 0;
        for row in rows {
            match serde_json::from_value::<Photo>(row).ok().and_then(normalize_photo) {
                Some(record) => records.push(record),
                None => skipped += 1,
            }
        }

        Ok(ParsedRecords::new(records, skipped))
    }

    fn cache_ttl(&self, query: &NormalizedQuery) -> Duration {
        if Self::is_latest(query) {
            LATEST_TTL
        } else {
            SOL_TTL
        }
    }
}

#[derive(Debug, Deserialize)]
struct PhotosResponse {
    photos: Option<Vec<Value>>,
    latest_photos: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct Photo {
    id: i64,
    sol: Option<i64>,
    img_src: Option<String>,
    earth_date: Option<String>,
    camera: Option<PhotoCamera>,
    rover: Option<PhotoRover>,
}

#[derive(Debug, Deserialize)]
struct PhotoCamera {
    name: Option<String>,
    full_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PhotoRover {
    name: Option<String>,
}

/// Rows with an unreadable earth date are dropped.
fn normalize_photo(photo: Photo) -> Option<NormalizedRecord> {
    let observed_at = match photo.earth_date.as_deref() {
        Some(raw) => FieldValue::timestamp(UtcDateTime::from_date(parse_calendar_date(raw).ok()?)),
        None => FieldValue::Absent,
    };

    let camera = photo.camera.map_or(FieldValue::Absent, |camera| {
        let mut fields = RecordFields::new();
        fields.insert(String::from("name"), FieldValue::optional_text(camera.name));
        fields.insert(
            String::from("full_name"),
            FieldValue::optional_text(camera.full_name),
        );
        FieldValue::Record(fields)
    });

    let rover = photo
        .rover
        .and_then(|rover| rover.name)
        .map(|name| name.to_ascii_lowercase());

    let record = NormalizedRecord::new(ProviderId::Mars)
        .with("photo_id", FieldValue::Integer(photo.id))
        .with("sol", FieldValue::optional_integer(photo.sol))
        .with("rover", FieldValue::optional_text(rover))
        .with("image_url", FieldValue::optional_text(photo.img_src))
        .with("observed_at", observed_at)
        .with("camera", camera);

    Some(record)
}
