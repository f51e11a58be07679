//! Concrete provider adapters.
//!
//! | Adapter | Provider | Upstream |
//! |---------|----------|----------|
//! | [`ExoplanetArchiveAdapter`] | `exoplanets` | NASA Exoplanet Archive TAP (ADQL) |
//! | [`IssPositionAdapter`] | `iss` | wheretheiss.at satellite positions |
//! | [`MarsRoverAdapter`] | `mars` | api.nasa.gov Mars Rover Photos |

mod exoplanets;
mod iss;
mod mars;

pub use exoplanets::{ExoplanetArchiveAdapter, DEFAULT_BASE_URL as EXOPLANETS_BASE_URL};
pub use iss::{IssPositionAdapter, DEFAULT_BASE_URL as ISS_BASE_URL, ISS_NORAD_ID};
pub use mars::{MarsRoverAdapter, RoverRoster, DEFAULT_BASE_URL as MARS_BASE_URL, DEFAULT_ROVER};

use serde::de::DeserializeOwned;

use crate::http_client::{HttpClient, HttpRequest};
use crate::{FetchContext, NativeRequest, ProviderId, RawResponse, SourceError, ValidationError};

/// Executes a translated request and classifies the HTTP status.
async fn send(
    http: &dyn HttpClient,
    request: &NativeRequest,
    context: &FetchContext,
) -> Result<RawResponse, SourceError> {
    let http_request = HttpRequest::get(request.to_url())
        .with_header("accept", "application/json")
        .with_timeout(context.timeout);

    http.execute(http_request).await?.into_raw_response()
}

fn decode_json<T>(provider: ProviderId, response: &RawResponse) -> Result<T, SourceError>
where
    T: DeserializeOwned,
{
    serde_json::from_str(&response.body).map_err(|error| {
        SourceError::malformed_response(
            format!("{provider} payload is not valid: {error}"),
            response.payload_bytes(),
        )
    })
}

fn validation_to_error(error: ValidationError) -> SourceError {
    SourceError::internal(error.to_string())
}
