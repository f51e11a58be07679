//! Query normalization.
//!
//! Validates client-facing filter parameters against the fixed vocabulary and
//! canonicalizes them so that semantically identical queries always produce
//! the same [`NormalizedQuery`] and therefore the same cache key.
//!
//! | Field | Accepted input | Canonical form |
//! |-------|----------------|----------------|
//! | `discovery_year` | integer in `[1989, current_year + 1]` | `Integer` |
//! | `radius_min` / `radius_max` | finite number `>= 0` | `Number` |
//! | `habitable_zone` | `true/false/1/0/yes/no` | `Flag` |
//! | `limit` | integer in `[1, 1000]` | `Integer` |
//! | `rover` | known rover name, any case | lowercase `Text` |
//! | `sol` | integer `>= 0` | `Integer` |
//! | `earth_date` | `YYYY-MM-DD` | `Date` |
//! | `camera` | known camera code, any case | uppercase `Text` |
//! | `page` | integer `>= 1` | `Integer` |
//! | `at` | unix seconds `>= 0` | `Integer` |
//!
//! Strings are accepted wherever numbers or booleans are, since CLI and
//! query-string callers cannot express JSON types. `null` means "not set".

use std::collections::BTreeMap;

use serde_json::Value;
use time::OffsetDateTime;

use crate::domain::{parse_calendar_date, NormalizedQuery, QueryField, QueryValue, RawParams};
use crate::error::InvalidQuery;

/// First year the exoplanet archive records a confirmed discovery.
pub const EARLIEST_DISCOVERY_YEAR: i64 = 1989;

pub const MAX_LIMIT: i64 = 1_000;

pub const KNOWN_ROVERS: [&str; 4] = ["curiosity", "opportunity", "spirit", "perseverance"];

pub const KNOWN_CAMERAS: [&str; 20] = [
    "FHAZ",
    "RHAZ",
    "MAST",
    "CHEMCAM",
    "MAHLI",
    "MARDI",
    "NAVCAM",
    "PANCAM",
    "MINITES",
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
];

/// Stateless validator; the only input besides the parameters is the clock
/// year bounding `discovery_year`.
#[derive(Debug, Clone, Copy)]
pub struct QueryNormalizer {
    current_year: i64,
}

impl Default for QueryNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryNormalizer {
    pub fn new() -> Self {
        Self::with_current_year(i64::from(OffsetDateTime::now_utc().year()))
    }

    pub const fn with_current_year(current_year: i64) -> Self {
        Self { current_year }
    }

    pub fn normalize(&self, raw: &RawParams) -> Result<NormalizedQuery, InvalidQuery> {
        let mut fields = BTreeMap::new();

        for (name, value) in raw {
            let field =
                QueryField::from_name(name).ok_or_else(|| InvalidQuery::unknown_field(name.trim()))?;
            if value.is_null() {
                continue;
            }

            let normalized = self.normalize_value(field, value)?;
            if fields.insert(field, normalized).is_some() {
                return Err(InvalidQuery::invalid_value(
                    field.as_str(),
                    "specified more than once",
                ));
            }
        }

        validate_cross_field(&fields)?;
        Ok(NormalizedQuery::from_fields(fields))
    }

    fn normalize_value(&self, field: QueryField, value: &Value) -> Result<QueryValue, InvalidQuery> {
        match field {
            QueryField::DiscoveryYear => {
                let year = integer_in_range(
                    field,
                    value,
                    EARLIEST_DISCOVERY_YEAR,
                    self.current_year + 1,
                )?;
                Ok(QueryValue::Integer(year))
            }
            QueryField::RadiusMin | QueryField::RadiusMax => {
                let radius = number(field, value)?;
                if radius < 0.0 {
                    return Err(InvalidQuery::invalid_value(
                        field.as_str(),
                        "must be non-negative",
                    ));
                }
                Ok(QueryValue::Number(radius))
            }
            QueryField::HabitableZone => flag(field, value).map(QueryValue::Flag),
            QueryField::Limit => integer_in_range(field, value, 1, MAX_LIMIT).map(QueryValue::Integer),
            QueryField::Sol | QueryField::At => {
                integer_in_range(field, value, 0, i64::MAX).map(QueryValue::Integer)
            }
            QueryField::Page => integer_in_range(field, value, 1, i64::MAX).map(QueryValue::Integer),
            QueryField::Rover => {
                let rover = text(field, value)?.to_ascii_lowercase();
                if !KNOWN_ROVERS.contains(&rover.as_str()) {
                    return Err(InvalidQuery::invalid_value(
                        field.as_str(),
                        format!("unknown rover '{rover}'"),
                    ));
                }
                Ok(QueryValue::Text(rover))
            }
            QueryField::Camera => {
                let camera = text(field, value)?.to_ascii_uppercase();
                if !KNOWN_CAMERAS.contains(&camera.as_str()) {
                    return Err(InvalidQuery::invalid_value(
                        field.as_str(),
                        format!("unknown camera '{camera}'"),
                    ));
                }
                Ok(QueryValue::Text(camera))
            }
            QueryField::EarthDate => {
                let raw = text(field, value)?;
                parse_calendar_date(&raw)
                    .map(QueryValue::Date)
                    .map_err(|_| InvalidQuery::invalid_value(field.as_str(), "expected YYYY-MM-DD"))
            }
        }
    }
}

/// Normalizes with the current UTC year as the `discovery_year` bound.
pub fn normalize(raw: &RawParams) -> Result<NormalizedQuery, InvalidQuery> {
    QueryNormalizer::new().normalize(raw)
}

fn validate_cross_field(fields: &BTreeMap<QueryField, QueryValue>) -> Result<(), InvalidQuery> {
    if let (Some(QueryValue::Number(min)), Some(QueryValue::Number(max))) = (
        fields.get(&QueryField::RadiusMin),
        fields.get(&QueryField::RadiusMax),
    ) {
        if min > max {
            return Err(InvalidQuery::invalid_value(
                QueryField::RadiusMin.as_str(),
                "must not exceed radius_max",
            ));
        }
    }

    if fields.contains_key(&QueryField::Sol) && fields.contains_key(&QueryField::EarthDate) {
        return Err(InvalidQuery::invalid_value(
            QueryField::EarthDate.as_str(),
            "cannot be combined with sol",
        ));
    }

    Ok(())
}

fn integer_in_range(
    field: QueryField,
    value: &Value,
    min: i64,
    max: i64,
) -> Result<i64, InvalidQuery> {
    let parsed = match value {
        Value::Number(number) => number.as_i64(),
        Value::String(raw) => raw.trim().parse::<i64>().ok(),
        _ => None,
    }
    .ok_or_else(|| InvalidQuery::invalid_value(field.as_str(), "must be an integer"))?;

    if parsed < min || parsed > max {
        let reason = if max == i64::MAX {
            format!("must be >= {min}")
        } else {
            format!("must be within [{min}, {max}]")
        };
        return Err(InvalidQuery::invalid_value(field.as_str(), reason));
    }

    Ok(parsed)
}

fn number(field: QueryField, value: &Value) -> Result<f64, InvalidQuery> {
    let parsed = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(raw) => raw.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|parsed| parsed.is_finite())
    .ok_or_else(|| InvalidQuery::invalid_value(field.as_str(), "must be a finite number"))?;

    // -0.0 and 0.0 must share a cache key.
    Ok(if parsed == 0.0 { 0.0 } else { parsed })
}

fn flag(field: QueryField, value: &Value) -> Result<bool, InvalidQuery> {
    let parsed = match value {
        Value::Bool(flag) => Some(*flag),
        Value::Number(number) => match number.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        Value::String(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    };

    parsed.ok_or_else(|| InvalidQuery::invalid_value(field.as_str(), "must be a boolean"))
}

fn text(field: QueryField, value: &Value) -> Result<String, InvalidQuery> {
    match value {
        Value::String(raw) if !raw.trim().is_empty() => Ok(raw.trim().to_owned()),
        _ => Err(InvalidQuery::invalid_value(
            field.as_str(),
            "must be a non-empty string",
        )),
    }
}
