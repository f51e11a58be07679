use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Serialize, Serializer};
use serde_json::{Number, Value};
use time::Date;

use super::timestamp::format_calendar_date;

/// Raw, client-facing filter parameters before normalization.
pub type RawParams = BTreeMap<String, Value>;

/// Fixed, provider-independent query vocabulary.
///
/// Declaration order is the canonical field order used by cache keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QueryField {
    DiscoveryYear,
    RadiusMin,
    RadiusMax,
    HabitableZone,
    Limit,
    Rover,
    Sol,
    EarthDate,
    Camera,
    Page,
    At,
}

impl QueryField {
    pub const ALL: [Self; 11] = [
        Self::DiscoveryYear,
        Self::RadiusMin,
        Self::RadiusMax,
        Self::HabitableZone,
        Self::Limit,
        Self::Rover,
        Self::Sol,
        Self::EarthDate,
        Self::Camera,
        Self::Page,
        Self::At,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DiscoveryYear => "discovery_year",
            Self::RadiusMin => "radius_min",
            Self::RadiusMax => "radius_max",
            Self::HabitableZone => "habitable_zone",
            Self::Limit => "limit",
            Self::Rover => "rover",
            Self::Sol => "sol",
            Self::EarthDate => "earth_date",
            Self::Camera => "camera",
            Self::Page => "page",
            Self::At => "at",
        }
    }

    /// Resolves a client-supplied name, accepting the legacy aliases.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        let field = match name.as_str() {
            "min_radius" => Self::RadiusMin,
            "max_radius" => Self::RadiusMax,
            "timestamp" => Self::At,
            other => return Self::ALL.into_iter().find(|field| field.as_str() == other),
        };
        Some(field)
    }
}

impl Display for QueryField {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for QueryField {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

/// Canonical, typed filter value.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryValue {
    Integer(i64),
    Number(f64),
    Flag(bool),
    Text(String),
    Date(Date),
}

impl QueryValue {
    pub fn to_json(&self) -> Value {
        match self {
            Self::Integer(value) => Value::from(*value),
            Self::Number(value) => Number::from_f64(*value)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::Flag(value) => Value::Bool(*value),
            Self::Text(value) => Value::String(value.clone()),
            Self::Date(value) => Value::String(format_calendar_date(*value)),
        }
    }
}

impl Display for QueryValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Integer(value) => write!(f, "{value}"),
            Self::Number(value) => write!(f, "{value}"),
            Self::Flag(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
            Self::Date(value) => f.write_str(&format_calendar_date(*value)),
        }
    }
}

/// Provider-agnostic, validated filter set.
///
/// Only [`crate::normalizer::QueryNormalizer`] constructs non-empty queries, so
/// every field/value pair has already passed vocabulary and range checks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedQuery {
    fields: BTreeMap<QueryField, QueryValue>,
}

impl NormalizedQuery {
    pub fn empty() -> Self {
        Self::default()
    }

    pub(crate) fn from_fields(fields: BTreeMap<QueryField, QueryValue>) -> Self {
        Self { fields }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn get(&self, field: QueryField) -> Option<&QueryValue> {
        self.fields.get(&field)
    }

    pub fn contains(&self, field: QueryField) -> bool {
        self.fields.contains_key(&field)
    }

    /// Fields present in canonical order.
    pub fn fields(&self) -> impl Iterator<Item = QueryField> + '_ {
        self.fields.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (QueryField, &QueryValue)> + '_ {
        self.fields.iter().map(|(field, value)| (*field, value))
    }

    pub fn integer(&self, field: QueryField) -> Option<i64> {
        match self.get(field)? {
            QueryValue::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn number(&self, field: QueryField) -> Option<f64> {
        match self.get(field)? {
            QueryValue::Number(value) => Some(*value),
            QueryValue::Integer(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn flag(&self, field: QueryField) -> Option<bool> {
        match self.get(field)? {
            QueryValue::Flag(value) => Some(*value),
            _ => None,
        }
    }

    pub fn text(&self, field: QueryField) -> Option<&str> {
        match self.get(field)? {
            QueryValue::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn date(&self, field: QueryField) -> Option<Date> {
        match self.get(field)? {
            QueryValue::Date(value) => Some(*value),
            _ => None,
        }
    }

    /// Deterministic cache key: `field=value` pairs in vocabulary order.
    pub fn cache_key(&self) -> String {
        self.fields
            .iter()
            .map(|(field, value)| format!("{field}={value}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Renders the query back into raw parameter form.
    pub fn to_raw_params(&self) -> RawParams {
        self.fields
            .iter()
            .map(|(field, value)| (field.as_str().to_owned(), value.to_json()))
            .collect()
    }
}

impl Serialize for NormalizedQuery {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_map(
            self.fields
                .iter()
                .map(|(field, value)| (field.as_str(), value.to_json())),
        )
    }
}
