use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{ProviderId, UtcDateTime, ValidationError};

/// Canonical field name to value mapping inside a record.
pub type RecordFields = BTreeMap<String, FieldValue>;

/// Typed scalar carried by a normalized record.
///
/// `Absent` marks a field the provider did not report. It is never folded into
/// zero or the empty string, so consumers can tell "unknown" from "zero".
/// Timestamps are UTC seconds since the epoch regardless of provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Absent,
    Text(String),
    Integer(i64),
    Number(f64),
    Flag(bool),
    Timestamp(i64),
    Record(RecordFields),
}

impl FieldValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn number(field: &'static str, value: f64) -> Result<Self, ValidationError> {
        if !value.is_finite() {
            return Err(ValidationError::NonFiniteValue { field });
        }
        Ok(Self::Number(value))
    }

    pub fn timestamp(value: UtcDateTime) -> Self {
        Self::Timestamp(value.unix_seconds())
    }

    pub fn optional_text(value: Option<String>) -> Self {
        match value {
            Some(value) if !value.trim().is_empty() => Self::Text(value),
            _ => Self::Absent,
        }
    }

    pub fn optional_integer(value: Option<i64>) -> Self {
        value.map_or(Self::Absent, Self::Integer)
    }

    pub fn optional_number(field: &'static str, value: Option<f64>) -> Result<Self, ValidationError> {
        value.map_or(Ok(Self::Absent), |value| Self::number(field, value))
    }

    pub const fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            Self::Integer(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }
}

/// Provider-agnostic result row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub provider: ProviderId,
    pub fields: RecordFields,
}

impl NormalizedRecord {
    pub fn new(provider: ProviderId) -> Self {
        Self {
            provider,
            fields: RecordFields::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }

    /// Returns the field value, or `Absent` when the field was never set.
    pub fn get(&self, name: &str) -> &FieldValue {
        static ABSENT: FieldValue = FieldValue::Absent;
        self.fields.get(name).unwrap_or(&ABSENT)
    }
}
