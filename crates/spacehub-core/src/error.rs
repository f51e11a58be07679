use thiserror::Error;

/// A client-supplied query could not be normalized.
///
/// Raised before any provider is contacted. `reason` is `None` when the field
/// itself is not part of the query vocabulary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{}", describe_invalid_query(.field, .reason.as_deref()))]
pub struct InvalidQuery {
    pub field: String,
    pub reason: Option<String>,
}

impl InvalidQuery {
    pub fn unknown_field(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: None,
        }
    }

    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: Some(reason.into()),
        }
    }
}

fn describe_invalid_query(field: &str, reason: Option<&str>) -> String {
    match reason {
        Some(reason) => format!("invalid value for query field '{field}': {reason}"),
        None => format!("unrecognized query field '{field}'"),
    }
}

/// Validation and contract errors exposed by `spacehub-core`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error(transparent)]
    InvalidQuery(#[from] InvalidQuery),

    #[error("invalid provider '{value}', expected one of exoplanets, iss, mars")]
    InvalidSource { value: String },

    #[error("timestamp must be RFC3339 UTC (suffix Z): '{value}'")]
    TimestampNotUtc { value: String },
    #[error("date must be formatted as YYYY-MM-DD: '{value}'")]
    InvalidDate { value: String },

    #[error("field '{field}' must be finite")]
    NonFiniteValue { field: &'static str },

    #[error("request_id must be at least 8 characters")]
    InvalidRequestId,
    #[error("schema_version must match vMAJOR.MINOR.PATCH: '{value}'")]
    InvalidSchemaVersion { value: String },
}

/// Invalid process configuration detected at startup.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("environment variable {name} must be a positive integer, got '{value}'")]
    InvalidNumber { name: &'static str, value: String },

    #[error("environment variable {name} must not be empty")]
    EmptyValue { name: &'static str },

    #[error("rover '{rover}' has no cameras configured")]
    EmptyRoster { rover: String },
}

/// Top-level error type for core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
