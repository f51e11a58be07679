use std::fmt::{Display, Formatter};

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime, Time, UtcOffset};

use crate::ValidationError;

/// RFC3339 timestamp guaranteed to be UTC.
///
/// Normalized records carry timestamps as UTC seconds since the epoch; this
/// type is the conversion point from every upstream date representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UtcDateTime(OffsetDateTime);

impl UtcDateTime {
    pub fn now() -> Self {
        Self(OffsetDateTime::now_utc())
    }

    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let parsed = OffsetDateTime::parse(input, &Rfc3339).map_err(|_| {
            ValidationError::TimestampNotUtc {
                value: input.to_owned(),
            }
        })?;

        Self::from_offset_datetime(parsed).map_err(|_| ValidationError::TimestampNotUtc {
            value: input.to_owned(),
        })
    }

    pub fn from_offset_datetime(value: OffsetDateTime) -> Result<Self, ValidationError> {
        if value.offset() != UtcOffset::UTC {
            return Err(ValidationError::TimestampNotUtc {
                value: value
                    .format(&Rfc3339)
                    .unwrap_or_else(|_| String::from("<unformattable>")),
            });
        }

        Ok(Self(value))
    }

    pub fn from_unix_seconds(seconds: i64) -> Result<Self, ValidationError> {
        OffsetDateTime::from_unix_timestamp(seconds)
            .map(Self)
            .map_err(|_| ValidationError::TimestampNotUtc {
                value: seconds.to_string(),
            })
    }

    /// Midnight UTC of the given calendar date.
    pub fn from_date(date: Date) -> Self {
        Self(date.with_time(Time::MIDNIGHT).assume_utc())
    }

    pub fn unix_seconds(self) -> i64 {
        self.0.unix_timestamp()
    }

    pub fn into_inner(self) -> OffsetDateTime {
        self.0
    }

    pub fn format_rfc3339(self) -> String {
        self.0
            .format(&Rfc3339)
            .unwrap_or_else(|_| self.0.unix_timestamp().to_string())
    }
}

/// Parses a `YYYY-MM-DD` calendar date.
pub fn parse_calendar_date(input: &str) -> Result<Date, ValidationError> {
    Date::parse(input.trim(), format_description!("[year]-[month]-[day]")).map_err(|_| {
        ValidationError::InvalidDate {
            value: input.to_owned(),
        }
    })
}

/// Formats a date as `YYYY-MM-DD`.
pub fn format_calendar_date(date: Date) -> String {
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

impl Display for UtcDateTime {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.format_rfc3339())
    }
}

impl Serialize for UtcDateTime {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.format_rfc3339())
    }
}

impl<'de> Deserialize<'de> for UtcDateTime {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Self::parse(&value).map_err(D::Error::custom)
    }
}
