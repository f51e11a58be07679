//! # Domain Models
//!
//! Canonical, provider-agnostic request and result shapes.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`NormalizedQuery`] | Validated filter set over the fixed [`QueryField`] vocabulary |
//! | [`QueryValue`] | Typed filter value |
//! | [`NormalizedRecord`] | Result row keyed by canonical field names |
//! | [`FieldValue`] | Typed scalar with an explicit `Absent` marker |
//! | [`UtcDateTime`] | UTC timestamp |
//!
//! Records from different providers describing the same concept share one
//! unit and timezone convention: timestamps are UTC epoch seconds, distances
//! are kilometers.

mod query;
mod record;
mod timestamp;

pub use query::{NormalizedQuery, QueryField, QueryValue, RawParams};
pub use record::{FieldValue, NormalizedRecord, RecordFields};
pub use timestamp::{format_calendar_date, parse_calendar_date, UtcDateTime};
