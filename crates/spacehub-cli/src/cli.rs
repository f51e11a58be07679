//! CLI argument definitions for spacehub.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `query` | Normalize a query and aggregate it across providers |
//! | `normalize` | Print the canonical form and cache key of a query |
//! | `sources` | List provider descriptors and quota state |
//!
//! # Examples
//!
//! ```bash
//! spacehub query discovery_year=2023 radius_max=1.5 --pretty
//! spacehub query sol=1000 camera=navcam --provider mars
//! spacehub normalize min_radius=0.5 timestamp=1700000000
//! spacehub sources --format table
//! ```

use clap::{Args, Parser, Subcommand, ValueEnum};
use spacehub_core::ProviderId;

/// Unified access to NASA exoplanet, ISS position and Mars rover data.
#[derive(Debug, Parser)]
#[command(name = "spacehub", author, version, about = "Unified space data aggregation CLI")]
pub struct Cli {
    /// Output format for results.
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Json)]
    pub format: OutputFormat,

    /// Pretty-print JSON output with indentation.
    #[arg(long, global = true, default_value_t = false)]
    pub pretty: bool,

    /// Log at debug level to stderr, overriding RUST_LOG.
    #[arg(long, short = 'v', global = true, default_value_t = false)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Single JSON object.
    Json,
    /// Human-readable summary.
    Table,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Aggregate a query across providers.
    ///
    /// Exits with 3 when at least one provider did not succeed.
    Query(QueryArgs),
    /// Validate a query and print its canonical form without calling providers.
    Normalize(NormalizeArgs),
    /// List providers with capabilities, cache TTL and quota state.
    Sources,
}

#[derive(Debug, Args)]
pub struct QueryArgs {
    /// Query filters as FIELD=VALUE pairs, e.g. `sol=1000`.
    #[arg(value_name = "FIELD=VALUE", value_parser = parse_assignment)]
    pub params: Vec<(String, String)>,

    /// Restrict the request to these providers. Repeatable.
    #[arg(long = "provider", value_name = "ID")]
    pub providers: Vec<ProviderId>,

    /// Overall request deadline, overriding SPACEHUB_REQUEST_DEADLINE_MS.
    #[arg(long, value_name = "MS")]
    pub deadline_ms: Option<u64>,
}

#[derive(Debug, Args)]
pub struct NormalizeArgs {
    /// Query filters as FIELD=VALUE pairs.
    #[arg(value_name = "FIELD=VALUE", value_parser = parse_assignment)]
    pub params: Vec<(String, String)>,
}

fn parse_assignment(input: &str) -> Result<(String, String), String> {
    match input.split_once('=') {
        Some((field, value)) if !field.trim().is_empty() => {
            Ok((field.trim().to_owned(), value.to_owned()))
        }
        _ => Err(format!("expected FIELD=VALUE, got '{input}'")),
    }
}
