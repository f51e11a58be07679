use std::time::{Duration, Instant};

use spacehub_core::{Aggregator, ProviderSelection, QueryNormalizer};
use tracing::debug;

use crate::cli::QueryArgs;
use crate::error::CliError;

use super::{raw_params, CommandResult};

pub async fn run(args: &QueryArgs, aggregator: &Aggregator) -> Result<CommandResult, CliError> {
    let started = Instant::now();
    let query = QueryNormalizer::new().normalize(&raw_params(&args.params)?)?;

    let selection = if args.providers.is_empty() {
        ProviderSelection::Matching
    } else {
        ProviderSelection::Only(args.providers.clone())
    };
    let providers = aggregator.plan(&query, &selection);
    debug!(query = %query.cache_key(), providers = ?providers, "running query");

    let result = match args.deadline_ms {
        Some(deadline_ms) => {
            aggregator
                .aggregate_within(&query, &selection, Duration::from_millis(deadline_ms))
                .await
        }
        None => aggregator.aggregate(&query, &selection).await,
    };

    let failed = result
        .providers
        .values()
        .filter(|status| !status.is_success())
        .count();
    let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    Ok(CommandResult::ok(serde_json::to_value(&result)?, providers)
        .with_latency(latency_ms)
        .with_failed_providers(failed))
}
