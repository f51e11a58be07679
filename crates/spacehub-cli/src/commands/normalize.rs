use serde::Serialize;
use spacehub_core::{Aggregator, NormalizedQuery, ProviderId, ProviderSelection, QueryNormalizer};

use crate::cli::NormalizeArgs;
use crate::error::CliError;

use super::{raw_params, CommandResult};

#[derive(Debug, Serialize)]
struct NormalizeResponseData {
    query: NormalizedQuery,
    cache_key: String,
    /// Providers an unrestricted `query` would involve.
    providers: Vec<ProviderId>,
}

pub fn run(args: &NormalizeArgs, aggregator: &Aggregator) -> Result<CommandResult, CliError> {
    let query = QueryNormalizer::new().normalize(&raw_params(&args.params)?)?;
    let providers = aggregator.plan(&query, &ProviderSelection::Matching);

    let data = serde_json::to_value(NormalizeResponseData {
        cache_key: query.cache_key(),
        query,
        providers: providers.clone(),
    })?;

    Ok(CommandResult::ok(data, providers))
}
