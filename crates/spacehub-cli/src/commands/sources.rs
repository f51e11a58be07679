use std::time::Duration;

use serde::Serialize;
use spacehub_core::{Aggregator, AuthRequirement, CapabilitySet, ProviderId, QuotaSnapshot};

use crate::error::CliError;

use super::CommandResult;

#[derive(Debug, Serialize)]
struct SourceStatus {
    id: ProviderId,
    name: &'static str,
    base_url: String,
    auth: AuthRequirement,
    capabilities: CapabilitySet,
    timeout_ms: u64,
    cache_ttl_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    quota: Option<QuotaSnapshot>,
}

#[derive(Debug, Serialize)]
struct SourcesResponseData {
    sources: Vec<SourceStatus>,
}

pub fn run(aggregator: &Aggregator) -> Result<CommandResult, CliError> {
    let sources = aggregator
        .descriptors()
        .into_iter()
        .map(|descriptor| SourceStatus {
            id: descriptor.id,
            name: descriptor.name,
            base_url: descriptor.base_url,
            auth: descriptor.auth,
            capabilities: descriptor.capabilities,
            timeout_ms: millis(descriptor.timeout),
            cache_ttl_ms: millis(descriptor.cache_ttl),
            quota: aggregator.governor().snapshot(descriptor.id),
        })
        .collect::<Vec<_>>();

    let providers = sources.iter().map(|source| source.id).collect();
    let data = serde_json::to_value(SourcesResponseData { sources })?;

    Ok(CommandResult::ok(data, providers))
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
