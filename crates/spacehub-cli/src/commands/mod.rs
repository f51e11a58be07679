mod normalize;
mod query;
mod sources;

use serde_json::Value;
use spacehub_core::{
    Envelope, EnvelopeMeta, HubBuilder, HubConfig, InvalidQuery, ProviderId, RawParams,
};
use uuid::Uuid;

use crate::cli::{Cli, Command};
use crate::error::CliError;

pub struct CommandResult {
    pub data: Value,
    pub providers: Vec<ProviderId>,
    pub latency_ms: u64,
    /// Providers that did not succeed, for commands that aggregate.
    pub failed_providers: Option<usize>,
}

impl CommandResult {
    pub fn ok(data: Value, providers: Vec<ProviderId>) -> Self {
        Self {
            data,
            providers,
            latency_ms: 0,
            failed_providers: None,
        }
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_failed_providers(mut self, failed: usize) -> Self {
        self.failed_providers = (failed > 0).then_some(failed);
        self
    }
}

pub struct CommandOutcome {
    pub envelope: Envelope<Value>,
    pub failed_providers: Option<usize>,
}

pub async fn run(cli: &Cli) -> Result<CommandOutcome, CliError> {
    let aggregator = HubBuilder::new(HubConfig::from_env()?).build();

    let result = match &cli.command {
        Command::Query(args) => query::run(args, &aggregator).await,
        Command::Normalize(args) => normalize::run(args, &aggregator),
        Command::Sources => sources::run(&aggregator),
    };
    aggregator.shutdown();

    let CommandResult {
        data,
        providers,
        latency_ms,
        failed_providers,
    } = result?;

    let meta = EnvelopeMeta::new(Uuid::new_v4().to_string(), providers, latency_ms)?;
    Ok(CommandOutcome {
        envelope: Envelope::new(meta, data),
        failed_providers,
    })
}

/// Collects `FIELD=VALUE` arguments into raw query parameters.
///
/// Values stay strings; the normalizer accepts either form.
fn raw_params(assignments: &[(String, String)]) -> Result<RawParams, InvalidQuery> {
    let mut params = RawParams::new();
    for (field, value) in assignments {
        if params
            .insert(field.clone(), Value::String(value.clone()))
            .is_some()
        {
            return Err(InvalidQuery::invalid_value(field, "given more than once"));
        }
    }
    Ok(params)
}
