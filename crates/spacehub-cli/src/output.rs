use std::io::{self, Write};

use serde_json::Value;
use spacehub_core::Envelope;

use crate::cli::OutputFormat;
use crate::error::CliError;

pub fn render(envelope: &Envelope<Value>, format: OutputFormat, pretty: bool) -> Result<(), CliError> {
    let stdout = io::stdout();
    let mut out = stdout.lock();

    match format {
        OutputFormat::Json => {
            let payload = if pretty {
                serde_json::to_string_pretty(envelope)?
            } else {
                serde_json::to_string(envelope)?
            };
            writeln!(out, "{payload}")?;
        }
        OutputFormat::Table => render_table(&mut out, envelope)?,
    }

    Ok(())
}

fn render_table(out: &mut impl Write, envelope: &Envelope<Value>) -> Result<(), CliError> {
    writeln!(out, "request_id  : {}", envelope.meta.request_id)?;
    writeln!(out, "schema      : {}", envelope.meta.schema_version)?;
    writeln!(out, "generated_at: {}", envelope.meta.generated_at)?;
    writeln!(
        out,
        "providers   : {}",
        envelope
            .meta
            .providers
            .iter()
            .map(|provider| provider.as_str())
            .collect::<Vec<_>>()
            .join(",")
    )?;
    writeln!(out, "latency_ms  : {}", envelope.meta.latency_ms)?;

    if let Some(statuses) = envelope.data.get("providers").and_then(Value::as_object) {
        writeln!(out, "status:")?;
        for (provider, status) in statuses {
            let status = status.as_str().unwrap_or("unknown");
            writeln!(out, "  {provider:<12} {status}")?;
        }
    }

    match envelope.data.get("records").and_then(Value::as_array) {
        Some(records) => {
            writeln!(out, "records     : {}", records.len())?;
            for record in records {
                writeln!(out, "  {}", serde_json::to_string(record)?)?;
            }
        }
        None => {
            writeln!(out, "data:")?;
            for line in serde_json::to_string_pretty(&envelope.data)?.lines() {
                writeln!(out, "  {line}")?;
            }
        }
    }

    Ok(())
}
