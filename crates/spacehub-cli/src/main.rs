mod cli;
mod commands;
mod error;
mod output;

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;
use crate::error::CliError;

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is the normal case.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(error.exit_code())
        }
    }
}

async fn run(cli: &Cli) -> Result<(), CliError> {
    let outcome = commands::run(cli).await?;
    output::render(&outcome.envelope, cli.format, cli.pretty)?;

    if let Some(failed) = outcome.failed_providers {
        return Err(CliError::Partial {
            failed,
            total: outcome.envelope.meta.providers.len(),
        });
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
