#[macro_use]
extern crate tracing;

#[macro_use]
mod display;

mod app;
mod cli;
mod ports;
mod signal;

use std::process::ExitCode;

use clap::Parser;
use eyre::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use self::app::App;
use self::cli::Cli;
use self::signal::Signals;

const LOG_ENV: &str = "RANGEPROXY_LOG";
const DEFAULT_LOG_FILTER: &str = "info";

fn init_logging() {
    let (filter, invalid) = match std::env::var(LOG_ENV) {
        Ok(x) => match EnvFilter::try_new(&x) {
            Ok(filter) => (filter, None),
            Err(e) => (EnvFilter::new(DEFAULT_LOG_FILTER), Some((x, e))),
        },
        Err(_) => (EnvFilter::new(DEFAULT_LOG_FILTER), None),
    };

    tracing_subscriber::fmt()
        .compact()
        .with_target(false)
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Some((value, e)) = invalid {
        warn!("ignoring invalid {LOG_ENV} '{value}': {e}");
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    match try_main(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn try_main(cli: Cli) -> Result<()> {
    let cancel = CancellationToken::new();

    Signals::new()
        .context("failed to register signal handlers")?
        .cancel_on_terminate(cancel.clone());

    let app = App::new(cli.ports, cli.settings());
    app.run(cancel).await?;

    let stats = app.stats();
    info!(total_sessions = stats.total_sessions, "finished successfully");
    Ok(())
}
