use std::process::ExitCode;

use bwmon::{monitor, Cli, MonitorConfig};
use clap::Parser;
use dotenv::dotenv;
use tracing::error;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    dotenv().ok();
    // stdout carries the report, diagnostics go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match MonitorConfig::try_from(Cli::parse()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::from(2);
        }
    };

    let cancel = monitor::CancelToken::new();
    if let Err(e) = monitor::cancel_on_ctrlc(&cancel) {
        error!("{}", e);
        return ExitCode::FAILURE;
    }

    match monitor::run(&config, &cancel) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
