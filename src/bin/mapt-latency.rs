//! Latency measurement entry point.

use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use maptbench::cli::LatencyArgs;
use maptbench::{Config, TestMode, TestRun};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), maptbench::Error> {
    let args = LatencyArgs::parse();
    args.validate()?;
    let config = Config::load(Config::default_path())?;
    let mode = TestMode::Latency {
        first_tagged_delay: args.first_tagged_delay,
        num_of_tagged: args.num_of_tagged,
    };
    let run = TestRun::init(config, args.common, mode)?;
    run.measure()?;
    Ok(())
}
