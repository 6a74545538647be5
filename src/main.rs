type Result<T> = color_eyre::eyre::Result<T>;

mod cli;

use std::io;
use std::process::ExitCode;

use clap::Parser;
use eyre::WrapErr;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use atf_harness::{Harness, TpsWriter};
use cli::{Cli, Config};

fn main() -> Result<ExitCode> {
    color_eyre::install()?;

    // stdout carries the results stream, so logs go to stderr
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_cli(cli)?;
    debug!(?config, "configuration");
    info!(programs = config.programs.len(), "atf-harness starting");

    let mut writer =
        TpsWriter::new(io::stdout().lock(), config.programs.len()).wrap_err("Failed to write results header")?;
    let harness = Harness::new(config.harness);
    let summary = harness
        .run(&config.programs, &mut writer)
        .wrap_err("Test run aborted")?;
    let _stdout = writer.finish().wrap_err("Failed to flush results")?;

    info!(?summary, "atf-harness exiting");
    Ok(if summary.all_passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
