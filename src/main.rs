// src/main.rs

mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use commands::Context;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

fn dispatch(cli: Cli) -> Result<bool> {
    let ctx = Context::load(&cli.config, cli.no_notify)?;

    match cli.command {
        Commands::Detect { no_fetch } => commands::cmd_detect(&ctx, !no_fetch),
        Commands::RefreshReference => commands::cmd_refresh_reference(&ctx),
        Commands::Run { all } => commands::cmd_run(&ctx, all),
        Commands::RefreshIndex => commands::cmd_refresh_index(&ctx),
        Commands::Monitor => commands::cmd_monitor(&ctx),
        Commands::Watch {
            pipeline_every,
            monitor_every,
        } => commands::cmd_watch(&ctx, &pipeline_every, &monitor_every),
        Commands::Rewind {
            version,
            arch,
            reason,
        } => commands::cmd_rewind(&ctx, &version, &arch, reason.as_deref()),
        Commands::Retry { version, reason } => {
            commands::cmd_retry(&ctx, &version, reason.as_deref())
        }
        Commands::Status { json } => commands::cmd_status(&ctx, json),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing subscriber for logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = autodeb::cancel::install_signal_handlers() {
        error!("{}", e);
        return ExitCode::FAILURE;
    }

    match dispatch(cli) {
        Ok(false) => ExitCode::SUCCESS,
        Ok(true) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
