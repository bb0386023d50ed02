// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::sync::Arc;

use clap::Parser;
use cli::{Cli, Commands};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => {
            let config = relay_config::load(cli.config.as_deref())?;
            let _log_guard = init_logging(cli.verbose, Some(&config.logging));
            relay_gateway::gateway::run(config, cli.config.clone()).await
        }
        Commands::ShowConfig => {
            init_logging(cli.verbose, None);
            let config = relay_config::load(cli.config.as_deref())?;
            relay_gateway::gateway::show_config(&config)
        }
        Commands::ListProfiles => {
            init_logging(cli.verbose, None);
            let config = relay_config::load(cli.config.as_deref())?;
            relay_gateway::gateway::list_profiles(&config)
        }
        Commands::ShowCooldowns => {
            init_logging(cli.verbose, None);
            let config = relay_config::load(cli.config.as_deref())?;
            show_cooldowns(&config)
        }
        Commands::Completions { shell } => {
            cli::print_completions(shell);
            Ok(())
        }
    }
}

fn show_cooldowns(config: &relay_config::Config) -> anyhow::Result<()> {
    use relay_core::clock::SystemClock;
    use relay_core::profiles::ProfilePool;

    if !config.profiles.dir.is_dir() {
        println!("no profile directory at {}", config.profiles.dir.display());
        return Ok(());
    }

    let clock: relay_core::clock::SharedClock = Arc::new(SystemClock);
    let pool = ProfilePool::load(&config.profiles.dir, &config.profiles.cooldown_ledger_path, &config.profiles.usage_ledger_path, clock)?;

    println!("{:<10} {:<10} {:>12} {:<9}", "PROFILE", "TIER", "USED TOKENS", "ELIGIBLE");
    for profile in pool.profiles() {
        let eligible = if pool.is_eligible(&profile.id, None) { "yes" } else { "no (global cooldown)" };
        println!("{:<10} {:<10} {:>12} {:<9}", profile.id, format!("{:?}", profile.tier), pool.usage_total(&profile.id), eligible);
    }
    Ok(())
}

/// Sets up stderr logging plus, when `logging` is given (the `serve`
/// subcommand), a daily-rotating file sink under `LoggingConfig::dir`
/// (§6 ambient config -- rotation/formatting policy itself is out of
/// scope, only the destination knobs are carried). Returns the
/// non-blocking writer's guard; it must stay alive for the process
/// lifetime or buffered log lines are dropped on exit.
fn init_logging(verbosity: u8, logging: Option<&relay_config::LoggingConfig>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let level = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let stderr_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);

    match logging {
        Some(cfg) => {
            let _ = std::fs::create_dir_all(&cfg.dir);
            let appender = tracing_appender::rolling::daily(&cfg.dir, "aistudio-relay.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer().with_target(false).with_ansi(false).with_writer(non_blocking);
            let _ = tracing_subscriber::registry().with(stderr_layer).with(file_layer).with(filter).try_init();
            Some(guard)
        }
        None => {
            let _ = tracing_subscriber::registry().with(stderr_layer).with(filter).try_init();
            None
        }
    }
}
