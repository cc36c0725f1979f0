//! bundle-service CLI
//!
//! CLI entry point that dispatches to subcommands.

use bundle_service::cli::args::{ConfigAction, ConfigArgs};
use bundle_service::cli::{Cli, Commands};
use bundle_service::config::{Config, ConfigManager};
use bundle_service::error::ServiceResult;
use clap::Parser;
use console::style;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> ServiceResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    // Init must work even when the existing file is broken
    let config = match cli.command {
        Commands::Config(ConfigArgs {
            action: Some(ConfigAction::Init { .. }),
        }) => Config::default(),
        _ => config_manager.load().await?,
    };

    // 0 = warn, 1 = info, 2 = debug, 3+ = trace
    let filter = match cli.verbose {
        0 => EnvFilter::new("bundle_service=warn"),
        1 => EnvFilter::new("bundle_service=info"),
        2 => EnvFilter::new("bundle_service=debug"),
        _ => EnvFilter::new("bundle_service=trace"),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if config.general.log_format == "json" {
        subscriber.json().init();
    } else {
        subscriber.without_time().init();
    }

    match cli.command {
        Commands::Build(args) => bundle_service::cli::commands::build(args, &config).await,
        Commands::Config(args) => {
            bundle_service::cli::commands::config(args, &config_manager, &config).await
        }
    }
}
