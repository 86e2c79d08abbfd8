use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use fl_domain::config::ConfigSeverity;
use fl_gateway::bootstrap;
use fl_gateway::cli::{self, Cli, Command, ConfigCommand};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    match args.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let (config, _path) = cli::load_config()?;

            // Config errors abort; warnings are logged and tolerated.
            let issues = config.validate();
            for issue in &issues {
                match issue.severity {
                    ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
                    ConfigSeverity::Error => tracing::error!("config: {issue}"),
                }
            }
            if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
                anyhow::bail!("config validation failed");
            }

            bootstrap::run_server(Arc::new(config)).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let (config, path) = cli::load_config()?;
            if !cli::config::validate(&config, &path) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let (config, _path) = cli::load_config()?;
            cli::config::show(&config);
            Ok(())
        }
        Some(Command::Version) => {
            println!("faultline {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON logs for the serve path.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,fl_gateway=debug")),
        )
        .json()
        .init();
}
