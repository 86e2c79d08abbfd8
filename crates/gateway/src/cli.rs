//! Command-line interface and config loading.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use fl_domain::config::{Config, ConfigSeverity};

#[derive(Parser)]
#[command(name = "faultline", about = "AI-driven root cause analysis gateway")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the gateway (API + workers). Default when no subcommand given.
    Serve,
    /// Configuration helpers.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the version.
    Version,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Validate the config file and exit non-zero on errors.
    Validate,
    /// Print the effective configuration as TOML.
    Show,
}

/// Load config from `FAULTLINE_CONFIG` or `./faultline.toml`. A missing
/// file yields the built-in defaults (dev mode).
pub fn load_config() -> anyhow::Result<(Config, PathBuf)> {
    let path = std::env::var("FAULTLINE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./faultline.toml"));

    if !path.exists() {
        tracing::info!(path = %path.display(), "no config file; using defaults");
        return Ok((Config::default(), path));
    }

    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config: Config =
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
    Ok((config, path))
}

pub mod config {
    use super::*;

    /// Print issues; returns false when any is an error.
    pub fn validate(config: &Config, path: &std::path::Path) -> bool {
        let issues = config.validate();
        if issues.is_empty() {
            println!("{}: ok", path.display());
            return true;
        }
        let mut ok = true;
        for issue in &issues {
            match issue.severity {
                ConfigSeverity::Warning => println!("warning: {issue}"),
                ConfigSeverity::Error => {
                    ok = false;
                    println!("error: {issue}");
                }
            }
        }
        ok
    }

    pub fn show(config: &Config) {
        match toml::to_string_pretty(config) {
            Ok(s) => println!("{s}"),
            Err(e) => eprintln!("failed to render config: {e}"),
        }
    }
}
