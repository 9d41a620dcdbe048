// src/cli.rs

//! Command-line arguments for the `depengine` binary.

use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::config::parse_duration;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "depengine",
    version,
    about = "Run a graph of interdependent workers, restarting them as their inputs come and go.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    #[arg(long, value_name = "PATH", default_value = "Depengine.toml")]
    pub config: String,

    /// Validate the config and print the install order, without running
    /// anything.
    #[arg(long)]
    pub dry_run: bool,

    /// How often to log the engine report, e.g. `10s`.
    #[arg(long, value_name = "DURATION", value_parser = parse_duration, default_value = "30s")]
    pub report_interval: Duration,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `DEPENGINE_LOG` or `info` is used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

pub fn parse() -> CliArgs {
    CliArgs::parse()
}
