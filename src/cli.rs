// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Command-line arguments for `workdag`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "workdag",
    version,
    about = "Run dependency-ordered tasks through a queue and a warm worker pool.",
    long_about = None
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `WORKDAG_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Submit every configured task and run them to completion.
    Run(RunArgs),

    /// Print the submission order and dependencies without executing.
    Plan(PlanArgs),
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Path to the config file (TOML). Defaults to `$WORKDAG_CONFIG`, then
    /// `Workdag.toml`.
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct PlanArgs {
    /// Path to the config file (TOML). Defaults to `$WORKDAG_CONFIG`, then
    /// `Workdag.toml`.
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,

    /// Only show the tasks `NAME` transitively depends on (and `NAME`).
    #[arg(long, value_name = "NAME")]
    pub from: Option<String>,
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

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
