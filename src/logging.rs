// src/logging.rs

//! Logging setup for `workdag` using `tracing` + `tracing-subscriber`.
//!
//! The filter comes from, in order:
//! 1. `--log-level` CLI flag
//! 2. `WORKDAG_LOG`: either a bare level ("debug") or full `EnvFilter`
//!    directives ("workdag::worker=trace,info")
//! 3. `info`
//!
//! A bare level applies to `workdag` targets only; other crates stay at
//! `warn` or quieter. Logs go to STDERR; stdout carries the run summary and
//! `plan` output.

use anyhow::{Context, Result};
use tracing::Level;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogLevel;

pub const LOG_ENV: &str = "WORKDAG_LOG";

/// Initialise the global subscriber. Call once at startup.
pub fn init_logging(cli_level: Option<LogLevel>) -> Result<()> {
    let env = std::env::var(LOG_ENV).ok();
    let directives = filter_directives(cli_level, env.as_deref());
    let filter = EnvFilter::try_new(&directives)
        .with_context(|| format!("invalid {LOG_ENV} filter '{directives}'"))?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}

fn filter_directives(cli_level: Option<LogLevel>, env: Option<&str>) -> String {
    if let Some(lvl) = cli_level {
        return scoped(level_from_log_level(lvl));
    }
    match env.map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => match parse_level_str(raw) {
            Some(level) => scoped(level),
            None => raw.to_string(),
        },
        None => scoped(Level::INFO),
    }
}

/// `level` for this crate, at most `warn` for everything else.
fn scoped(level: Level) -> String {
    let others = level.min(Level::WARN);
    format!(
        "{},workdag={}",
        others.as_str().to_lowercase(),
        level.as_str().to_lowercase()
    )
}

fn level_from_log_level(lvl: LogLevel) -> Level {
    match lvl {
        LogLevel::Error => Level::ERROR,
        LogLevel::Warn => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
        LogLevel::Trace => Level::TRACE,
    }
}

fn parse_level_str(s: &str) -> Option<Level> {
    match s.trim().to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_env_levels() {
        assert_eq!(parse_level_str(" Debug "), Some(Level::DEBUG));
        assert_eq!(parse_level_str("warning"), Some(Level::WARN));
        assert_eq!(parse_level_str("loud"), None);
    }

    #[test]
    fn cli_flag_wins_over_env() {
        assert_eq!(
            filter_directives(Some(LogLevel::Debug), Some("trace")),
            "warn,workdag=debug"
        );
        assert_eq!(
            filter_directives(Some(LogLevel::Error), None),
            "error,workdag=error"
        );
    }

    #[test]
    fn env_accepts_levels_and_directives() {
        assert_eq!(filter_directives(None, Some("TRACE")), "warn,workdag=trace");
        assert_eq!(
            filter_directives(None, Some("workdag::worker=trace,info")),
            "workdag::worker=trace,info"
        );
        assert_eq!(filter_directives(None, Some("  ")), "warn,workdag=info");
        assert_eq!(filter_directives(None, None), "warn,workdag=info");
    }

    #[test]
    fn produced_directives_are_valid_filters() {
        for lvl in [LogLevel::Error, LogLevel::Info, LogLevel::Trace] {
            assert!(EnvFilter::try_new(filter_directives(Some(lvl), None)).is_ok());
        }
    }
}
