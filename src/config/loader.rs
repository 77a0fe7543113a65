// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::Result;

/// Load a configuration file from a given path and return the raw `RawConfigFile`.
///
/// This only performs TOML deserialization; durations stay unparsed and no
/// semantic checks run. Use [`load_and_validate`] for that.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;
    parse_str(&contents)
}

/// Deserialize a TOML document into a `RawConfigFile`.
pub fn parse_str(contents: &str) -> Result<RawConfigFile> {
    let config: RawConfigFile = toml::from_str(contents)?;
    Ok(config)
}

/// Load a configuration file from path and validate it.
///
/// - Reads TOML and applies section defaults.
/// - Parses durations.
/// - Checks task references, cycles, predicates, labels and the
///   breaker/spawner bounds.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let raw_config = load_from_path(&path)?;
    let config = ConfigFile::try_from(raw_config)?;
    Ok(config)
}

pub const CONFIG_ENV: &str = "WORKDAG_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "Workdag.toml";

/// `$WORKDAG_CONFIG` if set and non-empty, else `Workdag.toml` in the
/// current working directory.
pub fn default_config_path() -> PathBuf {
    config_path_from(None, std::env::var(CONFIG_ENV).ok().as_deref())
}

/// An explicit `--config` path wins over the environment.
pub fn resolve_config_path(explicit: Option<&str>) -> PathBuf {
    match explicit {
        Some(path) => PathBuf::from(path),
        None => default_config_path(),
    }
}

fn config_path_from(explicit: Option<&str>, env: Option<&str>) -> PathBuf {
    explicit
        .or(env.map(str::trim).filter(|s| !s.is_empty()))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}
