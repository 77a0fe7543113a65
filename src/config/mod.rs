// src/config/mod.rs

//! Configuration loading and validation for workdag.
//!
//! - `model.rs` defines the TOML-backed raw model and the validated one.
//! - `loader.rs` reads a config file from disk.
//! - `validate.rs` parses durations and checks task graph invariants.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{
    CONFIG_ENV, default_config_path, load_and_validate, load_from_path, parse_str,
    resolve_config_path,
};
pub use model::{
    BreakerSection, ConfigFile, ManifestSection, QueueSection, RawConfigFile, SpawnerSection,
    TaskConfig, WorkerSection,
};
pub use validate::parse_duration;
