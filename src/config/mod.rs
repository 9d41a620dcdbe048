// src/config/mod.rs

//! Configuration for the dependency engine and the `depengine` binary.
//!
//! - `model.rs`: TOML-backed raw model, [`EngineConfig`] and duration parsing.
//! - `loader.rs`: reading a config file from disk.
//! - `validate.rs`: `RawConfigFile -> ConfigFile` with semantic checks.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{default_config_path, load_and_validate, load_from_path};
pub use model::{
    AgentKind, AgentSpec, ConfigFile, EngineConfig, ManifoldConfig, ManifoldKind, RawConfigFile,
    parse_duration,
};
