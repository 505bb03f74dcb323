//! Configuration module for the Keel deployment engine.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `keel.deploy.yaml`
//! - Validation of configuration values
//! - Computing configuration hashes for change detection

mod spec;
mod parser;
mod validator;
mod hash;

pub use spec::{
    AdapterConfig, DEFAULT_STATE_PATH, DeployConfig, EngineConfig, ProjectConfig, ReadyConfig,
    RemoteConfig, StateConfig,
};
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
pub use hash::ConfigHasher;
