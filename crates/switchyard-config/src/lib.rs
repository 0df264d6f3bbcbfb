//! Configuration system for the Switchyard run orchestrator.
//!
//! Provides TOML-based configuration with:
//! - Engine limits (`[engine]`) and retry backoff (`[engine.backoff]`)
//! - Run store location (`[store]`)
//! - Logging setup (`[logging]`) and tracing initialisation
//! - Config file layering (user config dir + project-local overrides)

pub mod discovery;
pub mod error;
pub mod logging;
pub mod types;

pub use discovery::{
    LoadedConfig, load_config, load_config_file, load_config_with_options, save_config,
    user_config_dir, user_config_path,
};
pub use error::{ConfigError, Result};
pub use logging::init_tracing;
pub use types::*;
