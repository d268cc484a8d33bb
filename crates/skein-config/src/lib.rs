//! Configuration system for Skein.
//!
//! Provides TOML-based configuration with:
//! - A `[server]` section for the HTTP gateway
//! - A `[client]` section for the identity announced to servers
//! - Named `[[servers]]` entries reached over stdio or HTTP
//! - Config file layering (user config dir + project-local overrides)

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    CONFIG_DIR_ENV, ConfigSource, LoadedConfig, PROJECT_CONFIG_FILE, USER_CONFIG_FILE,
    config_dir, load_config, load_config_file, load_config_with_options, log_dir, save_config,
    user_config_path,
};
pub use error::{ConfigError, Result};
pub use types::*;
