//! Configuration management
//!
//! Supports configuration loading with precedence: env > file > CLI > defaults

mod builder;
mod env;
mod file;

pub use builder::{Config, ConfigBuilder, TelemetryConfig};

use crate::Result;

/// Layer the discovered config file and the environment over `base`
pub fn load_config(base: ConfigBuilder) -> Result<ConfigBuilder> {
    let mut builder = base;

    // Load from config file if exists
    if let Some(path) = file::find_config_file() {
        tracing::info!("Loading configuration from {}", path.display());
        builder = file::load_from_file(&path, builder)?;
    }

    // Override with environment variables
    env::load_from_env(builder)
}

/// Layer a specific config file and the environment over `base`
pub fn load_config_from_path(path: &std::path::Path, base: ConfigBuilder) -> Result<ConfigBuilder> {
    let builder = file::load_from_file(path, base)?;
    env::load_from_env(builder)
}
