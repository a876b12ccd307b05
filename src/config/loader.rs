//! Configuration Loader
//!
//! Environment-aware loading built on the `config` crate. Files are optional;
//! a missing directory yields the defaults plus environment overrides.

use super::error::ConfigResult;
use super::DisttaskConfig;
use config::{Config, Environment, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Loaded, validated configuration plus where it came from
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: DisttaskConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load from `./config` with the environment taken from `DISTTASK_ENV`
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_dir(Self::default_config_directory())
    }

    pub fn load_from_dir(config_dir: impl AsRef<Path>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = crate::logging::get_environment();
        Self::load_from_dir_with_env(config_dir, &environment)
    }

    /// Load with an explicit environment, leaving process variables untouched
    pub fn load_from_dir_with_env(
        config_dir: impl AsRef<Path>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.as_ref().to_path_buf();
        debug!(
            "Loading configuration for environment '{}' from directory: {}",
            environment,
            config_directory.display()
        );

        let config: DisttaskConfig = Config::builder()
            .add_source(File::from(config_directory.join("base.toml")).required(false))
            .add_source(
                File::from(config_directory.join(format!("{environment}.toml"))).required(false),
            )
            .add_source(
                Environment::with_prefix("DISTTASK")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;

        debug!(
            environment = environment,
            dispatch_concurrency = config.dispatcher.dispatch_concurrency,
            "Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    /// Wrap an already built configuration
    pub fn from_config(config: DisttaskConfig, environment: &str) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory: Self::default_config_directory(),
        }))
    }

    pub fn config(&self) -> &DisttaskConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    fn default_config_directory() -> PathBuf {
        std::env::var("DISTTASK_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config"))
    }
}
