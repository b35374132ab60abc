//! Configuration loader with layered sources.

use crate::{format_validation_errors, AppConfig, ConfigValidator};
use config::{Config, ConfigError, Environment, File};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use vigil_core::VigilError;

/// Configuration loader with runtime refresh support.
#[derive(Clone)]
pub struct ConfigLoader {
    config: Arc<RwLock<AppConfig>>,
    config_dir: String,
}

impl ConfigLoader {
    /// Creates a new configuration loader.
    ///
    /// Configuration is loaded from multiple sources in order:
    /// 1. `config/default.toml` - Default values
    /// 2. `config/{environment}.toml` - Environment-specific overrides
    /// 3. `config/local.toml` - Local overrides
    /// 4. Environment variables with `VIGIL_` prefix
    pub fn new(config_dir: impl Into<String>) -> Result<Self, VigilError> {
        let config_dir = config_dir.into();
        let config = Self::load_config(&config_dir)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_dir,
        })
    }

    /// Loads configuration from the default location (`./config`).
    pub fn from_default_location() -> Result<Self, VigilError> {
        Self::new("./config")
    }

    /// Returns the current configuration.
    pub async fn get(&self) -> AppConfig {
        self.config.read().await.clone()
    }

    /// Reloads the configuration from disk.
    ///
    /// An invalid configuration leaves the current one in place.
    pub async fn reload(&self) -> Result<(), VigilError> {
        let new_config = Self::load_config(&self.config_dir)?;
        let mut config = self.config.write().await;
        *config = new_config;
        info!("Configuration reloaded successfully");
        Ok(())
    }

    /// Loads configuration from the specified directory.
    fn load_config(config_dir: &str) -> Result<AppConfig, VigilError> {
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file found or error loading it: {}", e);
        }

        let environment =
            std::env::var("VIGIL_ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        info!("Loading configuration for environment: {}", environment);

        let mut builder = Config::builder();

        for name in ["default", environment.as_str(), "local"] {
            let path = format!("{}/{}.toml", config_dir, name);
            if Path::new(&path).exists() {
                debug!("Loading config from: {}", path);
                builder = builder.add_source(File::with_name(&path).required(false));
            }
        }

        // VIGIL_SCHEDULER__MAX_QUEUED=100 overrides scheduler.max_queued
        builder = builder.add_source(
            Environment::with_prefix("VIGIL")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().map_err(config_error_to_vigil_error)?;

        let app_config: AppConfig = config
            .try_deserialize()
            .map_err(config_error_to_vigil_error)?;

        ConfigValidator::validate(&app_config)
            .map_err(|errors| VigilError::Configuration(format_validation_errors(&errors)))?;

        Ok(app_config)
    }

    /// Gets a specific configuration value by key path.
    pub async fn get_value<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let config = self.config.read().await;
        let json = serde_json::to_value(&*config).ok()?;

        let mut current = &json;
        for part in key.split('.') {
            current = current.get(part)?;
        }

        serde_json::from_value(current.clone()).ok()
    }
}

fn config_error_to_vigil_error(err: ConfigError) -> VigilError {
    VigilError::Configuration(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[tokio::test]
    async fn test_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("default.toml"),
            r#"
[scheduler]
max_queued = 1200
dispatch_interval_secs = 15

[scheduler.resource_type_limits]
"AWS::EC2::Instance" = 40

[compliance]
inner_iterations = 4
"#,
        )
        .unwrap();

        let loader = ConfigLoader::new(dir.path().to_string_lossy().to_string()).unwrap();
        let config = loader.get().await;
        assert_eq!(config.scheduler.max_queued, 1200);
        assert_eq!(config.scheduler.dispatch_interval_secs, 15);
        assert_eq!(config.scheduler.resource_type_limit("AWS::EC2::Instance"), 40);
        assert_eq!(config.compliance.inner_iterations, 4);
        // Untouched keys keep their defaults
        assert_eq!(config.scheduler.max_in_10_minutes, 5000);

        let limit: Option<u64> = loader.get_value("scheduler.default_resource_type_limit").await;
        assert_eq!(limit, Some(25));
    }

    #[tokio::test]
    async fn test_default_config_round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let rendered = toml::to_string(&AppConfig::default()).unwrap();
        fs::write(dir.path().join("default.toml"), rendered).unwrap();

        let loader = ConfigLoader::new(dir.path().to_string_lossy().to_string()).unwrap();
        let config = loader.get().await;
        assert_eq!(config.queue.key_prefix, "vigil:queue");
    }

    #[tokio::test]
    async fn test_invalid_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("default.toml"),
            "[compliance]\npublish_schedule = \"every minute\"\n",
        )
        .unwrap();

        let err = ConfigLoader::new(dir.path().to_string_lossy().to_string())
            .err()
            .unwrap();
        assert!(matches!(err, VigilError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_reload_picks_up_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("default.toml");
        fs::write(&path, "[scheduler]\nmax_retries = 3\n").unwrap();

        let loader = ConfigLoader::new(dir.path().to_string_lossy().to_string()).unwrap();
        fs::write(&path, "[scheduler]\nmax_retries = 5\n").unwrap();
        loader.reload().await.unwrap();
        assert_eq!(loader.get().await.scheduler.max_retries, 5);
    }
}
