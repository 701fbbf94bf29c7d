use crate::core::errors::ConfigError;
use std::env;
use tracing::Level;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub log_level: Level,
}

/// Batch pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Fixed worker pool size; each worker owns one inference session.
    pub pool_size: usize,
    /// Longest side an image may keep after preparation.
    pub max_dimension: u32,
    /// Images covered by one credit (cost = ceil(queued / images_per_credit)).
    pub images_per_credit: usize,
}

/// Segmentation model configuration
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub general_model_path: String,
    pub landscape_model_path: String,
    /// Square input size the models were exported with.
    pub input_size: u32,
}

/// Usage ledger configuration
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Base URL of the credit ledger service. When unset, metering is
    /// disabled and every batch is admitted.
    pub base_url: Option<String>,
    pub timeout_seconds: u64,
}

/// Result persistence configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Base URL of the result store. When unset, results are kept in memory
    /// only and the best-effort upload is skipped.
    pub base_url: Option<String>,
    pub timeout_seconds: u64,
}

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub pipeline: PipelineConfig,
    pub model: ModelConfig,
    pub ledger: LedgerConfig,
    pub storage: StorageConfig,
}

impl Config {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let config = Self::load_from_env()?;
        config.validate()?;
        Ok(config)
    }

    fn load_from_env() -> Result<Self, ConfigError> {
        // Parse log level
        let log_level = env::var("LOG_LEVEL")
            .ok()
            .and_then(|s| match s.to_lowercase().as_str() {
                "trace" => Some(Level::TRACE),
                "debug" => Some(Level::DEBUG),
                "info" => Some(Level::INFO),
                "warn" | "warning" => Some(Level::WARN),
                "error" => Some(Level::ERROR),
                _ => None,
            })
            .unwrap_or(Level::INFO);

        Ok(Self {
            server: ServerConfig {
                port: env::var("SERVER_PORT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(8700),
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                log_level,
            },
            pipeline: PipelineConfig {
                pool_size: env::var("WORKER_POOL_SIZE")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_else(|| {
                        // Hardware concurrency hint, never below 1
                        num_cpus::get().max(1)
                    }),
                max_dimension: env::var("MAX_IMAGE_DIMENSION")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2048),
                images_per_credit: env::var("IMAGES_PER_CREDIT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2),
            },
            model: ModelConfig {
                general_model_path: env::var("GENERAL_MODEL_PATH")
                    .unwrap_or_else(|_| "models/general.onnx".to_string()),
                landscape_model_path: env::var("LANDSCAPE_MODEL_PATH")
                    .unwrap_or_else(|_| "models/landscape.onnx".to_string()),
                input_size: env::var("MODEL_INPUT_SIZE")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(1024),
            },
            ledger: LedgerConfig {
                base_url: env::var("LEDGER_URL").ok().filter(|s| !s.trim().is_empty()),
                timeout_seconds: env::var("LEDGER_TIMEOUT_SECONDS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(15),
            },
            storage: StorageConfig {
                base_url: env::var("STORAGE_URL").ok().filter(|s| !s.trim().is_empty()),
                timeout_seconds: env::var("STORAGE_TIMEOUT_SECONDS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            },
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.pool_size == 0 {
            return Err(ConfigError::InvalidPoolSize(self.pipeline.pool_size));
        }

        if !(256..=8192).contains(&self.pipeline.max_dimension) {
            return Err(ConfigError::InvalidMaxDimension(self.pipeline.max_dimension));
        }

        if self.pipeline.images_per_credit == 0 {
            return Err(ConfigError::InvalidCreditDivisor(self.pipeline.images_per_credit));
        }

        if !(320..=2048).contains(&self.model.input_size) {
            return Err(ConfigError::InvalidModelInputSize(self.model.input_size));
        }

        for (name, url) in [
            ("LEDGER_URL", &self.ledger.base_url),
            ("STORAGE_URL", &self.storage.base_url),
        ] {
            if let Some(url) = url {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err(ConfigError::InvalidUrl {
                        name,
                        value: url.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    pub fn server_port(&self) -> u16 {
        self.server.port
    }

    pub fn server_host(&self) -> &str {
        &self.server.host
    }

    pub fn log_level(&self) -> Level {
        self.server.log_level
    }

    pub fn pool_size(&self) -> usize {
        self.pipeline.pool_size
    }

    pub fn max_dimension(&self) -> u32 {
        self.pipeline.max_dimension
    }

    pub fn images_per_credit(&self) -> usize {
        self.pipeline.images_per_credit
    }

    pub fn model_input_size(&self) -> u32 {
        self.model.input_size
    }
}

// Note: No Default implementation because Config::new() can fail
// Users should explicitly call Config::new()? and handle errors

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            server: ServerConfig {
                port: 8700,
                host: "127.0.0.1".to_string(),
                log_level: Level::INFO,
            },
            pipeline: PipelineConfig {
                pool_size: 4,
                max_dimension: 2048,
                images_per_credit: 2,
            },
            model: ModelConfig {
                general_model_path: "models/general.onnx".to_string(),
                landscape_model_path: "models/landscape.onnx".to_string(),
                input_size: 1024,
            },
            ledger: LedgerConfig {
                base_url: None,
                timeout_seconds: 15,
            },
            storage: StorageConfig {
                base_url: None,
                timeout_seconds: 30,
            },
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_zero_pool_size_rejected() {
        let mut config = base_config();
        config.pipeline.pool_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPoolSize(0))
        ));
    }

    #[test]
    fn test_bad_ledger_url_rejected() {
        let mut config = base_config();
        config.ledger.base_url = Some("ftp://ledger.internal".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidUrl { .. })
        ));
    }
}
