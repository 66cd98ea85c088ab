//! Configuration management for the anomaly detection pipeline

use crate::models::isolation_forest::{ForestParams, MaxSamples};
use crate::types::fraud::RiskLevelThresholds;
use anyhow::{Context, Result};
use config::{Config, File};
use serde::Deserialize;
use std::path::Path;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub nats: NatsConfig,
    pub database: DatabaseConfig,
    pub models: ModelsConfig,
    pub detection: DetectionConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

/// NATS JetStream feed configuration
#[derive(Debug, Clone, Deserialize)]
pub struct NatsConfig {
    /// NATS server URL
    pub url: String,
    /// JetStream stream holding the transaction feed
    pub stream_name: String,
    /// Subject for incoming transactions
    pub transaction_subject: String,
    /// Durable consumer name, so restarts resume where they stopped
    pub consumer_name: String,
    /// How long a delivered message may stay unacknowledged before
    /// redelivery. Must cover filling a batch on the slowest expected feed.
    #[serde(default = "default_ack_wait_secs")]
    pub ack_wait_secs: u64,
}

fn default_ack_wait_secs() -> u64 {
    300
}

/// SQLite result store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Tries per statement before a transient failure is surfaced
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_min_backoff_ms")]
    pub min_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_min_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    2000
}

/// Isolation forest and model lifecycle configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    /// Directory holding per-user model artifacts
    pub models_dir: String,
    pub n_trees: usize,
    #[serde(default)]
    pub max_samples: MaxSamples,
    pub seed: u64,
    /// Contamination of the batch-local global model
    pub global_contamination: f64,
    /// Contamination of per-user models
    pub user_contamination: f64,
    /// History rows required to train a user model
    pub min_user_transactions: usize,
    /// Most recent non-anomalous rows used for user training
    pub training_window: usize,
    /// User models older than this are retrained by the sweep
    pub max_model_age_secs: u64,
    /// Build profiles and models for every known user at startup
    #[serde(default)]
    pub bootstrap_on_start: bool,
}

impl ModelsConfig {
    pub fn forest_params(&self, contamination: f64) -> ForestParams {
        ForestParams {
            n_trees: self.n_trees,
            max_samples: self.max_samples,
            contamination,
            seed: self.seed,
        }
    }
}

/// Detection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    /// Risk level classification thresholds
    pub risk_levels: RiskLevelThresholds,
    /// Number of features reported in a detection explanation
    pub explanation_features: usize,
}

/// Pipeline configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Events per scoring batch
    pub batch_size: usize,
    /// Concurrent user-model trainings
    pub workers: usize,
    /// A sweep runs each time the processed total crosses a multiple of this
    pub sweep_interval: u64,
    /// History rows a user needs before the sweep considers it
    pub sweep_min_history: usize,
    pub sweep_max_users: usize,
    /// Non-anomalous rows summarized into a user profile
    pub profile_window: usize,
    /// Cap on fraud records held for retry after a persistence failure
    pub max_pending_records: usize,
    pub report_interval_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, pretty)
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file
    pub fn load() -> Result<Self> {
        Self::load_from_path("config/config.toml")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from(path.as_ref()))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            nats: NatsConfig {
                url: "nats://localhost:4222".to_string(),
                stream_name: "TRANSACTIONS".to_string(),
                transaction_subject: "transactions".to_string(),
                consumer_name: "anomaly-detector".to_string(),
                ack_wait_secs: default_ack_wait_secs(),
            },
            database: DatabaseConfig {
                path: "data/anomalies.db".to_string(),
                busy_timeout_ms: default_busy_timeout_ms(),
                max_attempts: default_max_attempts(),
                min_backoff_ms: default_min_backoff_ms(),
                max_backoff_ms: default_max_backoff_ms(),
            },
            models: ModelsConfig {
                models_dir: "models".to_string(),
                n_trees: 100,
                max_samples: MaxSamples::Auto,
                seed: 42,
                global_contamination: 0.1,
                user_contamination: 0.05,
                min_user_transactions: 20,
                training_window: 200,
                max_model_age_secs: 3600,
                bootstrap_on_start: false,
            },
            detection: DetectionConfig {
                risk_levels: RiskLevelThresholds::default(),
                explanation_features: 5,
            },
            pipeline: PipelineConfig {
                batch_size: 10,
                workers: 4,
                sweep_interval: 100,
                sweep_min_history: 30,
                sweep_max_users: 5,
                profile_window: 100,
                max_pending_records: 1000,
                report_interval_secs: 30,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.nats.url, "nats://localhost:4222");
        assert_eq!(config.pipeline.batch_size, 10);
        assert_eq!(config.models.min_user_transactions, 20);
        assert_eq!(config.detection.risk_levels.medium, 0.6);
        assert_eq!(config.detection.risk_levels.high, 0.8);
    }

    #[test]
    fn test_forest_params_from_config() {
        let config = AppConfig::default();
        let params = config.models.forest_params(config.models.user_contamination);
        assert_eq!(params.n_trees, 100);
        assert_eq!(params.contamination, 0.05);
        assert_eq!(params.seed, 42);
        assert_eq!(params.max_samples, MaxSamples::Auto);
    }

    #[test]
    fn test_load_shipped_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/config.toml");
        let config = AppConfig::load_from_path(path).unwrap();
        let defaults = AppConfig::default();

        assert_eq!(config.nats.stream_name, defaults.nats.stream_name);
        assert_eq!(config.nats.ack_wait_secs, 300);
        assert_eq!(config.database.path, defaults.database.path);
        assert_eq!(config.models.max_samples, MaxSamples::Auto);
        assert_eq!(config.models.global_contamination, 0.1);
        assert_eq!(config.pipeline.sweep_interval, 100);
        assert_eq!(config.detection.explanation_features, 5);
    }

    #[test]
    fn test_load_explicit_sample_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        let shipped =
            std::fs::read_to_string(Path::new(env!("CARGO_MANIFEST_DIR")).join("config/config.toml"))
                .unwrap();
        std::fs::write(
            &path,
            shipped.replace("max_samples = \"auto\"", "max_samples = { count = 64 }"),
        )
        .unwrap();

        let config = AppConfig::load_from_path(&path).unwrap();
        assert_eq!(config.models.max_samples, MaxSamples::Count(64));
    }
}
