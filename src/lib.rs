//! Anomaly Stream Detector Library
//!
//! Streaming transaction anomaly detection: per-user isolation forests with
//! a batch-local global fallback, backed by SQLite persistence.

pub mod config;
pub mod consumer;
pub mod error;
pub mod feature_extractor;
pub mod metrics;
pub mod models;
pub mod processor;
pub mod profiles;
pub mod store;
pub mod types;

pub use config::AppConfig;
pub use consumer::TransactionConsumer;
pub use error::{DetectorError, Result};
pub use feature_extractor::{FeatureEncoder, FeatureSchema};
pub use models::inference::ScoringRouter;
pub use processor::{BatchReport, ProcessorSettings, StreamProcessor};
pub use profiles::UserProfileStore;
pub use store::{Database, ResultStore};
pub use types::{fraud::FraudRecord, transaction::Transaction};
