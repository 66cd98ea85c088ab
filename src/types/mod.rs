//! Type definitions for the detection pipeline

pub mod fraud;
pub mod profile;
pub mod transaction;

pub use fraud::{FeatureContribution, FraudRecord, ModelSource, RiskLevel, RiskLevelThresholds};
pub use profile::UserProfile;
pub use transaction::{Device, Merchant, Transaction, UNKNOWN};
