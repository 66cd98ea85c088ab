//! Fraud record data structures

use crate::types::transaction::Transaction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Risk tier derived from a normalized anomaly score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// Determine risk level from score and cut points
    pub fn from_score(score: f64, thresholds: &RiskLevelThresholds) -> Self {
        if score >= thresholds.high {
            RiskLevel::High
        } else if score >= thresholds.medium {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(RiskLevel::Low),
            "medium" => Some(RiskLevel::Medium),
            "high" => Some(RiskLevel::High),
            _ => None,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cut points splitting `[0, 1]` into low / medium / high
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLevelThresholds {
    pub medium: f64,
    pub high: f64,
}

impl Default for RiskLevelThresholds {
    fn default() -> Self {
        Self {
            medium: 0.6,
            high: 0.8,
        }
    }
}

/// Which model produced a detection score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSource {
    /// Per-user model trained on the user's own history
    User,
    /// Batch-local model trained on the un-personalized part of a batch
    Global,
}

impl ModelSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelSource::User => "user",
            ModelSource::Global => "global",
        }
    }
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a detection explanation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureContribution {
    pub feature: String,
    pub value: f64,
}

/// A transaction classified anomalous, as written to the `frauds` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudRecord {
    pub transaction_id: String,
    pub user_id: i64,
    pub amount: f64,
    pub currency: String,
    pub location: String,
    pub timestamp: f64,
    pub transaction_type: String,
    pub merchant_id: String,
    pub merchant_name: String,
    pub merchant_category: String,
    pub payment_method: String,
    pub device_type: String,
    pub ip_address: String,
    pub is_confirmed_fraud: bool,

    /// Normalized anomaly score (0.0 - 1.0)
    pub detection_score: f64,
    pub risk_level: RiskLevel,
    pub model_used: ModelSource,

    /// Top contributing features, strongest first
    pub detection_features: Vec<FeatureContribution>,
    pub detection_time: DateTime<Utc>,
    pub notes: Option<String>,
}

impl FraudRecord {
    /// Build a record from a transaction and its detection outcome
    pub fn new(
        transaction: &Transaction,
        detection_score: f64,
        risk_level: RiskLevel,
        model_used: ModelSource,
    ) -> Self {
        Self {
            transaction_id: transaction.transaction_id.clone(),
            user_id: transaction.user_id,
            amount: transaction.amount,
            currency: transaction.currency.clone(),
            location: transaction.location.clone(),
            timestamp: transaction.timestamp,
            transaction_type: transaction.transaction_type.clone(),
            merchant_id: transaction.merchant.merchant_id.clone(),
            merchant_name: transaction.merchant.name.clone(),
            merchant_category: transaction.merchant.category.clone(),
            payment_method: transaction.payment_method.clone(),
            device_type: transaction.device.device_type.clone(),
            ip_address: transaction.device.ip_address.clone(),
            is_confirmed_fraud: transaction.is_confirmed_anomaly(),
            detection_score,
            risk_level,
            model_used,
            detection_features: Vec::new(),
            detection_time: Utc::now(),
            notes: None,
        }
    }

    /// Attach the ranked explanation
    pub fn with_explanation(mut self, features: Vec<FeatureContribution>) -> Self {
        self.detection_features = features;
        self
    }
}
