//! A fitted forest bundled with the feature schema it was trained against

use crate::error::Result;
use crate::feature_extractor::{top_contributions, FeatureEncoder, FeatureSchema};
use crate::models::isolation_forest::{ForestParams, IsolationForest};
use crate::types::fraud::{FeatureContribution, RiskLevel, RiskLevelThresholds};
use crate::types::transaction::Transaction;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of scoring one transaction
#[derive(Debug, Clone, PartialEq)]
pub struct ModelScore {
    /// Normalized anomaly score (0.0 - 1.0)
    pub score: f64,
    pub is_anomaly: bool,
    pub risk_level: RiskLevel,
    pub explanation: Vec<FeatureContribution>,
}

/// Serialized as one artifact per user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedModel {
    /// `None` for batch-local global models
    pub user_id: Option<i64>,
    pub forest: IsolationForest,
    pub schema: FeatureSchema,
    pub trained_at: DateTime<Utc>,
    pub training_rows: usize,
}

impl TrainedModel {
    /// Encode `transactions` and fit a forest on them.
    pub fn fit(
        user_id: Option<i64>,
        transactions: &[Transaction],
        params: &ForestParams,
    ) -> Result<Self> {
        let (matrix, schema) = FeatureEncoder::new().encode(transactions);
        Self::fit_encoded(user_id, &matrix, schema, params)
    }

    /// Fit on an already encoded matrix whose columns follow `schema`.
    pub fn fit_encoded(
        user_id: Option<i64>,
        matrix: &[Vec<f64>],
        schema: FeatureSchema,
        params: &ForestParams,
    ) -> Result<Self> {
        let forest = IsolationForest::train(matrix, params)?;
        Ok(Self {
            user_id,
            forest,
            schema,
            trained_at: Utc::now(),
            training_rows: matrix.len(),
        })
    }

    /// Project a transaction through the stored schema and score it.
    pub fn evaluate(
        &self,
        transaction: &Transaction,
        thresholds: &RiskLevelThresholds,
        explanation_features: usize,
    ) -> Result<ModelScore> {
        let vector = FeatureEncoder::new().project(transaction, &self.schema);
        self.score_vector(&vector, thresholds, explanation_features)
    }

    /// Score a vector already projected through `self.schema`.
    pub fn score_vector(
        &self,
        vector: &[f64],
        thresholds: &RiskLevelThresholds,
        explanation_features: usize,
    ) -> Result<ModelScore> {
        let score = self.forest.try_score(vector)?;
        Ok(ModelScore {
            score,
            is_anomaly: self.forest.is_anomalous_score(score),
            risk_level: RiskLevel::from_score(score, thresholds),
            explanation: top_contributions(&self.schema, vector, explanation_features),
        })
    }

    /// Whether the model was trained less than `max_age` ago.
    pub fn is_fresh(&self, max_age: Duration) -> bool {
        Utc::now() - self.trained_at < max_age
    }
}
