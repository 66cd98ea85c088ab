//! Scoring router: per-user models first, batch-local global model second

use crate::config::AppConfig;
use crate::feature_extractor::FeatureEncoder;
use crate::models::isolation_forest::{ForestParams, MIN_TRAINING_ROWS};
use crate::models::trained::{ModelScore, TrainedModel};
use crate::types::fraud::{FraudRecord, ModelSource, RiskLevelThresholds};
use crate::types::transaction::Transaction;
use tracing::{debug, warn};

/// Source of per-user scores. `None` means "no usable user model".
pub trait UserScorer: Send + Sync {
    fn score_with_user_model(&self, transaction: &Transaction) -> Option<ModelScore>;
}

/// A transaction together with the score the router assigned it
#[derive(Debug, Clone)]
pub struct ScoredTransaction<'a> {
    pub transaction: &'a Transaction,
    pub outcome: ModelScore,
    pub model_source: ModelSource,
}

impl ScoredTransaction<'_> {
    pub fn is_anomaly(&self) -> bool {
        self.outcome.is_anomaly
    }

    /// Convert into a persisted fraud record
    pub fn to_record(&self) -> FraudRecord {
        FraudRecord::new(
            self.transaction,
            self.outcome.score,
            self.outcome.risk_level,
            self.model_source,
        )
        .with_explanation(self.outcome.explanation.clone())
    }
}

/// Router output for one batch
#[derive(Debug, Default)]
pub struct BatchScores<'a> {
    /// Scored transactions in batch order
    pub scored: Vec<ScoredTransaction<'a>>,
    /// Transactions no model could score
    pub unscored: Vec<&'a Transaction>,
    pub global_trained: bool,
}

impl<'a> BatchScores<'a> {
    pub fn anomalies(&self) -> impl Iterator<Item = &ScoredTransaction<'a>> {
        self.scored.iter().filter(|s| s.is_anomaly())
    }

    pub fn count_by_source(&self, source: ModelSource) -> usize {
        self.scored
            .iter()
            .filter(|s| s.model_source == source)
            .count()
    }
}

pub struct ScoringRouter {
    /// Parameters for the batch-local global model
    params: ForestParams,
    thresholds: RiskLevelThresholds,
    explanation_features: usize,
}

impl ScoringRouter {
    pub fn new(
        params: ForestParams,
        thresholds: RiskLevelThresholds,
        explanation_features: usize,
    ) -> Self {
        Self {
            params,
            thresholds,
            explanation_features,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.models.forest_params(config.models.global_contamination),
            config.detection.risk_levels.clone(),
            config.detection.explanation_features,
        )
    }

    /// Score every transaction of `batch`.
    ///
    /// User-model hits are tagged `user`; the misses are encoded together,
    /// a fresh global model is trained on them alone and they are tagged
    /// `global`. A single error never fails the batch: transactions that
    /// cannot be scored end up in `unscored`.
    pub fn score_batch<'a>(&self, batch: &'a [Transaction], users: &dyn UserScorer) -> BatchScores<'a> {
        let mut slots: Vec<Option<ScoredTransaction<'a>>> = Vec::with_capacity(batch.len());
        let mut misses = Vec::new();

        for (idx, transaction) in batch.iter().enumerate() {
            match users.score_with_user_model(transaction) {
                Some(outcome) => slots.push(Some(ScoredTransaction {
                    transaction,
                    outcome,
                    model_source: ModelSource::User,
                })),
                None => {
                    slots.push(None);
                    misses.push(idx);
                }
            }
        }

        let global_trained = self.score_global(batch, &misses, &mut slots);

        let mut scores = BatchScores {
            global_trained,
            ..BatchScores::default()
        };
        for (slot, transaction) in slots.into_iter().zip(batch) {
            match slot {
                Some(scored) => scores.scored.push(scored),
                None => scores.unscored.push(transaction),
            }
        }
        scores
    }

    fn score_global<'a>(
        &self,
        batch: &'a [Transaction],
        misses: &[usize],
        slots: &mut [Option<ScoredTransaction<'a>>],
    ) -> bool {
        if misses.is_empty() {
            debug!("Every transaction had a user model, skipping global model");
            return false;
        }
        if misses.len() < MIN_TRAINING_ROWS {
            warn!(
                count = misses.len(),
                "Too few transactions for a global model, leaving them unscored"
            );
            return false;
        }

        let global_batch: Vec<Transaction> = misses.iter().map(|&i| batch[i].clone()).collect();
        let (matrix, schema) = FeatureEncoder::new().encode(&global_batch);

        let model = match TrainedModel::fit_encoded(None, &matrix, schema, &self.params) {
            Ok(model) => model,
            Err(e) => {
                warn!(count = misses.len(), error = %e, "Global model training failed");
                return false;
            }
        };

        // Each row stays paired with the transaction it was encoded from.
        for (row, &idx) in matrix.iter().zip(misses) {
            let transaction = &batch[idx];
            match model.score_vector(row, &self.thresholds, self.explanation_features) {
                Ok(outcome) => {
                    slots[idx] = Some(ScoredTransaction {
                        transaction,
                        outcome,
                        model_source: ModelSource::Global,
                    })
                }
                Err(e) => warn!(
                    transaction_id = %transaction.transaction_id,
                    error = %e,
                    "Global scoring failed"
                ),
            }
        }

        debug!(
            rows = matrix.len(),
            features = model.schema.len(),
            threshold = model.forest.threshold(),
            "Global model scored batch"
        );
        true
    }
}
