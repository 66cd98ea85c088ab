//! Stream processor: buffers the feed into fixed-size batches and drives
//! scoring, persistence and user-model maintenance for each batch.
//!
//! Scoring and model training run on the blocking pool. History, counter
//! and result writes go through the synchronous SQLite store on the calling
//! task, so a busy database stalls that task for up to the store's retry
//! budget.

use crate::config::AppConfig;
use crate::error::{DetectorError, Result};
use crate::metrics::PipelineMetrics;
use crate::models::inference::{ScoringRouter, UserScorer};
use crate::profiles::UserProfileStore;
use crate::store::results::{compute_metrics, BatchMetrics, ResultStore};
use crate::store::schema::{DECODE_ERRORS, TOTAL_PROCESSED};
use crate::types::fraud::{FraudRecord, ModelSource};
use crate::types::transaction::Transaction;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Where the processor is in its batch cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Idle,
    Buffering,
    /// Scoring the drained batch
    Draining,
    Persisting,
}

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub batch_size: usize,
    /// Concurrent user-model trainings
    pub workers: usize,
    pub sweep_interval: u64,
    pub sweep_min_history: usize,
    pub sweep_max_users: usize,
    pub min_user_transactions: usize,
    pub max_pending_records: usize,
}

impl ProcessorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            batch_size: config.pipeline.batch_size.max(1),
            workers: config.pipeline.workers.max(1),
            sweep_interval: config.pipeline.sweep_interval,
            sweep_min_history: config.pipeline.sweep_min_history,
            sweep_max_users: config.pipeline.sweep_max_users,
            min_user_transactions: config.models.min_user_transactions,
            max_pending_records: config.pipeline.max_pending_records,
        }
    }
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Summary of one processed batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub batch_size: usize,
    /// Processed total after this batch, as persisted
    pub total_processed: u64,
    pub user_scored: usize,
    pub global_scored: usize,
    pub unscored: usize,
    pub anomalies: usize,
    pub persisted: usize,
    pub rejected: usize,
    /// Records held back for the next batch after a transient failure
    pub pending: usize,
    pub metrics: Option<BatchMetrics>,
    pub swept: bool,
    pub retrained: Vec<i64>,
    pub training_failures: usize,
}

pub struct StreamProcessor {
    profiles: Arc<UserProfileStore>,
    results: ResultStore,
    router: Arc<ScoringRouter>,
    metrics: Arc<PipelineMetrics>,
    settings: ProcessorSettings,
    training_slots: Arc<Semaphore>,
    state: ProcessorState,
    buffer: Vec<Transaction>,
    pending: Vec<FraudRecord>,
    processed: u64,
}

impl StreamProcessor {
    pub fn new(
        profiles: Arc<UserProfileStore>,
        results: ResultStore,
        router: ScoringRouter,
        metrics: Arc<PipelineMetrics>,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            training_slots: Arc::new(Semaphore::new(settings.workers.max(1))),
            buffer: Vec::with_capacity(settings.batch_size),
            profiles,
            results,
            router: Arc::new(router),
            metrics,
            settings,
            state: ProcessorState::Idle,
            pending: Vec::new(),
            processed: 0,
        }
    }

    pub fn state(&self) -> ProcessorState {
        self.state
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn pending_records(&self) -> usize {
        self.pending.len()
    }

    pub fn results(&self) -> &ResultStore {
        &self.results
    }

    pub fn profiles(&self) -> &Arc<UserProfileStore> {
        &self.profiles
    }

    /// Decode and handle one raw feed payload. Malformed payloads are
    /// counted and skipped.
    pub async fn handle_payload(&mut self, payload: &[u8]) -> Result<Option<BatchReport>> {
        match Transaction::from_json(payload) {
            Ok(transaction) => self.handle_event(transaction).await,
            Err(e) => {
                self.metrics.record_decode_failure();
                warn!(error = %e, bytes = payload.len(), "Skipping malformed transaction");
                if let Err(e) = self.results.increment_counter(DECODE_ERRORS, 1) {
                    warn!(error = %e, "Failed to count decode error");
                }
                Ok(None)
            }
        }
    }

    /// Record the event in the user's history, buffer it, and run the batch
    /// once the buffer is full.
    pub async fn handle_event(&mut self, transaction: Transaction) -> Result<Option<BatchReport>> {
        self.metrics.record_received();

        // A redelivered message must not appear twice in one batch
        if self
            .buffer
            .iter()
            .any(|t| t.transaction_id == transaction.transaction_id)
        {
            debug!(
                transaction_id = %transaction.transaction_id,
                "Transaction already buffered"
            );
            return Ok(None);
        }

        match self.profiles.record_transaction(&transaction) {
            Ok(true) => {
                if let Err(e) = self.profiles.update_profile(transaction.user_id) {
                    debug!(user_id = transaction.user_id, error = %e, "Profile refresh skipped");
                }
            }
            Ok(false) => debug!(
                transaction_id = %transaction.transaction_id,
                "Transaction already in history"
            ),
            Err(e) => warn!(
                transaction_id = %transaction.transaction_id,
                user_id = transaction.user_id,
                error = %e,
                "Failed to record transaction history"
            ),
        }

        self.state = ProcessorState::Buffering;
        self.buffer.push(transaction);

        if self.buffer.len() >= self.settings.batch_size {
            return self.process_batch().await;
        }
        Ok(None)
    }

    /// Process whatever is buffered, e.g. at shutdown, then write any
    /// records still held back. `Ok` means nothing is left unwritten.
    pub async fn flush(&mut self) -> Result<Option<BatchReport>> {
        let outcome = match self.process_batch().await {
            Ok(report) => self.write_pending().map(|_| report),
            Err(e) => Err(e),
        };
        self.state = ProcessorState::Idle;
        outcome
    }

    /// Retry the records held back after a transient persistence failure.
    /// They stay held if the store is still unavailable.
    pub fn write_pending(&mut self) -> Result<usize> {
        if self.pending.is_empty() {
            return Ok(0);
        }

        match self.results.persist_batch(&self.pending) {
            Ok(outcome) => {
                self.metrics.record_persistence_failures(outcome.failed.len());
                info!(
                    persisted = outcome.persisted.len(),
                    rejected = outcome.failed.len(),
                    "Held records written"
                );
                self.pending.clear();
                Ok(outcome.persisted.len())
            }
            Err(e) => {
                error!(error = %e, pending = self.pending.len(), "Held records could not be written");
                Err(e)
            }
        }
    }

    async fn process_batch(&mut self) -> Result<Option<BatchReport>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        let started = Instant::now();
        let batch = std::mem::take(&mut self.buffer);
        self.state = ProcessorState::Draining;

        let total_processed = match self
            .results
            .increment_counter(TOTAL_PROCESSED, batch.len() as i64)
        {
            Ok(total) => total.max(0) as u64,
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "Processed counter unavailable, using local count");
                self.processed + batch.len() as u64
            }
            Err(e) => return Err(e),
        };
        self.processed = total_processed;

        let mut report = BatchReport {
            batch_size: batch.len(),
            total_processed,
            ..BatchReport::default()
        };

        let router = Arc::clone(&self.router);
        let profiles = Arc::clone(&self.profiles);
        let scoring = tokio::task::spawn_blocking(move || {
            let scored = score_owned(&router, &batch, profiles.as_ref());
            (batch, scored)
        })
        .await;
        let (batch, scored) = match scoring {
            Ok(done) => done,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => {
                // Nothing is acknowledged, so the feed redelivers the batch
                error!(error = %e, "Scoring task cancelled");
                self.state = ProcessorState::Buffering;
                return Ok(None);
            }
        };

        report.user_scored = scored.user_scored;
        report.global_scored = scored.global_scored;
        report.unscored = scored.unscored;
        for &score in &scored.scores {
            self.metrics.record_score(score);
        }
        for record in &scored.records {
            self.metrics.record_anomaly(record.risk_level, record.model_used);
            info!(
                transaction_id = %record.transaction_id,
                user_id = record.user_id,
                score = record.detection_score,
                risk_level = %record.risk_level,
                model = %record.model_used,
                "Anomaly detected"
            );
        }
        report.anomalies = scored.records.len();

        self.state = ProcessorState::Persisting;
        self.persist(scored.records, &mut report)?;

        report.metrics = compute_metrics(scored.labels);
        if let Some(metrics) = &report.metrics {
            if let Err(e) = self.results.record_metrics(metrics) {
                warn!(error = %e, "Failed to persist batch metrics");
            }
        }

        let mut users = confirmed_anomaly_users(&batch);
        if self.sweep_due(total_processed, batch.len()) {
            report.swept = true;
            match self.profiles.users_needing_models(
                self.settings.sweep_min_history,
                self.settings.sweep_max_users,
            ) {
                Ok(stale) => {
                    debug!(users = ?stale, "Model sweep");
                    for user_id in stale {
                        if !users.contains(&user_id) {
                            users.push(user_id);
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Model sweep skipped"),
            }
        }
        if !users.is_empty() {
            let (trained, failures) = self.train_users(users).await;
            report.retrained = trained;
            report.training_failures = failures;
        }

        self.metrics.record_batch(started.elapsed(), report.unscored);
        self.state = ProcessorState::Buffering;

        info!(
            batch_size = report.batch_size,
            total = report.total_processed,
            user = report.user_scored,
            global = report.global_scored,
            anomalies = report.anomalies,
            persisted = report.persisted,
            pending = report.pending,
            retrained = report.retrained.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "Batch processed"
        );
        Ok(Some(report))
    }

    /// Write this batch's records together with any held back earlier.
    fn persist(&mut self, records: Vec<FraudRecord>, report: &mut BatchReport) -> Result<()> {
        let mut to_write = std::mem::take(&mut self.pending);
        to_write.extend(records);
        if to_write.is_empty() {
            return Ok(());
        }

        match self.results.persist_batch(&to_write) {
            Ok(outcome) => {
                report.persisted = outcome.persisted.len();
                report.rejected = outcome.failed.len();
                self.metrics.record_persistence_failures(outcome.failed.len());
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                let dropped = cap_pending(&mut to_write, self.settings.max_pending_records);
                warn!(
                    error = %e,
                    pending = to_write.len(),
                    dropped,
                    "Persistence unavailable, holding records for the next batch"
                );
                self.metrics.record_persistence_failures(dropped);
                report.pending = to_write.len();
                self.pending = to_write;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, records = to_write.len(), "Persistence failed permanently");
                Err(e)
            }
        }
    }

    fn sweep_due(&self, total_processed: u64, batch_len: usize) -> bool {
        self.settings.sweep_interval > 0
            && total_processed % self.settings.sweep_interval < batch_len as u64
    }

    /// Train the given users on the bounded pool. Returns the users trained
    /// and the number of failures.
    async fn train_users(&self, users: Vec<i64>) -> (Vec<i64>, usize) {
        let min_transactions = self.settings.min_user_transactions;

        let tasks = users.into_iter().map(|user_id| {
            let profiles = Arc::clone(&self.profiles);
            let slots = Arc::clone(&self.training_slots);
            let metrics = Arc::clone(&self.metrics);

            async move {
                let _permit = slots.acquire_owned().await.ok()?;
                let started = Instant::now();
                let outcome = tokio::task::spawn_blocking(move || {
                    profiles.train_user_model(user_id, min_transactions)
                })
                .await;

                match outcome {
                    Ok(Ok(_)) => {
                        metrics.record_training(started.elapsed(), true);
                        Some(Ok(user_id))
                    }
                    Ok(Err(DetectorError::TrainingInProgress { .. })) => {
                        debug!(user_id, "Training already running");
                        None
                    }
                    Ok(Err(e)) => {
                        warn!(user_id, error = %e, "User model training failed");
                        metrics.record_training(started.elapsed(), false);
                        Some(Err(user_id))
                    }
                    Err(e) => {
                        error!(user_id, error = %e, "Training task panicked");
                        metrics.record_training(started.elapsed(), false);
                        Some(Err(user_id))
                    }
                }
            }
        });

        let mut trained = Vec::new();
        let mut failures = 0;
        for outcome in join_all(tasks).await.into_iter().flatten() {
            match outcome {
                Ok(user_id) => trained.push(user_id),
                Err(_) => failures += 1,
            }
        }
        (trained, failures)
    }
}

/// Scores of one batch, detached from the borrowed transactions
struct ScoredBatch {
    user_scored: usize,
    global_scored: usize,
    unscored: usize,
    scores: Vec<f64>,
    records: Vec<FraudRecord>,
    /// (ground truth, predicted) per transaction
    labels: Vec<(Option<bool>, bool)>,
}

fn score_owned(router: &ScoringRouter, batch: &[Transaction], users: &dyn UserScorer) -> ScoredBatch {
    let scores = router.score_batch(batch, users);
    ScoredBatch {
        user_scored: scores.count_by_source(ModelSource::User),
        global_scored: scores.count_by_source(ModelSource::Global),
        unscored: scores.unscored.len(),
        scores: scores.scored.iter().map(|s| s.outcome.score).collect(),
        records: scores.anomalies().map(|s| s.to_record()).collect(),
        labels: scores
            .scored
            .iter()
            .map(|s| (s.transaction.is_anomalous, s.is_anomaly()))
            .chain(scores.unscored.iter().map(|t| (t.is_anomalous, false)))
            .collect(),
    }
}

/// Users whose confirmed anomalies call for an immediate retrain, in
/// batch order.
fn confirmed_anomaly_users(batch: &[Transaction]) -> Vec<i64> {
    let mut seen = HashSet::new();
    batch
        .iter()
        .filter(|t| t.is_confirmed_anomaly())
        .map(|t| t.user_id)
        .filter(|user_id| seen.insert(*user_id))
        .collect()
}

/// Drop the oldest records beyond `max`. Returns how many were dropped.
fn cap_pending(pending: &mut Vec<FraudRecord>, max: usize) -> usize {
    let excess = pending.len().saturating_sub(max);
    pending.drain(..excess);
    excess
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::isolation_forest::ForestParams;
    use crate::models::loader::ModelStore;
    use crate::profiles::ProfileSettings;
    use crate::config::DatabaseConfig;
    use crate::store::db::Database;
    use crate::store::schema::reconcile;
    use rusqlite::Connection;
    use crate::types::fraud::{RiskLevel, RiskLevelThresholds};
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    struct Fixture {
        processor: StreamProcessor,
        metrics: Arc<PipelineMetrics>,
        _dir: TempDir,
    }

    fn fixture(settings: ProcessorSettings) -> Fixture {
        fixture_with(Database::open_in_memory().unwrap(), settings)
    }

    fn fixture_with(db: Database, settings: ProcessorSettings) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(db);
        reconcile(&db).unwrap();

        let models = Arc::new(ModelStore::open(dir.path()).unwrap());
        let profile_settings = ProfileSettings {
            params: ForestParams {
                n_trees: 25,
                ..ForestParams::default().with_contamination(0.05)
            },
            ..ProfileSettings::default()
        };
        let profiles = Arc::new(UserProfileStore::new(
            Arc::clone(&db),
            models,
            profile_settings,
        ));
        let router = ScoringRouter::new(
            ForestParams {
                n_trees: 25,
                ..ForestParams::default()
            },
            RiskLevelThresholds::default(),
            3,
        );
        let metrics = Arc::new(PipelineMetrics::new());
        let processor = StreamProcessor::new(
            profiles,
            ResultStore::new(db),
            router,
            Arc::clone(&metrics),
            settings,
        );

        Fixture {
            processor,
            metrics,
            _dir: dir,
        }
    }

    fn settings() -> ProcessorSettings {
        ProcessorSettings {
            batch_size: 10,
            workers: 2,
            sweep_interval: 0,
            sweep_min_history: 30,
            sweep_max_users: 5,
            min_user_transactions: 20,
            max_pending_records: 100,
        }
    }

    fn tx(id: &str, user_id: i64, amount: f64) -> Transaction {
        let mut tx = Transaction::new(id, user_id, amount, 1_704_551_400.0 + amount);
        tx.location = "US".to_string();
        tx.merchant.category = "Groceries".to_string();
        tx.payment_method = "credit_card".to_string();
        tx
    }

    fn seed_history(processor: &StreamProcessor, user_id: i64, rows: usize) {
        for seq in 0..rows {
            let t = tx(
                &format!("hist_{user_id}_{seq}"),
                user_id,
                40.0 + (seq % 7) as f64 * 3.0,
            );
            processor.profiles().record_transaction(&t).unwrap();
        }
    }

    #[tokio::test]
    async fn test_batch_runs_exactly_at_boundary() {
        let mut f = fixture(settings());

        for i in 0..9 {
            let report = f
                .processor
                .handle_event(tx(&format!("tx_{i}"), 100 + i, 20.0 + i as f64))
                .await
                .unwrap();
            assert!(report.is_none());
            assert_eq!(f.processor.state(), ProcessorState::Buffering);
        }
        assert_eq!(f.processor.buffered(), 9);
        assert_eq!(f.processor.results().counter(TOTAL_PROCESSED).unwrap(), Some(0));

        let report = f
            .processor
            .handle_event(tx("tx_9", 109, 9500.0))
            .await
            .unwrap()
            .expect("tenth event runs the batch");
        assert_eq!(report.batch_size, 10);
        assert_eq!(report.total_processed, 10);
        assert_eq!(report.global_scored + report.unscored, 10);
        assert!(report.anomalies >= 1);
        assert_eq!(report.persisted, report.anomalies);
        assert_eq!(f.processor.buffered(), 0);

        let report = f
            .processor
            .handle_event(tx("tx_10", 110, 30.0))
            .await
            .unwrap();
        assert!(report.is_none());
        assert_eq!(f.processor.buffered(), 1);
        assert_eq!(f.processor.results().counter(TOTAL_PROCESSED).unwrap(), Some(10));
        assert_eq!(f.metrics.batches_processed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_counted_and_skipped() {
        let mut f = fixture(settings());

        let report = f.processor.handle_payload(b"{not json").await.unwrap();
        assert!(report.is_none());
        assert_eq!(f.processor.buffered(), 0);
        assert_eq!(f.metrics.decode_failures.load(Ordering::Relaxed), 1);
        assert_eq!(f.processor.results().counter(DECODE_ERRORS).unwrap(), Some(1));

        let payload = serde_json::to_vec(&tx("tx_ok", 1, 12.0)).unwrap();
        f.processor.handle_payload(&payload).await.unwrap();
        assert_eq!(f.processor.buffered(), 1);
    }

    #[tokio::test]
    async fn test_confirmed_anomaly_triggers_retraining() {
        let mut f = fixture(ProcessorSettings {
            batch_size: 2,
            ..settings()
        });
        seed_history(&f.processor, 7, 25);

        let mut fraud = tx("tx_fraud", 7, 8800.0);
        fraud.location = "RU".to_string();
        fraud.is_anomalous = Some(true);
        f.processor.handle_event(fraud).await.unwrap();
        let report = f
            .processor
            .handle_event(tx("tx_other", 8, 35.0))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.retrained, vec![7]);
        assert_eq!(report.training_failures, 0);
        assert!(f.processor.profiles().models().artifact_path(7).exists());
        assert!(report.metrics.is_some());
        assert_eq!(f.metrics.models_trained.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_confirmed_anomaly_without_history_is_not_fatal() {
        let mut f = fixture(ProcessorSettings {
            batch_size: 2,
            ..settings()
        });

        let mut fraud = tx("tx_fraud", 5, 7000.0);
        fraud.is_anomalous = Some(true);
        f.processor.handle_event(fraud).await.unwrap();
        let report = f
            .processor
            .handle_event(tx("tx_other", 6, 20.0))
            .await
            .unwrap()
            .unwrap();

        assert!(report.retrained.is_empty());
        assert_eq!(report.training_failures, 1);
        assert_eq!(f.metrics.training_failures.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_sweep_trains_users_then_routes_to_their_model() {
        let mut f = fixture(ProcessorSettings {
            sweep_interval: 10,
            ..settings()
        });
        seed_history(&f.processor, 3, 30);

        let mut report = None;
        for i in 0..10 {
            report = f
                .processor
                .handle_event(tx(&format!("tx_{i}"), 200 + i, 25.0 + i as f64))
                .await
                .unwrap();
        }
        let report = report.unwrap();
        assert!(report.swept);
        assert_eq!(report.retrained, vec![3]);
        assert!(f.processor.profiles().models().get(3).is_some());

        let mut report = None;
        for i in 0..10 {
            let user_id = if i < 4 { 3 } else { 300 + i };
            report = f
                .processor
                .handle_event(tx(&format!("next_{i}"), user_id, 43.0))
                .await
                .unwrap();
        }
        let report = report.unwrap();
        assert_eq!(report.user_scored, 4);
        assert_eq!(report.global_scored, 6);
    }

    #[tokio::test]
    async fn test_flush_processes_partial_batch() {
        let mut f = fixture(settings());
        for i in 0..3 {
            f.processor
                .handle_event(tx(&format!("tx_{i}"), i, 10.0 * (i + 1) as f64))
                .await
                .unwrap();
        }

        let report = f.processor.flush().await.unwrap().unwrap();
        assert_eq!(report.batch_size, 3);
        assert_eq!(f.processor.state(), ProcessorState::Idle);
        assert!(f.processor.flush().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_held_records_are_written_on_flush() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            path: dir.path().join("results.db").to_string_lossy().into_owned(),
            busy_timeout_ms: 10,
            max_attempts: 1,
            min_backoff_ms: 1,
            max_backoff_ms: 1,
        };
        let mut f = fixture_with(Database::open(&config).unwrap(), settings());

        // A second connection holds the write lock for the whole batch
        let blocker = Connection::open(&config.path).unwrap();
        blocker.execute_batch("BEGIN IMMEDIATE;").unwrap();

        let mut report = None;
        for i in 0..10 {
            let amount = if i == 9 { 9500.0 } else { 20.0 + i as f64 };
            report = f
                .processor
                .handle_event(tx(&format!("tx_{i}"), 100 + i, amount))
                .await
                .unwrap();
        }
        let report = report.unwrap();
        assert!(report.anomalies >= 1);
        assert_eq!(report.persisted, 0);
        assert_eq!(report.pending, report.anomalies);
        assert_eq!(f.processor.pending_records(), report.anomalies);

        // Still locked: flush reports the failure and keeps the records
        let err = f.processor.flush().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(f.processor.pending_records(), report.anomalies);

        blocker.execute_batch("COMMIT;").unwrap();
        assert!(f.processor.flush().await.unwrap().is_none());
        assert_eq!(f.processor.pending_records(), 0);
        assert_eq!(
            f.processor.results().fraud_count().unwrap(),
            report.anomalies as i64
        );
    }

    #[tokio::test]
    async fn test_redelivered_message_is_buffered_once() {
        let mut f = fixture(settings());
        for _ in 0..3 {
            f.processor
                .handle_event(tx("tx_dup", 1, 15.0))
                .await
                .unwrap();
        }
        f.processor.handle_event(tx("tx_other", 2, 16.0)).await.unwrap();

        assert_eq!(f.processor.buffered(), 2);
        let report = f.processor.flush().await.unwrap().unwrap();
        assert_eq!(report.batch_size, 2);
        assert_eq!(f.processor.results().counter(TOTAL_PROCESSED).unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_negative_amount_is_a_decode_failure() {
        let mut f = fixture(settings());
        let mut payload = serde_json::to_value(tx("tx_neg", 1, 12.0)).unwrap();
        payload["amount"] = serde_json::json!(-12.0);

        let report = f
            .processor
            .handle_payload(&serde_json::to_vec(&payload).unwrap())
            .await
            .unwrap();
        assert!(report.is_none());
        assert_eq!(f.processor.buffered(), 0);
        assert_eq!(f.processor.results().counter(DECODE_ERRORS).unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_redelivered_batch_is_idempotent() {
        let mut f = fixture(ProcessorSettings {
            batch_size: 5,
            ..settings()
        });
        let batch: Vec<Transaction> = (0..5)
            .map(|i| tx(&format!("tx_{i}"), 50 + i, if i == 4 { 9000.0 } else { 20.0 + i as f64 }))
            .collect();

        for t in batch.clone() {
            f.processor.handle_event(t).await.unwrap();
        }
        let first = f.processor.results().fraud_count().unwrap();
        for t in batch {
            f.processor.handle_event(t).await.unwrap();
        }

        assert!(first >= 1);
        assert_eq!(f.processor.results().fraud_count().unwrap(), first);
    }

    #[test]
    fn test_confirmed_users_are_deduplicated() {
        let mut a = tx("a", 1, 10.0);
        a.is_anomalous = Some(true);
        let mut b = tx("b", 1, 11.0);
        b.is_anomalous = Some(true);
        let c = tx("c", 2, 12.0);
        let mut d = tx("d", 4, 13.0);
        d.is_anomalous = Some(true);

        assert_eq!(confirmed_anomaly_users(&[a, b, c, d]), vec![1, 4]);
    }

    #[test]
    fn test_pending_cap_drops_oldest() {
        let mut pending: Vec<FraudRecord> = (0..5)
            .map(|i| {
                FraudRecord::new(
                    &tx(&format!("tx_{i}"), 1, 10.0),
                    0.9,
                    RiskLevel::High,
                    ModelSource::Global,
                )
            })
            .collect();

        assert_eq!(cap_pending(&mut pending, 3), 2);
        let ids: Vec<&str> = pending.iter().map(|r| r.transaction_id.as_str()).collect();
        assert_eq!(ids, vec!["tx_2", "tx_3", "tx_4"]);
        assert_eq!(cap_pending(&mut pending, 10), 0);
    }
}
