//! Result store: fraud records, processing counters and accuracy metrics

use crate::error::Result;
use crate::store::db::{is_transient, Database};
use crate::store::schema::{F1_SCORE, PRECISION, RECALL};
use crate::types::fraud::{FraudRecord, ModelSource, RiskLevel};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Denominator floor for the F1 score
const F1_EPSILON: f64 = 0.001;

const UPSERT_FRAUD: &str = "
    INSERT INTO frauds (
        transaction_id, user_id, amount, currency, location, timestamp,
        transaction_type, merchant_id, merchant_name, merchant_category,
        payment_method, device_type, ip_address, is_confirmed_fraud,
        detection_score, risk_level, detection_time, detection_features,
        model_used, notes
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
    ON CONFLICT(transaction_id) DO UPDATE SET
        detection_score = excluded.detection_score,
        risk_level = excluded.risk_level,
        detection_time = excluded.detection_time,
        detection_features = excluded.detection_features,
        model_used = excluded.model_used,
        is_confirmed_fraud = excluded.is_confirmed_fraud
";

/// Outcome of persisting one batch of fraud records
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PersistOutcome {
    pub persisted: Vec<String>,
    /// Records rolled back individually: (transaction id, reason)
    pub failed: Vec<(String, String)>,
}

/// Accuracy of one labeled batch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchMetrics {
    pub true_positives: usize,
    pub detected: usize,
    pub actual: usize,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
}

impl BatchMetrics {
    /// Counter encoding: whole percentage points, truncated
    pub fn as_percent(value: f64) -> i64 {
        (value * 100.0).floor() as i64
    }
}

/// Precision, recall and F1 over `(ground truth, detected)` pairs.
///
/// Pairs without ground truth are ignored; `None` when no pair carries a
/// label.
pub fn compute_metrics<I>(outcomes: I) -> Option<BatchMetrics>
where
    I: IntoIterator<Item = (Option<bool>, bool)>,
{
    let mut labeled = false;
    let (mut true_positives, mut detected, mut actual) = (0usize, 0usize, 0usize);

    for (truth, flagged) in outcomes {
        let Some(truth) = truth else { continue };
        labeled = true;
        if flagged {
            detected += 1;
        }
        if truth {
            actual += 1;
            if flagged {
                true_positives += 1;
            }
        }
    }

    if !labeled {
        return None;
    }

    let precision = true_positives as f64 / detected.max(1) as f64;
    let recall = true_positives as f64 / actual.max(1) as f64;
    let f1_score = 2.0 * precision * recall / (precision + recall).max(F1_EPSILON);

    Some(BatchMetrics {
        true_positives,
        detected,
        actual,
        precision,
        recall,
        f1_score,
    })
}

/// Aggregate view of the store, logged at shutdown
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSummary {
    pub history_rows: i64,
    pub fraud_count: i64,
    pub frauds_by_risk: BTreeMap<String, i64>,
    pub frauds_by_model: BTreeMap<String, i64>,
    pub profiled_users: i64,
    pub counters: BTreeMap<String, i64>,
}

fn conversion_error<E>(idx: usize, error: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(error))
}

fn write_fraud(conn: &Connection, record: &FraudRecord) -> rusqlite::Result<usize> {
    let features = serde_json::to_string(&record.detection_features)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
    conn.execute(
        UPSERT_FRAUD,
        params![
            record.transaction_id,
            record.user_id,
            record.amount,
            record.currency,
            record.location,
            record.timestamp,
            record.transaction_type,
            record.merchant_id,
            record.merchant_name,
            record.merchant_category,
            record.payment_method,
            record.device_type,
            record.ip_address,
            record.is_confirmed_fraud,
            record.detection_score,
            record.risk_level.as_str(),
            record.detection_time.to_rfc3339(),
            features,
            record.model_used.as_str(),
            record.notes,
        ],
    )
}

fn read_fraud(row: &Row<'_>) -> rusqlite::Result<FraudRecord> {
    let risk: String = row.get(15)?;
    let detection_time: String = row.get(16)?;
    let features: String = row.get(17)?;
    let model: String = row.get(18)?;

    Ok(FraudRecord {
        transaction_id: row.get(0)?,
        user_id: row.get(1)?,
        amount: row.get(2)?,
        currency: row.get(3)?,
        location: row.get(4)?,
        timestamp: row.get(5)?,
        transaction_type: row.get(6)?,
        merchant_id: row.get(7)?,
        merchant_name: row.get(8)?,
        merchant_category: row.get(9)?,
        payment_method: row.get(10)?,
        device_type: row.get(11)?,
        ip_address: row.get(12)?,
        is_confirmed_fraud: row.get(13)?,
        detection_score: row.get(14)?,
        risk_level: RiskLevel::parse(&risk).ok_or(rusqlite::Error::InvalidColumnType(
            15,
            "risk_level".to_string(),
            Type::Text,
        ))?,
        detection_time: DateTime::parse_from_rfc3339(&detection_time)
            .map_err(|e| conversion_error(16, e))?
            .with_timezone(&Utc),
        detection_features: serde_json::from_str(&features).map_err(|e| conversion_error(17, e))?,
        model_used: if model == ModelSource::User.as_str() {
            ModelSource::User
        } else {
            ModelSource::Global
        },
        notes: row.get(19)?,
    })
}

/// Idempotent persistence of detection results
pub struct ResultStore {
    db: Arc<Database>,
}

impl ResultStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a fraud record, or refresh the detection fields of an existing one.
    pub fn upsert_fraud(&self, record: &FraudRecord) -> Result<()> {
        self.db.with_connection(|conn| write_fraud(conn, record))?;
        Ok(())
    }

    /// Write a batch of records in one transaction.
    ///
    /// Each record runs under its own savepoint: a record that violates a
    /// constraint is rolled back alone and reported in
    /// [`PersistOutcome::failed`] while the rest commit. Transient failures
    /// abort and retry the whole batch.
    pub fn persist_batch(&self, records: &[FraudRecord]) -> Result<PersistOutcome> {
        if records.is_empty() {
            return Ok(PersistOutcome::default());
        }

        let outcome = self.db.with_connection(|conn| {
            let mut outcome = PersistOutcome::default();
            let mut tx = conn.transaction()?;

            for record in records {
                let savepoint = tx.savepoint()?;
                match write_fraud(&savepoint, record) {
                    Ok(_) => {
                        savepoint.commit()?;
                        outcome.persisted.push(record.transaction_id.clone());
                    }
                    Err(e) if is_transient(&e) => return Err(e),
                    Err(e) => {
                        // dropping the savepoint rolls the record back
                        drop(savepoint);
                        outcome
                            .failed
                            .push((record.transaction_id.clone(), e.to_string()));
                    }
                }
            }

            tx.commit()?;
            Ok(outcome)
        })?;

        for (transaction_id, reason) in &outcome.failed {
            warn!(transaction_id = %transaction_id, reason = %reason, "Fraud record rejected");
        }
        debug!(
            persisted = outcome.persisted.len(),
            failed = outcome.failed.len(),
            "Batch persisted"
        );
        Ok(outcome)
    }

    /// Fetch a fraud record by transaction id
    pub fn fraud(&self, transaction_id: &str) -> Result<Option<FraudRecord>> {
        self.db.with_connection(|conn| {
            conn.query_row(
                "SELECT transaction_id, user_id, amount, currency, location, timestamp,
                        transaction_type, merchant_id, merchant_name, merchant_category,
                        payment_method, device_type, ip_address, is_confirmed_fraud,
                        detection_score, risk_level, detection_time, detection_features,
                        model_used, notes
                 FROM frauds WHERE transaction_id = ?1",
                [transaction_id],
                read_fraud,
            )
            .optional()
        })
    }

    pub fn fraud_count(&self) -> Result<i64> {
        self.db
            .with_connection(|conn| conn.query_row("SELECT COUNT(*) FROM frauds", [], |row| row.get(0)))
    }

    /// Atomically add `delta` to a counter, creating it at zero first.
    /// Returns the new value.
    pub fn increment_counter(&self, name: &str, delta: i64) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        self.db.with_connection(|conn| {
            conn.query_row(
                "INSERT INTO processing_stats (counter_name, count_value, last_updated_timestamp)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(counter_name) DO UPDATE SET
                     count_value = count_value + excluded.count_value,
                     last_updated_timestamp = excluded.last_updated_timestamp
                 RETURNING count_value",
                params![name, delta, now],
                |row| row.get(0),
            )
        })
    }

    pub fn set_counter(&self, name: &str, value: i64) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.db.with_connection(|conn| set_counter_on(conn, name, value, &now))?;
        Ok(())
    }

    pub fn counter(&self, name: &str) -> Result<Option<i64>> {
        self.db.with_connection(|conn| {
            conn.query_row(
                "SELECT count_value FROM processing_stats WHERE counter_name = ?1",
                [name],
                |row| row.get(0),
            )
            .optional()
        })
    }

    /// Persist precision, recall and F1 as percentage counters, together.
    pub fn record_metrics(&self, metrics: &BatchMetrics) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.db.with_connection(|conn| {
            let tx = conn.transaction()?;
            set_counter_on(&tx, PRECISION, BatchMetrics::as_percent(metrics.precision), &now)?;
            set_counter_on(&tx, RECALL, BatchMetrics::as_percent(metrics.recall), &now)?;
            set_counter_on(&tx, F1_SCORE, BatchMetrics::as_percent(metrics.f1_score), &now)?;
            tx.commit()
        })
    }

    pub fn stats_summary(&self) -> Result<StatsSummary> {
        self.db.with_connection(|conn| {
            let count = |sql: &str| conn.query_row(sql, [], |row| row.get::<_, i64>(0));
            let grouped = |sql: &str| -> rusqlite::Result<BTreeMap<String, i64>> {
                let mut stmt = conn.prepare(sql)?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?;
                rows.collect()
            };

            Ok(StatsSummary {
                history_rows: count("SELECT COUNT(*) FROM transaction_history")?,
                fraud_count: count("SELECT COUNT(*) FROM frauds")?,
                frauds_by_risk: grouped(
                    "SELECT risk_level, COUNT(*) FROM frauds GROUP BY risk_level",
                )?,
                frauds_by_model: grouped(
                    "SELECT model_used, COUNT(*) FROM frauds GROUP BY model_used",
                )?,
                profiled_users: count(
                    "SELECT COUNT(*) FROM user_profiles WHERE typical_max_amount IS NOT NULL",
                )?,
                counters: grouped("SELECT counter_name, count_value FROM processing_stats")?,
            })
        })
    }
}

fn set_counter_on(conn: &Connection, name: &str, value: i64, now: &str) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO processing_stats (counter_name, count_value, last_updated_timestamp)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(counter_name) DO UPDATE SET
             count_value = excluded.count_value,
             last_updated_timestamp = excluded.last_updated_timestamp",
        params![name, value, now],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::{reconcile, TOTAL_PROCESSED};
    use crate::types::fraud::FeatureContribution;
    use crate::types::transaction::Transaction;

    fn store() -> ResultStore {
        let db = Arc::new(Database::open_in_memory().unwrap());
        reconcile(&db).unwrap();
        ResultStore::new(db)
    }

    fn record(id: &str, score: f64, risk: RiskLevel) -> FraudRecord {
        let mut tx = Transaction::new(id, 11, 780.0, 1_704_551_400.0);
        tx.location = "FR".to_string();
        FraudRecord::new(&tx, score, risk, ModelSource::Global).with_explanation(vec![
            FeatureContribution {
                feature: "amount".to_string(),
                value: 2.5,
            },
        ])
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let store = store();

        store.upsert_fraud(&record("tx_1", 0.65, RiskLevel::Medium)).unwrap();
        let mut rescored = record("tx_1", 0.91, RiskLevel::High);
        rescored.model_used = ModelSource::User;
        store.upsert_fraud(&rescored).unwrap();

        assert_eq!(store.fraud_count().unwrap(), 1);
        let stored = store.fraud("tx_1").unwrap().unwrap();
        assert_eq!(stored.detection_score, 0.91);
        assert_eq!(stored.risk_level, RiskLevel::High);
        assert_eq!(stored.model_used, ModelSource::User);
        assert_eq!(stored.location, "FR");
        assert_eq!(stored.detection_features, rescored.detection_features);
    }

    #[test]
    fn test_missing_fraud_is_none() {
        assert!(store().fraud("nope").unwrap().is_none());
    }

    #[test]
    fn test_bad_record_rolls_back_alone() {
        let store = store();
        let records = vec![
            record("tx_a", 0.7, RiskLevel::Medium),
            record("tx_b", f64::NAN, RiskLevel::High),
            record("tx_c", 1.5, RiskLevel::High),
            record("tx_d", 0.85, RiskLevel::High),
        ];

        let outcome = store.persist_batch(&records).unwrap();

        assert_eq!(outcome.persisted, vec!["tx_a".to_string(), "tx_d".to_string()]);
        let failed: Vec<&str> = outcome.failed.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(failed, vec!["tx_b", "tx_c"]);
        assert_eq!(store.fraud_count().unwrap(), 2);
        assert!(store.fraud("tx_b").unwrap().is_none());
    }

    #[test]
    fn test_persisting_same_batch_twice_keeps_one_row_each() {
        let store = store();
        let records = vec![
            record("tx_a", 0.7, RiskLevel::Medium),
            record("tx_b", 0.9, RiskLevel::High),
        ];

        store.persist_batch(&records).unwrap();
        store.persist_batch(&records).unwrap();
        assert_eq!(store.fraud_count().unwrap(), 2);
    }

    #[test]
    fn test_counters() {
        let store = store();

        assert_eq!(store.increment_counter(TOTAL_PROCESSED, 10).unwrap(), 10);
        assert_eq!(store.increment_counter(TOTAL_PROCESSED, 10).unwrap(), 20);
        assert_eq!(store.increment_counter("fresh_counter", 3).unwrap(), 3);

        store.set_counter(TOTAL_PROCESSED, 5).unwrap();
        assert_eq!(store.counter(TOTAL_PROCESSED).unwrap(), Some(5));
        assert_eq!(store.counter("never_set").unwrap(), None);
    }

    #[test]
    fn test_metric_scenario() {
        // 10 transactions, 2 true anomalies, 3 flagged of which 2 correct
        let mut outcomes = vec![(Some(false), false); 10];
        outcomes[0] = (Some(true), true);
        outcomes[1] = (Some(true), true);
        outcomes[2] = (Some(false), true);

        let metrics = compute_metrics(outcomes).unwrap();
        assert_eq!(metrics.true_positives, 2);
        assert_eq!(metrics.detected, 3);
        assert_eq!(metrics.actual, 2);
        assert!((metrics.precision - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(metrics.recall, 1.0);
        assert!((metrics.f1_score - 0.8).abs() < 1e-12);

        let store = store();
        store.record_metrics(&metrics).unwrap();
        assert_eq!(store.counter(PRECISION).unwrap(), Some(66));
        assert_eq!(store.counter(RECALL).unwrap(), Some(100));
        assert_eq!(store.counter(F1_SCORE).unwrap(), Some(80));
    }

    #[test]
    fn test_metrics_need_labels() {
        assert!(compute_metrics(vec![(None, true), (None, false)]).is_none());

        let nothing_flagged = compute_metrics(vec![(Some(false), false)]).unwrap();
        assert_eq!(nothing_flagged.precision, 0.0);
        assert_eq!(nothing_flagged.f1_score, 0.0);
    }

    #[test]
    fn test_stats_summary() {
        let store = store();
        store
            .persist_batch(&[
                record("tx_a", 0.7, RiskLevel::Medium),
                record("tx_b", 0.9, RiskLevel::High),
                record("tx_c", 0.95, RiskLevel::High),
            ])
            .unwrap();
        store.increment_counter(TOTAL_PROCESSED, 30).unwrap();

        let summary = store.stats_summary().unwrap();
        assert_eq!(summary.fraud_count, 3);
        assert_eq!(summary.frauds_by_risk.get("high"), Some(&2));
        assert_eq!(summary.frauds_by_model.get("global"), Some(&3));
        assert_eq!(summary.counters.get(TOTAL_PROCESSED), Some(&30));
        assert_eq!(summary.history_rows, 0);
    }
}
