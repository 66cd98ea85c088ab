//! User profile store: transaction history, behavioral profiles and the
//! per-user model lifecycle.

use crate::config::AppConfig;
use crate::error::{DetectorError, Result};
use crate::models::inference::UserScorer;
use crate::models::isolation_forest::ForestParams;
use crate::models::loader::ModelStore;
use crate::models::trained::{ModelScore, TrainedModel};
use crate::store::db::Database;
use crate::types::fraud::RiskLevelThresholds;
use crate::types::profile::UserProfile;
use crate::types::transaction::{Transaction, UNKNOWN};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, Row};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Values must appear this often in the window to count as usual
const USUAL_MIN_OCCURRENCES: usize = 2;

/// Floor for the typical minimum amount
const MIN_TYPICAL_AMOUNT: f64 = 5.0;

const MAX_DEVICE_TYPES: usize = 10;

const HISTORY_COLUMNS: &str = "transaction_id, user_id, amount, currency, location, timestamp, \
     transaction_type, merchant_category, payment_method, device_type, is_anomalous";

/// Tunables of the profile store
#[derive(Debug, Clone)]
pub struct ProfileSettings {
    /// Non-anomalous rows summarized into a profile
    pub profile_window: usize,
    pub min_user_transactions: usize,
    pub training_window: usize,
    pub params: ForestParams,
    pub thresholds: RiskLevelThresholds,
    pub explanation_features: usize,
    pub max_model_age: Duration,
}

impl ProfileSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            profile_window: config.pipeline.profile_window,
            min_user_transactions: config.models.min_user_transactions,
            training_window: config.models.training_window,
            params: config.models.forest_params(config.models.user_contamination),
            thresholds: config.detection.risk_levels.clone(),
            explanation_features: config.detection.explanation_features,
            max_model_age: model_age_limit(config.models.max_model_age_secs),
        }
    }
}

/// Ages beyond what `Duration` can hold mean models never go stale.
fn model_age_limit(secs: u64) -> Duration {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

impl Default for ProfileSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Result of a bulk profile bootstrap
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BootstrapReport {
    pub users: usize,
    pub profiles_updated: usize,
    pub models_trained: usize,
    pub failures: usize,
}

/// Marks a user as being trained; released on drop.
struct TrainingGuard<'a> {
    active: &'a Mutex<HashSet<i64>>,
    user_id: i64,
}

impl Drop for TrainingGuard<'_> {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.user_id);
    }
}

pub struct UserProfileStore {
    db: Arc<Database>,
    models: Arc<ModelStore>,
    settings: ProfileSettings,
    training: Mutex<HashSet<i64>>,
}

impl UserProfileStore {
    pub fn new(db: Arc<Database>, models: Arc<ModelStore>, settings: ProfileSettings) -> Self {
        Self {
            db,
            models,
            settings,
            training: Mutex::new(HashSet::new()),
        }
    }

    pub fn models(&self) -> &Arc<ModelStore> {
        &self.models
    }

    pub fn settings(&self) -> &ProfileSettings {
        &self.settings
    }

    /// Append a transaction to the user's history.
    ///
    /// Returns `false` when the transaction id was already recorded.
    pub fn record_transaction(&self, tx: &Transaction) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let inserted = self.db.with_connection(|conn| {
            let db_tx = conn.transaction()?;
            db_tx.execute(
                "INSERT OR IGNORE INTO user_profiles (user_id, last_updated) VALUES (?1, ?2)",
                params![tx.user_id, now],
            )?;
            let inserted = db_tx.execute(
                "INSERT INTO transaction_history (
                    transaction_id, user_id, amount, currency, location, timestamp,
                    transaction_type, merchant_category, payment_method, device_type,
                    is_anomalous, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(transaction_id) DO NOTHING",
                params![
                    tx.transaction_id,
                    tx.user_id,
                    tx.amount,
                    tx.currency,
                    tx.location,
                    tx.timestamp,
                    tx.transaction_type,
                    tx.merchant.category,
                    tx.payment_method,
                    tx.device.device_type,
                    tx.is_confirmed_anomaly(),
                    now,
                ],
            )?;
            db_tx.commit()?;
            Ok(inserted)
        })?;

        if inserted == 0 {
            debug!(transaction_id = %tx.transaction_id, "Transaction already recorded");
        }
        Ok(inserted > 0)
    }

    /// Most recent history rows for a user, newest first
    pub fn history(&self, user_id: i64, limit: usize, exclude_anomalous: bool) -> Result<Vec<Transaction>> {
        let sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM transaction_history
             WHERE user_id = ?1 {}
             ORDER BY timestamp DESC, transaction_id DESC
             LIMIT ?2",
            if exclude_anomalous { "AND is_anomalous = 0" } else { "" }
        );
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![user_id, limit as i64], read_history_row)?;
            rows.collect()
        })
    }

    pub fn history_count(&self, user_id: i64) -> Result<usize> {
        let count: i64 = self.db.with_connection(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM transaction_history WHERE user_id = ?1",
                [user_id],
                |row| row.get(0),
            )
        })?;
        Ok(count.max(0) as usize)
    }

    /// Recompute and store the profile from recent non-anomalous history.
    ///
    /// Returns `false` when the user has no such history.
    pub fn update_profile(&self, user_id: i64) -> Result<bool> {
        let window = self.history(user_id, self.settings.profile_window, true)?;
        if window.is_empty() {
            debug!(user_id, "No history to build profile from");
            return Ok(false);
        }

        let device_types: Vec<String> = self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT device_type FROM transaction_history
                 WHERE user_id = ?1 AND device_type IS NOT NULL AND device_type != ?2
                 ORDER BY device_type
                 LIMIT ?3",
            )?;
            let rows = stmt.query_map(
                params![user_id, UNKNOWN, MAX_DEVICE_TYPES as i64],
                |row| row.get::<_, String>(0),
            )?;
            rows.collect()
        })?;

        let profile = summarize(user_id, &window, device_types);
        self.write_profile(&profile)?;
        debug!(user_id, rows = window.len(), model_score = profile.model_score, "Profile updated");
        Ok(true)
    }

    fn write_profile(&self, profile: &UserProfile) -> Result<()> {
        let (locations, merchants, payments, times, categories, devices) = (
            to_json(&profile.usual_locations),
            to_json(&profile.usual_merchants),
            to_json(&profile.typical_payment_methods),
            to_json(&profile.typical_transaction_times),
            to_json(&profile.merchant_categories),
            to_json(&profile.device_types),
        );
        let updated = profile.last_updated.to_rfc3339();

        self.db.with_connection(|conn| {
            conn.execute(
                "INSERT INTO user_profiles (
                    user_id, usual_locations, usual_merchants, typical_min_amount,
                    typical_max_amount, typical_payment_methods, typical_transaction_times,
                    avg_transaction_amount, model_score, merchant_categories, device_types,
                    last_updated
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(user_id) DO UPDATE SET
                    usual_locations = excluded.usual_locations,
                    usual_merchants = excluded.usual_merchants,
                    typical_min_amount = excluded.typical_min_amount,
                    typical_max_amount = excluded.typical_max_amount,
                    typical_payment_methods = excluded.typical_payment_methods,
                    typical_transaction_times = excluded.typical_transaction_times,
                    avg_transaction_amount = excluded.avg_transaction_amount,
                    model_score = excluded.model_score,
                    merchant_categories = excluded.merchant_categories,
                    device_types = excluded.device_types,
                    last_updated = excluded.last_updated",
                params![
                    profile.user_id,
                    locations,
                    merchants,
                    profile.typical_min_amount,
                    profile.typical_max_amount,
                    payments,
                    times,
                    profile.avg_transaction_amount,
                    profile.model_score,
                    categories,
                    devices,
                    updated,
                ],
            )
        })?;
        Ok(())
    }

    pub fn get_profile(&self, user_id: i64) -> Result<Option<UserProfile>> {
        self.db.with_connection(|conn| {
            conn.query_row(
                "SELECT user_id, usual_locations, usual_merchants, typical_min_amount,
                        typical_max_amount, typical_payment_methods, typical_transaction_times,
                        avg_transaction_amount, model_score, merchant_categories, device_types,
                        last_updated
                 FROM user_profiles WHERE user_id = ?1",
                [user_id],
                read_profile_row,
            )
            .optional()
        })
    }

    fn acquire_training(&self, user_id: i64) -> Result<TrainingGuard<'_>> {
        let mut active = self.training.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(user_id) {
            return Err(DetectorError::TrainingInProgress { user_id });
        }
        Ok(TrainingGuard {
            active: &self.training,
            user_id,
        })
    }

    pub fn is_training(&self, user_id: i64) -> bool {
        self.training
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&user_id)
    }

    /// Train and persist a model on the user's recent non-anomalous history.
    ///
    /// Fails with [`DetectorError::InsufficientHistory`] below
    /// `min_transactions` rows and with [`DetectorError::TrainingInProgress`]
    /// while another training for the same user runs.
    pub fn train_user_model(&self, user_id: i64, min_transactions: usize) -> Result<Arc<TrainedModel>> {
        let _guard = self.acquire_training(user_id)?;

        let rows = self.history(user_id, self.settings.training_window, true)?;
        if rows.len() < min_transactions {
            return Err(DetectorError::InsufficientHistory {
                user_id,
                required: min_transactions,
                available: rows.len(),
            });
        }

        let model = TrainedModel::fit(Some(user_id), &rows, &self.settings.params)?;
        let model = self.models.save(model)?;
        info!(
            user_id,
            rows = rows.len(),
            threshold = model.forest.threshold(),
            "User model trained"
        );
        Ok(model)
    }

    /// Score with the user's own model; `None` when no usable model exists.
    pub fn score_with_user_model(&self, tx: &Transaction) -> Option<ModelScore> {
        let model = self.models.get(tx.user_id)?;
        match model.evaluate(
            tx,
            &self.settings.thresholds,
            self.settings.explanation_features,
        ) {
            Ok(score) => Some(score),
            Err(e) => {
                warn!(
                    user_id = tx.user_id,
                    transaction_id = %tx.transaction_id,
                    error = %e,
                    "User model could not score transaction"
                );
                None
            }
        }
    }

    /// Users with enough history whose model is missing or stale
    pub fn users_needing_models(&self, min_history: usize, limit: usize) -> Result<Vec<i64>> {
        let candidates = self.users_with_history(min_history)?;
        Ok(candidates
            .into_iter()
            .filter(|&user_id| !self.is_training(user_id))
            .filter(|&user_id| !self.models.is_fresh(user_id, self.settings.max_model_age))
            .take(limit)
            .collect())
    }

    /// Users with at least `min_history` rows, busiest first
    fn users_with_history(&self, min_history: usize) -> Result<Vec<i64>> {
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id FROM transaction_history
                 GROUP BY user_id
                 HAVING COUNT(*) >= ?1
                 ORDER BY COUNT(*) DESC, user_id",
            )?;
            let rows = stmt.query_map([min_history as i64], |row| row.get::<_, i64>(0))?;
            rows.collect()
        })
    }

    /// Refresh profiles and train models for every user with enough history.
    pub fn bootstrap_profiles(&self, min_history: usize) -> Result<BootstrapReport> {
        let users = self.users_with_history(min_history)?;
        let mut report = BootstrapReport {
            users: users.len(),
            ..BootstrapReport::default()
        };

        for user_id in users {
            match self.update_profile(user_id) {
                Ok(true) => report.profiles_updated += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(user_id, error = %e, "Profile bootstrap failed");
                    report.failures += 1;
                }
            }
            match self.train_user_model(user_id, self.settings.min_user_transactions) {
                Ok(_) => report.models_trained += 1,
                Err(e) => {
                    warn!(user_id, error = %e, "Model bootstrap failed");
                    report.failures += 1;
                }
            }
        }

        info!(
            users = report.users,
            profiles = report.profiles_updated,
            models = report.models_trained,
            failures = report.failures,
            "Profile bootstrap complete"
        );
        Ok(report)
    }
}

impl UserScorer for UserProfileStore {
    fn score_with_user_model(&self, transaction: &Transaction) -> Option<ModelScore> {
        UserProfileStore::score_with_user_model(self, transaction)
    }
}

/// JSON text for a list column
fn to_json<T: serde::Serialize>(values: &[T]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

fn read_history_row(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    let mut tx = Transaction::new(
        row.get::<_, String>(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(5)?,
    );
    tx.currency = row.get(3)?;
    tx.location = row.get::<_, Option<String>>(4)?.unwrap_or_else(|| UNKNOWN.to_string());
    tx.transaction_type = row.get::<_, Option<String>>(6)?.unwrap_or_else(|| UNKNOWN.to_string());
    tx.merchant.category = row.get::<_, Option<String>>(7)?.unwrap_or_else(|| UNKNOWN.to_string());
    tx.payment_method = row.get::<_, Option<String>>(8)?.unwrap_or_else(|| UNKNOWN.to_string());
    tx.device.device_type = row.get::<_, Option<String>>(9)?.unwrap_or_else(|| UNKNOWN.to_string());
    tx.is_anomalous = Some(row.get(10)?);
    Ok(tx)
}

fn json_column<T: serde::de::DeserializeOwned + Default>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        }),
        None => Ok(T::default()),
    }
}

fn read_profile_row(row: &Row<'_>) -> rusqlite::Result<UserProfile> {
    let last_updated: String = row.get(11)?;
    Ok(UserProfile {
        user_id: row.get(0)?,
        usual_locations: json_column(row, 1)?,
        usual_merchants: json_column(row, 2)?,
        typical_min_amount: row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
        typical_max_amount: row.get::<_, Option<f64>>(4)?.unwrap_or(0.0),
        typical_payment_methods: json_column(row, 5)?,
        typical_transaction_times: json_column(row, 6)?,
        avg_transaction_amount: row.get::<_, Option<f64>>(7)?.unwrap_or(0.0),
        model_score: row.get::<_, Option<f64>>(8)?.unwrap_or(0.5),
        merchant_categories: json_column(row, 9)?,
        device_types: json_column(row, 10)?,
        last_updated: DateTime::parse_from_rfc3339(&last_updated)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

/// Linear-interpolated percentile of an ascending slice
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = pct / 100.0 * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
        }
    }
}

/// Values seen at least twice, in sorted order
fn usual<T: Ord + Clone>(values: impl Iterator<Item = T>) -> Vec<T> {
    let mut counts: BTreeMap<T, usize> = BTreeMap::new();
    for value in values {
        *counts.entry(value).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .filter(|(_, count)| *count >= USUAL_MIN_OCCURRENCES)
        .map(|(value, _)| value)
        .collect()
}

/// Build a profile from a window of non-anomalous transactions.
pub fn summarize(user_id: i64, window: &[Transaction], device_types: Vec<String>) -> UserProfile {
    let mut amounts: Vec<f64> = window
        .iter()
        .map(|tx| tx.amount)
        .filter(|a| a.is_finite())
        .collect();
    amounts.sort_by(f64::total_cmp);

    let avg_transaction_amount = if amounts.is_empty() {
        0.0
    } else {
        amounts.iter().sum::<f64>() / amounts.len() as f64
    };

    let usual_locations = usual(window.iter().map(|tx| tx.location.clone()));
    let usual_merchants = usual(window.iter().map(|tx| tx.merchant.category.clone()));
    let model_score =
        (0.5 + 0.1 * usual_locations.len() as f64 + 0.05 * usual_merchants.len() as f64).min(1.0);

    UserProfile {
        user_id,
        typical_min_amount: percentile(&amounts, 5.0).max(MIN_TYPICAL_AMOUNT),
        typical_max_amount: percentile(&amounts, 95.0),
        typical_payment_methods: usual(window.iter().map(|tx| tx.payment_method.clone())),
        typical_transaction_times: usual(window.iter().map(|tx| tx.hour_of_day())),
        avg_transaction_amount,
        model_score,
        merchant_categories: window
            .iter()
            .map(|tx| tx.merchant.category.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect(),
        device_types,
        usual_locations,
        usual_merchants,
        last_updated: Utc::now(),
    }
}
