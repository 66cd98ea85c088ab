//! Startup schema reconciliation
//!
//! Runs once before the stream is consumed. Missing tables are created,
//! columns added in later releases are patched in with defaults, and any
//! other gap fails fast with [`DetectorError::Schema`].

use crate::error::{DetectorError, Result};
use crate::store::db::Database;
use chrono::Utc;
use rusqlite::params;
use std::collections::HashSet;
use tracing::{info, warn};

pub const TOTAL_PROCESSED: &str = "total_transactions_processed";
pub const PRECISION: &str = "precision";
pub const RECALL: &str = "recall";
pub const F1_SCORE: &str = "f1_score";
pub const DECODE_ERRORS: &str = "decode_errors";

/// Counters that always exist after startup
pub const SEEDED_COUNTERS: [&str; 4] = [TOTAL_PROCESSED, PRECISION, RECALL, F1_SCORE];

struct TableSpec {
    name: &'static str,
    create: &'static str,
    required: &'static [&'static str],
    /// Columns that may be added in place: (name, column definition)
    additive: &'static [(&'static str, &'static str)],
}

const FRAUDS: TableSpec = TableSpec {
    name: "frauds",
    create: "
        CREATE TABLE IF NOT EXISTS frauds (
            transaction_id TEXT PRIMARY KEY,
            user_id INTEGER NOT NULL,
            amount REAL NOT NULL,
            currency TEXT NOT NULL DEFAULT 'USD',
            location TEXT,
            timestamp REAL NOT NULL,
            transaction_type TEXT,
            merchant_id TEXT,
            merchant_name TEXT,
            merchant_category TEXT,
            payment_method TEXT,
            device_type TEXT,
            ip_address TEXT,
            is_confirmed_fraud INTEGER NOT NULL DEFAULT 0,
            detection_score REAL NOT NULL CHECK (detection_score >= 0 AND detection_score <= 1),
            risk_level TEXT NOT NULL CHECK (risk_level IN ('low', 'medium', 'high')),
            detection_time TEXT NOT NULL,
            detection_features TEXT NOT NULL DEFAULT '[]',
            model_used TEXT NOT NULL DEFAULT 'global',
            notes TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_frauds_user ON frauds(user_id);
        CREATE INDEX IF NOT EXISTS idx_frauds_detection_time ON frauds(detection_time);
    ",
    required: &[
        "transaction_id",
        "user_id",
        "amount",
        "currency",
        "location",
        "timestamp",
        "transaction_type",
        "merchant_id",
        "merchant_name",
        "merchant_category",
        "payment_method",
        "device_type",
        "ip_address",
        "is_confirmed_fraud",
        "detection_score",
        "risk_level",
        "detection_time",
        "detection_features",
        "notes",
    ],
    additive: &[("model_used", "TEXT NOT NULL DEFAULT 'global'")],
};

const PROCESSING_STATS: TableSpec = TableSpec {
    name: "processing_stats",
    create: "
        CREATE TABLE IF NOT EXISTS processing_stats (
            counter_name TEXT PRIMARY KEY,
            count_value INTEGER NOT NULL DEFAULT 0,
            last_updated_timestamp TEXT NOT NULL
        );
    ",
    required: &["counter_name", "count_value", "last_updated_timestamp"],
    additive: &[],
};

const TRANSACTION_HISTORY: TableSpec = TableSpec {
    name: "transaction_history",
    create: "
        CREATE TABLE IF NOT EXISTS transaction_history (
            transaction_id TEXT PRIMARY KEY,
            user_id INTEGER NOT NULL,
            amount REAL NOT NULL,
            currency TEXT NOT NULL DEFAULT 'USD',
            location TEXT,
            timestamp REAL NOT NULL,
            transaction_type TEXT,
            merchant_category TEXT,
            payment_method TEXT,
            device_type TEXT,
            is_anomalous INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_history_user_time
            ON transaction_history(user_id, timestamp DESC);
    ",
    required: &[
        "transaction_id",
        "user_id",
        "amount",
        "currency",
        "location",
        "timestamp",
        "transaction_type",
        "merchant_category",
        "payment_method",
        "device_type",
        "is_anomalous",
        "created_at",
    ],
    additive: &[],
};

const USER_PROFILES: TableSpec = TableSpec {
    name: "user_profiles",
    create: "
        CREATE TABLE IF NOT EXISTS user_profiles (
            user_id INTEGER PRIMARY KEY,
            usual_locations TEXT NOT NULL DEFAULT '[]',
            usual_merchants TEXT NOT NULL DEFAULT '[]',
            typical_min_amount REAL,
            typical_max_amount REAL,
            typical_payment_methods TEXT NOT NULL DEFAULT '[]',
            typical_transaction_times TEXT NOT NULL DEFAULT '[]',
            avg_transaction_amount REAL NOT NULL DEFAULT 0,
            model_score REAL NOT NULL DEFAULT 0.5,
            merchant_categories TEXT NOT NULL DEFAULT '[]',
            device_types TEXT NOT NULL DEFAULT '[]',
            last_updated TEXT NOT NULL
        );
    ",
    required: &[
        "user_id",
        "usual_locations",
        "usual_merchants",
        "typical_min_amount",
        "typical_max_amount",
        "typical_payment_methods",
        "typical_transaction_times",
        "last_updated",
    ],
    additive: &[
        ("avg_transaction_amount", "REAL NOT NULL DEFAULT 0"),
        ("model_score", "REAL NOT NULL DEFAULT 0.5"),
        ("merchant_categories", "TEXT NOT NULL DEFAULT '[]'"),
        ("device_types", "TEXT NOT NULL DEFAULT '[]'"),
    ],
};

const TABLES: [TableSpec; 4] = [FRAUDS, PROCESSING_STATS, TRANSACTION_HISTORY, USER_PROFILES];

fn existing_columns(db: &Database, table: &str) -> Result<HashSet<String>> {
    db.with_connection(|conn| {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<rusqlite::Result<HashSet<String>>>()?;
        Ok(names)
    })
}

fn reconcile_table(db: &Database, spec: &TableSpec) -> Result<()> {
    db.with_connection(|conn| conn.execute_batch(spec.create))?;
    let columns = existing_columns(db, spec.name)?;

    let missing: Vec<String> = spec
        .required
        .iter()
        .filter(|column| !columns.contains(**column))
        .map(|column| column.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(DetectorError::Schema {
            table: spec.name.to_string(),
            missing,
        });
    }

    for (column, definition) in spec.additive {
        if columns.contains(*column) {
            continue;
        }
        db.with_connection(|conn| {
            conn.execute_batch(&format!(
                "ALTER TABLE {} ADD COLUMN {column} {definition};",
                spec.name
            ))
        })?;
        warn!(table = spec.name, column = *column, "Added missing column");
    }

    Ok(())
}

/// Bring the database up to the expected schema and seed the counters.
pub fn reconcile(db: &Database) -> Result<()> {
    for spec in &TABLES {
        reconcile_table(db, spec)?;
    }

    let now = Utc::now().to_rfc3339();
    db.with_connection(|conn| {
        let tx = conn.transaction()?;
        for counter in SEEDED_COUNTERS {
            tx.execute(
                "INSERT OR IGNORE INTO processing_stats (counter_name, count_value, last_updated_timestamp)
                 VALUES (?1, 0, ?2)",
                params![counter, now],
            )?;
        }
        tx.commit()
    })?;

    info!(tables = TABLES.len(), "Database schema reconciled");
    Ok(())
}
