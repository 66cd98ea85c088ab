//! Feature encoding for anomaly model training and scoring.
//!
//! Training and scoring share one code path: `encode` fixes a
//! [`FeatureSchema`] from a set of transactions and then projects every row
//! through it, and scoring projects single transactions through the schema
//! stored with the model. Numeric columns are standardized with the
//! statistics captured in the schema, never recomputed at scoring time.

use crate::types::fraud::FeatureContribution;
use crate::types::transaction::{Transaction, UNKNOWN};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Numeric columns, always first and always in this order.
pub const NUMERIC_FEATURES: [&str; 5] = [
    "amount",
    "hour_of_day",
    "day_of_week",
    "is_weekend",
    "time_since_midnight",
];

/// Binary flags are passed through unscaled.
const UNSCALED_FEATURES: [&str; 1] = ["is_weekend"];

/// Categorical transaction fields that are one-hot encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoricalField {
    TransactionType,
    Location,
    MerchantCategory,
    PaymentMethod,
    DeviceType,
}

impl CategoricalField {
    /// Encoding order of the categorical blocks.
    pub const ALL: [CategoricalField; 5] = [
        CategoricalField::TransactionType,
        CategoricalField::Location,
        CategoricalField::MerchantCategory,
        CategoricalField::PaymentMethod,
        CategoricalField::DeviceType,
    ];

    /// Column name prefix for this field
    pub fn prefix(&self) -> &'static str {
        match self {
            CategoricalField::TransactionType => "txn_type",
            CategoricalField::Location => "loc",
            CategoricalField::MerchantCategory => "merch",
            CategoricalField::PaymentMethod => "payment",
            CategoricalField::DeviceType => "device",
        }
    }

    /// Value of this field on a transaction, `Unknown` when blank.
    pub fn value<'a>(&self, tx: &'a Transaction) -> &'a str {
        let raw = match self {
            CategoricalField::TransactionType => tx.transaction_type.as_str(),
            CategoricalField::Location => tx.location.as_str(),
            CategoricalField::MerchantCategory => tx.merchant.category.as_str(),
            CategoricalField::PaymentMethod => tx.payment_method.as_str(),
            CategoricalField::DeviceType => tx.device.device_type.as_str(),
        };
        if raw.trim().is_empty() {
            UNKNOWN
        } else {
            raw
        }
    }
}

/// Standardization parameters of one numeric column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericColumn {
    pub name: String,
    pub mean: f64,
    pub scale: f64,
}

impl NumericColumn {
    fn standardize(&self, raw: f64) -> f64 {
        (raw - self.mean) / self.scale
    }
}

/// One-hot column for a single observed category value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoricalColumn {
    pub field: CategoricalField,
    pub value: String,
}

/// Ordered column set a model was trained against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSchema {
    numeric: Vec<NumericColumn>,
    categorical: Vec<CategoricalColumn>,
}

impl FeatureSchema {
    /// Total number of columns
    pub fn len(&self) -> usize {
        self.numeric.len() + self.categorical.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn numeric(&self) -> &[NumericColumn] {
        &self.numeric
    }

    /// Name of the column at `index`, e.g. `amount` or `loc_US`.
    pub fn column_name(&self, index: usize) -> Option<String> {
        if let Some(column) = self.numeric.get(index) {
            return Some(column.name.clone());
        }
        self.categorical
            .get(index - self.numeric.len())
            .map(|column| format!("{}_{}", column.field.prefix(), column.value))
    }

    /// All column names in encoding order
    pub fn column_names(&self) -> Vec<String> {
        (0..self.len()).filter_map(|i| self.column_name(i)).collect()
    }
}

/// Feature encoder shared by per-user and global models.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureEncoder;

impl FeatureEncoder {
    pub fn new() -> Self {
        Self
    }

    /// Unscaled numeric features in [`NUMERIC_FEATURES`] order.
    pub fn raw_numeric(&self, tx: &Transaction) -> [f64; 5] {
        let amount = if tx.amount.is_finite() { tx.amount } else { 0.0 };
        let day_of_week = tx.day_of_week();
        [
            amount,
            tx.hour_of_day() as f64,
            day_of_week as f64,
            if day_of_week >= 5 { 1.0 } else { 0.0 },
            tx.seconds_since_midnight() as f64 / 86_400.0,
        ]
    }

    /// Fix a schema from `transactions` and encode them through it.
    ///
    /// Categorical columns are the distinct values observed in this input
    /// set, sorted within each field.
    pub fn encode(&self, transactions: &[Transaction]) -> (Vec<Vec<f64>>, FeatureSchema) {
        let raw: Vec<[f64; 5]> = transactions.iter().map(|tx| self.raw_numeric(tx)).collect();
        let n = raw.len().max(1) as f64;

        let numeric = NUMERIC_FEATURES
            .iter()
            .enumerate()
            .map(|(col, name)| {
                if UNSCALED_FEATURES.contains(name) {
                    return NumericColumn {
                        name: name.to_string(),
                        mean: 0.0,
                        scale: 1.0,
                    };
                }
                let mean = raw.iter().map(|row| row[col]).sum::<f64>() / n;
                let variance = raw.iter().map(|row| (row[col] - mean).powi(2)).sum::<f64>() / n;
                let std_dev = variance.sqrt();
                NumericColumn {
                    name: name.to_string(),
                    mean,
                    scale: if std_dev > f64::EPSILON { std_dev } else { 1.0 },
                }
            })
            .collect();

        let categorical = CategoricalField::ALL
            .iter()
            .flat_map(|field| {
                let values: BTreeSet<&str> =
                    transactions.iter().map(|tx| field.value(tx)).collect();
                values.into_iter().map(move |value| CategoricalColumn {
                    field: *field,
                    value: value.to_string(),
                })
            })
            .collect();

        let schema = FeatureSchema {
            numeric,
            categorical,
        };
        let matrix = transactions
            .iter()
            .map(|tx| self.project(tx, &schema))
            .collect();

        (matrix, schema)
    }

    /// Encode a single transaction against a previously fixed schema.
    ///
    /// The result always has `schema.len()` entries. Category values absent
    /// from the schema contribute zeros for their field.
    pub fn project(&self, tx: &Transaction, schema: &FeatureSchema) -> Vec<f64> {
        let raw = self.raw_numeric(tx);
        let mut features = Vec::with_capacity(schema.len());

        for column in &schema.numeric {
            let value = NUMERIC_FEATURES
                .iter()
                .position(|name| *name == column.name)
                .map(|idx| raw[idx])
                .unwrap_or(0.0);
            features.push(column.standardize(value));
        }

        for column in &schema.categorical {
            let hit = column.field.value(tx) == column.value;
            features.push(if hit { 1.0 } else { 0.0 });
        }

        features
    }
}

/// The `k` columns with the largest absolute encoded value, strongest first.
pub fn top_contributions(
    schema: &FeatureSchema,
    features: &[f64],
    k: usize,
) -> Vec<FeatureContribution> {
    let mut ranked: Vec<(usize, f64)> = features
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, value)| *value != 0.0)
        .collect();
    ranked.sort_by(|a, b| b.1.abs().total_cmp(&a.1.abs()));

    ranked
        .into_iter()
        .take(k)
        .filter_map(|(idx, value)| {
            schema
                .column_name(idx)
                .map(|feature| FeatureContribution { feature, value })
        })
        .collect()
}
