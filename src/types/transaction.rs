//! Transaction data structures as published on the inbound feed

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};

/// Sentinel for missing categorical values.
pub const UNKNOWN: &str = "Unknown";

fn unknown() -> String {
    UNKNOWN.to_string()
}

fn default_currency() -> String {
    "USD".to_string()
}

/// Merchant attached to a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Merchant {
    #[serde(default = "unknown", alias = "id")]
    pub merchant_id: String,

    #[serde(default = "unknown")]
    pub name: String,

    #[serde(default = "unknown")]
    pub category: String,
}

impl Default for Merchant {
    fn default() -> Self {
        Self {
            merchant_id: unknown(),
            name: unknown(),
            category: unknown(),
        }
    }
}

/// Device the transaction originated from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    #[serde(rename = "type", default = "unknown")]
    pub device_type: String,

    #[serde(default = "unknown", alias = "ip")]
    pub ip_address: String,
}

impl Default for Device {
    fn default() -> Self {
        Self {
            device_type: unknown(),
            ip_address: unknown(),
        }
    }
}

fn non_negative<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let amount = f64::deserialize(deserializer)?;
    if amount < 0.0 {
        return Err(de::Error::custom(format!("amount must be non-negative, got {amount}")));
    }
    Ok(amount)
}

/// A financial transaction event. Never mutated after decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique transaction identifier
    pub transaction_id: String,

    pub user_id: i64,

    #[serde(default, deserialize_with = "non_negative")]
    pub amount: f64,

    #[serde(default = "default_currency")]
    pub currency: String,

    #[serde(default = "unknown")]
    pub location: String,

    /// Unix timestamp in seconds
    #[serde(default)]
    pub timestamp: f64,

    #[serde(default = "unknown")]
    pub transaction_type: String,

    #[serde(default)]
    pub merchant: Merchant,

    #[serde(default = "unknown")]
    pub payment_method: String,

    #[serde(default, rename = "device_info", alias = "device")]
    pub device: Device,

    /// Ground truth, only present in simulation and evaluation feeds
    #[serde(
        default,
        rename = "_anomalous",
        alias = "is_anomalous",
        skip_serializing_if = "Option::is_none"
    )]
    pub is_anomalous: Option<bool>,
}

impl Transaction {
    /// Create a transaction with `Unknown` categorical fields.
    pub fn new(transaction_id: impl Into<String>, user_id: i64, amount: f64, timestamp: f64) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            user_id,
            amount,
            currency: default_currency(),
            location: unknown(),
            timestamp,
            transaction_type: unknown(),
            merchant: Merchant::default(),
            payment_method: unknown(),
            device: Device::default(),
            is_anomalous: None,
        }
    }

    /// Decode a transaction from a JSON payload.
    pub fn from_json(payload: &[u8]) -> crate::error::Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Event time in UTC, if the timestamp is representable.
    pub fn datetime(&self) -> Option<DateTime<Utc>> {
        if !self.timestamp.is_finite() {
            return None;
        }
        let secs = self.timestamp.floor();
        let nanos = ((self.timestamp - secs) * 1e9) as u32;
        DateTime::from_timestamp(secs as i64, nanos.min(999_999_999))
    }

    /// Hour of day (0-23, UTC); 0 when the timestamp is unusable.
    pub fn hour_of_day(&self) -> u32 {
        self.datetime().map(|dt| dt.hour()).unwrap_or(0)
    }

    /// Day of week with Monday = 0; 0 when the timestamp is unusable.
    pub fn day_of_week(&self) -> u32 {
        self.datetime()
            .map(|dt| dt.weekday().num_days_from_monday())
            .unwrap_or(0)
    }

    /// Seconds elapsed since UTC midnight.
    pub fn seconds_since_midnight(&self) -> u32 {
        self.datetime()
            .map(|dt| dt.num_seconds_from_midnight())
            .unwrap_or(0)
    }

    /// Whether the feed marked this transaction as a known anomaly.
    pub fn is_confirmed_anomaly(&self) -> bool {
        self.is_anomalous == Some(true)
    }
}
