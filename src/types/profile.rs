//! Rolling behavioral summary of a single user

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: i64,
    /// Locations seen at least twice in the profile window
    pub usual_locations: Vec<String>,
    /// Merchant categories seen at least twice in the profile window
    pub usual_merchants: Vec<String>,
    pub typical_min_amount: f64,
    pub typical_max_amount: f64,
    pub typical_payment_methods: Vec<String>,
    /// Hours of day (UTC) seen at least twice
    pub typical_transaction_times: Vec<u32>,
    pub avg_transaction_amount: f64,
    pub model_score: f64,
    pub merchant_categories: Vec<String>,
    pub device_types: Vec<String>,
    pub last_updated: DateTime<Utc>,
}
