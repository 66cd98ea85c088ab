//! Error taxonomy for the detection pipeline.

use thiserror::Error;

/// Errors raised by the detection core.
///
/// Only feed-connection failure at startup and non-retryable persistence
/// failures are meant to stop the process; everything else is logged and
/// skipped by the stream processor.
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("Insufficient data: required {required} rows, got {got}")]
    InsufficientData { required: usize, got: usize },

    #[error("Insufficient history for user {user_id}: required {required}, available {available}")]
    InsufficientHistory {
        user_id: i64,
        required: usize,
        available: usize,
    },

    #[error("Schema mismatch: model expects {expected} features, got {got}")]
    SchemaMismatch { expected: usize, got: usize },

    #[error("Invalid parameter: {name} - {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("Persistence error (retryable: {retryable}): {source}")]
    Persistence {
        retryable: bool,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Failed to decode transaction: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Database schema error: table {table} is missing columns {missing:?}")]
    Schema { table: String, missing: Vec<String> },

    #[error("Model artifact error for user {user_id}: {reason}")]
    Artifact { user_id: i64, reason: String },

    #[error("Model training already in progress for user {user_id}")]
    TrainingInProgress { user_id: i64 },
}

impl DetectorError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DetectorError::Persistence {
                retryable: true,
                ..
            } | DetectorError::TrainingInProgress { .. }
        )
    }
}

/// Result type for detection operations.
pub type Result<T> = std::result::Result<T, DetectorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_history_display() {
        let error = DetectorError::InsufficientHistory {
            user_id: 7,
            required: 20,
            available: 19,
        };
        assert_eq!(
            error.to_string(),
            "Insufficient history for user 7: required 20, available 19"
        );
    }

    #[test]
    fn test_schema_error_lists_columns() {
        let error = DetectorError::Schema {
            table: "frauds".to_string(),
            missing: vec!["detection_score".to_string()],
        };
        assert!(error.to_string().contains("frauds"));
        assert!(error.to_string().contains("detection_score"));
    }

    #[test]
    fn test_retryable_classification() {
        let transient = DetectorError::Persistence {
            retryable: true,
            source: rusqlite::Error::InvalidQuery,
        };
        let permanent = DetectorError::Persistence {
            retryable: false,
            source: rusqlite::Error::InvalidQuery,
        };
        assert!(transient.is_retryable());
        assert!(!permanent.is_retryable());
        assert!(!DetectorError::InsufficientData { required: 2, got: 1 }.is_retryable());
    }

    #[test]
    fn test_decode_error_from_serde() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let error: DetectorError = err.into();
        assert!(matches!(error, DetectorError::Decode(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<DetectorError>();
    }
}
