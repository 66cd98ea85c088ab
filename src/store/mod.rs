//! Relational persistence: connection resource, schema and result store

pub mod db;
pub mod results;
pub mod retry;
pub mod schema;

pub use db::Database;
pub use results::{compute_metrics, BatchMetrics, PersistOutcome, ResultStore, StatsSummary};
pub use retry::RetryPolicy;
pub use schema::reconcile;
