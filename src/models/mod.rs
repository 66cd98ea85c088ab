//! Isolation forest models, artifact storage and scoring

pub mod inference;
pub mod isolation_forest;
pub mod loader;
pub mod trained;

pub use inference::{BatchScores, ScoredTransaction, ScoringRouter, UserScorer};
pub use isolation_forest::{ForestParams, IsolationForest, MaxSamples};
pub use loader::ModelStore;
pub use trained::{ModelScore, TrainedModel};
