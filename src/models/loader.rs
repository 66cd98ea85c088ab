//! Per-user model artifact store

use crate::error::{DetectorError, Result};
use crate::models::trained::TrainedModel;
use anyhow::Context;
use chrono::Duration;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Keyed model artifacts on disk, fronted by an in-memory cache.
///
/// Readers always get a complete model: artifacts are written to a temporary
/// file and renamed into place, and the cache entry is replaced by swapping
/// in a new `Arc`.
pub struct ModelStore {
    dir: PathBuf,
    cache: RwLock<HashMap<i64, Arc<TrainedModel>>>,
}

impl ModelStore {
    /// Open (creating if needed) the artifact directory
    pub fn open<P: AsRef<Path>>(dir: P) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create models directory {}", dir.display()))?;

        let artifacts = fs::read_dir(&dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
                    .count()
            })
            .unwrap_or(0);
        info!(path = %dir.display(), artifacts, "Model store opened");

        Ok(Self {
            dir,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Artifact location for a user
    pub fn artifact_path(&self, user_id: i64) -> PathBuf {
        self.dir.join(format!("user_{user_id}_model.json"))
    }

    /// Model for `user_id`, or `None` when no readable artifact exists.
    pub fn get(&self, user_id: i64) -> Option<Arc<TrainedModel>> {
        if let Some(model) = self.read_cache().get(&user_id) {
            return Some(Arc::clone(model));
        }

        match self.load_from_disk(user_id) {
            Ok(Some(model)) => {
                let model = Arc::new(model);
                self.write_cache().insert(user_id, Arc::clone(&model));
                debug!(user_id, "Loaded user model from disk");
                Some(model)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(user_id, error = %e, "Unreadable model artifact, falling back to global model");
                None
            }
        }
    }

    /// Read and validate an artifact. `Ok(None)` when the file is absent.
    pub fn load_from_disk(&self, user_id: i64) -> Result<Option<TrainedModel>> {
        let path = self.artifact_path(user_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(DetectorError::Artifact {
                    user_id,
                    reason: e.to_string(),
                })
            }
        };

        let model: TrainedModel =
            serde_json::from_slice(&bytes).map_err(|e| DetectorError::Artifact {
                user_id,
                reason: format!("malformed artifact: {e}"),
            })?;

        if model.user_id != Some(user_id) {
            return Err(DetectorError::Artifact {
                user_id,
                reason: format!("artifact belongs to user {:?}", model.user_id),
            });
        }
        if model.forest.n_features() != model.schema.len() {
            return Err(DetectorError::Artifact {
                user_id,
                reason: format!(
                    "forest expects {} features but schema has {}",
                    model.forest.n_features(),
                    model.schema.len()
                ),
            });
        }

        Ok(Some(model))
    }

    /// Persist a user model and make it visible to readers.
    pub fn save(&self, model: TrainedModel) -> Result<Arc<TrainedModel>> {
        let user_id = model.user_id.ok_or_else(|| DetectorError::InvalidParameter {
            name: "user_id",
            reason: "global models are not persisted".to_string(),
        })?;
        let artifact_error = |reason: String| DetectorError::Artifact { user_id, reason };

        let path = self.artifact_path(user_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec(&model).map_err(|e| artifact_error(e.to_string()))?;
        fs::write(&tmp, json).map_err(|e| artifact_error(e.to_string()))?;
        fs::rename(&tmp, &path).map_err(|e| artifact_error(e.to_string()))?;

        let model = Arc::new(model);
        self.write_cache().insert(user_id, Arc::clone(&model));

        info!(
            user_id,
            rows = model.training_rows,
            features = model.schema.len(),
            path = %path.display(),
            "User model saved"
        );
        Ok(model)
    }

    /// Whether a readable model younger than `max_age` exists
    pub fn is_fresh(&self, user_id: i64, max_age: Duration) -> bool {
        self.get(user_id)
            .map(|model| model.is_fresh(max_age))
            .unwrap_or(false)
    }

    /// Number of models currently held in memory
    pub fn cached_count(&self) -> usize {
        self.read_cache().len()
    }

    fn read_cache(&self) -> std::sync::RwLockReadGuard<'_, HashMap<i64, Arc<TrainedModel>>> {
        self.cache.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_cache(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<i64, Arc<TrainedModel>>> {
        self.cache.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::isolation_forest::ForestParams;
    use crate::types::transaction::Transaction;

    fn model_for(user_id: i64) -> TrainedModel {
        let txs: Vec<Transaction> = (0..12)
            .map(|i| {
                Transaction::new(
                    format!("u{user_id}_{i}"),
                    user_id,
                    20.0 + i as f64,
                    1_704_096_000.0 + i as f64 * 5_000.0,
                )
            })
            .collect();
        TrainedModel::fit(Some(user_id), &txs, &ForestParams::default()).unwrap()
    }

    #[test]
    fn test_missing_artifact_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::open(dir.path()).unwrap();

        assert!(store.get(1).is_none());
        assert!(store.load_from_disk(1).unwrap().is_none());
    }

    #[test]
    fn test_save_then_reload_from_fresh_store() {
        let dir = tempfile::tempdir().unwrap();
        let model = model_for(3);
        let expected = model.clone();

        let store = ModelStore::open(dir.path()).unwrap();
        store.save(model).unwrap();
        assert!(store.artifact_path(3).exists());
        assert!(!store.artifact_path(3).with_extension("json.tmp").exists());

        let reopened = ModelStore::open(dir.path()).unwrap();
        assert_eq!(reopened.cached_count(), 0);
        let loaded = reopened.get(3).unwrap();
        assert_eq!(*loaded, expected);
        assert_eq!(reopened.cached_count(), 1);
    }

    #[test]
    fn test_corrupt_artifact_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::open(dir.path()).unwrap();
        fs::write(store.artifact_path(8), b"{\"not\": \"a model\"}").unwrap();

        assert!(store.get(8).is_none());
        assert!(matches!(
            store.load_from_disk(8),
            Err(DetectorError::Artifact { user_id: 8, .. })
        ));
    }

    #[test]
    fn test_artifact_for_other_user_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::open(dir.path()).unwrap();
        fs::write(
            store.artifact_path(4),
            serde_json::to_vec(&model_for(5)).unwrap(),
        )
        .unwrap();

        assert!(store.get(4).is_none());
    }

    #[test]
    fn test_global_model_is_not_saved() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::open(dir.path()).unwrap();
        let mut model = model_for(1);
        model.user_id = None;

        assert!(store.save(model).is_err());
    }

    #[test]
    fn test_save_replaces_cached_model() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::open(dir.path()).unwrap();

        let first = store.save(model_for(2)).unwrap();
        let held = store.get(2).unwrap();
        let second = store.save(model_for(2)).unwrap();

        assert!(Arc::ptr_eq(&first, &held));
        assert!(Arc::ptr_eq(&second, &store.get(2).unwrap()));
        assert!(store.is_fresh(2, Duration::hours(1)));
    }
}
