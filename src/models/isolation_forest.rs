//! Isolation forest anomaly scorer
//!
//! Points that need fewer random axis-aligned splits to be isolated are more
//! anomalous. Raw scores follow the usual `2^(-E[h] / c(S))` form and are then
//! min-max scaled over the training matrix so that every model reports on the
//! same `[0, 1]` range.

use crate::error::{DetectorError, Result};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

const EULER_GAMMA: f64 = 0.577_215_664_9;

/// Sub-sample size used per tree when `max_samples` is `auto`
const AUTO_MAX_SAMPLES: usize = 256;

/// Training rows required to fit any model
pub const MIN_TRAINING_ROWS: usize = 2;

/// Average path length of an unsuccessful BST search over `n` points.
pub fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

/// Per-tree sub-sample size
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaxSamples {
    /// `min(256, rows)`
    #[default]
    Auto,
    Count(usize),
}

/// Training parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestParams {
    pub n_trees: usize,
    pub max_samples: MaxSamples,
    /// Expected anomalous fraction of the training set, in `(0, 0.5]`
    pub contamination: f64,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_samples: MaxSamples::Auto,
            contamination: 0.1,
            seed: 42,
        }
    }
}

impl ForestParams {
    pub fn with_contamination(mut self, contamination: f64) -> Self {
        self.contamination = contamination;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.n_trees == 0 {
            return Err(DetectorError::InvalidParameter {
                name: "n_trees",
                reason: "must be at least 1".to_string(),
            });
        }
        if !(self.contamination > 0.0 && self.contamination <= 0.5) {
            return Err(DetectorError::InvalidParameter {
                name: "contamination",
                reason: format!("{} is outside (0, 0.5]", self.contamination),
            });
        }
        if let MaxSamples::Count(count) = self.max_samples {
            if count < MIN_TRAINING_ROWS {
                return Err(DetectorError::InvalidParameter {
                    name: "max_samples",
                    reason: format!("{count} is below {MIN_TRAINING_ROWS}"),
                });
            }
        }
        Ok(())
    }

    fn sample_size(&self, rows: usize) -> usize {
        match self.max_samples {
            MaxSamples::Auto => rows.min(AUTO_MAX_SAMPLES),
            MaxSamples::Count(count) => rows.min(count),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum Node {
    Internal {
        feature: usize,
        split: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        size: usize,
    },
}

/// One isolation tree stored as a flat node arena, root at index 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct IsolationTree {
    nodes: Vec<Node>,
}

impl IsolationTree {
    fn build(rows: &[Vec<f64>], indices: Vec<usize>, max_depth: usize, rng: &mut StdRng) -> Self {
        let mut tree = Self { nodes: Vec::new() };
        tree.grow(rows, indices, 0, max_depth, rng);
        tree
    }

    fn grow(
        &mut self,
        rows: &[Vec<f64>],
        indices: Vec<usize>,
        depth: usize,
        max_depth: usize,
        rng: &mut StdRng,
    ) -> usize {
        let id = self.nodes.len();
        self.nodes.push(Node::Leaf {
            size: indices.len(),
        });

        if depth >= max_depth || indices.len() <= 1 {
            return id;
        }

        // Only features with spread can split; constant ones are never drawn.
        let n_features = rows[indices[0]].len();
        let candidates: Vec<(usize, f64, f64)> = (0..n_features)
            .filter_map(|feature| {
                let (lo, hi) = indices
                    .iter()
                    .map(|&i| rows[i][feature])
                    .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                        (lo.min(v), hi.max(v))
                    });
                (lo < hi).then_some((feature, lo, hi))
            })
            .collect();

        if candidates.is_empty() {
            return id;
        }

        let (feature, lo, hi) = candidates[rng.gen_range(0..candidates.len())];
        let split = rng.gen_range(lo..hi);
        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) =
            indices.into_iter().partition(|&i| rows[i][feature] < split);

        let left = self.grow(rows, left_rows, depth + 1, max_depth, rng);
        let right = self.grow(rows, right_rows, depth + 1, max_depth, rng);
        self.nodes[id] = Node::Internal {
            feature,
            split,
            left,
            right,
        };
        id
    }

    /// Path length to isolate `point`, with the leaf-size correction.
    /// Features beyond the end of `point` read as zero.
    fn path_length(&self, point: &[f64]) -> f64 {
        let mut idx = 0;
        let mut depth = 0usize;
        loop {
            match self.nodes.get(idx) {
                Some(Node::Internal {
                    feature,
                    split,
                    left,
                    right,
                }) => {
                    let value = point.get(*feature).copied().unwrap_or(0.0);
                    idx = if value < *split { *left } else { *right };
                    depth += 1;
                }
                Some(Node::Leaf { size }) => return depth as f64 + average_path_length(*size),
                None => return depth as f64,
            }
        }
    }
}

/// Trained isolation forest. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationForest {
    trees: Vec<IsolationTree>,
    n_features: usize,
    sample_size: usize,
    contamination: f64,
    /// Raw score range over the training matrix
    score_min: f64,
    score_max: f64,
    /// Normalized decision boundary
    threshold: f64,
}

impl IsolationForest {
    /// Fit a forest on `matrix` (rows are feature vectors).
    pub fn train(matrix: &[Vec<f64>], params: &ForestParams) -> Result<Self> {
        params.validate()?;

        if matrix.len() < MIN_TRAINING_ROWS {
            return Err(DetectorError::InsufficientData {
                required: MIN_TRAINING_ROWS,
                got: matrix.len(),
            });
        }

        let n_features = matrix[0].len();
        if n_features == 0 {
            return Err(DetectorError::InvalidParameter {
                name: "matrix",
                reason: "rows have no features".to_string(),
            });
        }
        for row in matrix {
            if row.len() != n_features {
                return Err(DetectorError::SchemaMismatch {
                    expected: n_features,
                    got: row.len(),
                });
            }
            if row.iter().any(|v| !v.is_finite()) {
                return Err(DetectorError::InvalidParameter {
                    name: "matrix",
                    reason: "contains non-finite values".to_string(),
                });
            }
        }

        let n_rows = matrix.len();
        let sample_size = params.sample_size(n_rows);
        let max_depth = (sample_size as f64).log2().ceil() as usize;
        let mut rng = StdRng::seed_from_u64(params.seed);

        let trees = (0..params.n_trees)
            .map(|_| {
                let indices = sample(&mut rng, n_rows, sample_size).into_vec();
                IsolationTree::build(matrix, indices, max_depth, &mut rng)
            })
            .collect();

        let mut forest = Self {
            trees,
            n_features,
            sample_size,
            contamination: params.contamination,
            score_min: 0.0,
            score_max: 0.0,
            threshold: 1.0,
        };

        let raw: Vec<f64> = matrix.iter().map(|row| forest.raw_score(row)).collect();
        forest.score_min = raw.iter().copied().fold(f64::INFINITY, f64::min);
        forest.score_max = raw.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        if forest.has_score_range() {
            let mut normalized: Vec<f64> = raw.iter().map(|&r| forest.normalize(r)).collect();
            normalized.sort_by(|a, b| b.total_cmp(a));
            let k = ((params.contamination * n_rows as f64) - 1e-9).ceil() as usize;
            forest.threshold = normalized[k.clamp(1, n_rows) - 1];
        }

        Ok(forest)
    }

    /// Unnormalized isolation score in `(0, 1]`.
    pub fn raw_score(&self, point: &[f64]) -> f64 {
        let c = average_path_length(self.sample_size);
        if self.trees.is_empty() || c == 0.0 {
            return 0.5;
        }
        let mean_path =
            self.trees.iter().map(|t| t.path_length(point)).sum::<f64>() / self.trees.len() as f64;
        2f64.powf(-mean_path / c)
    }

    fn has_score_range(&self) -> bool {
        self.score_max - self.score_min > f64::EPSILON
    }

    fn normalize(&self, raw: f64) -> f64 {
        if self.has_score_range() {
            ((raw - self.score_min) / (self.score_max - self.score_min)).clamp(0.0, 1.0)
        } else if raw > self.score_max {
            1.0
        } else {
            0.0
        }
    }

    /// Normalized anomaly score in `[0, 1]`; higher is more anomalous.
    pub fn score(&self, point: &[f64]) -> f64 {
        self.normalize(self.raw_score(point))
    }

    /// Like [`score`](Self::score) but rejects vectors of the wrong width.
    pub fn try_score(&self, point: &[f64]) -> Result<f64> {
        if point.len() != self.n_features {
            return Err(DetectorError::SchemaMismatch {
                expected: self.n_features,
                got: point.len(),
            });
        }
        Ok(self.score(point))
    }

    pub fn classify(&self, point: &[f64]) -> bool {
        self.is_anomalous_score(self.score(point))
    }

    /// Apply the contamination-derived decision boundary to a score.
    pub fn is_anomalous_score(&self, score: f64) -> bool {
        score >= self.threshold
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_with_outlier(rows: usize) -> Vec<Vec<f64>> {
        let mut rng = StdRng::seed_from_u64(7);
        let mut matrix: Vec<Vec<f64>> = (0..rows - 1)
            .map(|_| vec![rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0), 3.0])
            .collect();
        matrix.push(vec![12.0, -9.0, 3.0]);
        matrix
    }

    #[test]
    fn test_average_path_length() {
        assert_eq!(average_path_length(0), 0.0);
        assert_eq!(average_path_length(1), 0.0);
        assert_eq!(average_path_length(2), 1.0);
        let c256 = average_path_length(256);
        assert!((c256 - 10.244_770_920_2).abs() < 1e-6);
    }

    #[test]
    fn test_rejects_single_row() {
        let err = IsolationForest::train(&[vec![1.0, 2.0]], &ForestParams::default()).unwrap_err();
        assert!(matches!(
            err,
            DetectorError::InsufficientData { required: 2, got: 1 }
        ));
    }

    #[test]
    fn test_rejects_bad_parameters() {
        let matrix = cluster_with_outlier(20);
        for contamination in [0.0, -0.1, 0.51, f64::NAN] {
            let params = ForestParams::default().with_contamination(contamination);
            assert!(matches!(
                IsolationForest::train(&matrix, &params),
                Err(DetectorError::InvalidParameter { name: "contamination", .. })
            ));
        }

        let params = ForestParams {
            n_trees: 0,
            ..ForestParams::default()
        };
        assert!(IsolationForest::train(&matrix, &params).is_err());

        let mut with_nan = matrix.clone();
        with_nan[3][1] = f64::NAN;
        assert!(IsolationForest::train(&with_nan, &ForestParams::default()).is_err());
    }

    #[test]
    fn test_outlier_scores_highest() {
        let matrix = cluster_with_outlier(64);
        let forest = IsolationForest::train(&matrix, &ForestParams::default()).unwrap();

        let outlier = forest.score(&matrix[63]);
        let inlier = forest.score(&[0.0, 0.0, 3.0]);
        assert!(outlier > inlier);
        assert!(forest.classify(&matrix[63]));
        assert!(!forest.classify(&[0.0, 0.0, 3.0]));
    }

    #[test]
    fn test_scores_within_unit_interval() {
        let matrix = cluster_with_outlier(40);
        let forest = IsolationForest::train(&matrix, &ForestParams::default()).unwrap();

        for point in matrix.iter().chain([vec![1e6, 1e6, 1e6], vec![-1e6, 0.0, 3.0]].iter()) {
            let score = forest.score(point);
            assert!((0.0..=1.0).contains(&score), "score {score} out of range");
        }
    }

    #[test]
    fn test_training_is_deterministic() {
        let matrix = cluster_with_outlier(50);
        let params = ForestParams::default();

        let first = IsolationForest::train(&matrix, &params).unwrap();
        let second = IsolationForest::train(&matrix, &params).unwrap();

        assert_eq!(first, second);
        for row in &matrix {
            assert_eq!(first.score(row), second.score(row));
        }
    }

    #[test]
    fn test_threshold_monotonic_in_contamination() {
        let matrix = cluster_with_outlier(60);
        let mut previous = 0;

        for contamination in [0.01, 0.05, 0.1, 0.2, 0.3, 0.5] {
            let params = ForestParams::default().with_contamination(contamination);
            let forest = IsolationForest::train(&matrix, &params).unwrap();
            let flagged = matrix.iter().filter(|row| forest.classify(row)).count();
            assert!(flagged >= previous, "{contamination}: {flagged} < {previous}");
            assert!(flagged >= (contamination * 60.0 - 1e-9).ceil() as usize);
            previous = flagged;
        }
    }

    #[test]
    fn test_constant_column_is_never_split() {
        // column 2 is constant in every row
        let matrix = cluster_with_outlier(30);
        let forest = IsolationForest::train(&matrix, &ForestParams::default()).unwrap();

        for tree in &forest.trees {
            for node in &tree.nodes {
                if let Node::Internal { feature, .. } = node {
                    assert_ne!(*feature, 2);
                }
            }
        }
    }

    #[test]
    fn test_all_constant_matrix_trains() {
        let matrix = vec![vec![1.0, 1.0]; 10];
        let forest = IsolationForest::train(&matrix, &ForestParams::default()).unwrap();

        assert_eq!(forest.score(&[1.0, 1.0]), 0.0);
        assert!(!forest.classify(&[1.0, 1.0]));
    }

    #[test]
    fn test_try_score_checks_width() {
        let matrix = cluster_with_outlier(20);
        let forest = IsolationForest::train(&matrix, &ForestParams::default()).unwrap();

        assert!(forest.try_score(&[0.0, 0.0, 3.0]).is_ok());
        assert!(matches!(
            forest.try_score(&[0.0, 0.0]),
            Err(DetectorError::SchemaMismatch { expected: 3, got: 2 })
        ));
    }

    #[test]
    fn test_sample_size_respects_max_samples() {
        let matrix = cluster_with_outlier(300);
        let auto = IsolationForest::train(&matrix, &ForestParams::default()).unwrap();
        assert_eq!(auto.sample_size, 256);

        let params = ForestParams {
            max_samples: MaxSamples::Count(32),
            n_trees: 10,
            ..ForestParams::default()
        };
        let small = IsolationForest::train(&matrix, &params).unwrap();
        assert_eq!(small.sample_size, 32);
        assert_eq!(small.n_trees(), 10);
    }

    #[test]
    fn test_serialized_model_scores_identically() {
        let matrix = cluster_with_outlier(30);
        let forest = IsolationForest::train(&matrix, &ForestParams::default()).unwrap();

        let json = serde_json::to_string(&forest).unwrap();
        let restored: IsolationForest = serde_json::from_str(&json).unwrap();

        for row in &matrix {
            assert_eq!(forest.score(row), restored.score(row));
        }
        assert_eq!(forest.threshold(), restored.threshold());
    }
}
