// src/models/iforest.rs

use linfa::traits::Fit;
use linfa::DatasetBase;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::prelude::*;
use rand::seq::index;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ModelSettings;
use crate::error::{EngineError, Result};
use crate::models::base_model::{validate_contamination, OutlierDetector, OutlierModel};
use crate::utils::dataset::ensure_finite;

const EULER_GAMMA: f64 = 0.5772156649;

// Below this range a feature is treated as constant inside a node.
const FEATURE_THRESHOLD: f64 = 1e-7;

/// c(n): average path length of an unsuccessful BST search over `n` points.
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

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Node {
    split_feature: Option<usize>,
    split_value: f64,
    size: usize,
    left: Option<Box<Node>>,
    right: Option<Box<Node>>,
}

impl Node {
    fn leaf(size: usize) -> Self {
        Node {
            split_feature: None,
            split_value: 0.0,
            size,
            left: None,
            right: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IsolationTree {
    root: Node,
}

impl IsolationTree {
    fn build(records: ArrayView2<f64>, sample: &[usize], height_limit: usize, rng: &mut StdRng) -> Self {
        IsolationTree {
            root: Self::build_node(records, sample, 0, height_limit, rng),
        }
    }

    fn build_node(
        records: ArrayView2<f64>,
        rows: &[usize],
        height: usize,
        height_limit: usize,
        rng: &mut StdRng,
    ) -> Node {
        let size = rows.len();
        let mut node = Node::leaf(size);

        // Stop criteria
        if size <= 1 || height >= height_limit {
            return node;
        }

        // Visit features in random order and split on the first non-constant one
        let mut features: Vec<usize> = (0..records.ncols()).collect();
        features.shuffle(rng);

        for split_feature in features {
            let column = records.column(split_feature);
            let mut min_val = column[rows[0]];
            let mut max_val = min_val;
            for &row in rows {
                let val = column[row];
                min_val = min_val.min(val);
                max_val = max_val.max(val);
            }

            if max_val - min_val <= FEATURE_THRESHOLD {
                continue;
            }

            let split_value = rng.gen::<f64>() * (max_val - min_val) + min_val;
            let (left, right): (Vec<usize>, Vec<usize>) =
                rows.iter().copied().partition(|&row| column[row] < split_value);

            // Only split if we actually divided the data
            if !left.is_empty() && !right.is_empty() {
                node.split_feature = Some(split_feature);
                node.split_value = split_value;
                node.left = Some(Box::new(Self::build_node(
                    records,
                    &left,
                    height + 1,
                    height_limit,
                    rng,
                )));
                node.right = Some(Box::new(Self::build_node(
                    records,
                    &right,
                    height + 1,
                    height_limit,
                    rng,
                )));
            }
            break;
        }

        node
    }

    /// Depth of the leaf reached by `x`, plus c(leaf size) for unresolved points.
    fn path_length(&self, x: ArrayView1<f64>) -> f64 {
        let mut node = &self.root;
        let mut depth = 0.0;
        while let (Some(feature), Some(left), Some(right)) =
            (node.split_feature, node.left.as_deref(), node.right.as_deref())
        {
            node = if x[feature] < node.split_value { left } else { right };
            depth += 1.0;
        }
        depth + average_path_length(node.size)
    }
}

/// Hyper-parameters of the isolation forest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationForestParams {
    n_estimators: usize,
    max_samples: usize,
    contamination: f64,
    random_seed: u64,
    n_jobs: Option<usize>,
}

impl Default for IsolationForestParams {
    fn default() -> Self {
        Self::from_settings(&ModelSettings::default())
    }
}

impl IsolationForestParams {
    pub fn from_settings(settings: &ModelSettings) -> Self {
        IsolationForestParams {
            n_estimators: settings.n_estimators,
            max_samples: settings.max_samples,
            contamination: 0.1,
            random_seed: settings.random_seed,
            n_jobs: settings.n_jobs,
        }
    }

    pub fn with_n_estimators(mut self, n_estimators: usize) -> Self {
        self.n_estimators = n_estimators;
        self
    }

    pub fn with_max_samples(mut self, max_samples: usize) -> Self {
        self.max_samples = max_samples;
        self
    }

    pub fn with_contamination(mut self, contamination: f64) -> Self {
        self.contamination = contamination;
        self
    }

    pub fn with_random_seed(mut self, random_seed: u64) -> Self {
        self.random_seed = random_seed;
        self
    }

    pub fn with_n_jobs(mut self, n_jobs: usize) -> Self {
        self.n_jobs = Some(n_jobs);
        self
    }

    fn fit_records(&self, records: ArrayView2<f64>) -> Result<IsolationForest> {
        validate_contamination(self.contamination)?;
        if self.n_estimators == 0 {
            return Err(EngineError::InvalidParameter {
                name: "n_estimators",
                value: 0.0,
                reason: "must be > 0",
            });
        }
        if self.n_jobs == Some(0) {
            return Err(EngineError::InvalidParameter {
                name: "n_jobs",
                value: 0.0,
                reason: "must be > 0",
            });
        }
        if self.max_samples == 0 {
            return Err(EngineError::InvalidParameter {
                name: "max_samples",
                value: 0.0,
                reason: "must be > 0",
            });
        }

        let n_samples = records.nrows();
        if n_samples == 0 {
            return Err(EngineError::EmptySeries);
        }
        ensure_finite(records)?;

        let subsample_size = self.max_samples.min(n_samples);
        let height_limit = (subsample_size as f64).log2().ceil() as usize;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.n_jobs.unwrap_or_else(num_cpus::get))
            .build()?;

        // Tree i owns its own seeded rng, so the forest does not depend on scheduling.
        let trees: Vec<IsolationTree> = pool.install(|| {
            (0..self.n_estimators)
                .into_par_iter()
                .map(|i| {
                    let mut rng = StdRng::seed_from_u64(self.random_seed.wrapping_add(i as u64));
                    let sample = index::sample(&mut rng, n_samples, subsample_size).into_vec();
                    IsolationTree::build(records, &sample, height_limit, &mut rng)
                })
                .collect()
        });

        let mut forest = IsolationForest {
            trees,
            subsample_size,
            n_features: records.ncols(),
            contamination: self.contamination,
            offset: 0.0,
        };

        let training_scores = forest.score_samples(records)?;
        forest.offset = percentile(training_scores.to_vec(), self.contamination);

        debug!(
            trees = forest.trees.len(),
            subsample_size,
            height_limit,
            offset = forest.offset,
            "isolation forest fitted"
        );
        Ok(forest)
    }
}

impl<T> Fit<Array2<f64>, T, EngineError> for IsolationForestParams {
    type Object = IsolationForest;

    fn fit(&self, dataset: &DatasetBase<Array2<f64>, T>) -> Result<IsolationForest> {
        self.fit_records(dataset.records().view())
    }
}

impl OutlierDetector for IsolationForestParams {
    type Model = IsolationForest;

    fn fit(&self, records: ArrayView2<f64>, contamination: f64) -> Result<IsolationForest> {
        let params = self.clone().with_contamination(contamination);
        // Unsupervised: unit targets, as linfa expects a target slot.
        let targets = Array1::from_elem(records.nrows(), ());
        let dataset = DatasetBase::new(records.to_owned(), targets);
        Fit::fit(&params, &dataset)
    }

    fn algorithm(&self) -> &'static str {
        "IsolationForest"
    }

    fn n_estimators(&self) -> usize {
        self.n_estimators
    }

    fn random_seed(&self) -> u64 {
        self.random_seed
    }
}

/// Fitted isolation forest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationForest {
    trees: Vec<IsolationTree>,
    subsample_size: usize,
    n_features: usize,
    contamination: f64,
    offset: f64,
}

impl IsolationForest {
    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    fn score_row(&self, row: ArrayView1<f64>) -> f64 {
        let total: f64 = self.trees.iter().map(|tree| tree.path_length(row)).sum();
        let avg_path_length = total / self.trees.len() as f64;

        let expected_path_length = average_path_length(self.subsample_size);
        if expected_path_length > 0.0 {
            -(2.0f64.powf(-avg_path_length / expected_path_length))
        } else {
            -1.0
        }
    }
}

impl OutlierModel for IsolationForest {
    fn score_samples(&self, records: ArrayView2<f64>) -> Result<Array1<f64>> {
        self.check_features(records)?;
        ensure_finite(records)?;
        Ok(records.outer_iter().map(|row| self.score_row(row)).collect())
    }

    fn offset(&self) -> f64 {
        self.offset
    }

    fn contamination(&self) -> f64 {
        self.contamination
    }

    fn n_features(&self) -> usize {
        self.n_features
    }
}

/// Linear-interpolated `q` quantile (q in [0, 1]) of `values`.
fn percentile(mut values: Vec<f64>, q: f64) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    let rank = q * (values.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    values[lo] + (values[hi] - values[lo]) * (rank - lo as f64)
}
