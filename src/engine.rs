// src/engine.rs

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ndarray::ArrayView2;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, ZeroVariancePolicy};
use crate::error::{EngineError, Result};
use crate::models::base_model::{OutlierDetector, OutlierModel, Verdict};
use crate::models::iforest::IsolationForestParams;
use crate::store::{ModelBlob, ModelStore};
use crate::utils::dataset::{ensure_finite, CsvDatasetLoader, DatasetSource, FeatureMatrix};
use crate::utils::scaler::StandardScaler;

/// Where the training matrix came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrainingSource {
    Provided,
    Fallback { dataset: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub samples_trained: usize,
    pub feature_count: usize,
    pub feature_names: Vec<String>,
    pub contamination: f64,
    pub mean_score: f64,
    pub max_score: f64,
    pub min_score: f64,
    /// Training rows the fitted model itself labels anomalous
    pub anomaly_count: usize,
    /// Anomaly scores above this value are labelled 1
    pub threshold: f64,
    pub source: TrainingSource,
    pub trained_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreStats {
    pub mean: f64,
    pub max: f64,
    pub min: f64,
}

impl ScoreStats {
    fn of(scores: &[f64]) -> Option<Self> {
        if scores.is_empty() {
            return None;
        }
        Some(ScoreStats {
            mean: scores.iter().sum::<f64>() / scores.len() as f64,
            max: scores.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            min: scores.iter().copied().fold(f64::INFINITY, f64::min),
        })
    }
}

/// Parallel per-point anomaly scores and labels (1 = anomalous).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub scores: Vec<f64>,
    pub labels: Vec<u8>,
}

impl Prediction {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn anomaly_count(&self) -> usize {
        self.labels.iter().filter(|&&l| l == 1).count()
    }

    pub fn is_anomalous(&self) -> bool {
        self.labels.contains(&1)
    }

    pub fn score_stats(&self) -> Option<ScoreStats> {
        ScoreStats::of(&self.scores)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencePrediction {
    pub index: usize,
    pub scores: Vec<f64>,
    pub labels: Vec<u8>,
    pub anomaly_count: usize,
    pub is_anomalous: bool,
}

impl SequencePrediction {
    fn new(index: usize, prediction: Prediction) -> Self {
        SequencePrediction {
            index,
            anomaly_count: prediction.anomaly_count(),
            is_anomalous: prediction.is_anomalous(),
            scores: prediction.scores,
            labels: prediction.labels,
        }
    }

    pub fn prediction(&self) -> Prediction {
        Prediction {
            scores: self.scores.clone(),
            labels: self.labels.clone(),
        }
    }
}

/// Per-sequence results, in input order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub predictions: Vec<SequencePrediction>,
}

impl BatchResult {
    pub fn get(&self, index: usize) -> Option<&SequencePrediction> {
        self.predictions.get(index)
    }

    pub fn len(&self) -> usize {
        self.predictions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predictions.is_empty()
    }

    /// Results keyed `sequence_{index}`, in input order.
    pub fn keyed(&self) -> Vec<(String, &SequencePrediction)> {
        self.predictions
            .iter()
            .map(|p| (format!("sequence_{}", p.index), p))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub is_trained: bool,
    pub algorithm: String,
    pub feature_names: Vec<String>,
    pub feature_count: usize,
    pub contamination: Option<f64>,
    pub threshold: Option<f64>,
    pub n_estimators: usize,
    pub random_seed: u64,
    pub model_path: Option<PathBuf>,
    pub scaler_path: Option<PathBuf>,
    pub trained_at: Option<DateTime<Utc>>,
}

/// Everything a prediction needs. Never mutated after publication.
struct TrainedState<M> {
    scaler: StandardScaler,
    model: M,
    feature_names: Vec<String>,
    trained_at: DateTime<Utc>,
}

impl<M: OutlierModel> TrainedState<M> {
    fn score(&self, x: ArrayView2<f64>) -> Result<Prediction> {
        let scaled = self.scaler.transform(x)?;
        let scores = self
            .model
            .score_samples(scaled.view())?
            .iter()
            .map(|s| -s)
            .collect();
        let labels = self
            .model
            .predict(scaled.view())?
            .into_iter()
            .map(Verdict::as_label)
            .collect();
        Ok(Prediction { scores, labels })
    }

    /// Boundary in anomaly-score space.
    fn threshold(&self) -> f64 {
        -self.model.offset()
    }
}

/// Normalizer plus outlier model, moving from untrained to trained.
pub struct ScoringEngine<D: OutlierDetector = IsolationForestParams> {
    detector: D,
    fallback: Box<dyn DatasetSource>,
    store: Option<ModelStore>,
    min_training_samples: usize,
    zero_variance: ZeroVariancePolicy,
    // Replaced wholesale; readers clone the Arc and never see a partial model.
    state: RwLock<Option<Arc<TrainedState<D::Model>>>>,
    train_lock: Mutex<()>,
}

impl ScoringEngine<IsolationForestParams> {
    /// Build an untrained engine from configuration.
    pub fn new(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let store = config.storage.persist.then(|| {
            ModelStore::new(&config.storage.model_path, &config.storage.scaler_path)
        });
        Ok(Self::with_parts(
            IsolationForestParams::from_settings(&config.model),
            Box::new(CsvDatasetLoader::new(&config.training.fallback_dataset)),
            store,
            config,
        ))
    }
}

impl<D> ScoringEngine<D>
where
    D: OutlierDetector,
    D::Model: Serialize + DeserializeOwned,
{
    /// Assemble an engine from explicit components.
    pub fn with_parts(
        detector: D,
        fallback: Box<dyn DatasetSource>,
        store: Option<ModelStore>,
        config: &EngineConfig,
    ) -> Self {
        ScoringEngine {
            detector,
            fallback,
            store,
            min_training_samples: config.training.min_training_samples,
            zero_variance: config.training.zero_variance,
            state: RwLock::new(None),
            train_lock: Mutex::new(()),
        }
    }

    pub fn is_trained(&self) -> bool {
        self.state.read().is_some()
    }

    fn snapshot(&self) -> Result<Arc<TrainedState<D::Model>>> {
        self.state.read().clone().ok_or(EngineError::ModelNotTrained)
    }

    fn publish(&self, state: TrainedState<D::Model>) {
        *self.state.write() = Some(Arc::new(state));
    }

    /// Fit normalization and model, replacing any previous trained state.
    ///
    /// Input that is absent or shorter than the configured minimum is replaced
    /// by the fallback dataset.
    pub fn train(&self, data: Option<&[f64]>, contamination: f64) -> Result<TrainingSummary> {
        let _guard = self.train_lock.lock();

        let (matrix, source) = match data {
            Some(series) if series.len() >= self.min_training_samples => {
                (FeatureMatrix::from_series(series), TrainingSource::Provided)
            }
            other => {
                warn!(
                    provided = other.map_or(0, |s| s.len()),
                    minimum = self.min_training_samples,
                    dataset = %self.fallback.describe(),
                    "insufficient training data, using fallback dataset"
                );
                let matrix = self.fallback.load()?;
                let dataset = self.fallback.describe();
                (matrix, TrainingSource::Fallback { dataset })
            }
        };

        info!(
            samples = matrix.nrows(),
            features = matrix.ncols(),
            contamination,
            "training outlier model"
        );

        ensure_finite(matrix.view())?;
        let mut scaler = StandardScaler::new(self.zero_variance);
        let scaled = scaler.fit_transform(matrix.view(), &matrix.feature_names)?;
        let model = self.detector.fit(scaled.view(), contamination)?;

        let state = TrainedState {
            scaler,
            model,
            feature_names: matrix.feature_names,
            trained_at: Utc::now(),
        };
        let training = state.score(matrix.values.view())?;
        let stats = training.score_stats().ok_or(EngineError::EmptySeries)?;

        if let Some(store) = &self.store {
            let blob = ModelBlob {
                model: &state.model,
                feature_names: state.feature_names.clone(),
                trained_at: state.trained_at,
            };
            let scaler_stats = state.scaler.statistics().ok_or(EngineError::ModelNotTrained)?;
            store.save(&blob, scaler_stats)?;
        }

        let summary = TrainingSummary {
            samples_trained: training.len(),
            feature_count: state.feature_names.len(),
            feature_names: state.feature_names.clone(),
            contamination: state.model.contamination(),
            mean_score: stats.mean,
            max_score: stats.max,
            min_score: stats.min,
            anomaly_count: training.anomaly_count(),
            threshold: state.threshold(),
            source,
            trained_at: state.trained_at,
        };
        self.publish(state);

        info!(
            samples = summary.samples_trained,
            anomalies = summary.anomaly_count,
            mean_score = summary.mean_score,
            "training completed"
        );
        Ok(summary)
    }

    /// Score one raw series against the trained model.
    pub fn predict(&self, series: &[f64]) -> Result<Prediction> {
        let state = self.snapshot()?;
        Self::predict_with(&state, series)
    }

    fn predict_with(state: &TrainedState<D::Model>, series: &[f64]) -> Result<Prediction> {
        if series.is_empty() {
            return Err(EngineError::EmptySeries);
        }
        let matrix = FeatureMatrix::from_series(series);
        ensure_finite(matrix.view())?;

        let prediction = state.score(matrix.view())?;
        debug!(
            points = prediction.len(),
            anomalies = prediction.anomaly_count(),
            "prediction completed"
        );
        Ok(prediction)
    }

    /// Score each sequence independently against one snapshot of the model.
    ///
    /// The first failing sequence fails the whole call.
    pub fn predict_batch<S: AsRef<[f64]>>(&self, sequences: &[S]) -> Result<BatchResult> {
        let state = self.snapshot()?;
        debug!(sequences = sequences.len(), "batch prediction");

        let predictions = sequences
            .iter()
            .enumerate()
            .map(|(index, sequence)| {
                Self::predict_with(&state, sequence.as_ref())
                    .map(|prediction| SequencePrediction::new(index, prediction))
                    .map_err(|source| EngineError::BatchItem {
                        index,
                        source: Box::new(source),
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(BatchResult { predictions })
    }

    pub fn get_model_info(&self) -> ModelInfo {
        let state = self.state.read().clone();
        ModelInfo {
            is_trained: state.is_some(),
            algorithm: self.detector.algorithm().to_string(),
            feature_names: state
                .as_ref()
                .map(|s| s.feature_names.clone())
                .unwrap_or_default(),
            feature_count: state.as_ref().map_or(0, |s| s.feature_names.len()),
            contamination: state.as_ref().map(|s| s.model.contamination()),
            threshold: state.as_ref().map(|s| s.threshold()),
            n_estimators: self.detector.n_estimators(),
            random_seed: self.detector.random_seed(),
            model_path: self.store.as_ref().map(|s| s.model_path().to_path_buf()),
            scaler_path: self.store.as_ref().map(|s| s.scaler_path().to_path_buf()),
            trained_at: state.as_ref().map(|s| s.trained_at),
        }
    }

    /// Publish the persisted state, if there is one. Returns whether it did.
    pub fn restore(&self) -> Result<bool> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        let _guard = self.train_lock.lock();

        let Some((blob, stats)) = store.load::<D::Model>()? else {
            warn!("no pre-trained model found, train the model first");
            return Ok(false);
        };

        let n_features = blob.model.n_features();
        if stats.n_features() != n_features || blob.feature_names.len() != n_features {
            return Err(EngineError::Persistence {
                path: store.model_path().to_path_buf(),
                reason: format!(
                    "stored blobs disagree: model has {} features, scaler {}, names {}",
                    n_features,
                    stats.n_features(),
                    blob.feature_names.len()
                ),
            });
        }

        self.publish(TrainedState {
            scaler: StandardScaler::from_statistics(stats),
            model: blob.model,
            feature_names: blob.feature_names,
            trained_at: blob.trained_at,
        });
        info!(
            model = %store.model_path().display(),
            features = n_features,
            "restored trained model"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::dataset::InMemoryDataset;
    use ndarray::Array2;

    fn fallback_matrix() -> FeatureMatrix {
        // Two correlated features; row 63 sits far away from the rest.
        let values = Array2::from_shape_fn((64, 2), |(row, col)| {
            if row == 63 {
                40.0
            } else {
                (row % 8) as f64 + col as f64 * 0.5
            }
        });
        FeatureMatrix::new(vec!["cpu".into(), "mem".into()], values).unwrap()
    }

    fn engine() -> ScoringEngine {
        let config = EngineConfig::default();
        ScoringEngine::with_parts(
            IsolationForestParams::from_settings(&config.model).with_n_jobs(2),
            Box::new(InMemoryDataset::new("inline", fallback_matrix())),
            None,
            &config,
        )
    }

    fn separated_training_data() -> Vec<f64> {
        let mut data = vec![50.0; 100];
        data.extend(vec![5.0; 10]);
        data
    }

    #[test]
    fn test_predict_before_train() {
        let engine = engine();
        assert!(!engine.is_trained());
        assert!(matches!(
            engine.predict(&[1.0, 2.0]),
            Err(EngineError::ModelNotTrained)
        ));
        assert!(matches!(
            engine.predict_batch(&[vec![1.0]]),
            Err(EngineError::ModelNotTrained)
        ));
    }

    #[test]
    fn test_train_on_separated_data() {
        let engine = engine();
        let summary = engine
            .train(Some(separated_training_data().as_slice()), 0.1)
            .unwrap();

        assert_eq!(summary.samples_trained, 110);
        assert_eq!(summary.feature_count, 1);
        assert_eq!(summary.source, TrainingSource::Provided);
        assert_eq!(summary.anomaly_count, 10);
        assert!(summary.max_score > summary.mean_score);
        assert!(engine.is_trained());

        let prediction = engine.predict(&[50.0, 50.0, 5.0, 50.0]).unwrap();
        assert_eq!(prediction.labels, vec![0, 0, 1, 0]);
        assert_eq!(prediction.scores.len(), 4);
        assert!(prediction.scores[2] > prediction.scores[0]);
        assert!(prediction.scores.iter().all(|&s| s > 0.0));
    }

    #[test]
    fn test_labels_follow_threshold() {
        let engine = engine();
        engine.train(Some(separated_training_data().as_slice()), 0.1).unwrap();
        let threshold = engine.get_model_info().threshold.unwrap();

        let prediction = engine.predict(&[50.0, 5.0, 27.0, 49.0, 4.0]).unwrap();
        for (score, label) in prediction.scores.iter().zip(&prediction.labels) {
            assert_eq!(*label == 1, *score > threshold);
        }
    }

    #[test]
    fn test_short_or_missing_data_uses_fallback() {
        let engine = engine();
        for data in [None, Some(&[][..]), Some(&[1.0, 2.0, 3.0][..])] {
            let summary = engine.train(data, 0.1).unwrap();
            assert_eq!(
                summary.source,
                TrainingSource::Fallback {
                    dataset: "inline".into()
                }
            );
            assert_eq!(summary.samples_trained, 64);
            assert_eq!(summary.feature_names, vec!["cpu", "mem"]);
        }
    }

    #[test]
    fn test_fallback_model_rejects_raw_series() {
        let engine = engine();
        engine.train(None, 0.1).unwrap();
        assert!(matches!(
            engine.predict(&[1.0, 2.0]),
            Err(EngineError::FeatureCountMismatch { expected: 2, got: 1 })
        ));
    }

    #[test]
    fn test_missing_fallback_dataset() {
        let config = EngineConfig::default();
        let engine: ScoringEngine = ScoringEngine::with_parts(
            IsolationForestParams::from_settings(&config.model),
            Box::new(CsvDatasetLoader::new("/nonexistent/fallback.csv")),
            None,
            &config,
        );
        assert!(matches!(
            engine.train(None, 0.1),
            Err(EngineError::DatasetNotFound { .. })
        ));
        assert!(!engine.is_trained());
    }

    #[test]
    fn test_fallback_without_numeric_columns() {
        let config = EngineConfig::default();
        let empty = FeatureMatrix::new(vec![], Array2::zeros((12, 0))).unwrap();
        let engine: ScoringEngine = ScoringEngine::with_parts(
            IsolationForestParams::from_settings(&config.model),
            Box::new(InMemoryDataset::new("text-only", empty)),
            None,
            &config,
        );
        assert!(matches!(
            engine.train(Some(&[1.0, 2.0][..]), 0.1),
            Err(EngineError::NoNumericFeatures { .. })
        ));
        assert!(!engine.is_trained());
    }

    #[test]
    fn test_invalid_contamination_keeps_previous_model() {
        let engine = engine();
        engine.train(Some(separated_training_data().as_slice()), 0.1).unwrap();

        for bad in [0.0, 0.6, -0.1] {
            assert!(matches!(
                engine.train(Some(separated_training_data().as_slice()), bad),
                Err(EngineError::InvalidParameter { .. })
            ));
        }
        assert_eq!(engine.get_model_info().contamination, Some(0.1));
    }

    #[test]
    fn test_predict_is_idempotent() {
        let engine = engine();
        engine.train(Some(separated_training_data().as_slice()), 0.1).unwrap();
        let series = [50.0, 12.0, 5.0, 48.5];
        assert_eq!(engine.predict(&series).unwrap(), engine.predict(&series).unwrap());
    }

    #[test]
    fn test_predict_rejects_bad_series() {
        let engine = engine();
        engine.train(Some(separated_training_data().as_slice()), 0.1).unwrap();
        assert!(matches!(engine.predict(&[]), Err(EngineError::EmptySeries)));
        assert!(matches!(
            engine.predict(&[1.0, f64::INFINITY]),
            Err(EngineError::NonFiniteValue { row: 1, column: 0 })
        ));
    }

    #[test]
    fn test_batch_matches_single_predictions() {
        let engine = engine();
        engine.train(Some(separated_training_data().as_slice()), 0.1).unwrap();

        let s1 = vec![50.0, 49.0, 51.0];
        let s2 = vec![50.0, 5.0];
        let batch = engine.predict_batch(&[s1.clone(), s2.clone()]).unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.get(0).unwrap().prediction(), engine.predict(&s1).unwrap());
        assert_eq!(batch.get(1).unwrap().prediction(), engine.predict(&s2).unwrap());
        assert!(batch.get(1).unwrap().is_anomalous);
        assert_eq!(batch.get(1).unwrap().anomaly_count, 1);

        let keys: Vec<String> = batch.keyed().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["sequence_0", "sequence_1"]);
    }

    #[test]
    fn test_batch_failure_carries_index() {
        let engine = engine();
        engine.train(Some(separated_training_data().as_slice()), 0.1).unwrap();

        let result = engine.predict_batch(&[vec![50.0], vec![], vec![f64::NAN]]);
        match result {
            Err(EngineError::BatchItem { index, source }) => {
                assert_eq!(index, 1);
                assert!(matches!(*source, EngineError::EmptySeries));
            }
            other => panic!("expected BatchItem error, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_batch() {
        let engine = engine();
        engine.train(Some(separated_training_data().as_slice()), 0.1).unwrap();
        let batch = engine.predict_batch::<Vec<f64>>(&[]).unwrap();
        assert!(batch.is_empty());
    }

    #[test]
    fn test_model_info() {
        let engine = engine();
        let info = engine.get_model_info();
        assert!(!info.is_trained);
        assert_eq!(info.algorithm, "IsolationForest");
        assert_eq!(info.feature_count, 0);
        assert_eq!(info.threshold, None);
        assert_eq!(info.n_estimators, 100);
        assert_eq!(info.random_seed, 42);
        assert!(info.model_path.is_none());

        engine.train(Some(separated_training_data().as_slice()), 0.2).unwrap();
        let info = engine.get_model_info();
        assert!(info.is_trained);
        assert_eq!(info.feature_names, vec!["value"]);
        assert_eq!(info.contamination, Some(0.2));
        assert!(info.threshold.unwrap() > 0.0);
        assert!(info.trained_at.is_some());
    }

    #[test]
    fn test_retrain_replaces_state() {
        let engine = engine();
        engine.train(None, 0.1).unwrap();
        assert_eq!(engine.get_model_info().feature_count, 2);

        engine.train(Some(separated_training_data().as_slice()), 0.1).unwrap();
        assert_eq!(engine.get_model_info().feature_count, 1);
        assert!(engine.predict(&[50.0]).is_ok());
    }

    #[test]
    fn test_concurrent_predict_during_retrain() {
        let engine = engine();
        engine.train(Some(separated_training_data().as_slice()), 0.1).unwrap();

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..20 {
                        let prediction = engine.predict(&[50.0, 5.0]).unwrap();
                        assert_eq!(prediction.labels, vec![0, 1]);
                    }
                });
            }
            scope.spawn(|| {
                for _ in 0..3 {
                    engine.train(Some(separated_training_data().as_slice()), 0.1).unwrap();
                }
            });
        });
    }
}
