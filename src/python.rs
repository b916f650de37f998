use numpy::{PyArray1, PyReadonlyArray1, ToPyArray};
use pyo3::exceptions::{PyIOError, PyTypeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;
use tracing::error;

use crate::config::EngineConfig;
use crate::engine::{ScoringEngine, TrainingSource};
use crate::error::EngineError;

impl From<EngineError> for PyErr {
    fn from(err: EngineError) -> PyErr {
        match err {
            EngineError::Io(_) | EngineError::Persistence { .. } => {
                PyIOError::new_err(err.to_string())
            }
            _ => PyValueError::new_err(err.to_string()),
        }
    }
}

// Accepts a float64 ndarray or anything that extracts to a list of floats.
fn as_series(x: &PyAny) -> PyResult<Vec<f64>> {
    if let Ok(arr) = x.extract::<PyReadonlyArray1<f64>>() {
        Ok(arr.as_array().to_vec())
    } else if let Ok(values) = x.extract::<Vec<f64>>() {
        Ok(values)
    } else {
        Err(PyTypeError::new_err(
            "expected a 1-d float64 array or a sequence of floats",
        ))
    }
}

/// Python-exposed wrapper around `ScoringEngine`
#[pyclass(name = "ScoringEngine")]
pub struct PyScoringEngine {
    inner: ScoringEngine,
    default_contamination: f64,
}

#[pymethods]
impl PyScoringEngine {
    #[new]
    #[pyo3(signature = (config_path=None))]
    fn new(config_path: Option<&str>) -> PyResult<Self> {
        let config = match config_path {
            Some(path) => EngineConfig::from_file(path)?,
            None => {
                let mut config = EngineConfig::default();
                config.apply_env_overrides()?;
                config
            }
        };
        let inner = ScoringEngine::new(&config)?;
        if let Err(e) = inner.restore() {
            error!(error = %e, "failed to restore persisted model, starting untrained");
        }
        Ok(PyScoringEngine {
            inner,
            default_contamination: config.training.default_contamination,
        })
    }

    #[pyo3(signature = (data=None, contamination=None))]
    fn train(
        &self,
        py: Python,
        data: Option<&PyAny>,
        contamination: Option<f64>,
    ) -> PyResult<PyObject> {
        let series = data.map(as_series).transpose()?;
        let contamination = contamination.unwrap_or(self.default_contamination);
        let summary = py.allow_threads(|| self.inner.train(series.as_deref(), contamination))?;

        let result = PyDict::new(py);
        result.set_item("status", "success")?;
        result.set_item("samples_trained", summary.samples_trained)?;
        result.set_item("feature_count", summary.feature_count)?;
        result.set_item("feature_names", summary.feature_names)?;
        result.set_item("contamination", summary.contamination)?;
        result.set_item("mean_score", summary.mean_score)?;
        result.set_item("max_score", summary.max_score)?;
        result.set_item("min_score", summary.min_score)?;
        result.set_item("anomaly_count", summary.anomaly_count)?;
        result.set_item("threshold", summary.threshold)?;
        match summary.source {
            TrainingSource::Provided => result.set_item("source", "provided")?,
            TrainingSource::Fallback { dataset } => {
                result.set_item("source", "fallback")?;
                result.set_item("dataset", dataset)?;
            }
        }
        result.set_item("trained_at", summary.trained_at.to_rfc3339())?;
        Ok(result.into())
    }

    fn predict<'py>(
        &self,
        py: Python<'py>,
        series: &PyAny,
    ) -> PyResult<(&'py PyArray1<f64>, Vec<u8>)> {
        let series = as_series(series)?;
        let prediction = self.inner.predict(&series)?;
        Ok((prediction.scores.to_pyarray(py), prediction.labels))
    }

    fn predict_batch(&self, py: Python, sequences: Vec<Vec<f64>>) -> PyResult<PyObject> {
        let batch = self.inner.predict_batch(&sequences)?;

        let results = PyDict::new(py);
        for (key, sequence) in batch.keyed() {
            let entry = PyDict::new(py);
            entry.set_item("scores", sequence.scores.clone())?;
            entry.set_item("labels", sequence.labels.clone())?;
            entry.set_item("anomaly_count", sequence.anomaly_count)?;
            entry.set_item("is_anomalous", sequence.is_anomalous)?;
            results.set_item(key, entry)?;
        }
        Ok(results.into())
    }

    fn get_model_info(&self, py: Python) -> PyResult<PyObject> {
        let info = self.inner.get_model_info();

        let result = PyDict::new(py);
        result.set_item("is_trained", info.is_trained)?;
        result.set_item("algorithm", info.algorithm)?;
        result.set_item("feature_names", info.feature_names)?;
        result.set_item("feature_count", info.feature_count)?;
        result.set_item("contamination", info.contamination)?;
        result.set_item("threshold", info.threshold)?;
        result.set_item("n_estimators", info.n_estimators)?;
        result.set_item("random_seed", info.random_seed)?;
        result.set_item(
            "model_path",
            info.model_path.map(|p| p.display().to_string()),
        )?;
        result.set_item(
            "scaler_path",
            info.scaler_path.map(|p| p.display().to_string()),
        )?;
        result.set_item("trained_at", info.trained_at.map(|t| t.to_rfc3339()))?;
        Ok(result.into())
    }
}
