pub mod config;
pub mod engine;
pub mod error;
pub mod models;
pub mod store;
pub mod utils;

#[cfg(feature = "python")]
mod python;

pub use config::EngineConfig;
pub use engine::{
    BatchResult, ModelInfo, Prediction, ScoreStats, ScoringEngine, SequencePrediction,
    TrainingSource, TrainingSummary,
};
pub use error::{EngineError, Result};
pub use models::{IsolationForest, IsolationForestParams, OutlierDetector, OutlierModel, Verdict};
pub use store::ModelStore;

#[cfg(feature = "python")]
use pyo3::prelude::*;

/// A Python module implemented in Rust.
#[cfg(feature = "python")]
#[pymodule]
fn anomaly_scoring(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<python::PyScoringEngine>()?;
    Ok(())
}
