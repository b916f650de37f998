use std::path::PathBuf;

use thiserror::Error;

/// Every failure the scoring engine can surface to its host.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("model not trained; train the model first")]
    ModelNotTrained,

    #[error("invalid parameter `{name}` = {value}: {reason}")]
    InvalidParameter {
        name: &'static str,
        value: f64,
        reason: &'static str,
    },

    #[error("fallback dataset not found at {}", path.display())]
    DatasetNotFound { path: PathBuf },

    #[error("fallback dataset {} has no numeric columns", path.display())]
    NoNumericFeatures { path: PathBuf },

    #[error("fallback dataset {} has no complete numeric rows", path.display())]
    EmptyDataset { path: PathBuf },

    #[error("failed to read dataset {}: {source}", path.display())]
    Dataset {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("feature `{name}` (column {column}) has zero variance")]
    DegenerateFeature { column: usize, name: String },

    #[error("input series is empty")]
    EmptySeries,

    #[error("non-finite value at row {row}, column {column}")]
    NonFiniteValue { row: usize, column: usize },

    #[error("feature count mismatch: expected {expected}, got {got}")]
    FeatureCountMismatch { expected: usize, got: usize },

    #[error("sequence {index} failed: {source}")]
    BatchItem {
        index: usize,
        #[source]
        source: Box<EngineError>,
    },

    #[error("failed to persist {}: {reason}", path.display())]
    Persistence { path: PathBuf, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error(transparent)]
    Linfa(#[from] linfa::error::Error),
}

impl EngineError {
    /// Build an `InvalidParameter` for a contamination outside (0, 0.5].
    pub fn contamination(value: f64) -> Self {
        EngineError::InvalidParameter {
            name: "contamination",
            value,
            reason: "must lie in (0, 0.5]",
        }
    }

    /// True for failures caused by the caller's input rather than the environment.
    pub fn is_client_error(&self) -> bool {
        match self {
            EngineError::ModelNotTrained
            | EngineError::InvalidParameter { .. }
            | EngineError::DegenerateFeature { .. }
            | EngineError::EmptySeries
            | EngineError::NonFiniteValue { .. }
            | EngineError::FeatureCountMismatch { .. } => true,
            EngineError::BatchItem { source, .. } => source.is_client_error(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
