use ndarray::{Array1, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Per-row verdict of a fitted outlier model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Normal,
    Outlier,
}

impl Verdict {
    /// Native ensemble convention: +1 normal, -1 outlier.
    pub fn as_sign(self) -> i8 {
        match self {
            Verdict::Normal => 1,
            Verdict::Outlier => -1,
        }
    }

    /// Service convention: 0 normal, 1 anomalous.
    pub fn as_label(self) -> u8 {
        match self {
            Verdict::Normal => 0,
            Verdict::Outlier => 1,
        }
    }
}

/// An unfitted outlier estimator.
pub trait OutlierDetector: Send + Sync {
    type Model: OutlierModel;

    /// Fit on already normalized records.
    fn fit(&self, records: ArrayView2<f64>, contamination: f64) -> Result<Self::Model>;

    fn algorithm(&self) -> &'static str;

    fn n_estimators(&self) -> usize;

    fn random_seed(&self) -> u64;
}

/// A fitted outlier model. Immutable once built.
pub trait OutlierModel: Send + Sync {
    /// Raw score per row; higher is more normal.
    fn score_samples(&self, records: ArrayView2<f64>) -> Result<Array1<f64>>;

    /// Decision boundary in `score_samples` space.
    fn offset(&self) -> f64;

    fn contamination(&self) -> f64;

    fn n_features(&self) -> usize;

    /// Default: a row is an outlier when its score falls strictly below the offset.
    fn decision_function(&self, records: ArrayView2<f64>) -> Result<Array1<f64>> {
        let offset = self.offset();
        Ok(self.score_samples(records)?.mapv(|s| s - offset))
    }

    /// Default: derive verdicts from the decision function.
    fn predict(&self, records: ArrayView2<f64>) -> Result<Vec<Verdict>> {
        Ok(self
            .decision_function(records)?
            .iter()
            .map(|&d| if d < 0.0 { Verdict::Outlier } else { Verdict::Normal })
            .collect())
    }

    /// Shared input check for scoring calls.
    fn check_features(&self, records: ArrayView2<f64>) -> Result<()> {
        if records.ncols() != self.n_features() {
            return Err(EngineError::FeatureCountMismatch {
                expected: self.n_features(),
                got: records.ncols(),
            });
        }
        Ok(())
    }
}

/// Contamination is the expected outlier fraction and must lie in (0, 0.5].
pub fn validate_contamination(contamination: f64) -> Result<()> {
    if contamination > 0.0 && contamination <= 0.5 {
        Ok(())
    } else {
        Err(EngineError::contamination(contamination))
    }
}
