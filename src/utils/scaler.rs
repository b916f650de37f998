use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::config::ZeroVariancePolicy;
use crate::error::{EngineError, Result};

/// Per-feature mean and scale learned at training time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationStatistics {
    pub mean: Array1<f64>,
    /// Population standard deviation, or 1.0 for a zero-variance feature
    pub scale: Array1<f64>,
}

impl NormalizationStatistics {
    pub fn n_features(&self) -> usize {
        self.mean.len()
    }
}

/// Standard scaler: `(x - mean) / scale`, column by column.
#[derive(Debug, Clone)]
pub struct StandardScaler {
    policy: ZeroVariancePolicy,
    stats: Option<NormalizationStatistics>,
}

impl Default for StandardScaler {
    fn default() -> Self {
        Self::new(ZeroVariancePolicy::UnitScale)
    }
}

impl StandardScaler {
    pub fn new(policy: ZeroVariancePolicy) -> Self {
        Self {
            policy,
            stats: None,
        }
    }

    /// Rebuild a fitted scaler from stored statistics.
    pub fn from_statistics(stats: NormalizationStatistics) -> Self {
        Self {
            policy: ZeroVariancePolicy::UnitScale,
            stats: Some(stats),
        }
    }

    pub fn is_fitted(&self) -> bool {
        self.stats.is_some()
    }

    pub fn statistics(&self) -> Option<&NormalizationStatistics> {
        self.stats.as_ref()
    }

    /// Learn mean and scale from `x`, then return the standardized matrix.
    ///
    /// `feature_names` is only used for error context and may be shorter than
    /// the column count.
    pub fn fit_transform(
        &mut self,
        x: ArrayView2<f64>,
        feature_names: &[String],
    ) -> Result<Array2<f64>> {
        if x.nrows() == 0 {
            return Err(EngineError::EmptySeries);
        }

        let n_features = x.ncols();
        let mut mean = Array1::zeros(n_features);
        let mut scale = Array1::ones(n_features);

        for (index, column) in x.axis_iter(Axis(1)).enumerate() {
            let m = column.mean().unwrap_or(0.0);
            let std = column.std(0.0);
            mean[index] = m;

            if std < f64::EPSILON {
                match self.policy {
                    ZeroVariancePolicy::UnitScale => scale[index] = 1.0,
                    ZeroVariancePolicy::Reject => {
                        return Err(EngineError::DegenerateFeature {
                            column: index,
                            name: feature_names
                                .get(index)
                                .cloned()
                                .unwrap_or_else(|| format!("feature_{}", index)),
                        })
                    }
                }
            } else {
                scale[index] = std;
            }
        }

        self.stats = Some(NormalizationStatistics { mean, scale });
        self.transform(x)
    }

    /// Apply the stored statistics to `x`.
    pub fn transform(&self, x: ArrayView2<f64>) -> Result<Array2<f64>> {
        let stats = self.stats.as_ref().ok_or(EngineError::ModelNotTrained)?;

        if x.ncols() != stats.n_features() {
            return Err(EngineError::FeatureCountMismatch {
                expected: stats.n_features(),
                got: x.ncols(),
            });
        }

        Ok((&x - &stats.mean) / &stats.scale)
    }
}
