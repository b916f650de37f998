// src/config.rs

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::utils::dataset::MIN_TRAINING_SAMPLES;

/// Root configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Isolation forest hyper-parameters
    pub model: ModelSettings,

    /// Training and fallback behaviour
    pub training: TrainingSettings,

    /// Persistence of the fitted state
    pub storage: StorageSettings,

    /// Logging configuration (consumed by the host binary)
    pub logging: LoggingSettings,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Trees in the ensemble
    pub n_estimators: usize,
    /// Upper bound on the subsample drawn for each tree
    pub max_samples: usize,
    /// Seed for reproducible fits
    pub random_seed: u64,
    /// Worker threads used while building trees; defaults to the CPU count
    pub n_jobs: Option<usize>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_samples: 256,
            random_seed: 42,
            n_jobs: None,
        }
    }
}

/// What to do with a feature whose training variance is zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ZeroVariancePolicy {
    /// Keep the column and divide by 1.0 (sklearn's StandardScaler behaviour)
    UnitScale,
    /// Fail the fit with `DegenerateFeature`
    Reject,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    pub default_contamination: f64,
    /// Below this many observations, training switches to the fallback dataset
    pub min_training_samples: usize,
    pub fallback_dataset: PathBuf,
    pub zero_variance: ZeroVariancePolicy,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            default_contamination: 0.1,
            min_training_samples: MIN_TRAINING_SAMPLES,
            fallback_dataset: PathBuf::from("data/fallback.csv"),
            zero_variance: ZeroVariancePolicy::UnitScale,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Write the fitted state to disk after every successful train
    pub persist: bool,
    pub model_path: PathBuf,
    pub scaler_path: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            persist: true,
            model_path: PathBuf::from("models/anomaly_model.json"),
            scaler_path: PathBuf::from("models/scaler.json"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            EngineError::Config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let mut config = Self::from_str(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn from_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Serialize configuration to a TOML string
    pub fn to_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - ANOMALY_CONTAMINATION, ANOMALY_RANDOM_SEED
    /// - ANOMALY_FALLBACK_DATASET
    /// - ANOMALY_PERSIST, ANOMALY_MODEL_PATH, ANOMALY_SCALER_PATH
    /// - ANOMALY_LOG_LEVEL
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("ANOMALY_CONTAMINATION") {
            self.training.default_contamination = parse_env("ANOMALY_CONTAMINATION", &v)?;
        }
        if let Some(v) = lookup("ANOMALY_RANDOM_SEED") {
            self.model.random_seed = parse_env("ANOMALY_RANDOM_SEED", &v)?;
        }
        if let Some(v) = lookup("ANOMALY_FALLBACK_DATASET") {
            self.training.fallback_dataset = PathBuf::from(v);
        }
        if let Some(v) = lookup("ANOMALY_PERSIST") {
            self.storage.persist = parse_env("ANOMALY_PERSIST", &v)?;
        }
        if let Some(v) = lookup("ANOMALY_MODEL_PATH") {
            self.storage.model_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ANOMALY_SCALER_PATH") {
            self.storage.scaler_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ANOMALY_LOG_LEVEL") {
            self.logging.level = v;
        }
        Ok(())
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.model.n_estimators == 0 {
            return Err(EngineError::Config("model.n_estimators must be > 0".into()));
        }
        if self.model.max_samples == 0 {
            return Err(EngineError::Config("model.max_samples must be > 0".into()));
        }
        if self.model.n_jobs == Some(0) {
            return Err(EngineError::Config("model.n_jobs must be > 0".into()));
        }
        let c = self.training.default_contamination;
        if !(c > 0.0 && c <= 0.5) {
            return Err(EngineError::Config(format!(
                "training.default_contamination must lie in (0, 0.5], got {}",
                c
            )));
        }
        if self.training.min_training_samples == 0 {
            return Err(EngineError::Config(
                "training.min_training_samples must be > 0".into(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| EngineError::Config(format!("{} has an invalid value: {:?}", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.model.n_estimators, 100);
        assert_eq!(config.model.random_seed, 42);
        assert_eq!(config.training.min_training_samples, 10);
        assert_eq!(config.training.zero_variance, ZeroVariancePolicy::UnitScale);
        assert!(config.storage.persist);
        assert_eq!(
            config.storage.model_path,
            PathBuf::from("models/anomaly_model.json")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_str(
            r#"
            [model]
            n_estimators = 50

            [training]
            zero_variance = "reject"
            "#,
        )
        .unwrap();

        assert_eq!(config.model.n_estimators, 50);
        assert_eq!(config.model.max_samples, 256);
        assert_eq!(config.training.zero_variance, ZeroVariancePolicy::Reject);
        assert_eq!(config.training.default_contamination, 0.1);
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = EngineConfig::default();
        config.storage.persist = false;
        let text = config.to_string().unwrap();
        let parsed = EngineConfig::from_str(&text).unwrap();
        assert!(!parsed.storage.persist);
        assert_eq!(parsed.storage.model_path, config.storage.model_path);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("ANOMALY_CONTAMINATION", "0.05"),
            ("ANOMALY_PERSIST", "false"),
            ("ANOMALY_MODEL_PATH", "/tmp/m.json"),
        ]
        .into_iter()
        .collect();

        let mut config = EngineConfig::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.training.default_contamination, 0.05);
        assert!(!config.storage.persist);
        assert_eq!(config.storage.model_path, PathBuf::from("/tmp/m.json"));
    }

    #[test]
    fn test_bad_override_is_an_error() {
        let mut config = EngineConfig::default();
        let result = config.apply_overrides(|k| {
            (k == "ANOMALY_RANDOM_SEED").then(|| "forty-two".to_string())
        });
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_contamination() {
        let mut config = EngineConfig::default();
        config.training.default_contamination = 0.6;
        assert!(config.validate().is_err());
        config.training.default_contamination = 0.0;
        assert!(config.validate().is_err());
    }
}
