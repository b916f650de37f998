// src/store.rs

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::utils::scaler::NormalizationStatistics;

/// Model blob contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelBlob<M> {
    pub model: M,
    pub feature_names: Vec<String>,
    pub trained_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ModelStore {
    model_path: PathBuf,
    scaler_path: PathBuf,
}

impl ModelStore {
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(model_path: P, scaler_path: Q) -> Self {
        Self {
            model_path: model_path.into(),
            scaler_path: scaler_path.into(),
        }
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn scaler_path(&self) -> &Path {
        &self.scaler_path
    }

    pub fn exists(&self) -> bool {
        self.model_path.is_file() && self.scaler_path.is_file()
    }

    /// Write both blobs. Either both files are replaced or neither is.
    pub fn save<M: Serialize>(
        &self,
        blob: &ModelBlob<M>,
        stats: &NormalizationStatistics,
    ) -> Result<()> {
        let model_bytes = serde_json::to_vec(blob)?;
        let scaler_bytes = serde_json::to_vec_pretty(stats)?;

        let staged_model = stage(&self.model_path, &model_bytes)?;
        let staged_scaler = stage(&self.scaler_path, &scaler_bytes)?;

        let previous_scaler = read_existing(&self.scaler_path)?;

        staged_scaler
            .persist(&self.scaler_path)
            .map_err(|e| persistence(&self.scaler_path, e.error))?;

        if let Err(e) = staged_model.persist(&self.model_path) {
            warn!(path = %self.model_path.display(), "model write failed, rolling back scaler");
            restore(&self.scaler_path, previous_scaler);
            return Err(persistence(&self.model_path, e.error));
        }

        info!(
            model = %self.model_path.display(),
            scaler = %self.scaler_path.display(),
            "persisted trained state"
        );
        Ok(())
    }

    /// Read both blobs; `Ok(None)` when either file is absent.
    pub fn load<M: DeserializeOwned>(
        &self,
    ) -> Result<Option<(ModelBlob<M>, NormalizationStatistics)>> {
        if !self.exists() {
            debug!(
                model = %self.model_path.display(),
                scaler = %self.scaler_path.display(),
                "no persisted state"
            );
            return Ok(None);
        }

        let blob: ModelBlob<M> = serde_json::from_slice(&fs::read(&self.model_path)?)?;
        let stats: NormalizationStatistics =
            serde_json::from_slice(&fs::read(&self.scaler_path)?)?;
        Ok(Some((blob, stats)))
    }
}

fn persistence(path: &Path, err: impl std::fmt::Display) -> EngineError {
    EngineError::Persistence {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}

/// Write `bytes` to a temp file next to `target` so the final rename stays on one filesystem.
fn stage(target: &Path, bytes: &[u8]) -> Result<NamedTempFile> {
    let dir = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(|e| persistence(target, e))?;

    let mut file = NamedTempFile::new_in(dir).map_err(|e| persistence(target, e))?;
    file.write_all(bytes).map_err(|e| persistence(target, e))?;
    file.as_file().sync_all().map_err(|e| persistence(target, e))?;
    Ok(file)
}

fn read_existing(path: &Path) -> Result<Option<Vec<u8>>> {
    if path.is_file() {
        Ok(Some(fs::read(path)?))
    } else {
        Ok(None)
    }
}

fn restore(path: &Path, previous: Option<Vec<u8>>) {
    let outcome = match previous {
        Some(bytes) => fs::write(path, bytes),
        None => fs::remove_file(path),
    };
    if let Err(e) = outcome {
        warn!(path = %path.display(), error = %e, "rollback failed");
    }
}
