use std::path::{Path, PathBuf};

use ndarray::{Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

/// Training input shorter than this is replaced by the fallback dataset.
pub const MIN_TRAINING_SAMPLES: usize = 10;

/// Feature name given to the single column of a reshaped raw series.
pub const SERIES_FEATURE_NAME: &str = "value";

/// Rectangular numeric input: rows are observations, columns are features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureMatrix {
    pub feature_names: Vec<String>,
    pub values: Array2<f64>,
}

impl FeatureMatrix {
    pub fn new(feature_names: Vec<String>, values: Array2<f64>) -> Result<Self> {
        if feature_names.len() != values.ncols() {
            return Err(EngineError::FeatureCountMismatch {
                expected: feature_names.len(),
                got: values.ncols(),
            });
        }
        Ok(Self {
            feature_names,
            values,
        })
    }

    /// Reshape a raw series into one column: each scalar becomes its own row.
    pub fn from_series(series: &[f64]) -> Self {
        let values = Array2::from_shape_fn((series.len(), 1), |(row, _)| series[row]);
        Self {
            feature_names: vec![SERIES_FEATURE_NAME.to_string()],
            values,
        }
    }

    pub fn nrows(&self) -> usize {
        self.values.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.values.ncols()
    }

    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }
}

/// Fail on the first NaN or infinite cell.
pub fn ensure_finite(values: ArrayView2<f64>) -> Result<()> {
    for (row, line) in values.axis_iter(Axis(0)).enumerate() {
        if let Some(column) = line.iter().position(|v| !v.is_finite()) {
            return Err(EngineError::NonFiniteValue { row, column });
        }
    }
    Ok(())
}

/// Supplier of the default training matrix.
pub trait DatasetSource: Send + Sync {
    fn load(&self) -> Result<FeatureMatrix>;

    /// Path or name used in logs and error context.
    fn describe(&self) -> String;
}

/// A fixed matrix held in memory, for hosts that ship their reference data inline.
#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    name: String,
    matrix: FeatureMatrix,
}

impl InMemoryDataset {
    pub fn new<S: Into<String>>(name: S, matrix: FeatureMatrix) -> Self {
        Self {
            name: name.into(),
            matrix,
        }
    }
}

impl DatasetSource for InMemoryDataset {
    fn load(&self) -> Result<FeatureMatrix> {
        if self.matrix.ncols() == 0 {
            return Err(EngineError::NoNumericFeatures {
                path: PathBuf::from(&self.name),
            });
        }
        if self.matrix.nrows() == 0 {
            return Err(EngineError::EmptyDataset {
                path: PathBuf::from(&self.name),
            });
        }
        Ok(self.matrix.clone())
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

/// Reads a headered CSV file and keeps every numeric column.
#[derive(Debug, Clone)]
pub struct CsvDatasetLoader {
    path: PathBuf,
}

impl CsvDatasetLoader {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn csv_error(&self, source: csv::Error) -> EngineError {
        EngineError::Dataset {
            path: self.path.clone(),
            source,
        }
    }
}

impl DatasetSource for CsvDatasetLoader {
    fn load(&self) -> Result<FeatureMatrix> {
        if !self.path.is_file() {
            return Err(EngineError::DatasetNotFound {
                path: self.path.clone(),
            });
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(&self.path)
            .map_err(|e| self.csv_error(e))?;

        let headers = reader.headers().map_err(|e| self.csv_error(e))?.clone();
        let records = reader
            .records()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| self.csv_error(e))?;

        // A column is numeric when it has data and every non-empty cell is a finite number.
        let numeric: Vec<usize> = (0..headers.len())
            .filter(|&col| {
                let mut seen = false;
                let all_numeric = records.iter().all(|record| match record.get(col) {
                    Some(cell) if !cell.is_empty() => {
                        seen = true;
                        cell.parse::<f64>().map(|v| v.is_finite()).unwrap_or(false)
                    }
                    _ => true,
                });
                seen && all_numeric
            })
            .collect();

        if numeric.is_empty() {
            return Err(EngineError::NoNumericFeatures {
                path: self.path.clone(),
            });
        }

        let mut data = Vec::with_capacity(records.len() * numeric.len());
        let mut rows = 0;
        for (line, record) in records.iter().enumerate() {
            let row: Option<Vec<f64>> = numeric
                .iter()
                .map(|&col| record.get(col).and_then(|cell| cell.parse::<f64>().ok()))
                .collect();
            match row {
                Some(row) => {
                    data.extend(row);
                    rows += 1;
                }
                None => warn!(
                    dataset = %self.path.display(),
                    record = line + 1,
                    "skipping row with missing numeric value"
                ),
            }
        }

        if rows == 0 {
            return Err(EngineError::EmptyDataset {
                path: self.path.clone(),
            });
        }

        let feature_names = numeric
            .iter()
            .map(|&col| headers.get(col).unwrap_or_default().to_string())
            .collect();
        let values = Array2::from_shape_vec((rows, numeric.len()), data)?;

        debug!(
            dataset = %self.path.display(),
            rows,
            features = numeric.len(),
            "loaded fallback dataset"
        );
        FeatureMatrix::new(feature_names, values)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_csv(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("data.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_from_series_is_one_column() {
        let matrix = FeatureMatrix::from_series(&[1.0, 2.0, 3.0]);
        assert_eq!(matrix.nrows(), 3);
        assert_eq!(matrix.ncols(), 1);
        assert_eq!(matrix.feature_names, vec!["value"]);
        assert_eq!(matrix.values[[2, 0]], 3.0);
    }

    #[test]
    fn test_new_checks_names() {
        let values = Array2::zeros((2, 3));
        let result = FeatureMatrix::new(vec!["a".into()], values);
        assert!(matches!(
            result,
            Err(EngineError::FeatureCountMismatch { expected: 1, got: 3 })
        ));
    }

    #[test]
    fn test_in_memory_dataset() {
        let matrix = FeatureMatrix::from_series(&[1.0, 2.0, 3.0]);
        let source = InMemoryDataset::new("inline", matrix.clone());
        assert_eq!(source.load().unwrap(), matrix);
        assert_eq!(source.describe(), "inline");
    }

    #[test]
    fn test_in_memory_dataset_without_columns() {
        let matrix = FeatureMatrix::new(vec![], Array2::zeros((4, 0))).unwrap();
        let source = InMemoryDataset::new("no-columns", matrix);
        assert!(matches!(
            source.load(),
            Err(EngineError::NoNumericFeatures { path }) if path == PathBuf::from("no-columns")
        ));
    }

    #[test]
    fn test_in_memory_dataset_without_rows() {
        let matrix = FeatureMatrix::new(vec!["cpu".into()], Array2::zeros((0, 1))).unwrap();
        let source = InMemoryDataset::new("no-rows", matrix);
        assert!(matches!(
            source.load(),
            Err(EngineError::EmptyDataset { path }) if path == PathBuf::from("no-rows")
        ));
    }

    #[test]
    fn test_ensure_finite() {
        let ok = ndarray::arr2(&[[1.0, 2.0], [3.0, 4.0]]);
        assert!(ensure_finite(ok.view()).is_ok());

        let bad = ndarray::arr2(&[[1.0, 2.0], [3.0, f64::NAN]]);
        assert!(matches!(
            ensure_finite(bad.view()),
            Err(EngineError::NonFiniteValue { row: 1, column: 1 })
        ));
    }

    #[test]
    fn test_loads_numeric_columns_only() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(
            &dir,
            "name,age,score,city\nAlice,30,95.5,NYC\nBob,25,87,LA\nCharlie,35,92,Chicago\n",
        );

        let matrix = CsvDatasetLoader::new(&path).load().unwrap();
        assert_eq!(matrix.feature_names, vec!["age", "score"]);
        assert_eq!(matrix.nrows(), 3);
        assert_eq!(matrix.values[[0, 1]], 95.5);
        assert_eq!(matrix.values[[2, 0]], 35.0);
    }

    #[test]
    fn test_skips_incomplete_rows() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(&dir, "a,b\n1,2\n3,\n5,6\n");

        let matrix = CsvDatasetLoader::new(&path).load().unwrap();
        assert_eq!(matrix.nrows(), 2);
        assert_eq!(matrix.values[[1, 0]], 5.0);
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let loader = CsvDatasetLoader::new(dir.path().join("absent.csv"));
        assert!(matches!(
            loader.load(),
            Err(EngineError::DatasetNotFound { .. })
        ));
    }

    #[test]
    fn test_no_numeric_columns() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(&dir, "name,city\nAlice,NYC\nBob,LA\n");
        assert!(matches!(
            CsvDatasetLoader::new(&path).load(),
            Err(EngineError::NoNumericFeatures { .. })
        ));
    }

    #[test]
    fn test_header_only_has_no_numeric_columns() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(&dir, "a,b\n");
        assert!(matches!(
            CsvDatasetLoader::new(&path).load(),
            Err(EngineError::NoNumericFeatures { .. })
        ));
    }
}
