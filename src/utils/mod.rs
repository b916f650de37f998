pub mod dataset;
pub mod scaler;

pub use dataset::{CsvDatasetLoader, DatasetSource, FeatureMatrix, InMemoryDataset};
pub use scaler::{NormalizationStatistics, StandardScaler};
