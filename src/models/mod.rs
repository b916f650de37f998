pub mod base_model;
pub mod iforest;

pub use base_model::{OutlierDetector, OutlierModel, Verdict};
pub use iforest::{IsolationForest, IsolationForestParams};
