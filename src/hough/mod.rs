pub mod patch;
pub mod sample;
pub mod split;
pub mod tree;
pub mod nodegrid;
pub mod learner;
pub mod houghforest;
pub mod persist;
pub mod prediction;

#[cfg(test)]
pub mod testutil;

pub use self::houghforest::{CancelToken, ForestLearner, HoughForest};
pub use self::prediction::{Detection, DetectionResult, Predictor};
