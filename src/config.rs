//! Parameters for learning and applying a hough forest.
//!
//! Both configurations are plain serde structs, so they can be stored as json
//! next to a trained forest and loaded again.

use rand::Rng;
use serde_json;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use errors::*;
use hough::patch::Offset;
use hough::split::SplitKind;

macro_rules! invalid {
    ($msg: expr) => (bail!(ErrorKind::InvalidConfig($msg.to_owned())))
}

/// Parameters for training a hough forest.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct LearnerConfig {
    /// Number of trees of the forest
    pub num_trees: usize,
    /// Number of records drawn (with replacement) to train one tree
    pub num_samples: usize,
    /// Number of randomly generated split functions a node chooses from
    pub num_split_functions: usize,
    /// The maximum depth a tree may have.
    pub max_depth: usize,
    /// A node with fewer records becomes a leaf.
    pub min_sample_size: usize,
    /// Seed for the random number generator. A random seed is taken (and logged)
    /// if this is None.
    pub seed: Option<u64>,
    /// Use split functions that look at the state of neighbouring patches
    pub entanglement: bool,
    /// Probability that a candidate split function is an entangled one
    /// (once the depth allows it)
    pub entanglement_ratio: f64,
    /// [min, max] distance (in pixel) of neighbours in x direction
    pub horizontal_offset: [u32; 2],
    /// [min, max] distance (in pixel) of neighbours in y direction
    pub vertical_offset: [u32; 2],
    /// Entangled split functions which may be used
    pub split_kinds: Vec<SplitKind>,
    /// Step budget of the ancestor pair split function
    pub ancestor_pair_threshold: usize,
    /// Sigma of the offset similarity split function
    pub offset_similarity_sigma: f64,
    /// Width and height of a patch
    pub patch_size: [u32; 2],
    /// Distance of two neighbouring patches
    pub stride: [u32; 2],
    /// Number of worker threads (None: rayon's global pool)
    pub threads: Option<usize>,
}

impl Default for LearnerConfig {
    fn default() -> LearnerConfig {
        LearnerConfig {
            num_trees: 8,
            num_samples: 10000,
            num_split_functions: 10000,
            max_depth: 15,
            min_sample_size: 20,
            seed: None,
            entanglement: true,
            entanglement_ratio: 0.5,
            horizontal_offset: [0, 50],
            vertical_offset: [0, 50],
            split_kinds: vec![SplitKind::MapClass],
            ancestor_pair_threshold: 5,
            offset_similarity_sigma: 7.0,
            patch_size: [16, 16],
            stride: [8, 8],
            threads: None,
        }
    }
}

impl LearnerConfig {
    /// Checks every parameter. Training must not start with an invalid configuration.
    pub fn validate(&self) -> Result<()> {
        if self.num_trees < 1 {
            invalid!("The number of trees must be at least 1!");
        }
        if self.num_samples < self.min_sample_size {
            invalid!("The size of the sample must not be lower than the minimum size!");
        }
        if self.horizontal_offset[0] > self.horizontal_offset[1] ||
           self.vertical_offset[0] > self.vertical_offset[1] {
            invalid!("Min. offset must not be greater than max. offset!");
        }
        if self.entanglement && self.split_kinds.is_empty() {
            invalid!("At least one entangled split function must be enabled!");
        }
        if self.max_depth < 1 {
            invalid!("The maximum depth must be at least 1!");
        }
        if self.num_split_functions < 1 {
            invalid!("The number of split functions must be at least 1!");
        }
        if self.num_samples < 1 {
            invalid!("The size of the sample must be at least 1!");
        }
        if self.patch_size[0] < 1 || self.patch_size[1] < 1 {
            invalid!("The patch size must be at least 1!");
        }
        if self.stride[0] < 1 || self.stride[1] < 1 {
            invalid!("The stride must be at least 1!");
        }
        if !(self.entanglement_ratio >= 0.0 && self.entanglement_ratio <= 1.0) {
            invalid!("The entanglement ratio must be within [0, 1]!");
        }
        if self.ancestor_pair_threshold < 1 {
            invalid!("The ancestor pair threshold must be at least 1!");
        }
        if !(self.offset_similarity_sigma > 0.0) {
            invalid!("Sigma of the offset similarity must be greater than 0!");
        }
        if self.threads == Some(0) {
            invalid!("The number of threads must be at least 1!");
        }
        Ok(())
    }

    /// Random offset to a neighbour (in pixel, a multiple of the stride).
    /// Every axis gets a random sign and a random number of cells
    /// within [min / stride, round(max / stride)].
    pub fn random_offset<R: Rng>(&self, rng: &mut R) -> Offset {
        let axis = |rng: &mut R, range: [u32; 2], stride: u32| {
            let min = range[0] / stride;
            let max = (range[1] as f64 / stride as f64 + 0.5) as u32;
            let sign = if rng.gen::<bool>() { 1 } else { -1 };
            let cells = rng.gen_range(min..max + 1);
            sign * (cells * stride) as i32
        };
        let x = axis(&mut *rng, self.horizontal_offset, self.stride[0]);
        let y = axis(&mut *rng, self.vertical_offset, self.stride[1]);
        [x, y]
    }

    /// Sets the number of trees
    pub fn trees(mut self, num: usize) -> Self {
        self.num_trees = num;
        self
    }

    /// Sets the maximum depth of a tree
    pub fn depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    /// Sets the seed
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Sets patch size and stride
    pub fn patches(mut self, patch_size: [u32; 2], stride: [u32; 2]) -> Self {
        self.patch_size = patch_size;
        self.stride = stride;
        self
    }

    pub fn from_json(json: &str) -> Result<LearnerConfig> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<LearnerConfig> {
        read_json(path.as_ref()).and_then(|s| LearnerConfig::from_json(&s))
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_json(self, path.as_ref())
    }
}

/// Parameters for detecting objects with a trained forest.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PredictorConfig {
    /// Distance of two neighbouring patches
    pub stride: [u32; 2],
    /// The image is evaluated at each of these scales (at most 4)
    pub scales: Vec<f64>,
    /// Sigma of the gaussian smoothing of the vote maps
    pub sigma_xy: f32,
    /// Sigma of the gaussian smoothing across the scales
    pub sigma_z: f32,
    /// Half size of the window around a maximum used for backprojection
    pub backprojection_span: u32,
    /// Detect all maxima above `detection_threshold` instead of the global maximum only
    pub multiple_detection: bool,
    pub detection_threshold: f32,
    /// Two detections are at least this far apart (in pixel)
    pub max_suppression: f64,
    /// Number of worker threads (None: rayon's global pool)
    pub threads: Option<usize>,
}

/// Largest number of scales a prediction may use.
pub const MAX_SCALES: usize = 4;

impl Default for PredictorConfig {
    fn default() -> PredictorConfig {
        PredictorConfig {
            stride: [8, 8],
            scales: vec![1.0],
            sigma_xy: 3.0,
            sigma_z: 1.0,
            backprojection_span: 15,
            multiple_detection: false,
            detection_threshold: 1.0,
            max_suppression: 25.0,
            threads: None,
        }
    }
}

impl PredictorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.scales.is_empty() || self.scales.len() > MAX_SCALES {
            invalid!("Between one and four scales must be given!");
        }
        if self.scales.iter().any(|&s| !(s > 0.0)) {
            invalid!("Every scale must be greater than 0!");
        }
        if self.stride[0] < 1 || self.stride[1] < 1 {
            invalid!("The stride must be at least 1!");
        }
        if self.sigma_xy < 0.0 || self.sigma_z < 0.0 {
            invalid!("Sigma must not be negative!");
        }
        if self.max_suppression < 0.0 {
            invalid!("The suppression radius must not be negative!");
        }
        if self.threads == Some(0) {
            invalid!("The number of threads must be at least 1!");
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<PredictorConfig> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<PredictorConfig> {
        read_json(path.as_ref()).and_then(|s| PredictorConfig::from_json(&s))
    }
}

/// Describes how the feature tensors of a forest were computed.
/// The features themselves are computed outside of this crate, the descriptor
/// is stored with the forest so the same features can be computed for prediction.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct FeatureDescriptor {
    pub is_color: bool,
    pub convert_to_lab: bool,
    pub first_derivative: bool,
    pub absolute_first_derivative: bool,
    pub second_derivative: bool,
    pub absolute_second_derivative: bool,
    pub hog: bool,
    pub hog_bins: u32,
    pub min_max: bool,
    pub use_absolute: bool,
}

impl Default for FeatureDescriptor {
    fn default() -> FeatureDescriptor {
        FeatureDescriptor {
            is_color: false,
            convert_to_lab: true,
            first_derivative: true,
            absolute_first_derivative: true,
            second_derivative: true,
            absolute_second_derivative: true,
            hog: true,
            hog_bins: 9,
            min_max: true,
            use_absolute: false,
        }
    }
}

fn read_json(path: &Path) -> Result<String> {
    let mut s = String::new();
    File::open(path)?.read_to_string(&mut s)?;
    Ok(s)
}

fn write_json<T: ::serde::Serialize>(obj: &T, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(obj)?;
    let mut file = File::create(path)?;
    file.write_all(json.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn message(cfg: &LearnerConfig) -> String {
        match cfg.validate() {
            Err(Error(ErrorKind::InvalidConfig(msg), _)) => msg,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_defaults_valid() {
        assert!(LearnerConfig::default().validate().is_ok());
        assert!(PredictorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validation_messages() {
        let cfg = LearnerConfig::default().trees(0);
        assert_eq!(message(&cfg), "The number of trees must be at least 1!");

        let mut cfg = LearnerConfig::default();
        cfg.num_samples = 10;
        assert_eq!(message(&cfg), "The size of the sample must not be lower than the minimum size!");

        let mut cfg = LearnerConfig::default();
        cfg.vertical_offset = [20, 10];
        assert_eq!(message(&cfg), "Min. offset must not be greater than max. offset!");

        let mut cfg = LearnerConfig::default();
        cfg.split_kinds.clear();
        assert_eq!(message(&cfg), "At least one entangled split function must be enabled!");
        cfg.entanglement = false;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_predictor_validation() {
        let mut cfg = PredictorConfig::default();
        cfg.scales = vec![1.0, 0.5, 0.25, 2.0, 4.0];
        assert!(cfg.validate().is_err());
        cfg.scales = vec![1.0, 0.0];
        assert!(cfg.validate().is_err());
        cfg.scales = vec![];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_random_offset() {
        let mut cfg = LearnerConfig::default();
        cfg.horizontal_offset = [8, 20];
        cfg.vertical_offset = [0, 0];
        cfg.stride = [4, 4];
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..100 {
            let o = cfg.random_offset(&mut rng);
            // cells within [2, 5]
            assert!(o[0].abs() >= 8 && o[0].abs() <= 20, "{:?}", o);
            assert_eq!(o[0] % 4, 0);
            assert_eq!(o[1], 0);
        }
    }

    #[test]
    fn test_json() {
        let cfg = LearnerConfig::from_json(r#"{"num_trees": 3, "split_kinds": ["AncestorPair"]}"#).unwrap();
        assert_eq!(cfg.num_trees, 3);
        assert_eq!(cfg.split_kinds, vec![SplitKind::AncestorPair]);
        assert_eq!(cfg.max_depth, 15);
        let json = serde_json::to_string(&cfg).unwrap();
        assert_eq!(LearnerConfig::from_json(&json).unwrap(), cfg);
        assert!(LearnerConfig::from_json("{\"num_trees\": -1}").is_err());
    }
}
