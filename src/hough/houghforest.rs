use rand::{thread_rng, Rng, SeedableRng};
use rand::rngs::StdRng;
use rayon;
use rayon::prelude::*;
use serde_json;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use config::{FeatureDescriptor, LearnerConfig};
use errors::*;
use hough::learner::TreeLearner;
use hough::patch::PatchRecord;
use hough::sample::Sample;
use hough::split::SplitFunction;
use hough::tree::{NodeKind, Tree};
use types::FeatureTensor;

/// A tree is grown at most this often before the training is given up.
pub const MAX_TRAINING_ATTEMPTS: usize = 3;

/// Cooperative cancellation of training and prediction.
/// Clones share their state.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    parent: Option<Box<CancelToken>>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.parent.as_ref().map_or(false, |p| p.is_canceled())
    }

    /// Returns `ErrorKind::Canceled` once the token was canceled
    pub fn check(&self) -> Result<()> {
        if self.is_canceled() {
            bail!(ErrorKind::Canceled);
        }
        Ok(())
    }

    /// A token that is canceled together with this one, but can also be
    /// canceled on its own without affecting this one.
    pub fn child(&self) -> CancelToken {
        CancelToken {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Box::new(self.clone())),
        }
    }
}

/// Runs `f` within a pool of `threads` workers, or within the global pool of rayon.
pub fn run_in_pool<T, F>(threads: Option<usize>, f: F) -> Result<T>
    where T: Send,
          F: FnOnce() -> T + Send
{
    match threads {
        Some(n) => {
            let pool = rayon::ThreadPoolBuilder::new().num_threads(n).build()?;
            Ok(pool.install(f))
        }
        None => Ok(f()),
    }
}

/// A trained hough forest together with what is needed to extract the
/// same patches at prediction time.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HoughForest {
    trees: Vec<Tree>,
    patch_size: [u32; 2],
    /// Number of feature channels of the training patches
    channels: usize,
    descriptor: FeatureDescriptor,
}

impl HoughForest {
    pub fn new(trees: Vec<Tree>,
               patch_size: [u32; 2],
               channels: usize,
               descriptor: FeatureDescriptor)
               -> HoughForest {
        HoughForest {
            trees: trees,
            patch_size: patch_size,
            channels: channels,
            descriptor: descriptor,
        }
    }

    /// Checks that every pixel test reads one of the forest's channels.
    /// Forests which were not trained by `ForestLearner` (e.g. loaded ones)
    /// must pass this before they are applied to an image.
    pub fn check(&self) -> Result<()> {
        if self.channels == 0 {
            bail!(ErrorKind::InvalidForestFormat("a forest needs at least one channel".to_owned()));
        }
        for (i, t) in self.trees.iter().enumerate() {
            for n in t.nodes().iter() {
                if let NodeKind::Split { function: SplitFunction::Default { channel, .. }, .. } = n.kind {
                    if channel >= self.channels {
                        bail!(ErrorKind::InvalidForestFormat(format!("tree {} reads channel {} of {}",
                                                                     i,
                                                                     channel,
                                                                     self.channels)));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn trees(&self) -> &[Tree] {
        &self.trees
    }

    pub fn patch_size(&self) -> [u32; 2] {
        self.patch_size
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// The features the forest was trained with
    pub fn descriptor(&self) -> &FeatureDescriptor {
        &self.descriptor
    }

    /// Number of split functions of each kind per depth over all trees,
    /// indexed by `SplitFunction::kind_index`.
    pub fn split_statistics(&self) -> Vec<[usize; 5]> {
        let mut stats = vec![];
        for t in self.trees.iter() {
            t.split_statistics(&mut stats);
        }
        stats
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<HoughForest> {
        let forest: HoughForest = serde_json::from_str(json)?;
        forest.check()?;
        Ok(forest)
    }

    /// Writes the forest as JSON, e.g. for inspection.
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer(BufWriter::new(file), self)?;
        Ok(())
    }
}

impl fmt::Display for HoughForest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, t) in self.trees.iter().enumerate() {
            writeln!(f, "Tree {}:", i)?;
            write!(f, "{}", t)?;
        }
        Ok(())
    }
}

/// Trains hough forests.
pub struct ForestLearner {
    config: LearnerConfig,
    descriptor: FeatureDescriptor,
    cancel: CancelToken,
}

impl ForestLearner {
    /// Checks the configuration. No training starts with an invalid one.
    pub fn new(config: LearnerConfig) -> Result<ForestLearner> {
        config.validate()?;
        Ok(ForestLearner {
            config: config,
            descriptor: FeatureDescriptor::default(),
            cancel: CancelToken::new(),
        })
    }

    /// Sets the features the training patches were extracted with
    pub fn descriptor(mut self, descriptor: FeatureDescriptor) -> Self {
        self.descriptor = descriptor;
        self
    }

    /// Uses `token` to cancel the training
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &LearnerConfig {
        &self.config
    }

    /// Trains a forest. The trees are learned in parallel.
    ///
    /// # Arguments
    /// * `records` - labeled patches of all training images. Patches of
    ///   different images must have different image numbers.
    pub fn train(&self, records: &[PatchRecord]) -> Result<HoughForest> {
        self.check_training_set(records)?;
        let thresholds = channel_ranges(records);
        let num_trees = self.config.num_trees;
        let seed = match self.config.seed {
            Some(s) => s,
            None => thread_rng().gen(),
        };
        info!("Start training {} trees with {} patches (seed {})",
              num_trees,
              records.len(),
              seed);

        let mut rng = StdRng::seed_from_u64(seed);
        let seeds: Vec<u64> = (0..num_trees).map(|_| rng.gen()).collect();
        // canceled by the user or by the first failing tree
        let cancel = self.cancel.child();
        let progress = AtomicUsize::new(0);

        let results: Vec<Result<Tree>> = run_in_pool(self.config.threads, || {
            seeds.par_iter()
                .enumerate()
                .map(|(i, &seed)| {
                    let result = self.train_tree(i, seed, records, &thresholds, &cancel);
                    match result {
                        Ok(_) => {
                            let done = progress.fetch_add(1, Ordering::SeqCst) + 1;
                            info!("Tree {} of {} learned", done, num_trees);
                        }
                        Err(ref e) => {
                            if !is_canceled(e) {
                                cancel.cancel();
                            }
                        }
                    }
                    result
                })
                .collect()
        })?;

        if self.cancel.is_canceled() {
            info!("Training canceled");
            bail!(ErrorKind::Canceled);
        }
        let mut trees = Vec::with_capacity(num_trees);
        let mut canceled = None;
        for r in results.into_iter() {
            match r {
                Ok(t) => trees.push(t),
                Err(e) => {
                    if !is_canceled(&e) {
                        error!("{}", e);
                        return Err(e);
                    }
                    canceled = Some(e);
                }
            }
        }
        if let Some(e) = canceled {
            return Err(e);
        }
        Ok(HoughForest::new(trees,
                            self.config.patch_size,
                            records[0].patch.channels(),
                            self.descriptor))
    }

    /// Grows tree no. `tree`, retrying with a new sample if it never split.
    fn train_tree(&self,
                  tree: usize,
                  seed: u64,
                  records: &[PatchRecord],
                  thresholds: &[f64],
                  cancel: &CancelToken)
                  -> Result<Tree> {
        let training_set = Sample::whole(records);
        let learner = TreeLearner::new(&self.config, &training_set, thresholds, cancel);
        let mut rng = StdRng::seed_from_u64(seed);
        for attempt in 1..MAX_TRAINING_ATTEMPTS + 1 {
            cancel.check()?;
            let sample = training_set.random_subsample(self.config.num_samples, &mut rng);
            let result = learner.train(sample, rng.gen())?;
            if !result.is_degenerate() {
                debug!("Tree {}: {} nodes, depth {}", tree, result.len(), result.depth());
                return Ok(result);
            }
            warn!("Hough tree no. {} never split (attempt {} of {})",
                  tree,
                  attempt,
                  MAX_TRAINING_ATTEMPTS);
        }
        bail!(ErrorKind::TreeTrainingFailed(tree, MAX_TRAINING_ATTEMPTS))
    }

    fn check_training_set(&self, records: &[PatchRecord]) -> Result<()> {
        let first = match records.first() {
            Some(r) => r,
            None => bail!(ErrorKind::InvalidTrainingSet("The training set is empty!".to_owned())),
        };
        if records.iter().any(|r| r.truth.is_none()) {
            bail!(ErrorKind::InvalidTrainingSet("Every training patch needs a label!".to_owned()));
        }
        let channels = first.patch.channels();
        if channels == 0 || records.iter().any(|r| r.patch.channels() != channels) {
            bail!(ErrorKind::InvalidTrainingSet("All training patches need the same number of channels!"
                .to_owned()));
        }
        if records.iter().any(|r| r.patch.size() != self.config.patch_size) {
            bail!(ErrorKind::InvalidTrainingSet("The patch size of the training patches does not match \
                                                 the configuration!"
                .to_owned()));
        }
        // every record owns exactly one cell of its image's node grid
        let mut dims = HashMap::new();
        let mut cells = HashSet::new();
        for r in records.iter() {
            if *dims.entry(r.image).or_insert(r.grid_dims) != r.grid_dims {
                bail!(ErrorKind::InvalidTrainingSet(format!("The patches of image {} belong to grids of \
                                                             different size!",
                                                            r.image)));
            }
            if r.position[0] >= r.grid_dims[0] || r.position[1] >= r.grid_dims[1] {
                bail!(ErrorKind::InvalidTrainingSet(format!("Patch ({}, {}) of image {} lies outside of its grid!",
                                                            r.position[0],
                                                            r.position[1],
                                                            r.image)));
            }
            if !cells.insert((r.image, r.position)) {
                bail!(ErrorKind::InvalidTrainingSet(format!("Image {} has more than one patch at ({}, {})!",
                                                            r.image,
                                                            r.position[0],
                                                            r.position[1])));
            }
        }
        Ok(())
    }
}

fn is_canceled(e: &Error) -> bool {
    match *e.kind() {
        ErrorKind::Canceled => true,
        _ => false,
    }
}

/// Value range of every channel over all images of the training set.
/// Upper bound for the thresholds of pixel difference tests.
fn channel_ranges(records: &[PatchRecord]) -> Vec<f64> {
    let channels = records[0].patch.channels();
    let mut seen = HashSet::new();
    let mut ranges = vec![(::std::f32::MAX, ::std::f32::MIN); channels];
    for rec in records.iter() {
        let tensor: &FeatureTensor = rec.patch.tensor();
        if !seen.insert(tensor as *const FeatureTensor) {
            continue;
        }
        for (c, range) in ranges.iter_mut().enumerate() {
            let (lo, hi) = tensor.channel_range(c);
            range.0 = min!(range.0, lo);
            range.1 = max!(range.1, hi);
        }
    }
    ranges.iter().map(|&(lo, hi)| max!((hi - lo) as f64, 0.0)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hough::patch::Truth;
    use hough::split::SplitKind;
    use hough::testutil::{labeled_records, ramp_records};

    fn config() -> LearnerConfig {
        let mut cfg = LearnerConfig::default()
            .trees(3)
            .depth(3)
            .seed(7)
            .patches([4, 4], [4, 4]);
        cfg.num_samples = 64;
        cfg.num_split_functions = 30;
        cfg.min_sample_size = 1;
        cfg.horizontal_offset = [0, 8];
        cfg.vertical_offset = [0, 8];
        cfg.split_kinds = vec![SplitKind::MapClass, SplitKind::NodeDescendant, SplitKind::AncestorPair];
        cfg
    }

    #[test]
    fn test_cancel_token() {
        let parent = CancelToken::new();
        let child = parent.child();
        let grandchild = child.child();
        grandchild.cancel();
        assert!(!child.is_canceled());
        child.cancel();
        assert!(!parent.is_canceled());
        assert!(child.check().is_err());

        let parent = CancelToken::new();
        let child = parent.child().child();
        parent.clone().cancel();
        assert!(child.is_canceled());
    }

    #[test]
    fn test_invalid_training_set() {
        let learner = ForestLearner::new(config()).unwrap();
        match learner.train(&[]) {
            Err(Error(ErrorKind::InvalidTrainingSet(_), _)) => (),
            _ => panic!("empty training set accepted"),
        }
        let mut records = ramp_records();
        records[3].truth = None;
        match learner.train(&records) {
            Err(Error(ErrorKind::InvalidTrainingSet(_), _)) => (),
            _ => panic!("unlabeled patch accepted"),
        }
        let learner = ForestLearner::new(config().patches([8, 8], [4, 4])).unwrap();
        assert!(learner.train(&ramp_records()).is_err());
    }

    #[test]
    fn test_overlapping_grids() {
        let learner = ForestLearner::new(config()).unwrap();
        let expect_invalid = |records: &[PatchRecord], what: &str| match learner.train(records) {
            Err(Error(ErrorKind::InvalidTrainingSet(_), _)) => (),
            _ => panic!("{} accepted", what),
        };

        // the same image twice
        let mut records = ramp_records();
        records.extend(ramp_records());
        expect_invalid(&records, "duplicate patches");

        // a differently sized image under the same number
        let mut records = ramp_records();
        records.extend(labeled_records(&[Some([2, 2]), None, None, Some([1, 1]), None]));
        expect_invalid(&records, "grids of different size");

        let mut records = ramp_records();
        records[0].position = [4, 0];
        expect_invalid(&records, "patch outside of its grid");

        // fine once every image has its own number
        let mut records = ramp_records();
        let mut other = labeled_records(&[Some([2, 2]), None, None, Some([1, 1]), None]);
        for r in other.iter_mut() {
            r.image = 1;
        }
        records.extend(other);
        let forest = learner.train(&records).unwrap();
        assert_eq!(forest.channels(), 1);
    }

    #[test]
    fn test_invalid_config() {
        match ForestLearner::new(config().trees(0)) {
            Err(Error(ErrorKind::InvalidConfig(_), _)) => (),
            _ => panic!("invalid configuration accepted"),
        }
    }

    #[test]
    fn test_thresholds() {
        let records = ramp_records();
        assert_eq!(channel_ranges(&records), vec![30.0]);
    }

    #[test]
    fn test_deterministic() {
        let records = ramp_records();
        let learner = ForestLearner::new(config()).unwrap();
        let forest = learner.train(&records).unwrap();
        assert_eq!(forest.trees().len(), 3);
        assert_eq!(forest.patch_size(), [4, 4]);
        assert!(forest.trees().iter().all(|t| !t.is_degenerate() && t.depth() <= 3));

        let mut cfg = config();
        cfg.threads = Some(2);
        let again = ForestLearner::new(cfg).unwrap().train(&records).unwrap();
        assert!(forest == again);

        let other = ForestLearner::new(config().seed(8)).unwrap().train(&records).unwrap();
        assert_eq!(other.trees().len(), 3);
    }

    #[test]
    fn test_json() {
        let records = ramp_records();
        let forest = ForestLearner::new(config().trees(1)).unwrap().train(&records).unwrap();
        let json = forest.to_json().unwrap();
        assert!(HoughForest::from_json(&json).unwrap() == forest);
        assert!(format!("{}", forest).starts_with("Tree 0:\nS-- 0;"));
        let stats = forest.split_statistics();
        assert_eq!(stats[0].iter().sum::<usize>(), 1);
    }

    #[test]
    fn test_retries_exhausted() {
        let mut records = ramp_records();
        for rec in records.iter_mut() {
            rec.truth = Some(Truth::Background);
        }
        let learner = ForestLearner::new(config().trees(2)).unwrap();
        match learner.train(&records) {
            Err(Error(ErrorKind::TreeTrainingFailed(_, attempts), _)) => {
                assert_eq!(attempts, MAX_TRAINING_ATTEMPTS)
            }
            _ => panic!("degenerate trees accepted"),
        }
    }

    #[test]
    fn test_canceled() {
        let token = CancelToken::new();
        let learner = ForestLearner::new(config()).unwrap().with_cancel_token(token.clone());
        token.cancel();
        match learner.train(&ramp_records()) {
            Err(Error(ErrorKind::Canceled, _)) => (),
            _ => panic!("training was not canceled"),
        }
    }
}
