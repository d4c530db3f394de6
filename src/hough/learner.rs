//! Growing a single hough tree.
//!
//! Without entanglement a tree is grown depth first, every node only needs
//! its own records. Entangled split functions read the node every
//! neighbouring patch currently sits in, so with entanglement a tree is grown
//! breadth first: a whole level of nodes is expanded against the same node
//! grid, and the grid is updated only once the level is complete.

use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;

use config::LearnerConfig;
use errors::*;
use hough::houghforest::CancelToken;
use hough::nodegrid::{GridView, NodeGrid};
use hough::sample::{offset_mean, Sample};
use hough::split::{random_candidates, SplitFunction};
use hough::tree::{Node, NodeId, NodeKind, Tree};

/// Below this share of background patches a split is always scored by the
/// spread of the offsets.
const MIN_BACKGROUND_FRACTION: f64 = 0.05;

/// Entropy of both sides, weighted by their size.
pub fn entropy_score(left: &Sample, right: &Sample, training_set: &Sample) -> f64 {
    let size = left.len() + right.len();
    if size == 0 {
        return 0.0;
    }
    rel!(left.len(), size) * left.entropy(training_set) + rel!(right.len(), size) * right.entropy(training_set)
}

/// Sum of the squared distances of the offsets to the mean offset of their side.
/// The mean is taken over the whole side, a background patch adds a zero offset.
pub fn offset_variance_score(left: &Sample, right: &Sample) -> f64 {
    fn side(sample: &Sample) -> f64 {
        if sample.is_empty() {
            return 0.0;
        }
        let offsets = sample.offsets();
        let (sx, sy) = offsets.iter().fold((0f64, 0f64), |(sx, sy), o| (sx + o[0] as f64, sy + o[1] as f64));
        let mx = sx / sample.len() as f64;
        let my = sy / sample.len() as f64;
        offsets.iter()
            .map(|o| {
                let dx = o[0] as f64 - mx;
                let dy = o[1] as f64 - my;
                dx * dx + dy * dy
            })
            .sum()
    }
    side(left) + side(right)
}

/// One node of the frontier of the breadth first training.
struct Frontier<'a> {
    node: NodeId,
    /// the (bootstrapped) records the node is trained with
    sample: Sample<'a>,
    /// every record of the training set that reaches this node
    reached: Sample<'a>,
    seed: u64,
}

/// Trains single trees.
pub struct TreeLearner<'a> {
    config: &'a LearnerConfig,
    /// Every training record (each once), used to reweight class probabilities
    training_set: &'a Sample<'a>,
    /// Upper bound of the pixel difference thresholds, per channel
    thresholds: &'a [f64],
    cancel: &'a CancelToken,
}

impl<'a> TreeLearner<'a> {
    pub fn new(config: &'a LearnerConfig,
               training_set: &'a Sample<'a>,
               thresholds: &'a [f64],
               cancel: &'a CancelToken)
               -> TreeLearner<'a> {
        TreeLearner {
            config: config,
            training_set: training_set,
            thresholds: thresholds,
            cancel: cancel,
        }
    }

    /// Grows a tree from `sample`. Breadth first if entanglement is enabled,
    /// depth first otherwise.
    pub fn train(&self, sample: Sample<'a>, seed: u64) -> Result<Tree> {
        if self.config.entanglement {
            self.train_breadth_first(sample, seed)
        } else {
            self.train_depth_first(sample, seed)
        }
    }

    /// Returns the class probabilities of a leaf if `sample` must not be split
    /// any further at `depth`.
    ///
    /// # Arguments
    /// * `probabilities` - the (reweighted) probabilities of `sample`
    fn stop_probabilities(&self, sample: &Sample, depth: usize, probabilities: [f64; 2]) -> Option<[f64; 2]> {
        if depth >= self.config.max_depth || sample.len() < self.config.min_sample_size {
            return Some(probabilities);
        }
        let [n0, n1] = sample.class_counts();
        if n0 == 0 {
            return Some([0.0, 1.0]);
        }
        if n1 == 0 {
            return Some([1.0, 0.0]);
        }
        None
    }

    /// Generates random candidates and returns the one with the lowest score.
    fn best_split<R: Rng>(&self, sample: &Sample, depth: usize, view: &GridView, rng: &mut R) -> Result<SplitFunction> {
        let candidates = random_candidates(self.config, depth, self.thresholds, rng);
        let background = rel!(sample.count0(), sample.len());
        let mut best: Option<(f64, SplitFunction)> = None;
        for candidate in candidates.into_iter() {
            self.cancel.check()?;
            let (left, right) = sample.partition(|rec| candidate.apply(rec, view, None));
            let by_entropy = background >= MIN_BACKGROUND_FRACTION && rng.gen::<bool>();
            let score = if by_entropy {
                entropy_score(&left, &right, self.training_set)
            } else {
                offset_variance_score(&left, &right)
            };
            if best.as_ref().map_or(true, |&(s, _)| score < s) {
                best = Some((score, candidate));
            }
        }
        match best {
            Some((_, f)) => Ok(f),
            None => bail!(ErrorKind::InvalidConfig("No split function was generated".to_owned())),
        }
    }

    /// Appends a new node for `sample` to the arena.
    fn push_node(&self, nodes: &mut Vec<Node>, sample: &Sample, depth: usize, index: u64, parent: Option<NodeId>) -> NodeId {
        let offsets = sample.offsets();
        nodes.push(Node::pending(depth,
                                 index,
                                 sample.probabilities(self.training_set),
                                 sample.class_counts(),
                                 offset_mean(&offsets),
                                 parent));
        nodes.len() - 1
    }

    /// Grows a tree without entangled split functions.
    pub fn train_depth_first(&self, sample: Sample<'a>, seed: u64) -> Result<Tree> {
        let mut nodes = vec![];
        self.grow(&mut nodes, sample, 0, 0, None, seed)?;
        Ok(Tree::from_nodes(nodes))
    }

    fn grow(&self,
            nodes: &mut Vec<Node>,
            sample: Sample<'a>,
            depth: usize,
            index: u64,
            parent: Option<NodeId>,
            seed: u64)
            -> Result<NodeId> {
        self.cancel.check()?;
        let mut rng = StdRng::seed_from_u64(seed);
        let id = self.push_node(nodes, &sample, depth, index, parent);
        let probabilities = nodes[id].probabilities;
        if let Some(p) = self.stop_probabilities(&sample, depth, probabilities) {
            nodes[id].make_leaf(p, sample.offsets());
            return Ok(id);
        }

        let grid = NodeGrid::empty();
        let (function, left, right) = {
            let view = GridView::new(&nodes[..], &grid);
            let function = self.best_split(&sample, depth, &view, &mut rng)?;
            let (left, right) = sample.partition(|rec| function.apply(rec, &view, None));
            (function, left, right)
        };
        if left.is_empty() || right.is_empty() {
            // all records went to one side: that side is `sample` itself
            nodes[id].make_leaf(probabilities, sample.offsets());
            return Ok(id);
        }

        let (left_seed, right_seed) = (rng.gen(), rng.gen());
        let l = self.grow(nodes, left, depth + 1, 2 * index + 1, Some(id), left_seed)?;
        let r = self.grow(nodes, right, depth + 1, 2 * index + 2, Some(id), right_seed)?;
        nodes[id].kind = NodeKind::Split {
            function: function,
            left: l,
            right: r,
        };
        Ok(id)
    }

    /// Grows a tree level by level.
    ///
    /// Every training record's grid cell starts at the root. When a node is
    /// split, its records (the sample as well as every training record
    /// reaching it) are moved into the children, but the moves are written to
    /// the node grid only after the whole level was processed. That way every
    /// split decision of one level sees the same state of the neighbours.
    pub fn train_breadth_first(&self, sample: Sample<'a>, seed: u64) -> Result<Tree> {
        let mut rng = StdRng::seed_from_u64(seed);
        let records = self.training_set.records();
        let mut grid = NodeGrid::new(records, 0);
        let mut nodes = vec![];
        let root = self.push_node(&mut nodes, &sample, 0, 0, None);
        let mut frontier = vec![Frontier {
                                    node: root,
                                    sample: sample,
                                    reached: Sample::new(records, self.training_set.elements().to_vec()),
                                    seed: rng.gen(),
                                }];
        let mut level = 0;
        while !frontier.is_empty() {
            self.cancel.check()?;
            debug!("Level {}: expanding {} nodes", level, frontier.len());
            frontier = self.expand_level(&mut nodes, &mut grid, frontier)?;
            level += 1;
        }
        Ok(Tree::from_nodes(nodes))
    }

    /// Expands every node of one level and returns the next level.
    fn expand_level(&self,
                    nodes: &mut Vec<Node>,
                    grid: &mut NodeGrid,
                    frontier: Vec<Frontier<'a>>)
                    -> Result<Vec<Frontier<'a>>> {
        let mut next = vec![];
        let mut moves: Vec<(usize, NodeId)> = vec![];
        for f in frontier.into_iter() {
            let (depth, index, probabilities) = {
                let n = &nodes[f.node];
                (n.depth, n.index, n.probabilities)
            };
            if let Some(p) = self.stop_probabilities(&f.sample, depth, probabilities) {
                nodes[f.node].make_leaf(p, f.sample.offsets());
                continue;
            }

            let mut rng = StdRng::seed_from_u64(f.seed);
            let (function, left, right, reached_left, reached_right) = {
                let view = GridView::new(&nodes[..], grid);
                let function = self.best_split(&f.sample, depth, &view, &mut rng)?;
                let (left, right) = f.sample.partition(|rec| function.apply(rec, &view, None));
                let (reached_left, reached_right) = f.reached.partition(|rec| function.apply(rec, &view, None));
                (function, left, right, reached_left, reached_right)
            };
            if left.is_empty() || right.is_empty() {
                nodes[f.node].make_leaf(probabilities, f.sample.offsets());
                continue;
            }

            let l = self.push_node(nodes, &left, depth + 1, 2 * index + 1, Some(f.node));
            let r = self.push_node(nodes, &right, depth + 1, 2 * index + 2, Some(f.node));
            nodes[f.node].kind = NodeKind::Split {
                function: function,
                left: l,
                right: r,
            };
            moves.extend(reached_left.elements().iter().map(|&i| (i, l)));
            moves.extend(reached_right.elements().iter().map(|&i| (i, r)));
            let (left_seed, right_seed) = (rng.gen(), rng.gen());
            next.push(Frontier {
                node: l,
                sample: left,
                reached: reached_left,
                seed: left_seed,
            });
            next.push(Frontier {
                node: r,
                sample: right,
                reached: reached_right,
                seed: right_seed,
            });
        }
        grid.commit(self.training_set.records(), &moves);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hough::patch::Truth;
    use hough::split::{Split, SplitKind};
    use hough::testutil::{labeled_records, ramp_records};

    macro_rules! assert_feq {
        ($a: expr, $b: expr, $tol: expr) => (
            assert!(($a - $b).abs() < $tol, "{} != {}", $a, $b);
            )
    }

    fn config() -> LearnerConfig {
        let mut cfg = LearnerConfig::default();
        cfg.num_samples = 64;
        cfg.num_split_functions = 200;
        cfg.min_sample_size = 1;
        cfg.patch_size = [4, 4];
        cfg.stride = [4, 4];
        cfg.horizontal_offset = [0, 8];
        cfg.vertical_offset = [0, 8];
        cfg.split_kinds = vec![SplitKind::MapClass,
                               SplitKind::NodeDescendant,
                               SplitKind::AncestorPair,
                               SplitKind::OffsetSimilarityPair];
        cfg
    }

    /// Checks indices, depths, counts and parent links of every node.
    fn check_structure(tree: &Tree, max_depth: usize) {
        for (id, n) in tree.nodes().iter().enumerate() {
            assert!(n.depth <= max_depth);
            if let NodeKind::Split { left, right, .. } = n.kind {
                for &(child, idx) in [(left, 2 * n.index + 1), (right, 2 * n.index + 2)].iter() {
                    let c = tree.node(child);
                    assert_eq!(c.index, idx);
                    assert_eq!(c.depth, n.depth + 1);
                    assert_eq!(c.parent, Some(id));
                }
                let (l, r) = (tree.node(left), tree.node(right));
                assert_eq!(l.counts[0] + r.counts[0], n.counts[0]);
                assert_eq!(l.counts[1] + r.counts[1], n.counts[1]);
            }
        }
    }

    #[test]
    fn test_scores() {
        let records = labeled_records(&[None, None, Some([2, 2]), Some([4, 2])]);
        let set = Sample::whole(&records);
        let pure_l = Sample::new(&records, vec![0, 1]);
        let pure_r = Sample::new(&records, vec![2, 3]);
        assert_eq!(entropy_score(&pure_l, &pure_r, &set), 0.0);
        let mixed_l = Sample::new(&records, vec![0, 2]);
        let mixed_r = Sample::new(&records, vec![1, 3]);
        assert_feq!(entropy_score(&mixed_l, &mixed_r, &set), 2f64.ln(), 1e-9);

        // object side: mean (3,2) => 1 + 1
        assert_feq!(offset_variance_score(&pure_l, &pure_r), 2.0, 1e-9);
        // the background patch pulls the mean towards zero: mean (1,1) => 2
        assert_feq!(offset_variance_score(&mixed_l, &Sample::new(&records, vec![])), 2.0, 1e-9);
    }

    #[test]
    fn test_stop_conditions() {
        let records = labeled_records(&[None, None, Some([2, 2]), Some([4, 2])]);
        let set = Sample::whole(&records);
        let mut cfg = config();
        cfg.max_depth = 3;
        cfg.min_sample_size = 3;
        let thresholds = [1.0];
        let cancel = CancelToken::new();
        let learner = TreeLearner::new(&cfg, &set, &thresholds, &cancel);
        let p = set.probabilities(&set);
        assert_eq!(learner.stop_probabilities(&set, 3, p), Some(p));
        assert_eq!(learner.stop_probabilities(&set, 2, p), None);
        let small = Sample::new(&records, vec![0, 2]);
        assert_eq!(learner.stop_probabilities(&small, 0, [0.5, 0.5]), Some([0.5, 0.5]));
        let pure = Sample::new(&records, vec![0, 1, 0]);
        assert_eq!(learner.stop_probabilities(&pure, 0, [0.9, 0.1]), Some([1.0, 0.0]));
        let pure = Sample::new(&records, vec![2, 3, 2]);
        assert_eq!(learner.stop_probabilities(&pure, 0, [0.1, 0.9]), Some([0.0, 1.0]));
    }

    #[test]
    fn test_depth_one_single_split() {
        let records = ramp_records();
        let set = Sample::whole(&records);
        let mut cfg = config().depth(1);
        cfg.entanglement = false;
        let thresholds = [30.0];
        let cancel = CancelToken::new();
        let learner = TreeLearner::new(&cfg, &set, &thresholds, &cancel);
        let mut rng = StdRng::seed_from_u64(17);
        let sample = set.random_subsample(cfg.num_samples, &mut rng);
        let tree = learner.train(sample, 4).unwrap();
        assert_eq!(tree.len(), 3);
        check_structure(&tree, 1);
        // the split separates both classes perfectly
        let grid = NodeGrid::empty();
        let view = GridView::new(tree.nodes(), &grid);
        let function = match tree.node(0).kind {
            NodeKind::Split { ref function, .. } => function.clone(),
            _ => panic!("root is a leaf"),
        };
        let sides: Vec<_> = records.iter().map(|r| function.apply(r, &view, None)).collect();
        for (rec, side) in records.iter().zip(sides.iter()) {
            let first = sides[if rec.class() == 1 { 0 } else { 2 }];
            assert_eq!(*side, first);
        }
        assert!(sides[0] != sides[2]);
        for leaf in tree.leaves() {
            assert!(leaf.probabilities == [1.0, 0.0] || leaf.probabilities == [0.0, 1.0]);
            assert!(leaf.offsets.iter().all(|o| *o == [2, 2]));
            assert_eq!(leaf.offsets.len(), leaf.count1());
        }
    }

    #[test]
    fn test_breadth_first_structure() {
        let records = ramp_records();
        let set = Sample::whole(&records);
        let mut cfg = config().depth(4);
        cfg.entanglement_ratio = 1.0;
        cfg.num_split_functions = 20;
        let thresholds = [30.0];
        let cancel = CancelToken::new();
        let learner = TreeLearner::new(&cfg, &set, &thresholds, &cancel);
        for seed in 0..5 {
            let mut rng = StdRng::seed_from_u64(seed);
            let sample = set.random_subsample(cfg.num_samples, &mut rng);
            let tree = learner.train(sample, seed).unwrap();
            check_structure(&tree, 4);
            for leaf in tree.leaves() {
                assert_feq!(leaf.probabilities[0] + leaf.probabilities[1], 1.0, 1e-9);
                assert_eq!(leaf.offsets.len(), leaf.count1());
            }
            // the same seed grows the same tree
            let mut rng = StdRng::seed_from_u64(seed);
            let sample = set.random_subsample(cfg.num_samples, &mut rng);
            assert!(learner.train(sample, seed).unwrap() == tree);
        }
    }

    #[test]
    fn test_level_barrier() {
        // Level 1 of a tree whose root sent the columns 0 and 1 of a 4 x 4
        // grid to node 2 (object) and the columns 2 and 3 to node 1
        // (background). Objects are the columns 0 and 2, so a map class
        // function looking one cell to the left or right separates both nodes.
        let mut records = ramp_records();
        for rec in records.iter_mut() {
            rec.truth = Some(if rec.position[0] % 2 == 0 {
                Truth::Object { offset: [2, 2] }
            } else {
                Truth::Background
            });
        }
        let set = Sample::whole(&records);
        let mut cfg = config().depth(3);
        cfg.entanglement_ratio = 1.0;
        cfg.split_kinds = vec![SplitKind::MapClass];
        cfg.num_split_functions = 50;
        cfg.horizontal_offset = [4, 4];
        cfg.vertical_offset = [0, 0];
        let thresholds = [30.0];
        let cancel = CancelToken::new();
        let learner = TreeLearner::new(&cfg, &set, &thresholds, &cancel);

        let mut nodes = vec![Node::pending(0, 0, [0.5, 0.5], [8, 8], [2.0, 2.0], None),
                             Node::pending(1, 1, [0.8, 0.2], [4, 4], [2.0, 2.0], Some(0)),
                             Node::pending(1, 2, [0.2, 0.8], [4, 4], [2.0, 2.0], Some(0))];
        nodes[0].kind = NodeKind::Split {
            function: SplitFunction::Default {
                first: [3, 0],
                second: [0, 0],
                channel: 0,
                threshold: 15.0,
            },
            left: 1,
            right: 2,
        };
        let mut grid = NodeGrid::new(&records, 0);
        let (mut bg, mut obj) = (vec![], vec![]);
        for (i, rec) in records.iter().enumerate() {
            if rec.position[0] < 2 {
                grid.set(0, rec.position, 2);
                obj.push(i);
            } else {
                grid.set(0, rec.position, 1);
                bg.push(i);
            }
        }
        let frontier = vec![Frontier {
                                node: 1,
                                sample: Sample::new(&records, bg.clone()),
                                reached: Sample::new(&records, bg),
                                seed: 1,
                            },
                            Frontier {
                                node: 2,
                                sample: Sample::new(&records, obj.clone()),
                                reached: Sample::new(&records, obj),
                                seed: 2,
                            }];
        let before = grid.clone();
        let next = learner.expand_level(&mut nodes, &mut grid, frontier).unwrap();
        assert_eq!(next.len(), 4);

        // every decision of the level was taken against the grid as it was
        // before the level, afterwards the records sit in the new nodes
        let view = GridView::new(&nodes, &before);
        for f in next.iter() {
            let node = &nodes[f.node];
            let parent = node.parent.unwrap();
            let function = match nodes[parent].kind {
                NodeKind::Split { ref function, .. } => function,
                _ => panic!("parent was not split"),
            };
            let side = if node.index % 2 == 1 { Split::Left } else { Split::Right };
            assert!(node.counts[0] == 0 || node.counts[1] == 0);
            for rec in f.reached.iter() {
                assert_eq!(function.apply(rec, &view, None), side);
                assert_eq!(grid.current(rec), Some(f.node));
            }
        }
    }

    #[test]
    fn test_cancel() {
        let records = ramp_records();
        let set = Sample::whole(&records);
        let cfg = config();
        let thresholds = [30.0];
        let cancel = CancelToken::new();
        cancel.cancel();
        let learner = TreeLearner::new(&cfg, &set, &thresholds, &cancel);
        match learner.train(Sample::whole(&records), 1) {
            Err(Error(ErrorKind::Canceled, _)) => (),
            _ => panic!("training was not canceled"),
        }
    }
}
