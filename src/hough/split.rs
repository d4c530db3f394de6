//! Split functions of a hough tree.
//!
//! Besides the classic pixel difference test there are four *entangled*
//! split functions. They do not look at the patch itself but at the node
//! a neighbouring patch currently sits in (see `NodeGrid`).

use rand::Rng;
use std::fmt;

use config::LearnerConfig;
use hough::nodegrid::GridView;
use hough::patch::{Offset, PatchRecord};

/// Result of a split function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Left,
    Right,
}

/// The entangled split functions, used to configure which of them may be chosen
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SplitKind {
    MapClass,
    NodeDescendant,
    AncestorPair,
    OffsetSimilarityPair,
}

/// All offsets are given in pixel. `stride` is the patch distance the
/// function was trained with, it converts the offsets into grid cells
/// unless another stride is given when applying the function.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum SplitFunction {
    /// Left iff `value(first) - value(second) < threshold` within the patch
    Default {
        first: [u32; 2],
        second: [u32; 2],
        channel: usize,
        threshold: f64,
    },
    /// Left iff the most probable class of the neighbour's node is `class`.
    /// Neighbours outside of the grid are background.
    MapClass {
        offset: Offset,
        class: usize,
        stride: [u32; 2],
    },
    /// Left iff the node with breadth first index `node_index` is an
    /// ancestor of the neighbour's node.
    NodeDescendant {
        offset: Offset,
        node_index: u64,
        stride: [u32; 2],
    },
    /// Left iff the nodes of both neighbours have a common ancestor within
    /// `max_steps` steps upwards.
    AncestorPair {
        first: Offset,
        second: Offset,
        max_steps: usize,
        stride: [u32; 2],
    },
    /// Left if a neighbour is (still) background or outside of the grid,
    /// otherwise left iff `exp(-|mean1 - mean2|^2 / sigma^2) < threshold`.
    OffsetSimilarityPair {
        first: Offset,
        second: Offset,
        threshold: f64,
        sigma: f64,
        stride: [u32; 2],
    },
}

impl SplitFunction {
    /// Decides in which child `record` goes.
    ///
    /// # Arguments
    /// * `record` - the patch to decide for
    /// * `view` - the tree and its current node grid, read by entangled functions
    /// * `stride` - patch distance of the grid `record` belongs to, if it
    ///   differs from the one used for training
    pub fn apply(&self, record: &PatchRecord, view: &GridView, stride: Option<[u32; 2]>) -> Split {
        match *self {
            SplitFunction::Default { first, second, channel, threshold } => {
                let a = record.patch.value(first[0], first[1], channel) as f64;
                let b = record.patch.value(second[0], second[1], channel) as f64;
                if a - b < threshold {
                    Split::Left
                } else {
                    Split::Right
                }
            }
            SplitFunction::MapClass { offset, class, stride: trained } => {
                let s = stride.unwrap_or(trained);
                let neighbour_class = view.neighbour(record, offset, s)
                    .map_or(0, |id| view.node(id).map_class());
                if neighbour_class == class {
                    Split::Left
                } else {
                    Split::Right
                }
            }
            SplitFunction::NodeDescendant { offset, node_index, stride: trained } => {
                let s = stride.unwrap_or(trained);
                match view.neighbour(record, offset, s) {
                    Some(id) if view.ancestors(id).any(|n| n.index == node_index) => Split::Left,
                    _ => Split::Right,
                }
            }
            SplitFunction::AncestorPair { first, second, max_steps, stride: trained } => {
                let s = stride.unwrap_or(trained);
                match (view.neighbour(record, first, s), view.neighbour(record, second, s)) {
                    (Some(a), Some(b)) if view.meet_within(a, b, max_steps) => Split::Left,
                    _ => Split::Right,
                }
            }
            SplitFunction::OffsetSimilarityPair { first, second, threshold, sigma, stride: trained } => {
                let s = stride.unwrap_or(trained);
                let (a, b) = match (view.neighbour(record, first, s), view.neighbour(record, second, s)) {
                    (Some(a), Some(b)) => (view.node(a), view.node(b)),
                    _ => return Split::Left,
                };
                if a.probabilities[0] > 0.5 || b.probabilities[0] > 0.5 {
                    return Split::Left;
                }
                let dx = a.offset_mean[0] - b.offset_mean[0];
                let dy = a.offset_mean[1] - b.offset_mean[1];
                let similarity = (-(dx * dx + dy * dy) / (sigma * sigma)).exp();
                if similarity < threshold {
                    Split::Left
                } else {
                    Split::Right
                }
            }
        }
    }

    pub fn is_entangled(&self) -> bool {
        match *self {
            SplitFunction::Default { .. } => false,
            _ => true,
        }
    }

    /// 0 = Default, 1 = MapClass, 2 = NodeDescendant, 3 = AncestorPair, 4 = OffsetSimilarityPair
    pub fn kind_index(&self) -> usize {
        match *self {
            SplitFunction::Default { .. } => 0,
            SplitFunction::MapClass { .. } => 1,
            SplitFunction::NodeDescendant { .. } => 2,
            SplitFunction::AncestorPair { .. } => 3,
            SplitFunction::OffsetSimilarityPair { .. } => 4,
        }
    }

    pub fn name(&self) -> &'static str {
        KIND_NAMES[self.kind_index()]
    }

    /// Pixel difference test with random positions and channel.
    /// The threshold is drawn from [0, thresholds[channel]).
    pub fn random_default<R: Rng>(config: &LearnerConfig, thresholds: &[f64], rng: &mut R) -> SplitFunction {
        let channel = rng.gen_range(0..thresholds.len());
        let [w, h] = config.patch_size;
        let first = [rng.gen_range(0..w), rng.gen_range(0..h)];
        let second = [rng.gen_range(0..w), rng.gen_range(0..h)];
        let threshold = rng.gen::<f64>() * thresholds[channel];
        SplitFunction::Default {
            first: first,
            second: second,
            channel: channel,
            threshold: threshold,
        }
    }

    pub fn random_map_class<R: Rng>(config: &LearnerConfig, rng: &mut R) -> SplitFunction {
        let offset = config.random_offset(rng);
        SplitFunction::MapClass {
            offset: offset,
            class: rng.gen_range(0..2),
            stride: config.stride,
        }
    }

    /// The target index is drawn from [1, 2^depth - 2]. `depth` has to be at least 2.
    pub fn random_node_descendant<R: Rng>(config: &LearnerConfig, depth: usize, rng: &mut R) -> SplitFunction {
        let offset = config.random_offset(rng);
        let count = 1u64.checked_shl(depth as u32).unwrap_or(::std::u64::MAX).saturating_sub(2);
        SplitFunction::NodeDescendant {
            offset: offset,
            node_index: rng.gen_range(0..max!(count, 1)) + 1,
            stride: config.stride,
        }
    }

    /// The step budget is drawn from [1, min(depth - 1, configured threshold)].
    pub fn random_ancestor_pair<R: Rng>(config: &LearnerConfig, depth: usize, rng: &mut R) -> SplitFunction {
        let first = config.random_offset(rng);
        let second = config.random_offset(rng);
        let bound = max!(min!(depth.saturating_sub(1), config.ancestor_pair_threshold), 1);
        SplitFunction::AncestorPair {
            first: first,
            second: second,
            max_steps: rng.gen_range(0..bound) + 1,
            stride: config.stride,
        }
    }

    pub fn random_offset_similarity<R: Rng>(config: &LearnerConfig, rng: &mut R) -> SplitFunction {
        let first = config.random_offset(rng);
        let second = config.random_offset(rng);
        SplitFunction::OffsetSimilarityPair {
            first: first,
            second: second,
            threshold: rng.gen::<f64>(),
            sigma: config.offset_similarity_sigma,
            stride: config.stride,
        }
    }

    /// Creates a random split function for a node at `depth`.
    ///
    /// At the root only pixel differences are used. Deeper, an entangled
    /// function is chosen with probability `entanglement_ratio`: at depth 1
    /// only the map class function makes sense (the neighbours' nodes have no
    /// ancestors yet), from depth 2 on any enabled kind is drawn uniformly.
    pub fn random<R: Rng>(config: &LearnerConfig, depth: usize, thresholds: &[f64], rng: &mut R) -> SplitFunction {
        if depth < 1 || rng.gen::<f64>() > config.entanglement_ratio || !config.entanglement ||
           config.split_kinds.is_empty() {
            return SplitFunction::random_default(config, thresholds, rng);
        }
        if depth < 2 {
            if config.split_kinds.contains(&SplitKind::MapClass) {
                return SplitFunction::random_map_class(config, rng);
            }
            return SplitFunction::random_default(config, thresholds, rng);
        }
        match config.split_kinds[rng.gen_range(0..config.split_kinds.len())] {
            SplitKind::MapClass => SplitFunction::random_map_class(config, rng),
            SplitKind::NodeDescendant => SplitFunction::random_node_descendant(config, depth, rng),
            SplitKind::AncestorPair => SplitFunction::random_ancestor_pair(config, depth, rng),
            SplitKind::OffsetSimilarityPair => SplitFunction::random_offset_similarity(config, rng),
        }
    }
}

/// Names of the split functions, ordered by `kind_index`
pub const KIND_NAMES: [&'static str; 5] = ["Default", "MapClass", "NodeDescendant", "AncestorPair",
                                           "OffsetSimilarityPair"];

/// `config.num_split_functions` random candidates for a node at `depth`
pub fn random_candidates<R: Rng>(config: &LearnerConfig,
                                 depth: usize,
                                 thresholds: &[f64],
                                 rng: &mut R)
                                 -> Vec<SplitFunction> {
    (0..config.num_split_functions).map(|_| SplitFunction::random(config, depth, thresholds, rng)).collect()
}

impl fmt::Display for SplitFunction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: ", self.name())?;
        match *self {
            SplitFunction::Default { first, second, channel, threshold } => {
                write!(f,
                       "[{},{}] - [{},{}] < {:.3}, channel {}",
                       first[0],
                       first[1],
                       second[0],
                       second[1],
                       threshold,
                       channel)
            }
            SplitFunction::MapClass { offset, class, .. } => {
                write!(f, "[{},{}], class {}", offset[0], offset[1], class)
            }
            SplitFunction::NodeDescendant { offset, node_index, .. } => {
                write!(f, "[{},{}], node {}", offset[0], offset[1], node_index)
            }
            SplitFunction::AncestorPair { first, second, max_steps, .. } => {
                write!(f,
                       "[{},{}] [{},{}], steps {}",
                       first[0],
                       first[1],
                       second[0],
                       second[1],
                       max_steps)
            }
            SplitFunction::OffsetSimilarityPair { first, second, threshold, sigma, .. } => {
                write!(f,
                       "[{},{}] [{},{}] < {:.3}, sigma {}",
                       first[0],
                       first[1],
                       second[0],
                       second[1],
                       threshold,
                       sigma)
            }
        }
    }
}
