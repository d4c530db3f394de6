//! Synthetic records and trees shared by the unit tests.

use std::sync::Arc;

use hough::patch::{Offset, PatchRecord, Truth};
use hough::sample::offset_mean;
use hough::split::SplitFunction;
use hough::tree::{Node, NodeKind};
use types::{FeatureTensor, PatchGrid};

/// One record per label in a single row grid. `Some(offset)` is an object patch.
pub fn labeled_records(labels: &[Option<Offset>]) -> Vec<PatchRecord> {
    let tensor = Arc::new(FeatureTensor::new(4 * labels.len() as u32, 4, 1));
    let grid = PatchGrid::new(tensor, [4, 4], [4, 4]).unwrap();
    let mut records = grid.records(0);
    for (rec, label) in records.iter_mut().zip(labels.iter()) {
        rec.truth = Some(match *label {
            Some(offset) => Truth::Object { offset: offset },
            None => Truth::Background,
        });
    }
    records
}

/// Unlabeled records of a `w` x `h` grid with patch size and stride 4.
pub fn grid_records(w: u32, h: u32, image: usize) -> Vec<PatchRecord> {
    let tensor = Arc::new(FeatureTensor::new(4 * w, 4 * h, 1));
    PatchGrid::new(tensor, [4, 4], [4, 4]).unwrap().records(image)
}

/// 16 x 16 image sliced into a 4 x 4 grid (patch size and stride 4).
/// The patches of the two left columns show a ramp (pixel value 10 * x
/// within the patch), the others are flat.
pub fn ramp_grid() -> PatchGrid {
    let tensor = FeatureTensor::from_fn(16, 16, 1, |x, _, _| if x < 8 { 10.0 * (x % 4) as f32 } else { 0.0 });
    PatchGrid::new(Arc::new(tensor), [4, 4], [4, 4]).unwrap()
}

/// Records of `ramp_grid`. The ramp patches are objects voting with
/// offset (2, 2), all others are background.
pub fn ramp_records() -> Vec<PatchRecord> {
    let mut records = ramp_grid().records(0);
    for rec in records.iter_mut() {
        rec.truth = Some(if rec.position[0] < 2 {
            Truth::Object { offset: [2, 2] }
        } else {
            Truth::Background
        });
    }
    records
}

fn test_node(index: u64, depth: usize, parent: Option<usize>, is_leaf: bool) -> Node {
    let probabilities = if index == 0 {
        [0.5, 0.5]
    } else if index % 2 == 1 {
        [0.8, 0.2]
    } else {
        [0.2, 0.8]
    };
    let mut node = Node::pending(depth, index, probabilities, [4, 1], [0.0, 0.0], parent);
    if is_leaf {
        let offsets = vec![[index as i32, 1], [1, 1]];
        node.offset_mean = offset_mean(&offsets);
        node.counts = [4, offsets.len()];
        node.make_leaf(probabilities, offsets);
    }
    node
}

fn test_split(index: u64) -> SplitFunction {
    SplitFunction::Default {
        first: [0, 0],
        second: [1, 0],
        channel: 0,
        threshold: index as f64,
    }
}

/// Complete tree whose leaves have depth `depth`, stored breadth first
/// (so the arena position equals the breadth first index).
pub fn full_tree(depth: usize) -> Vec<Node> {
    let count = (1usize << (depth + 1)) - 1;
    let mut nodes = Vec::with_capacity(count);
    for id in 0..count {
        let d = (64 - (id as u64 + 1).leading_zeros() - 1) as usize;
        let parent = if id == 0 { None } else { Some((id - 1) / 2) };
        let mut node = test_node(id as u64, d, parent, d == depth);
        if d < depth {
            node.kind = NodeKind::Split {
                function: test_split(id as u64),
                left: 2 * id + 1,
                right: 2 * id + 2,
            };
        }
        nodes.push(node);
    }
    nodes
}

/// The same tree as `full_tree`, but the arena is filled in pre-order.
pub fn full_tree_preorder(depth: usize) -> Vec<Node> {
    fn build(nodes: &mut Vec<Node>, index: u64, d: usize, depth: usize, parent: Option<usize>) -> usize {
        let id = nodes.len();
        nodes.push(test_node(index, d, parent, d == depth));
        if d < depth {
            let left = build(nodes, 2 * index + 1, d + 1, depth, Some(id));
            let right = build(nodes, 2 * index + 2, d + 1, depth, Some(id));
            nodes[id].kind = NodeKind::Split {
                function: test_split(index),
                left: left,
                right: right,
            };
        }
        id
    }
    let mut nodes = vec![];
    build(&mut nodes, 0, 0, depth, None);
    nodes
}
