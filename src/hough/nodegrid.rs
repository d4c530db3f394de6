//! The per tree node assignment grid.
//!
//! While a tree is trained or evaluated, every grid cell points to the node
//! its record currently sits in. Entangled split functions read this state
//! for neighbouring cells, so the grid has to stay unchanged while one level
//! of the tree is processed: all moves of a level are collected and written
//! with `commit` once the level is complete. Each cell is written at most once
//! per level and only for the record owning it.

use hough::patch::{Offset, PatchRecord};
use hough::tree::{Node, NodeId};

#[derive(Debug, Clone)]
struct Layer {
    dims: [usize; 2],
    cells: Vec<NodeId>,
}

/// Current node of every grid cell, one layer per image (or scaled image).
/// Owned by exactly one tree traversal.
#[derive(Debug, Clone)]
pub struct NodeGrid {
    layers: Vec<Layer>,
}

impl NodeGrid {
    /// Grid without any layer. Every lookup falls outside of it.
    pub fn empty() -> NodeGrid {
        NodeGrid { layers: vec![] }
    }

    /// Creates one layer per image referenced by `records`, with every
    /// cell pointing to `node`.
    pub fn new(records: &[PatchRecord], node: NodeId) -> NodeGrid {
        let mut layers: Vec<Layer> = vec![];
        for rec in records.iter() {
            while layers.len() <= rec.image {
                layers.push(Layer {
                    dims: [0, 0],
                    cells: vec![],
                });
            }
            let layer = &mut layers[rec.image];
            if layer.cells.is_empty() {
                layer.dims = rec.grid_dims;
                layer.cells = vec![node; rec.grid_dims[0] * rec.grid_dims[1]];
            }
        }
        NodeGrid { layers: layers }
    }

    /// Current node at `pos` of layer `image`
    pub fn get(&self, image: usize, pos: [usize; 2]) -> Option<NodeId> {
        self.layers.get(image).and_then(|l| {
            if pos[0] >= l.dims[0] || pos[1] >= l.dims[1] {
                return None;
            }
            Some(l.cells[pos[1] * l.dims[0] + pos[0]])
        })
    }

    /// Current node of a record
    pub fn current(&self, record: &PatchRecord) -> Option<NodeId> {
        self.get(record.image, record.position)
    }

    pub fn set(&mut self, image: usize, pos: [usize; 2], node: NodeId) {
        if let Some(l) = self.layers.get_mut(image) {
            if pos[0] < l.dims[0] && pos[1] < l.dims[1] {
                l.cells[pos[1] * l.dims[0] + pos[0]] = node;
            }
        }
    }

    /// Points every cell to `node`.
    pub fn fill(&mut self, node: NodeId) {
        for l in self.layers.iter_mut() {
            for c in l.cells.iter_mut() {
                *c = node;
            }
        }
    }

    /// Writes the moves of one complete level.
    /// `moves` holds (index into `records`, new node).
    pub fn commit(&mut self, records: &[PatchRecord], moves: &[(usize, NodeId)]) {
        for &(rec, node) in moves.iter() {
            let rec = &records[rec];
            self.set(rec.image, rec.position, node);
        }
    }
}

/// Read access to the tree (or the tree in progress) and its node grid,
/// as seen by split functions.
#[derive(Clone, Copy)]
pub struct GridView<'a> {
    nodes: &'a [Node],
    grid: &'a NodeGrid,
}

impl<'a> GridView<'a> {
    pub fn new(nodes: &'a [Node], grid: &'a NodeGrid) -> GridView<'a> {
        GridView {
            nodes: nodes,
            grid: grid,
        }
    }

    pub fn node(&self, id: NodeId) -> &'a Node {
        &self.nodes[id]
    }

    /// Current node of the cell reached from `record` by a pixel `offset`.
    /// The offset is converted into grid cells using `stride`.
    /// Returns None if that cell is outside of the grid.
    pub fn neighbour(&self, record: &PatchRecord, offset: Offset, stride: [u32; 2]) -> Option<NodeId> {
        let cells = [to_cells(offset[0], stride[0]), to_cells(offset[1], stride[1])];
        record.neighbour(cells).and_then(|pos| self.grid.get(record.image, pos))
    }

    /// Iterates over the ancestors of `id`, beginning with its parent.
    pub fn ancestors(&self, id: NodeId) -> Ancestors<'a> {
        Ancestors {
            nodes: self.nodes,
            current: self.nodes[id].parent,
        }
    }

    /// Walks upwards from `a` and `b` (first equalizing their depth,
    /// then in lock step) and returns true if both meet in a common
    /// ancestor before more than `max_steps` steps were made.
    pub fn meet_within(&self, a: NodeId, b: NodeId, max_steps: usize) -> bool {
        let (mut a, mut b) = (a, b);
        let mut steps = 0;
        while self.nodes[a].depth > self.nodes[b].depth {
            match self.nodes[a].parent {
                Some(p) => a = p,
                None => return false,
            }
            steps += 1;
        }
        while self.nodes[b].depth > self.nodes[a].depth {
            match self.nodes[b].parent {
                Some(p) => b = p,
                None => return false,
            }
            steps += 1;
        }
        while let Some(pa) = self.nodes[a].parent {
            a = pa;
            b = match self.nodes[b].parent {
                Some(pb) => pb,
                None => return false,
            };
            if a == b {
                return true;
            }
            steps += 1;
            if steps > max_steps {
                return false;
            }
        }
        false
    }
}

/// Pixel offset => cell offset
#[inline]
fn to_cells(offset: i32, stride: u32) -> i64 {
    (offset as f64 / max!(stride, 1) as f64).round() as i64
}

pub struct Ancestors<'a> {
    nodes: &'a [Node],
    current: Option<NodeId>,
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = &'a Node;
    fn next(&mut self) -> Option<&'a Node> {
        self.current.map(|id| {
            let node = &self.nodes[id];
            self.current = node.parent;
            node
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hough::testutil::{full_tree, grid_records};

    #[test]
    fn test_grid_layers() {
        let mut records = grid_records(3, 2, 0);
        records.extend(grid_records(2, 2, 1));
        let mut grid = NodeGrid::new(&records, 0);
        assert_eq!(grid.get(0, [2, 1]), Some(0));
        assert_eq!(grid.get(0, [3, 1]), None);
        assert_eq!(grid.get(1, [1, 1]), Some(0));
        assert_eq!(grid.get(2, [0, 0]), None);
        grid.set(0, [2, 1], 4);
        assert_eq!(grid.current(&records[5]), Some(4));
        grid.commit(&records, &[(0, 7), (6, 3)]);
        assert_eq!(grid.get(0, [0, 0]), Some(7));
        assert_eq!(grid.get(1, [0, 0]), Some(3));
        grid.fill(1);
        assert_eq!(grid.get(0, [2, 1]), Some(1));
        assert_eq!(NodeGrid::empty().get(0, [0, 0]), None);
    }

    #[test]
    fn test_neighbour_lookup() {
        let records = grid_records(3, 3, 0);
        let nodes = full_tree(2);
        let mut grid = NodeGrid::new(&records, 0);
        grid.set(0, [2, 1], 2);
        let view = GridView::new(&nodes, &grid);
        // center record (1,1), stride 8: 8px = one cell, 5px rounds to one cell
        assert_eq!(view.neighbour(&records[4], [8, 0], [8, 8]), Some(2));
        assert_eq!(view.neighbour(&records[4], [5, 0], [8, 8]), Some(2));
        assert_eq!(view.neighbour(&records[4], [3, 0], [8, 8]), Some(0));
        assert_eq!(view.neighbour(&records[4], [16, 0], [8, 8]), None);
        assert_eq!(view.neighbour(&records[4], [0, -16], [8, 8]), None);
    }

    #[test]
    fn test_ancestors() {
        let nodes = full_tree(3);
        let grid = NodeGrid::empty();
        let view = GridView::new(&nodes, &grid);
        let idx: Vec<_> = view.ancestors(7).map(|n| n.index).collect();
        assert_eq!(idx, vec![3, 1, 0]);
        assert_eq!(view.ancestors(0).count(), 0);
    }

    #[test]
    fn test_meet_within() {
        // full tree: node id == breadth first index
        let nodes = full_tree(3);
        let grid = NodeGrid::empty();
        let view = GridView::new(&nodes, &grid);
        // siblings meet in their parent right away
        assert!(view.meet_within(7, 8, 0));
        // 7 and 14 meet in the root after two lock steps
        assert!(view.meet_within(7, 14, 2));
        assert!(!view.meet_within(7, 14, 1));
        // equalizing the depth counts as a step
        assert!(view.meet_within(7, 6, 2));
        assert!(!view.meet_within(7, 6, 1));
        // same node: its parent is the first common ancestor
        assert!(view.meet_within(3, 3, 0));
        // the root has no ancestor at all
        assert!(!view.meet_within(0, 0, 10));
    }
}
