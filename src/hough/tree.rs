//! Hough trees, stored as an arena of nodes.
//!
//! Nodes refer to their children and their parent by their position in the
//! arena (`NodeId`). Besides that every node carries its breadth first index
//! (root = 0, left child = 2i+1, right child = 2i+2), which is what
//! split functions and the textual dump refer to.

use std::fmt;

use hough::patch::Offset;
use hough::split::{Split, SplitFunction};

/// Position of a node within the arena of its tree.
pub type NodeId = usize;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum NodeKind {
    Split {
        function: SplitFunction,
        left: NodeId,
        right: NodeId,
    },
    Leaf,
    /// Created, but not expanded yet. Only exists while a tree is trained.
    Pending,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Node {
    pub depth: usize,
    /// Breadth first index
    pub index: u64,
    /// [p0, p1] of the training patches reaching this node
    pub probabilities: [f64; 2],
    /// Number of background and object training patches reaching this node
    pub counts: [usize; 2],
    /// Offsets of all object patches. Only kept by leaves.
    pub offsets: Vec<Offset>,
    pub offset_mean: [f64; 2],
    pub parent: Option<NodeId>,
    pub kind: NodeKind,
}

impl Node {
    /// Creates a node which still has to be expanded.
    pub fn pending(depth: usize,
                   index: u64,
                   probabilities: [f64; 2],
                   counts: [usize; 2],
                   offset_mean: [f64; 2],
                   parent: Option<NodeId>)
                   -> Node {
        Node {
            depth: depth,
            index: index,
            probabilities: probabilities,
            counts: counts,
            offsets: vec![],
            offset_mean: offset_mean,
            parent: parent,
            kind: NodeKind::Pending,
        }
    }

    pub fn is_leaf(&self) -> bool {
        match self.kind {
            NodeKind::Leaf => true,
            _ => false,
        }
    }

    /// The most probable class. Ties count as object.
    pub fn map_class(&self) -> usize {
        if self.probabilities[0] > self.probabilities[1] { 0 } else { 1 }
    }

    /// Number of object patches of a leaf
    pub fn count1(&self) -> usize {
        self.counts[1]
    }

    /// Turns this node into a leaf storing `offsets`.
    pub fn make_leaf(&mut self, probabilities: [f64; 2], offsets: Vec<Offset>) {
        self.probabilities = probabilities;
        self.offsets = offsets;
        self.kind = NodeKind::Leaf;
    }
}

/// A trained hough tree
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    /// Wraps an arena of nodes. The root has to be the first node.
    ///
    /// # Panics
    /// If a node was not expanded or a link points outside of the arena.
    pub fn from_nodes(nodes: Vec<Node>) -> Tree {
        assert!(!nodes.is_empty(), "A tree needs a root");
        for n in nodes.iter() {
            match n.kind {
                NodeKind::Pending => panic!("Node {} was never expanded", n.index),
                NodeKind::Split { left, right, .. } => {
                    assert!(left < nodes.len() && right < nodes.len());
                }
                NodeKind::Leaf => (),
            }
        }
        Tree { nodes: nodes }
    }

    pub fn root(&self) -> NodeId {
        0
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// A tree is degenerate if its root is a leaf, i.e. it never split anything.
    pub fn is_degenerate(&self) -> bool {
        self.nodes[0].is_leaf()
    }

    /// Depth of the deepest node
    pub fn depth(&self) -> usize {
        self.nodes.iter().map(|n| n.depth).max().unwrap_or(0)
    }

    pub fn leaves<'a>(&'a self) -> impl Iterator<Item = &'a Node> + 'a {
        self.nodes.iter().filter(|n| n.is_leaf())
    }

    /// Child of the split node `id` in `direction`.
    ///
    /// # Panics
    /// If `id` is a leaf.
    pub fn child(&self, id: NodeId, direction: Split) -> NodeId {
        match self.nodes[id].kind {
            NodeKind::Split { left, right, .. } => {
                match direction {
                    Split::Left => left,
                    Split::Right => right,
                }
            }
            _ => unreachable!("Node {} has no children", self.nodes[id].index),
        }
    }

    /// Adds the number of split functions of each kind used per depth to `stats`.
    /// `stats[depth][kind]` where kind is `SplitFunction::kind_index`.
    pub fn split_statistics(&self, stats: &mut Vec<[usize; 5]>) {
        for n in self.nodes.iter() {
            if let NodeKind::Split { ref function, .. } = n.kind {
                while stats.len() <= n.depth {
                    stats.push([0; 5]);
                }
                stats[n.depth][function.kind_index()] += 1;
            }
        }
    }

    fn subtree_eq(&self, a: NodeId, other: &Tree, b: NodeId) -> bool {
        let (na, nb) = (&self.nodes[a], &other.nodes[b]);
        if na.depth != nb.depth || na.index != nb.index || na.probabilities != nb.probabilities ||
           na.counts != nb.counts || na.offsets != nb.offsets ||
           na.offset_mean != nb.offset_mean {
            return false;
        }
        match (&na.kind, &nb.kind) {
            (&NodeKind::Leaf, &NodeKind::Leaf) => true,
            (&NodeKind::Split { function: ref fa, left: la, right: ra },
             &NodeKind::Split { function: ref fb, left: lb, right: rb }) => {
                fa == fb && self.subtree_eq(la, other, lb) && self.subtree_eq(ra, other, rb)
            }
            _ => false,
        }
    }

    fn fmt_node(&self, f: &mut fmt::Formatter, id: NodeId, side: &str) -> fmt::Result {
        let n = &self.nodes[id];
        for _ in 0..n.depth {
            write!(f, "  ")?;
        }
        write!(f,
               "{}-- {}; P(0)={:.3}, P(1)={:.3}; ",
               side,
               n.index,
               n.probabilities[0],
               n.probabilities[1])?;
        match n.kind {
            NodeKind::Split { ref function, left, right } => {
                writeln!(f, "{}", function)?;
                self.fmt_node(f, left, "L")?;
                self.fmt_node(f, right, "R")
            }
            _ => {
                writeln!(f,
                         "leaf: {} votes, mean offset [{:.1},{:.1}]",
                         n.count1(),
                         n.offset_mean[0],
                         n.offset_mean[1])
            }
        }
    }
}

/// Structural equality: compares the trees from their roots on and ignores
/// where a node is placed in the arena (and therefore the parent links).
impl PartialEq for Tree {
    fn eq(&self, other: &Tree) -> bool {
        self.subtree_eq(0, other, 0)
    }
}

impl fmt::Display for Tree {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.fmt_node(f, 0, "S")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hough::testutil::{full_tree, full_tree_preorder};

    #[test]
    fn test_structure() {
        let tree = Tree::from_nodes(full_tree(2));
        assert_eq!(tree.len(), 7);
        assert_eq!(tree.depth(), 2);
        assert_eq!(tree.leaves().count(), 4);
        assert!(!tree.is_degenerate());
        for (id, n) in tree.nodes().iter().enumerate() {
            if let NodeKind::Split { left, right, .. } = n.kind {
                assert_eq!(tree.node(left).index, 2 * n.index + 1);
                assert_eq!(tree.node(right).index, 2 * n.index + 2);
                assert_eq!(tree.node(left).depth, n.depth + 1);
                assert_eq!(tree.node(left).parent, Some(id));
                assert_eq!(tree.child(id, Split::Right), right);
            }
        }
    }

    #[test]
    fn test_structural_eq() {
        let tree = Tree::from_nodes(full_tree(2));
        // same tree, arena filled in pre-order
        let preorder = Tree::from_nodes(full_tree_preorder(2));
        assert_eq!(preorder.node(2).index, 3);
        assert!(tree == preorder);

        let mut nodes = full_tree(2);
        nodes[4].offsets.push([1, 1]);
        assert!(tree != Tree::from_nodes(nodes));
    }

    #[test]
    fn test_display() {
        let tree = Tree::from_nodes(full_tree(1));
        let text = format!("{}", tree);
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("S-- 0;"));
        assert!(lines[1].starts_with("  L-- 1;"));
        assert!(lines[2].starts_with("  R-- 2;"));
        assert!(lines[2].contains("leaf"));
    }

    #[test]
    fn test_split_statistics() {
        let tree = Tree::from_nodes(full_tree(2));
        let mut stats = vec![];
        tree.split_statistics(&mut stats);
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0][0], 1);
        assert_eq!(stats[1][0], 2);
    }

    #[test]
    #[should_panic]
    fn test_pending_rejected() {
        let mut nodes = full_tree(1);
        nodes[1].kind = NodeKind::Pending;
        Tree::from_nodes(nodes);
    }
}
