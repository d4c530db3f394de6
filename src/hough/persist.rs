//! Binary format of a hough forest.
//!
//! All numbers are little endian.
//!
//! ```text
//! "HGHF" version:u16 patch_width:u32 patch_height:u32 channels:u32 trees:u32
//! tree*            (nodes in pre-order)
//! descriptor       (nine flags as u8 and hog_bins:u32)
//!
//! node   := kind:u8 depth:u32 index:u64 p0:f64 p1:f64 count0:u64 count1:u64
//!           mean_x:f64 mean_y:f64 (split | leaf)
//! leaf   := n:u32 (x:i32 y:i32)^n
//! split  := function node(left) node(right)
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use config::FeatureDescriptor;
use errors::*;
use hough::houghforest::HoughForest;
use hough::patch::Offset;
use hough::split::SplitFunction;
use hough::tree::{Node, NodeId, NodeKind, Tree};

type End = LittleEndian;

const MAGIC: &'static [u8; 4] = b"HGHF";
const VERSION: u16 = 1;

const LEAF: u8 = 0;
const SPLIT: u8 = 1;

/// Deeper trees are rejected while reading
const MAX_TREE_DEPTH: usize = 512;

macro_rules! invalid_format {
    ($($arg:tt)*) => (bail!(ErrorKind::InvalidForestFormat(format!($($arg)*))))
}

impl HoughForest {
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(MAGIC)?;
        w.write_u16::<End>(VERSION)?;
        let [pw, ph] = self.patch_size();
        w.write_u32::<End>(pw)?;
        w.write_u32::<End>(ph)?;
        w.write_u32::<End>(self.channels() as u32)?;
        w.write_u32::<End>(self.trees().len() as u32)?;
        for t in self.trees().iter() {
            write_node(w, t, t.root())?;
        }
        write_descriptor(w, self.descriptor())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<HoughForest> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            invalid_format!("not a hough forest");
        }
        let version = r.read_u16::<End>()?;
        if version != VERSION {
            invalid_format!("unsupported version {}", version);
        }
        let patch_size = [r.read_u32::<End>()?, r.read_u32::<End>()?];
        let channels = r.read_u32::<End>()? as usize;
        if channels == 0 {
            invalid_format!("a forest needs at least one channel");
        }
        let count = r.read_u32::<End>()?;
        if count == 0 {
            invalid_format!("a forest needs at least one tree");
        }
        let mut trees = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let mut nodes = vec![];
            read_node(r, &mut nodes, None, channels)?;
            trees.push(Tree::from_nodes(nodes));
        }
        let descriptor = read_descriptor(r)?;
        Ok(HoughForest::new(trees, patch_size, channels, descriptor))
    }

    /// Stores the forest in the binary format.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        self.write_to(&mut w)?;
        w.flush()?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<HoughForest> {
        let mut r = BufReader::new(File::open(path)?);
        HoughForest::read_from(&mut r)
    }
}

fn write_node<W: Write>(w: &mut W, tree: &Tree, id: NodeId) -> Result<()> {
    let n = tree.node(id);
    let kind = match n.kind {
        NodeKind::Split { .. } => SPLIT,
        NodeKind::Leaf => LEAF,
        NodeKind::Pending => unreachable!("trained trees have no pending nodes"),
    };
    w.write_u8(kind)?;
    w.write_u32::<End>(n.depth as u32)?;
    w.write_u64::<End>(n.index)?;
    w.write_f64::<End>(n.probabilities[0])?;
    w.write_f64::<End>(n.probabilities[1])?;
    w.write_u64::<End>(n.counts[0] as u64)?;
    w.write_u64::<End>(n.counts[1] as u64)?;
    w.write_f64::<End>(n.offset_mean[0])?;
    w.write_f64::<End>(n.offset_mean[1])?;
    match n.kind {
        NodeKind::Split { ref function, left, right } => {
            write_function(w, function)?;
            write_node(w, tree, left)?;
            write_node(w, tree, right)
        }
        _ => {
            w.write_u32::<End>(n.offsets.len() as u32)?;
            for o in n.offsets.iter() {
                write_offset(w, *o)?;
            }
            Ok(())
        }
    }
}

fn read_node<R: Read>(r: &mut R,
                      nodes: &mut Vec<Node>,
                      parent: Option<NodeId>,
                      channels: usize)
                      -> Result<NodeId> {
    let kind = r.read_u8()?;
    let depth = r.read_u32::<End>()? as usize;
    if depth > MAX_TREE_DEPTH {
        invalid_format!("tree deeper than {}", MAX_TREE_DEPTH);
    }
    if let Some(p) = parent {
        if depth != nodes[p].depth + 1 {
            invalid_format!("depth {} below a node of depth {}", depth, nodes[p].depth);
        }
    }
    let index = r.read_u64::<End>()?;
    let probabilities = [r.read_f64::<End>()?, r.read_f64::<End>()?];
    let counts = [r.read_u64::<End>()? as usize, r.read_u64::<End>()? as usize];
    let mean = [r.read_f64::<End>()?, r.read_f64::<End>()?];
    nodes.push(Node::pending(depth, index, probabilities, counts, mean, parent));
    let id = nodes.len() - 1;
    match kind {
        SPLIT => {
            let function = read_function(r, channels)?;
            let left = read_node(r, nodes, Some(id), channels)?;
            let right = read_node(r, nodes, Some(id), channels)?;
            nodes[id].kind = NodeKind::Split {
                function: function,
                left: left,
                right: right,
            };
        }
        LEAF => {
            let len = r.read_u32::<End>()?;
            let mut offsets = Vec::with_capacity(min!(len, 1 << 16) as usize);
            for _ in 0..len {
                offsets.push(read_offset(r)?);
            }
            nodes[id].make_leaf(probabilities, offsets);
        }
        k => invalid_format!("unknown node kind {}", k),
    }
    Ok(id)
}

fn write_offset<W: Write>(w: &mut W, o: Offset) -> Result<()> {
    w.write_i32::<End>(o[0])?;
    w.write_i32::<End>(o[1])?;
    Ok(())
}

fn read_offset<R: Read>(r: &mut R) -> Result<Offset> {
    Ok([r.read_i32::<End>()?, r.read_i32::<End>()?])
}

fn write_pair<W: Write>(w: &mut W, v: [u32; 2]) -> Result<()> {
    w.write_u32::<End>(v[0])?;
    w.write_u32::<End>(v[1])?;
    Ok(())
}

fn read_pair<R: Read>(r: &mut R) -> Result<[u32; 2]> {
    Ok([r.read_u32::<End>()?, r.read_u32::<End>()?])
}

fn write_function<W: Write>(w: &mut W, f: &SplitFunction) -> Result<()> {
    w.write_u8(f.kind_index() as u8)?;
    match *f {
        SplitFunction::Default { first, second, channel, threshold } => {
            write_pair(w, first)?;
            write_pair(w, second)?;
            w.write_u32::<End>(channel as u32)?;
            w.write_f64::<End>(threshold)?;
        }
        SplitFunction::MapClass { offset, class, stride } => {
            write_offset(w, offset)?;
            w.write_u8(class as u8)?;
            write_pair(w, stride)?;
        }
        SplitFunction::NodeDescendant { offset, node_index, stride } => {
            write_offset(w, offset)?;
            w.write_u64::<End>(node_index)?;
            write_pair(w, stride)?;
        }
        SplitFunction::AncestorPair { first, second, max_steps, stride } => {
            write_offset(w, first)?;
            write_offset(w, second)?;
            w.write_u32::<End>(max_steps as u32)?;
            write_pair(w, stride)?;
        }
        SplitFunction::OffsetSimilarityPair { first, second, threshold, sigma, stride } => {
            write_offset(w, first)?;
            write_offset(w, second)?;
            w.write_f64::<End>(threshold)?;
            w.write_f64::<End>(sigma)?;
            write_pair(w, stride)?;
        }
    }
    Ok(())
}

fn read_function<R: Read>(r: &mut R, channels: usize) -> Result<SplitFunction> {
    let f = match r.read_u8()? {
        0 => {
            let first = read_pair(r)?;
            let second = read_pair(r)?;
            let channel = r.read_u32::<End>()? as usize;
            if channel >= channels {
                invalid_format!("pixel test on channel {} of {}", channel, channels);
            }
            SplitFunction::Default {
                first: first,
                second: second,
                channel: channel,
                threshold: r.read_f64::<End>()?,
            }
        }
        1 => {
            SplitFunction::MapClass {
                offset: read_offset(r)?,
                class: r.read_u8()? as usize,
                stride: read_pair(r)?,
            }
        }
        2 => {
            SplitFunction::NodeDescendant {
                offset: read_offset(r)?,
                node_index: r.read_u64::<End>()?,
                stride: read_pair(r)?,
            }
        }
        3 => {
            SplitFunction::AncestorPair {
                first: read_offset(r)?,
                second: read_offset(r)?,
                max_steps: r.read_u32::<End>()? as usize,
                stride: read_pair(r)?,
            }
        }
        4 => {
            SplitFunction::OffsetSimilarityPair {
                first: read_offset(r)?,
                second: read_offset(r)?,
                threshold: r.read_f64::<End>()?,
                sigma: r.read_f64::<End>()?,
                stride: read_pair(r)?,
            }
        }
        t => invalid_format!("unknown split function {}", t),
    };
    Ok(f)
}

fn write_descriptor<W: Write>(w: &mut W, d: &FeatureDescriptor) -> Result<()> {
    for &flag in [d.is_color,
                  d.convert_to_lab,
                  d.first_derivative,
                  d.absolute_first_derivative,
                  d.second_derivative,
                  d.absolute_second_derivative,
                  d.hog,
                  d.min_max,
                  d.use_absolute]
        .iter() {
        w.write_u8(flag as u8)?;
    }
    w.write_u32::<End>(d.hog_bins)?;
    Ok(())
}

fn read_descriptor<R: Read>(r: &mut R) -> Result<FeatureDescriptor> {
    let mut flags = [false; 9];
    for flag in flags.iter_mut() {
        *flag = match r.read_u8()? {
            0 => false,
            1 => true,
            v => invalid_format!("invalid flag {}", v),
        };
    }
    Ok(FeatureDescriptor {
        is_color: flags[0],
        convert_to_lab: flags[1],
        first_derivative: flags[2],
        absolute_first_derivative: flags[3],
        second_derivative: flags[4],
        absolute_second_derivative: flags[5],
        hog: flags[6],
        min_max: flags[7],
        use_absolute: flags[8],
        hog_bins: r.read_u32::<End>()?,
    })
}
