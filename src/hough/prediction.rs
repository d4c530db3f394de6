//! Voting for object centers with a trained forest.
//!
//! Every patch of an image descends each tree and, once it reached a leaf,
//! votes for `center + offset` for every offset stored in the leaf. Maxima of
//! the (smoothed) vote maps are object centers; the patches that voted for a
//! maximum outline the object (backprojection).

use imageproc::filter::gaussian_blur_f32;
use rayon::prelude::*;
use std::sync::Arc;

use config::PredictorConfig;
use errors::*;
use hough::houghforest::{run_in_pool, CancelToken, HoughForest};
use hough::nodegrid::{GridView, NodeGrid};
use hough::patch::PatchRecord;
use hough::tree::{NodeId, NodeKind, Tree};
use types::{FeatureTensor, FloatImage, PatchGrid, Rect};

/// Accumulated votes of one scale, in the coordinates of the unscaled image
pub type VoteMap = FloatImage;

/// A patch becomes part of an object if more of its votes hit the window
/// around the maximum.
pub const MIN_SUPPORT: usize = 5;

/// Lets every record descend `tree` and returns the leaf each one reached.
///
/// The records move level by level: all records still at a split node
/// evaluate their split function against the node grid of the previous
/// level, then all of them move at once.
///
/// # Arguments
/// * `records` - all patches of the image(s)
/// * `stride` - patch distance of `records`, if it differs from the training stride
pub fn descend_tree(tree: &Tree,
                    records: &[PatchRecord],
                    stride: Option<[u32; 2]>,
                    cancel: &CancelToken)
                    -> Result<Vec<NodeId>> {
    let root = tree.root();
    let mut grid = NodeGrid::new(records, root);
    let mut current = vec![root; records.len()];
    let mut active: Vec<usize> = if tree.node(root).is_leaf() {
        vec![]
    } else {
        (0..records.len()).collect()
    };
    while !active.is_empty() {
        cancel.check()?;
        let moves: Vec<(usize, NodeId)> = {
            let view = GridView::new(tree.nodes(), &grid);
            active.iter()
                .map(|&i| {
                    let id = current[i];
                    let direction = match tree.node(id).kind {
                        NodeKind::Split { ref function, .. } => function.apply(&records[i], &view, stride),
                        _ => unreachable!("node {} is no split node", tree.node(id).index),
                    };
                    (i, tree.child(id, direction))
                })
                .collect()
        };
        grid.commit(records, &moves);
        active.clear();
        for &(i, id) in moves.iter() {
            current[i] = id;
            if !tree.node(id).is_leaf() {
                active.push(i);
            }
        }
    }
    Ok(current)
}

/// Adds the votes of the records which reached `leaves` in `tree`.
///
/// A leaf with `count1` object patches and probability `p1` adds
/// `p1 / count1 / scale` to `center + offset` for each of its offsets.
/// Records and offsets are given in the coordinates of the image scaled by
/// `scale`, the votes are written in unscaled coordinates.
pub fn accumulate_votes(tree: &Tree, leaves: &[NodeId], records: &[PatchRecord], scale: f64, votes: &mut VoteMap) {
    for (rec, &id) in records.iter().zip(leaves.iter()) {
        let leaf = tree.node(id);
        if leaf.count1() == 0 || leaf.offsets.is_empty() {
            continue;
        }
        let weight = (leaf.probabilities[1] / leaf.count1() as f64 / scale) as f32;
        let (w, h) = {
            let t = rec.patch.tensor();
            (t.width() as i64, t.height() as i64)
        };
        for o in leaf.offsets.iter() {
            let tx = rec.center[0] as i64 + o[0] as i64;
            let ty = rec.center[1] as i64 + o[1] as i64;
            if tx < 0 || ty < 0 || tx >= w || ty >= h {
                continue;
            }
            let x = (tx as f64 / scale) as u32;
            let y = (ty as f64 / scale) as u32;
            if x < votes.width() && y < votes.height() {
                votes.get_pixel_mut(x, y).0[0] += weight;
            }
        }
    }
}

/// Result of all trees for one scale of an image.
pub struct ScalePrediction {
    pub scale: f64,
    /// The patches of the scaled image
    pub records: Vec<PatchRecord>,
    /// `leaves[tree][record]`
    pub leaves: Vec<Vec<NodeId>>,
}

impl ScalePrediction {
    /// Vote map of size `width` x `height` (the unscaled image).
    /// Every tree votes into its own map, the maps are summed up afterwards.
    pub fn votes(&self, forest: &HoughForest, width: u32, height: u32) -> VoteMap {
        forest.trees()
            .par_iter()
            .zip(self.leaves.par_iter())
            .map(|(tree, leaves)| {
                let mut votes = VoteMap::new(width, height);
                accumulate_votes(tree, leaves, &self.records, self.scale, &mut votes);
                votes
            })
            .reduce(|| VoteMap::new(width, height), |mut a, b| {
                for (p, q) in a.pixels_mut().zip(b.pixels()) {
                    p.0[0] += q.0[0];
                }
                a
            })
    }
}

/// Smoothes every slice with a gaussian of `sigma_xy` and across the slices
/// with a gaussian of `sigma_z`. A sigma of 0 turns the respective smoothing off.
pub fn smooth_votes(slices: &[VoteMap], sigma_xy: f32, sigma_z: f32) -> Vec<VoteMap> {
    let blurred: Vec<VoteMap> = slices.iter()
        .map(|s| if sigma_xy > 0.0 {
            gaussian_blur_f32(s, sigma_xy)
        } else {
            s.clone()
        })
        .collect();
    if blurred.len() < 2 || sigma_z <= 0.0 {
        return blurred;
    }
    let radius = (3.0 * sigma_z).ceil() as i64;
    let kernel: Vec<f32> = (-radius..radius + 1)
        .map(|d| (-((d * d) as f32) / (2.0 * sigma_z * sigma_z)).exp())
        .collect();
    let (w, h) = blurred[0].dimensions();
    let n = blurred.len() as i64;
    (0..n)
        .map(|z| {
            let mut out = VoteMap::new(w, h);
            let mut norm = 0f32;
            for (k, d) in (-radius..radius + 1).enumerate() {
                let zz = z + d;
                if zz < 0 || zz >= n {
                    continue;
                }
                norm += kernel[k];
                for (p, q) in out.pixels_mut().zip(blurred[zz as usize].pixels()) {
                    p.0[0] += kernel[k] * q.0[0];
                }
            }
            for p in out.pixels_mut() {
                p.0[0] /= norm;
            }
            out
        })
        .collect()
}

/// A maximum of the vote maps
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoteMaximum {
    /// Pixel position in the unscaled image
    pub position: [u32; 2],
    /// Index of the scale (slice)
    pub slice: usize,
    pub value: f32,
}

/// The largest vote of all slices (the first one on ties), even if nobody
/// voted at all. None only for empty vote maps.
pub fn global_maximum(slices: &[VoteMap]) -> Option<VoteMaximum> {
    let mut best: Option<VoteMaximum> = None;
    for (s, slice) in slices.iter().enumerate() {
        for (x, y, p) in slice.enumerate_pixels() {
            if best.map_or(true, |b| p.0[0] > b.value) {
                best = Some(VoteMaximum {
                    position: [x, y],
                    slice: s,
                    value: p.0[0],
                });
            }
        }
    }
    best
}

/// Local maxima (within their 3x3x3 neighbourhood over the slices) larger
/// than `threshold`, strongest first. Of two maxima closer than
/// `suppression` pixels only the stronger one is kept.
pub fn local_maxima(slices: &[VoteMap], threshold: f32, suppression: f64) -> Vec<VoteMaximum> {
    let mut candidates = vec![];
    for (s, slice) in slices.iter().enumerate() {
        let (w, h) = slice.dimensions();
        for (x, y, p) in slice.enumerate_pixels() {
            let v = p.0[0];
            if v <= threshold {
                continue;
            }
            let mut is_max = true;
            'search: for ds in -1i64..2 {
                let ss = s as i64 + ds;
                if ss < 0 || ss >= slices.len() as i64 {
                    continue;
                }
                for dy in -1i64..2 {
                    for dx in -1i64..2 {
                        let (nx, ny) = (x as i64 + dx, y as i64 + dy);
                        if (ds == 0 && dx == 0 && dy == 0) || nx < 0 || ny < 0 || nx >= w as i64 ||
                           ny >= h as i64 {
                            continue;
                        }
                        if slices[ss as usize].get_pixel(nx as u32, ny as u32).0[0] > v {
                            is_max = false;
                            break 'search;
                        }
                    }
                }
            }
            if is_max {
                candidates.push(VoteMaximum {
                    position: [x, y],
                    slice: s,
                    value: v,
                });
            }
        }
    }
    candidates.sort_by(|a, b| b.value.partial_cmp(&a.value).unwrap_or(::std::cmp::Ordering::Equal));

    let mut maxima: Vec<VoteMaximum> = vec![];
    for c in candidates.into_iter() {
        let close = maxima.iter().any(|m| {
            let dx = m.position[0] as f64 - c.position[0] as f64;
            let dy = m.position[1] as f64 - c.position[1] as f64;
            (dx * dx + dy * dy).sqrt() < suppression
        });
        if !close {
            maxima.push(c);
        }
    }
    maxima
}

/// A detected object
#[derive(Debug, Clone)]
pub struct Detection {
    pub maximum: VoteMaximum,
    /// Centers (unscaled) of all patches supporting the maximum
    pub vertices: Vec<[i32; 2]>,
    /// Bounding box of the vertices
    pub bounding_box: Option<Rect>,
}

impl Detection {
    /// False if no patch supported the maximum
    pub fn is_successful(&self) -> bool {
        !self.vertices.is_empty()
    }
}

/// Collects the patches whose votes hit the window of `span` pixels around
/// `maximum` more than `MIN_SUPPORT` times. Only leaves with p1 > 0.5 count.
pub fn backproject(forest: &HoughForest,
                   predictions: &[ScalePrediction],
                   maximum: &VoteMaximum,
                   span: u32)
                   -> Detection {
    let mut vertices = vec![];
    for p in predictions.iter() {
        let s = p.scale;
        let lo = [((maximum.position[0] as i64 - span as i64) as f64 * s) as i64,
                  ((maximum.position[1] as i64 - span as i64) as f64 * s) as i64];
        let hi = [((maximum.position[0] as i64 + span as i64) as f64 * s) as i64,
                  ((maximum.position[1] as i64 + span as i64) as f64 * s) as i64];
        for (r, rec) in p.records.iter().enumerate() {
            let mut hits = 0;
            for (tree, leaves) in forest.trees().iter().zip(p.leaves.iter()) {
                let leaf = tree.node(leaves[r]);
                if leaf.probabilities[1] <= 0.5 {
                    continue;
                }
                for o in leaf.offsets.iter() {
                    let tx = rec.center[0] as i64 + o[0] as i64;
                    let ty = rec.center[1] as i64 + o[1] as i64;
                    if tx >= lo[0] && tx <= hi[0] && ty >= lo[1] && ty <= hi[1] {
                        hits += 1;
                    }
                }
            }
            if hits > MIN_SUPPORT {
                vertices.push([(rec.center[0] as f64 / s) as i32, (rec.center[1] as f64 / s) as i32]);
            }
        }
    }
    if vertices.is_empty() {
        warn!("No patch supports the maximum at ({}, {})",
              maximum.position[0],
              maximum.position[1]);
    }
    let bounding_box = Rect::bounding(&vertices);
    Detection {
        maximum: *maximum,
        vertices: vertices,
        bounding_box: bounding_box,
    }
}

/// Everything found in one image
pub struct DetectionResult {
    /// Smoothed vote map of every scale
    pub votes: Vec<VoteMap>,
    pub maxima: Vec<VoteMaximum>,
    /// One detection per maximum
    pub detections: Vec<Detection>,
}

/// Detects objects with a trained forest.
pub struct Predictor {
    forest: HoughForest,
    config: PredictorConfig,
    cancel: CancelToken,
}

impl Predictor {
    pub fn new(forest: HoughForest, config: PredictorConfig) -> Result<Predictor> {
        config.validate()?;
        forest.check()?;
        Ok(Predictor {
            forest: forest,
            config: config,
            cancel: CancelToken::new(),
        })
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn forest(&self) -> &HoughForest {
        &self.forest
    }

    pub fn config(&self) -> &PredictorConfig {
        &self.config
    }

    /// Lets every patch of `tensor` scaled by `scale` descend all trees (in parallel).
    pub fn predict_scale(&self, tensor: &Arc<FeatureTensor>, scale: f64) -> Result<ScalePrediction> {
        if tensor.channels() != self.forest.channels() {
            bail!(ErrorKind::ChannelMismatch(self.forest.channels(), tensor.channels()));
        }
        let scaled = if scale == 1.0 {
            tensor.clone()
        } else {
            Arc::new(tensor.scaled(scale))
        };
        let grid = PatchGrid::new(scaled, self.forest.patch_size(), self.config.stride)?;
        let records = grid.records(0);
        let stride = Some(self.config.stride);
        let leaves = {
            let records = &records;
            let trees = self.forest.trees();
            let cancel = &self.cancel;
            run_in_pool(self.config.threads, || {
                trees.par_iter()
                    .map(|t| descend_tree(t, records, stride, cancel))
                    .collect::<Result<Vec<_>>>()
            })??
        };
        Ok(ScalePrediction {
            scale: scale,
            records: records,
            leaves: leaves,
        })
    }

    /// Detects the objects in `tensor`.
    ///
    /// Votes at every configured scale, smoothes the vote maps, searches the
    /// maxima (only the global one unless multiple detection is enabled) and
    /// backprojects each of them.
    pub fn detect(&self, tensor: &Arc<FeatureTensor>) -> Result<DetectionResult> {
        let (w, h) = (tensor.width(), tensor.height());
        let mut predictions = Vec::with_capacity(self.config.scales.len());
        let mut slices = Vec::with_capacity(self.config.scales.len());
        for &scale in self.config.scales.iter() {
            self.cancel.check()?;
            let p = self.predict_scale(tensor, scale)?;
            debug!("Scale {}: {} patches", scale, p.records.len());
            slices.push(p.votes(&self.forest, w, h));
            predictions.push(p);
        }
        let votes = smooth_votes(&slices, self.config.sigma_xy, self.config.sigma_z);
        let maxima = if self.config.multiple_detection {
            local_maxima(&votes,
                         self.config.detection_threshold,
                         self.config.max_suppression)
        } else {
            global_maximum(&votes).into_iter().collect()
        };
        if maxima.is_empty() {
            warn!("No vote maximum above {}", self.config.detection_threshold);
        } else {
            info!("Found {} maxima", maxima.len());
        }
        let detections = maxima.iter()
            .map(|m| backproject(&self.forest, &predictions, m, self.config.backprojection_span))
            .collect();
        Ok(DetectionResult {
            votes: votes,
            maxima: maxima,
            detections: detections,
        })
    }
}
