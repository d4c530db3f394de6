use image::{GrayImage, ImageBuffer, Luma};
use std::sync::Arc;

use errors::*;
use hough::patch::{Offset, PatchRecord, Truth};

/// Single channel float image. Used for the channels of a feature tensor and for vote maps.
pub type FloatImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Represents a rectangle
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rect {
    topleft: [u32; 2],
    bottomright: [u32; 2],
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Rect {
        Rect {
            topleft: [x, y],
            bottomright: [x + width, y + height],
        }
    }

    /// Smallest rectangle containing every point (inclusive).
    /// Negative coordinates are clamped to 0.
    /// Returns None if `points` is empty.
    pub fn bounding(points: &[[i32; 2]]) -> Option<Rect> {
        let first = match points.first() {
            Some(p) => *p,
            None => return None,
        };
        let (mut min, mut max) = (first, first);
        for p in points.iter() {
            for d in 0..2 {
                min[d] = min!(min[d], p[d]);
                max[d] = max!(max[d], p[d]);
            }
        }
        let lx = max!(min[0], 0) as u32;
        let ly = max!(min[1], 0) as u32;
        let hx = max!(max[0], 0) as u32;
        let hy = max!(max[1], 0) as u32;
        Some(Rect::new(lx, ly, hx - lx + 1, hy - ly + 1))
    }

    pub fn width(&self) -> u32 {
        self.bottomright[0] - self.topleft[0]
    }
    pub fn height(&self) -> u32 {
        self.bottomright[1] - self.topleft[1]
    }
    pub fn x(&self) -> u32 {
        self.topleft[0]
    }
    pub fn y(&self) -> u32 {
        self.topleft[1]
    }
    pub fn size(&self) -> u64 {
        (self.width() as u64) * (self.height() as u64)
    }

    /// Returns true if the point lies within this rectangle.
    pub fn contains(&self, x: i64, y: i64) -> bool {
        x >= self.topleft[0] as i64 && x < self.bottomright[0] as i64 &&
        y >= self.topleft[1] as i64 && y < self.bottomright[1] as i64
    }
}

/// Per pixel features of one image: `channels` planes of `width` x `height` values.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTensor {
    width: u32,
    height: u32,
    channels: usize,
    data: Vec<f32>,
}

impl FeatureTensor {
    /// Creates a tensor with every value set to zero.
    pub fn new(width: u32, height: u32, channels: usize) -> FeatureTensor {
        FeatureTensor {
            width: width,
            height: height,
            channels: channels,
            data: vec![0f32; width as usize * height as usize * channels],
        }
    }

    /// Creates a tensor by calling `f(x, y, channel)` for every value.
    pub fn from_fn<F>(width: u32, height: u32, channels: usize, mut f: F) -> FeatureTensor
        where F: FnMut(u32, u32, usize) -> f32
    {
        let mut tensor = FeatureTensor::new(width, height, channels);
        for c in 0..channels {
            for y in 0..height {
                for x in 0..width {
                    tensor.set(x, y, c, f(x, y, c));
                }
            }
        }
        tensor
    }

    /// Single channel tensor holding the intensities of a grayscale image.
    pub fn from_luma(img: &GrayImage) -> FeatureTensor {
        FeatureTensor::from_fn(img.width(), img.height(), 1, |x, y, _| img[(x, y)][0] as f32)
    }

    /// Stacks float images (which must share their dimension) into one tensor.
    pub fn from_channels(channels: &[FloatImage]) -> Result<FeatureTensor> {
        let (w, h) = match channels.first() {
            Some(c) => c.dimensions(),
            None => bail!(ErrorKind::InvalidTrainingSet("A feature tensor needs at least one channel".to_owned())),
        };
        if channels.iter().any(|c| c.dimensions() != (w, h)) {
            bail!(ErrorKind::InvalidTrainingSet("All feature channels must have the same size".to_owned()));
        }
        Ok(FeatureTensor::from_fn(w, h, channels.len(), |x, y, c| channels[c][(x, y)][0]))
    }

    pub fn width(&self) -> u32 {
        self.width
    }
    pub fn height(&self) -> u32 {
        self.height
    }
    pub fn channels(&self) -> usize {
        self.channels
    }

    #[inline]
    fn idx(&self, x: u32, y: u32, c: usize) -> usize {
        (c * self.height as usize + y as usize) * self.width as usize + x as usize
    }

    pub fn get(&self, x: u32, y: u32, c: usize) -> f32 {
        self.data[self.idx(x, y, c)]
    }

    pub fn set(&mut self, x: u32, y: u32, c: usize, val: f32) {
        let idx = self.idx(x, y, c);
        self.data[idx] = val;
    }

    /// Returns the value at (x, y). Coordinates outside the tensor
    /// are mirrored at the border.
    #[inline]
    pub fn get_mirrored(&self, x: i64, y: i64, c: usize) -> f32 {
        let x = mirror(x, self.width as i64);
        let y = mirror(y, self.height as i64);
        let idx = self.idx(x as u32, y as u32, c);
        #[cfg(feature="reduce_bound_checks")]
        {
            // mirror() keeps x and y within the tensor; the channel is
            // checked against the forest before any patch is evaluated
            assert!(c < self.channels && !self.data.is_empty(),
                    "channel {} of a {}x{}x{} tensor",
                    c,
                    self.width,
                    self.height,
                    self.channels);
            unsafe { *self.data.get_unchecked(idx) }
        }
        #[cfg(not(feature="reduce_bound_checks"))]
        {
            self.data[idx]
        }
    }

    /// Returns (min, max) of one channel.
    pub fn channel_range(&self, c: usize) -> (f32, f32) {
        let len = self.width as usize * self.height as usize;
        let plane = &self.data[c * len..(c + 1) * len];
        plane.iter().fold((::std::f32::MAX, ::std::f32::MIN),
                          |(lo, hi), &v| (min!(lo, v), max!(hi, v)))
    }

    /// Resizes the tensor by `scale` using bilinear interpolation.
    pub fn scaled(&self, scale: f64) -> FeatureTensor {
        let nw = max!((self.width as f64 * scale).round() as u32, 1);
        let nh = max!((self.height as f64 * scale).round() as u32, 1);
        let fx = self.width as f64 / nw as f64;
        let fy = self.height as f64 / nh as f64;
        FeatureTensor::from_fn(nw, nh, self.channels, |x, y, c| {
            // sample at pixel centers
            let sx = (x as f64 + 0.5) * fx - 0.5;
            let sy = (y as f64 + 0.5) * fy - 0.5;
            let x0 = sx.floor();
            let y0 = sy.floor();
            let ax = (sx - x0) as f32;
            let ay = (sy - y0) as f32;
            let (x0, y0) = (x0 as i64, y0 as i64);
            let top = self.get_mirrored(x0, y0, c) * (1.0 - ax) + self.get_mirrored(x0 + 1, y0, c) * ax;
            let bottom = self.get_mirrored(x0, y0 + 1, c) * (1.0 - ax) +
                         self.get_mirrored(x0 + 1, y0 + 1, c) * ax;
            top * (1.0 - ay) + bottom * ay
        })
    }
}

/// Mirrors `i` into [0, len) (single reflection, border pixel not repeated).
#[inline]
fn mirror(i: i64, len: i64) -> i64 {
    let i = if i < 0 { -i } else { i };
    let i = if i >= len { 2 * (len - 1) - i } else { i };
    if i < 0 { 0 } else if i >= len { len - 1 } else { i }
}

/// A fixed size window within a feature tensor.
#[derive(Debug, Clone)]
pub struct Patch {
    tensor: Arc<FeatureTensor>,
    min: [i64; 2],
    size: [u32; 2],
}

impl Patch {
    /// Creates a patch whose top left corner is `min`. The patch may reach
    /// beyond the tensor, such values are mirrored.
    pub fn new(tensor: Arc<FeatureTensor>, min: [i64; 2], size: [u32; 2]) -> Patch {
        Patch {
            tensor: tensor,
            min: min,
            size: size,
        }
    }

    /// Value of `channel` at position (x, y) relative to the top left corner.
    #[inline]
    pub fn value(&self, x: u32, y: u32, channel: usize) -> f32 {
        self.tensor.get_mirrored(self.min[0] + x as i64, self.min[1] + y as i64, channel)
    }

    pub fn size(&self) -> [u32; 2] {
        self.size
    }

    pub fn channels(&self) -> usize {
        self.tensor.channels()
    }

    pub fn tensor(&self) -> &Arc<FeatureTensor> {
        &self.tensor
    }
}

/// Regular grid of patches over a feature tensor.
///
/// The patch at grid position (i, j) starts at `(i * stride_x, j * stride_y)`,
/// its center lies at `patch_size / 2 + (i, j) * stride`.
#[derive(Debug, Clone)]
pub struct PatchGrid {
    tensor: Arc<FeatureTensor>,
    patch_size: [u32; 2],
    stride: [u32; 2],
    dims: [usize; 2],
}

impl PatchGrid {
    /// Slices `tensor` into a grid.
    ///
    /// # Arguments
    /// * `tensor` - the per pixel features
    /// * `patch_size` - width and height of a patch
    /// * `stride` - step size in x and y direction
    pub fn new(tensor: Arc<FeatureTensor>, patch_size: [u32; 2], stride: [u32; 2]) -> Result<PatchGrid> {
        if patch_size[0] == 0 || patch_size[1] == 0 {
            bail!(ErrorKind::InvalidConfig("The patch size must be at least 1!".to_owned()));
        }
        if stride[0] == 0 || stride[1] == 0 {
            bail!(ErrorKind::InvalidConfig("The stride must be at least 1!".to_owned()));
        }
        let dim = |len: u32, patch: u32, gap: u32| {
            let d = (len as i64 - patch as i64) / gap as i64 + 1;
            max!(d, 1) as usize
        };
        let dims = [dim(tensor.width(), patch_size[0], stride[0]),
                    dim(tensor.height(), patch_size[1], stride[1])];
        Ok(PatchGrid {
            tensor: tensor,
            patch_size: patch_size,
            stride: stride,
            dims: dims,
        })
    }

    pub fn dims(&self) -> [usize; 2] {
        self.dims
    }

    pub fn stride(&self) -> [u32; 2] {
        self.stride
    }

    pub fn tensor(&self) -> &Arc<FeatureTensor> {
        &self.tensor
    }

    /// Pixel center of the patch at grid position (i, j)
    pub fn center(&self, i: usize, j: usize) -> [i32; 2] {
        [(self.patch_size[0] / 2) as i32 + (i as u32 * self.stride[0]) as i32,
         (self.patch_size[1] / 2) as i32 + (j as u32 * self.stride[1]) as i32]
    }

    pub fn patch(&self, i: usize, j: usize) -> Patch {
        let min = [(i as u32 * self.stride[0]) as i64, (j as u32 * self.stride[1]) as i64];
        Patch::new(self.tensor.clone(), min, self.patch_size)
    }

    fn record(&self, image: usize, i: usize, j: usize, truth: Option<Truth>) -> PatchRecord {
        PatchRecord {
            image: image,
            position: [i, j],
            grid_dims: self.dims,
            center: self.center(i, j),
            patch: self.patch(i, j),
            truth: truth,
        }
    }

    /// Unlabeled records of every grid cell (row by row), e.g. for prediction.
    /// `image` identifies this grid among all grids handed to the forest at once.
    pub fn records(&self, image: usize) -> Vec<PatchRecord> {
        let mut out = Vec::with_capacity(self.dims[0] * self.dims[1]);
        for j in 0..self.dims[1] {
            for i in 0..self.dims[0] {
                out.push(self.record(image, i, j, None));
            }
        }
        out
    }

    /// Labeled records of every grid cell.
    /// A patch whose center lies within one of the `regions` is an object patch
    /// and votes (truncated) for the centroid of that region. Every other
    /// patch is background.
    pub fn labeled_records(&self, image: usize, regions: &[ObjectRegion]) -> Vec<PatchRecord> {
        let mut out = self.records(image);
        for rec in out.iter_mut() {
            let [cx, cy] = rec.center;
            let truth = match regions.iter().find(|r| r.contains(cx, cy)) {
                Some(region) => {
                    let (mx, my) = region.centroid();
                    let offset: Offset = [(mx - cx as f64) as i32, (my - cy as f64) as i32];
                    Truth::Object { offset: offset }
                }
                None => Truth::Background,
            };
            rec.truth = Some(truth);
        }
        out
    }
}

/// The pixels of one labeled object.
#[derive(Debug, Clone)]
pub struct ObjectRegion {
    bounds: Rect,
    pixels: Vec<[i32; 2]>,
    // row major bitmap within `bounds`
    mask: Vec<bool>,
}

impl ObjectRegion {
    /// Creates a region from its pixels. Returns None if `pixels` is empty.
    pub fn new(pixels: Vec<[i32; 2]>) -> Option<ObjectRegion> {
        let bounds = match Rect::bounding(&pixels) {
            Some(b) => b,
            None => return None,
        };
        let mut mask = vec![false; bounds.size() as usize];
        let mut kept = Vec::with_capacity(pixels.len());
        for p in pixels.into_iter() {
            if p[0] < 0 || p[1] < 0 {
                continue;
            }
            let idx = (p[1] as u32 - bounds.y()) * bounds.width() + (p[0] as u32 - bounds.x());
            if !mask[idx as usize] {
                mask[idx as usize] = true;
                kept.push(p);
            }
        }
        if kept.is_empty() {
            return None;
        }
        Some(ObjectRegion {
            bounds: bounds,
            pixels: kept,
            mask: mask,
        })
    }

    /// Every non zero pixel of `mask` belongs to the region.
    pub fn from_mask(mask: &GrayImage) -> Option<ObjectRegion> {
        let pixels = mask.enumerate_pixels()
            .filter(|&(_, _, p)| p[0] != 0)
            .map(|(x, y, _)| [x as i32, y as i32])
            .collect();
        ObjectRegion::new(pixels)
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        if !self.bounds.contains(x as i64, y as i64) {
            return false;
        }
        let idx = (y as u32 - self.bounds.y()) * self.bounds.width() + (x as u32 - self.bounds.x());
        self.mask[idx as usize]
    }

    /// Center of mass
    pub fn centroid(&self) -> (f64, f64) {
        let (sx, sy) = self.pixels
            .iter()
            .fold((0f64, 0f64), |(sx, sy), p| (sx + p[0] as f64, sy + p[1] as f64));
        let n = self.pixels.len() as f64;
        (sx / n, sy / n)
    }

    pub fn bounds(&self) -> Rect {
        self.bounds
    }
}
