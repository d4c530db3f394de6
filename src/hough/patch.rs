//! Patch records: one grid cell of one image handed to the forest.

use types::Patch;

/// Offset from a patch center to the object center (in pixels).
pub type Offset = [i32; 2];

/// Ground truth of a training patch.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Truth {
    Background,
    Object {
        /// Vote for the object center, relative to the patch center.
        offset: Offset,
    },
}

impl Truth {
    pub fn class(&self) -> usize {
        match *self {
            Truth::Background => 0,
            Truth::Object { .. } => 1,
        }
    }

    pub fn offset(&self) -> Option<Offset> {
        match *self {
            Truth::Background => None,
            Truth::Object { offset } => Some(offset),
        }
    }
}

/// One cell of a patch grid.
#[derive(Debug, Clone)]
pub struct PatchRecord {
    /// Identifies the grid (image and scale) this record belongs to.
    /// Records of the same grid share one layer of a `NodeGrid`.
    pub image: usize,
    /// Grid position (i, j)
    pub position: [usize; 2],
    /// Dimension of the grid this record belongs to
    pub grid_dims: [usize; 2],
    /// Pixel center of the patch
    pub center: [i32; 2],
    pub patch: Patch,
    /// Only known for training records
    pub truth: Option<Truth>,
}

impl PatchRecord {
    /// Class of this record. Unlabeled records count as background.
    pub fn class(&self) -> usize {
        self.truth.map_or(0, |t| t.class())
    }

    pub fn offset(&self) -> Option<Offset> {
        self.truth.and_then(|t| t.offset())
    }

    /// Grid position reached from this record by moving `cells`.
    /// Returns None if that position is outside of the grid.
    pub fn neighbour(&self, cells: [i64; 2]) -> Option<[usize; 2]> {
        let x = self.position[0] as i64 + cells[0];
        let y = self.position[1] as i64 + cells[1];
        if x < 0 || y < 0 || x >= self.grid_dims[0] as i64 || y >= self.grid_dims[1] as i64 {
            return None;
        }
        Some([x as usize, y as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use types::{FeatureTensor, Patch};

    fn record(truth: Option<Truth>) -> PatchRecord {
        let tensor = Arc::new(FeatureTensor::new(8, 8, 1));
        PatchRecord {
            image: 0,
            position: [1, 2],
            grid_dims: [3, 4],
            center: [4, 6],
            patch: Patch::new(tensor, [0, 0], [4, 4]),
            truth: truth,
        }
    }

    #[test]
    fn test_truth() {
        let bg = record(Some(Truth::Background));
        assert_eq!(bg.class(), 0);
        assert_eq!(bg.offset(), None);
        let fg = record(Some(Truth::Object { offset: [2, -1] }));
        assert_eq!(fg.class(), 1);
        assert_eq!(fg.offset(), Some([2, -1]));
        assert_eq!(record(None).class(), 0);
    }

    #[test]
    fn test_neighbour() {
        let r = record(None);
        assert_eq!(r.neighbour([0, 0]), Some([1, 2]));
        assert_eq!(r.neighbour([1, 1]), Some([2, 3]));
        assert_eq!(r.neighbour([2, 0]), None);
        assert_eq!(r.neighbour([-2, 0]), None);
        assert_eq!(r.neighbour([0, 2]), None);
        assert_eq!(r.neighbour([-1, -2]), Some([0, 0]));
    }
}
