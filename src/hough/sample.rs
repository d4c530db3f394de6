//! Bags of patch records and their class statistics.

use rand::Rng;
use std::cell::Cell;

use hough::patch::{Offset, PatchRecord};
use hough::split::Split;

/// Returns the class probabilities [p0, p1] of a set containing `n0`
/// background and `n1` object patches.
///
/// Mixed sets are reweighted by the inverse class frequency of the whole
/// `training_set`, which compensates unbalanced training data.
pub fn class_probabilities(n0: usize, n1: usize, training_set: &Sample) -> [f64; 2] {
    match (n0, n1) {
        (0, 0) => [0.5, 0.5],
        (0, _) => [0.0, 1.0],
        (_, 0) => [1.0, 0.0],
        _ => {
            let [c0, c1] = training_set.class_counts();
            let rc0 = rel!(training_set.len(), c0);
            let rc1 = rel!(training_set.len(), c1);
            let w0 = n0 as f64 * rc0;
            let w1 = n1 as f64 * rc1;
            let p0 = w0 / (w0 + w1);
            [p0, 1.0 - p0]
        }
    }
}

/// Mean of some offsets, (0,0) for an empty list.
pub fn offset_mean(offsets: &[Offset]) -> [f64; 2] {
    if offsets.is_empty() {
        return [0.0, 0.0];
    }
    let (sx, sy) = offsets.iter().fold((0i64, 0i64), |(sx, sy), o| (sx + o[0] as i64, sy + o[1] as i64));
    [rel!(sx, offsets.len()), rel!(sy, offsets.len())]
}

/// A bag of patch records, given as indices into a slice of records.
/// Indices may repeat (sampling with replacement).
///
/// Class counts and entropy are computed on first use and cached.
pub struct Sample<'a> {
    records: &'a [PatchRecord],
    elements: Vec<usize>,
    counts: Cell<Option<[usize; 2]>>,
    entropy: Cell<Option<f64>>,
}

impl<'a> Sample<'a> {
    pub fn new(records: &'a [PatchRecord], elements: Vec<usize>) -> Sample<'a> {
        Sample {
            records: records,
            elements: elements,
            counts: Cell::new(None),
            entropy: Cell::new(None),
        }
    }

    /// Sample containing every record exactly once.
    pub fn whole(records: &'a [PatchRecord]) -> Sample<'a> {
        Sample::new(records, (0..records.len()).collect())
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Indices of the elements into `records()`
    pub fn elements(&self) -> &[usize] {
        &self.elements
    }

    /// All records the elements refer to.
    pub fn records(&self) -> &'a [PatchRecord] {
        self.records
    }

    pub fn iter<'b>(&'b self) -> impl Iterator<Item = &'a PatchRecord> + 'b {
        let records = self.records;
        self.elements.iter().map(move |&i| &records[i])
    }

    /// Number of background and object patches
    pub fn class_counts(&self) -> [usize; 2] {
        if let Some(c) = self.counts.get() {
            return c;
        }
        let mut counts = [0usize; 2];
        for rec in self.iter() {
            counts[rec.class()] += 1;
        }
        self.counts.set(Some(counts));
        counts
    }

    pub fn count0(&self) -> usize {
        self.class_counts()[0]
    }

    pub fn count1(&self) -> usize {
        self.class_counts()[1]
    }

    /// Class probabilities of this sample (see `class_probabilities`)
    pub fn probabilities(&self, training_set: &Sample) -> [f64; 2] {
        let [n0, n1] = self.class_counts();
        class_probabilities(n0, n1, training_set)
    }

    /// Entropy of the (reweighted) class distribution
    pub fn entropy(&self, training_set: &Sample) -> f64 {
        if let Some(e) = self.entropy.get() {
            return e;
        }
        let [p0, p1] = self.probabilities(training_set);
        let e = -(p0 * ln!(p0) + p1 * ln!(p1));
        self.entropy.set(Some(e));
        e
    }

    /// Offsets of every object patch
    pub fn offsets(&self) -> Vec<Offset> {
        self.iter().filter_map(|r| r.offset()).collect()
    }

    /// Draws `size` elements with replacement.
    pub fn random_subsample<R: Rng>(&self, size: usize, rng: &mut R) -> Sample<'a> {
        if self.elements.is_empty() {
            return Sample::new(self.records, vec![]);
        }
        let elements = (0..size)
            .map(|_| self.elements[rng.gen_range(0..self.elements.len())])
            .collect();
        Sample::new(self.records, elements)
    }

    /// Splits the sample into the records going left and those going right.
    pub fn partition<F>(&self, mut f: F) -> (Sample<'a>, Sample<'a>)
        where F: FnMut(&PatchRecord) -> Split
    {
        let mut left = vec![];
        let mut right = vec![];
        for &i in self.elements.iter() {
            match f(&self.records[i]) {
                Split::Left => left.push(i),
                Split::Right => right.push(i),
            }
        }
        (Sample::new(self.records, left), Sample::new(self.records, right))
    }
}
