// Multi-resolution index built while appending.
//
// Level 0 buckets are `base_width` wide; each level above is `branching` times wider and
// aligned on the same grid, so a level k+1 bucket covers exactly `branching` level-k
// intervals. A bucket is folded into its parent level only when it closes, which keeps
// `push` O(1) amortized. Data still held by open buckets below a level is merged in at
// read time (`tail`), so every level always covers every sample.

use crate::models::{AggregateBucket, Timestamp};

#[derive(Debug)]
struct Level {
    width: u64,
    closed: Vec<AggregateBucket>,
    open: Option<AggregateBucket>,
}

impl Level {
    fn new(width: u64) -> Self {
        Self {
            width,
            closed: Vec::new(),
            open: None,
        }
    }

    fn align(&self, ts: Timestamp) -> Timestamp {
        ts - ts % self.width
    }
}

#[derive(Debug)]
pub(crate) struct Ladder {
    branching: u64,
    levels: Vec<Level>,
}

impl Ladder {
    pub(crate) fn new(base_width: u64, branching: u64) -> Self {
        Self {
            branching: branching.max(2),
            levels: vec![Level::new(base_width.max(1))],
        }
    }

    pub(crate) fn depth(&self) -> usize {
        self.levels.len()
    }

    pub(crate) fn width(&self, level: usize) -> u64 {
        self.levels[level].width
    }

    pub(crate) fn push(&mut self, ts: Timestamp, value: f64) {
        let level0 = &mut self.levels[0];
        if let Some(open) = level0.open.as_mut()
            && open.contains(ts)
        {
            open.add(value);
            return;
        }
        let start = level0.align(ts);
        let fresh = AggregateBucket::single(start, start.saturating_add(level0.width), value);
        if let Some(finished) = level0.open.replace(fresh) {
            self.close(0, finished);
        }
    }

    /// Publishes a finished bucket at `level` and folds it into the parent level.
    fn close(&mut self, level: usize, bucket: AggregateBucket) {
        self.levels[level].closed.push(bucket);
        let parent = level + 1;
        if parent == self.levels.len() {
            // Widest representable level reached; it keeps its closed buckets unfolded.
            let Some(width) = self.levels[level].width.checked_mul(self.branching) else {
                return;
            };
            self.levels.push(Level::new(width));
        }

        let upper = &mut self.levels[parent];
        let start = upper.align(bucket.bucket_start);
        if let Some(open) = upper.open.as_mut()
            && open.bucket_start == start
        {
            open.merge(&bucket);
            return;
        }
        let fresh = bucket.with_bounds(start, start.saturating_add(upper.width));
        if let Some(finished) = upper.open.replace(fresh) {
            self.close(parent, finished);
        }
    }

    /// Level buckets overlapping [lo, hi), in time order. Edge buckets are not clipped.
    pub(crate) fn buckets(
        &self,
        level: usize,
        lo: Timestamp,
        hi: Timestamp,
    ) -> Vec<AggregateBucket> {
        let closed = self.closed_overlapping(level, lo, hi);
        let mut out = Vec::with_capacity(closed.len() + level + 1);
        out.extend_from_slice(closed);
        out.extend(
            self.tail(level)
                .into_iter()
                .filter(|b| b.bucket_end > lo && b.bucket_start < hi),
        );
        out
    }

    /// Number of level buckets overlapping [lo, hi).
    pub(crate) fn count(&self, level: usize, lo: Timestamp, hi: Timestamp) -> usize {
        self.closed_overlapping(level, lo, hi).len()
            + self
                .tail(level)
                .iter()
                .filter(|b| b.bucket_end > lo && b.bucket_start < hi)
                .count()
    }

    fn closed_overlapping(&self, level: usize, lo: Timestamp, hi: Timestamp) -> &[AggregateBucket] {
        let closed = &self.levels[level].closed;
        let first = closed.partition_point(|b| b.bucket_end <= lo);
        let last = closed.partition_point(|b| b.bucket_start < hi);
        &closed[first..last.max(first)]
    }

    /// Open buckets of `level` and every finer level, re-gridded to `level`'s width.
    /// Finer open buckets always hold newer data than coarser ones.
    fn tail(&self, level: usize) -> Vec<AggregateBucket> {
        let width = self.levels[level].width;
        let mut out: Vec<AggregateBucket> = Vec::with_capacity(level + 1);
        for lvl in self.levels[..=level].iter().rev() {
            let Some(open) = lvl.open else { continue };
            let start = open.bucket_start - open.bucket_start % width;
            match out.last_mut() {
                Some(last) if last.bucket_start == start => last.merge(&open),
                _ => out.push(open.with_bounds(start, start.saturating_add(width))),
            }
        }
        out
    }
}
