// In-memory time-series store: append-only raw log per series plus a multi-resolution
// aggregate ladder. Each series sits behind its own RwLock; an append (raw push plus
// bucket folds) happens under the write lock, so readers only ever see whole appends.

pub mod aggregation;
mod ladder;

use crate::error::StoreError;
use crate::models::{
    AggregateBucket, Sample, SeriesDescriptor, SeriesId, Timestamp, ViewPoint,
};
use ladder::Ladder;
use serde::Deserialize;
use std::sync::{PoisonError, RwLock, RwLockReadGuard};

/// Ladder geometry: level-0 bucket width and the width factor between levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_base_bucket_ms")]
    pub base_bucket_ms: u64,
    #[serde(default = "default_branching_factor")]
    pub branching_factor: u64,
}

fn default_base_bucket_ms() -> u64 {
    1000
}

fn default_branching_factor() -> u64 {
    8
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_bucket_ms: default_base_bucket_ms(),
            branching_factor: default_branching_factor(),
        }
    }
}

/// Result of an aggregate query: raw samples when they already fit the budget,
/// otherwise buckets from one ladder level.
#[derive(Debug, Clone, PartialEq)]
pub enum Downsampled {
    Raw(Vec<Sample>),
    Buckets {
        level: usize,
        /// Nominal bucket width of the level (wider when the top level had to be coalesced).
        width_ms: u64,
        buckets: Vec<AggregateBucket>,
    },
}

impl Downsampled {
    pub fn len(&self) -> usize {
        match self {
            Downsampled::Raw(samples) => samples.len(),
            Downsampled::Buckets { buckets, .. } => buckets.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_points(self) -> Vec<ViewPoint> {
        match self {
            Downsampled::Raw(samples) => samples.into_iter().map(ViewPoint::Sample).collect(),
            Downsampled::Buckets { buckets, .. } => {
                buckets.into_iter().map(ViewPoint::Bucket).collect()
            }
        }
    }
}

#[derive(Debug)]
struct SeriesLog {
    descriptor: SeriesDescriptor,
    raw: Vec<Sample>,
    ladder: Ladder,
}

impl SeriesLog {
    fn new(descriptor: SeriesDescriptor, config: &StoreConfig) -> Self {
        Self {
            descriptor,
            raw: Vec::new(),
            ladder: Ladder::new(config.base_bucket_ms, config.branching_factor),
        }
    }

    fn append(&mut self, id: SeriesId, sample: Sample) -> Result<(), StoreError> {
        if let Some(last) = self.raw.last()
            && sample.timestamp < last.timestamp
        {
            return Err(StoreError::OutOfOrderAppend {
                series: id,
                timestamp: sample.timestamp,
                last: last.timestamp,
            });
        }
        self.ladder.push(sample.timestamp, sample.value.numeric());
        self.raw.push(sample);
        Ok(())
    }

    /// Raw slice with timestamps in [lo, hi). `hi == Timestamp::MAX` is open-ended,
    /// matching the saturated end of the last ladder bucket.
    fn raw_slice(&self, lo: Timestamp, hi: Timestamp) -> &[Sample] {
        let first = self.raw.partition_point(|s| s.timestamp < lo);
        let last = if hi == Timestamp::MAX {
            self.raw.len()
        } else {
            self.raw.partition_point(|s| s.timestamp < hi)
        };
        &self.raw[first..last.max(first)]
    }

    /// Raw slice with t0 <= timestamp <= t1.
    fn raw_between(&self, t0: Timestamp, t1: Timestamp) -> &[Sample] {
        let first = self.raw.partition_point(|s| s.timestamp < t0);
        let last = self.raw.partition_point(|s| s.timestamp <= t1);
        &self.raw[first..last.max(first)]
    }

    /// Exact statistics over [lo, hi) using buckets of `level` and finer;
    /// `None` means raw samples. Only partially covered buckets recurse.
    fn summarize(&self, level: Option<usize>, lo: Timestamp, hi: Timestamp) -> Option<AggregateBucket> {
        let Some(level) = level else {
            return aggregation::summarize_samples(self.raw_slice(lo, hi), lo, hi);
        };
        let mut acc = None;
        for b in self.ladder.buckets(level, lo, hi) {
            let part = if b.bucket_start >= lo && b.bucket_end <= hi {
                Some(b)
            } else {
                self.summarize(
                    level.checked_sub(1),
                    b.bucket_start.max(lo),
                    b.bucket_end.min(hi),
                )
            };
            aggregation::merge_into(&mut acc, part);
        }
        acc.map(|b| b.with_bounds(lo, hi))
    }

    /// Level buckets over [lo, hi) with edge buckets clipped to the window.
    fn level_view(&self, level: usize, lo: Timestamp, hi: Timestamp) -> Vec<AggregateBucket> {
        self.ladder
            .buckets(level, lo, hi)
            .into_iter()
            .filter_map(|b| {
                if b.bucket_start >= lo && b.bucket_end <= hi {
                    Some(b)
                } else {
                    self.summarize(
                        level.checked_sub(1),
                        b.bucket_start.max(lo),
                        b.bucket_end.min(hi),
                    )
                }
            })
            .collect()
    }

    fn aggregate(&self, t0: Timestamp, t1: Timestamp, max_points: usize) -> Downsampled {
        if max_points == 0 || t0 > t1 {
            return Downsampled::Raw(Vec::new());
        }
        let raw = self.raw_between(t0, t1);
        if raw.len() <= max_points {
            return Downsampled::Raw(raw.to_vec());
        }
        let (lo, hi) = window(t0, t1);
        for level in 0..self.ladder.depth() {
            if self.ladder.count(level, lo, hi) <= max_points {
                return Downsampled::Buckets {
                    level,
                    width_ms: self.ladder.width(level),
                    buckets: self.level_view(level, lo, hi),
                };
            }
        }
        // Window wider than the coarsest level can express within the budget.
        let top = self.ladder.depth() - 1;
        let buckets = self.level_view(top, lo, hi);
        let chunk = buckets.len().div_ceil(max_points) as u64;
        Downsampled::Buckets {
            level: top,
            width_ms: self.ladder.width(top).saturating_mul(chunk.max(1)),
            buckets: aggregation::coalesce(buckets, max_points),
        }
    }
}

/// Half-open bounds for the inclusive window [t0, t1]; `t1 == Timestamp::MAX`
/// maps to the open-ended `hi == Timestamp::MAX`.
fn window(t0: Timestamp, t1: Timestamp) -> (Timestamp, Timestamp) {
    (t0, t1.saturating_add(1))
}

/// Owns every series of one session.
#[derive(Debug)]
pub struct TimeSeriesStore {
    config: StoreConfig,
    series: Vec<RwLock<SeriesLog>>,
}

impl TimeSeriesStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            series: Vec::new(),
        }
    }

    /// Store with one series per descriptor; ids follow iteration order.
    pub fn with_series(
        config: StoreConfig,
        descriptors: impl IntoIterator<Item = SeriesDescriptor>,
    ) -> Self {
        let mut store = Self::new(config);
        for d in descriptors {
            store.register(d);
        }
        store
    }

    pub fn register(&mut self, descriptor: SeriesDescriptor) -> SeriesId {
        let id = SeriesId(self.series.len() as u32);
        self.series
            .push(RwLock::new(SeriesLog::new(descriptor, &self.config)));
        id
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn series_ids(&self) -> Vec<SeriesId> {
        (0..self.series.len() as u32).map(SeriesId).collect()
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn contains(&self, id: SeriesId) -> bool {
        (id.0 as usize) < self.series.len()
    }

    pub fn descriptor(&self, id: SeriesId) -> Result<SeriesDescriptor, StoreError> {
        Ok(self.read(id)?.descriptor.clone())
    }

    pub fn append(&self, id: SeriesId, sample: Sample) -> Result<(), StoreError> {
        let lock = self
            .series
            .get(id.0 as usize)
            .ok_or(StoreError::UnknownSeries(id))?;
        let mut log = lock.write().unwrap_or_else(PoisonError::into_inner);
        log.append(id, sample)
    }

    /// Raw samples with t0 <= timestamp <= t1, in append order.
    pub fn range(
        &self,
        id: SeriesId,
        t0: Timestamp,
        t1: Timestamp,
    ) -> Result<Vec<Sample>, StoreError> {
        Ok(self.read(id)?.raw_between(t0, t1).to_vec())
    }

    /// At most `max_points` points summarizing [t0, t1]. Bucket statistics over the
    /// result equal the statistics of `range(id, t0, t1)`.
    pub fn aggregate(
        &self,
        id: SeriesId,
        t0: Timestamp,
        t1: Timestamp,
        max_points: usize,
    ) -> Result<Downsampled, StoreError> {
        Ok(self.read(id)?.aggregate(t0, t1, max_points))
    }

    pub fn sample_count(&self, id: SeriesId) -> Result<usize, StoreError> {
        Ok(self.read(id)?.raw.len())
    }

    /// First and last timestamp of a series.
    pub fn bounds(&self, id: SeriesId) -> Result<Option<(Timestamp, Timestamp)>, StoreError> {
        let log = self.read(id)?;
        Ok(log
            .raw
            .first()
            .zip(log.raw.last())
            .map(|(first, last)| (first.timestamp, last.timestamp)))
    }

    /// Most recent sample at or before `ts`.
    pub fn latest_at(&self, id: SeriesId, ts: Timestamp) -> Result<Option<Sample>, StoreError> {
        let log = self.read(id)?;
        let idx = log.raw.partition_point(|s| s.timestamp <= ts);
        Ok(idx.checked_sub(1).map(|i| log.raw[i].clone()))
    }

    /// Number of ladder levels currently built for a series.
    pub fn levels(&self, id: SeriesId) -> Result<usize, StoreError> {
        Ok(self.read(id)?.ladder.depth())
    }

    fn read(&self, id: SeriesId) -> Result<RwLockReadGuard<'_, SeriesLog>, StoreError> {
        let lock = self
            .series
            .get(id.0 as usize)
            .ok_or(StoreError::UnknownSeries(id))?;
        Ok(lock.read().unwrap_or_else(PoisonError::into_inner))
    }
}
