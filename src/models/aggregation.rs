// Aggregate bucket: one interval's summary statistics for one series at one level.
// Intervals are half-open [bucket_start, bucket_end) in session milliseconds; the
// saturated end Timestamp::MAX is inclusive.

use serde::{Deserialize, Serialize};

use super::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateBucket {
    pub bucket_start: Timestamp,
    pub bucket_end: Timestamp,
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub count: u64,
}

impl AggregateBucket {
    /// Bucket over [start, end) holding a single value.
    pub fn single(bucket_start: Timestamp, bucket_end: Timestamp, value: f64) -> Self {
        Self {
            bucket_start,
            bucket_end,
            min: value,
            max: value,
            sum: value,
            count: 1,
        }
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum / (self.count as f64)
    }

    /// A bucket whose end saturated at `Timestamp::MAX` also holds that instant.
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.bucket_start && (ts < self.bucket_end || self.bucket_end == Timestamp::MAX)
    }

    pub fn add(&mut self, value: f64) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum += value;
        self.count += 1;
    }

    /// Fold another bucket's statistics in. Bounds are left untouched.
    pub fn merge(&mut self, other: &AggregateBucket) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.sum += other.sum;
        self.count += other.count;
    }

    /// Same statistics over different bounds.
    pub fn with_bounds(mut self, bucket_start: Timestamp, bucket_end: Timestamp) -> Self {
        self.bucket_start = bucket_start;
        self.bucket_end = bucket_end;
        self
    }
}
