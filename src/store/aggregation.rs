// Pure bucket arithmetic shared by the store and its readers.

use crate::models::{AggregateBucket, Sample, Timestamp};

/// Statistics of `samples` as one bucket over [start, end). `None` when empty.
pub fn summarize_samples(
    samples: &[Sample],
    start: Timestamp,
    end: Timestamp,
) -> Option<AggregateBucket> {
    let (first, rest) = samples.split_first()?;
    let mut bucket = AggregateBucket::single(start, end, first.value.numeric());
    for s in rest {
        bucket.add(s.value.numeric());
    }
    Some(bucket)
}

/// Folds `part` into `acc`, keeping `acc`'s bounds.
pub fn merge_into(acc: &mut Option<AggregateBucket>, part: Option<AggregateBucket>) {
    match (acc.as_mut(), part) {
        (Some(a), Some(p)) => a.merge(&p),
        (None, Some(p)) => *acc = Some(p),
        (_, None) => {}
    }
}

/// Merges runs of consecutive buckets so at most `max_points` remain.
/// Statistics are preserved exactly; each merged bucket spans its first to last input.
pub fn coalesce(buckets: Vec<AggregateBucket>, max_points: usize) -> Vec<AggregateBucket> {
    if max_points == 0 {
        return Vec::new();
    }
    if buckets.len() <= max_points {
        return buckets;
    }
    let chunk = buckets.len().div_ceil(max_points);
    buckets
        .chunks(chunk)
        .map(|run| {
            let mut merged = run[0];
            for b in &run[1..] {
                merged.merge(b);
            }
            merged.bucket_end = run[run.len() - 1].bucket_end;
            merged
        })
        .collect()
}
