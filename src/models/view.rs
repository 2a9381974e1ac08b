// Query results handed to the viewer

use serde::{Deserialize, Serialize};

use super::{AggregateBucket, Sample, SeriesId, Timestamp, Value};

/// One point of a viewer series: a raw sample in narrow windows, a bucket otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ViewPoint {
    Sample(Sample),
    Bucket(AggregateBucket),
}

impl ViewPoint {
    /// Start of the time span this point covers.
    pub fn start(&self) -> Timestamp {
        match self {
            ViewPoint::Sample(s) => s.timestamp,
            ViewPoint::Bucket(b) => b.bucket_start,
        }
    }
}

/// All series joined at one timestamp. Series with no sample at or before it hold `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub timestamp: Timestamp,
    pub values: Vec<(SeriesId, Option<Value>)>,
}
