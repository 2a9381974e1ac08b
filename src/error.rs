// Error taxonomy at the source, store and session boundaries

use crate::models::{SeriesId, Timestamp};
use thiserror::Error;

/// Failure of one `MetricSource::poll`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// One failed query; the series gets a gap at this tick.
    #[error("transient source failure: {0}")]
    Transient(String),
    /// The metric cannot be read on this host (missing driver, non-Linux, ...).
    #[error("metric unsupported: {0}")]
    Unsupported(String),
    /// The target process no longer exists.
    #[error("target process {pid} is gone")]
    TargetGone { pid: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("unknown series {0}")]
    UnknownSeries(SeriesId),
    #[error("out-of-order append to {series}: {timestamp} precedes last timestamp {last}")]
    OutOfOrderAppend {
        series: SeriesId,
        timestamp: Timestamp,
        last: Timestamp,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("target process {pid} not found")]
    TargetNotFound { pid: u32 },
    #[error("sampler already running")]
    AlreadyRunning,
    #[error("sampler already stopped")]
    AlreadyStopped,
}
