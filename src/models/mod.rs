// Domain models: samples, series, buckets, sessions, views

mod aggregation;
mod sample;
mod series;
mod session;
mod view;

pub use aggregation::AggregateBucket;
pub use sample::{ProcessEntry, Sample, ThreadEntry, ThreadState, Timestamp, Value};
pub use series::{MetricKind, SeriesDescriptor, SeriesId};
pub use session::{CompletionReason, GpuDevice, HostInfo, SessionInfo, SessionStatus};
pub use view::{Snapshot, ViewPoint};
