// Read façade for viewers. Stateless: every call goes straight to the session's store.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::StoreError;
use crate::models::{SeriesDescriptor, SeriesId, Snapshot, Timestamp, ViewPoint};
use crate::store::TimeSeriesStore;

#[derive(Debug, Clone)]
pub struct QueryEngine {
    store: Arc<TimeSeriesStore>,
}

impl QueryEngine {
    pub fn new(store: Arc<TimeSeriesStore>) -> Self {
        Self { store }
    }

    /// Every series of the session in id order.
    pub fn series(&self) -> Vec<(SeriesId, SeriesDescriptor)> {
        self.store
            .series_ids()
            .into_iter()
            .filter_map(|id| self.store.descriptor(id).ok().map(|d| (id, d)))
            .collect()
    }

    /// Earliest and latest timestamp over all series; the viewer's default window.
    pub fn time_bounds(&self) -> Option<(Timestamp, Timestamp)> {
        self.store
            .series_ids()
            .into_iter()
            .filter_map(|id| self.store.bounds(id).ok().flatten())
            .reduce(|(lo, hi), (a, b)| (lo.min(a), hi.max(b)))
    }

    /// At most `max_points_per_series` points per requested series, all over the same
    /// [t0, t1]. Unknown ids fail the whole call before anything is read.
    pub fn view(
        &self,
        series_ids: &[SeriesId],
        t0: Timestamp,
        t1: Timestamp,
        max_points_per_series: usize,
    ) -> Result<BTreeMap<SeriesId, Vec<ViewPoint>>, StoreError> {
        if let Some(unknown) = series_ids.iter().find(|id| !self.store.contains(**id)) {
            return Err(StoreError::UnknownSeries(*unknown));
        }
        let mut out = BTreeMap::new();
        for &id in series_ids {
            if out.contains_key(&id) {
                continue;
            }
            let points = self
                .store
                .aggregate(id, t0, t1, max_points_per_series)?
                .into_points();
            out.insert(id, points);
        }
        Ok(out)
    }

    /// Reconstructs one poll cycle: each series' latest sample at or before `ts`.
    pub fn snapshot_at(&self, ts: Timestamp) -> Snapshot {
        let values = self
            .store
            .series_ids()
            .into_iter()
            .map(|id| {
                let value = self
                    .store
                    .latest_at(id, ts)
                    .ok()
                    .flatten()
                    .map(|s| s.value);
                (id, value)
            })
            .collect();
        Snapshot {
            timestamp: ts,
            values,
        }
    }
}
