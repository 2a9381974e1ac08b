// Session: one monitoring run. Owns the store; the sampler writes, viewers query.

use std::sync::{Arc, Mutex, PoisonError};

use crate::models::{Sample, SeriesId, SessionInfo, SessionStatus};
use crate::query::QueryEngine;
use crate::source::MetricSource;
use crate::store::{StoreConfig, TimeSeriesStore};

/// A source bound to the series it feeds.
pub struct Binding {
    pub series: SeriesId,
    pub source: Box<dyn MetricSource>,
}

/// What the sampler forwards to the session writer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Sample { series: SeriesId, sample: Sample },
    Finished(SessionStatus),
}

#[derive(Debug)]
pub struct Session {
    info: Mutex<SessionInfo>,
    store: Arc<TimeSeriesStore>,
}

impl Session {
    pub fn new(info: SessionInfo, store: Arc<TimeSeriesStore>) -> Self {
        Self {
            info: Mutex::new(info),
            store,
        }
    }

    /// Creates a session described by `info` with one series per source, in source order.
    pub fn open(
        info: SessionInfo,
        store_config: StoreConfig,
        sources: Vec<Box<dyn MetricSource>>,
    ) -> (Self, Vec<Binding>) {
        let mut store = TimeSeriesStore::new(store_config);
        let bindings: Vec<Binding> = sources
            .into_iter()
            .map(|source| Binding {
                series: store.register(source.descriptor()),
                source,
            })
            .collect();
        (Self::new(info, Arc::new(store)), bindings)
    }

    pub fn info(&self) -> SessionInfo {
        self.info
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.info
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .status
            .clone()
    }

    pub fn store(&self) -> &Arc<TimeSeriesStore> {
        &self.store
    }

    pub fn query(&self) -> QueryEngine {
        QueryEngine::new(self.store.clone())
    }

    /// Records the terminal status. The first one wins; returns the status in effect.
    pub(crate) fn finalize(&self, status: SessionStatus) -> SessionStatus {
        let mut info = self.info.lock().unwrap_or_else(PoisonError::into_inner);
        if !info.status.is_terminal() {
            info.status = status;
        }
        info.status.clone()
    }
}
