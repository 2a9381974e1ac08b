// Shared test helpers: scripted metric sources and target probes.
#![allow(dead_code)]

use async_trait::async_trait;
use proctimeline::error::SourceError;
use proctimeline::models::{MetricKind, SeriesDescriptor, Value};
use proctimeline::source::{MetricSource, TargetProbe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub const FAKE_PID: u32 = 4242;

type Script = dyn Fn(u64) -> Result<Value, SourceError> + Send + Sync;

/// Source whose n-th poll (0-based) returns `script(n)`, after an optional delay.
pub struct ScriptedSource {
    name: String,
    script: Box<Script>,
    delay: Duration,
    polls: Arc<AtomicU64>,
}

impl ScriptedSource {
    pub fn new(
        name: &str,
        script: impl Fn(u64) -> Result<Value, SourceError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.to_string(),
            script: Box::new(script),
            delay: Duration::ZERO,
            polls: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Always returns `value`.
    pub fn constant(name: &str, value: f64) -> Self {
        Self::new(name, move |_| Ok(Value::Scalar(value)))
    }

    /// Simulated work per poll (virtual time under `start_paused`).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn poll_counter(&self) -> Arc<AtomicU64> {
        self.polls.clone()
    }

    pub fn boxed(self) -> Box<dyn MetricSource> {
        Box::new(self)
    }
}

#[async_trait]
impl MetricSource for ScriptedSource {
    fn descriptor(&self) -> SeriesDescriptor {
        SeriesDescriptor::new(self.name.clone(), "%", MetricKind::Cpu)
    }

    async fn poll(&self) -> Result<Value, SourceError> {
        let n = self.polls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.script)(n)
    }
}

/// Probe that reports the target alive for the first `alive_checks` calls, then gone.
/// The sampler's `start` consumes one check before tick 0.
pub struct FakeProbe {
    alive_checks: u64,
    checks: AtomicU64,
}

impl FakeProbe {
    pub fn exits_after(alive_checks: u64) -> Arc<Self> {
        Arc::new(Self {
            alive_checks,
            checks: AtomicU64::new(0),
        })
    }

    /// Alive for `ticks` ticks (plus the check made by `start`).
    pub fn for_ticks(ticks: u64) -> Arc<Self> {
        Self::exits_after(ticks + 1)
    }

    pub fn immortal() -> Arc<Self> {
        Self::exits_after(u64::MAX)
    }

    pub fn checks(&self) -> u64 {
        self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TargetProbe for FakeProbe {
    fn pid(&self) -> u32 {
        FAKE_PID
    }

    async fn check_alive(&self) -> Result<(), SourceError> {
        let n = self.checks.fetch_add(1, Ordering::SeqCst);
        if n < self.alive_checks {
            Ok(())
        } else {
            Err(SourceError::TargetGone { pid: FAKE_PID })
        }
    }
}
