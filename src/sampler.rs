// Sampler: fixed-interval polling loop bound to one target process.
// State machine Idle -> Running -> {Stopped, Failed}. Stop requests are only honoured
// between ticks, so a tick's polls always complete and append together.
// Samples go to the session store; a copy is forwarded to the session writer, if any.

use futures_util::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Duration, Instant};
use tracing::{Instrument, debug, error, info, warn};

use crate::error::{SessionError, SourceError};
use crate::models::{CompletionReason, Sample, SeriesId, SessionStatus, Value};
use crate::session::{Binding, Session, SessionEvent};
use crate::source::TargetProbe;

/// Sampler timing.
#[derive(Debug, Clone, Copy)]
pub struct SamplerConfig {
    pub interval: Duration,
    /// Upper bound for each source poll and for the liveness check.
    pub source_timeout: Duration,
    /// How often to log sampler stats at INFO level.
    pub stats_log_interval: Duration,
}

impl SamplerConfig {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            source_timeout: interval,
            stats_log_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerState {
    Idle,
    Running,
    Stopped,
    Failed,
}

/// Counters updated by the polling loop.
#[derive(Debug, Default)]
pub struct SamplerStats {
    ticks: AtomicU64,
    skipped_ticks: AtomicU64,
    samples: AtomicU64,
    gaps: AtomicU64,
    last_slot: AtomicU64,
    last_tick_ms: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerStatsSnapshot {
    /// Completed ticks.
    pub ticks: u64,
    /// Tick deadlines that passed while an earlier tick was still running.
    pub skipped_ticks: u64,
    pub samples: u64,
    /// Polls that produced no sample (transient, unsupported, timed out).
    pub gaps: u64,
    /// Schedule slot of the last completed tick; its ideal start is `slot * interval`.
    pub last_slot: u64,
    /// Actual start of the last completed tick, in session milliseconds.
    pub last_tick_ms: u64,
}

impl SamplerStats {
    pub fn snapshot(&self) -> SamplerStatsSnapshot {
        SamplerStatsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            skipped_ticks: self.skipped_ticks.load(Ordering::Relaxed),
            samples: self.samples.load(Ordering::Relaxed),
            gaps: self.gaps.load(Ordering::Relaxed),
            last_slot: self.last_slot.load(Ordering::Relaxed),
            last_tick_ms: self.last_tick_ms.load(Ordering::Relaxed),
        }
    }
}

pub struct Sampler {
    session: Arc<Session>,
    probe: Arc<dyn TargetProbe>,
    config: SamplerConfig,
    bindings: Option<Vec<Binding>>,
    sink: Option<mpsc::Sender<SessionEvent>>,
    state: Arc<Mutex<SamplerState>>,
    stats: Arc<SamplerStats>,
    stop_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<SessionStatus>>,
    stop_requested: bool,
}

impl Sampler {
    pub fn new(
        session: Arc<Session>,
        bindings: Vec<Binding>,
        probe: Arc<dyn TargetProbe>,
        config: SamplerConfig,
    ) -> Self {
        Self {
            session,
            probe,
            config,
            bindings: Some(bindings),
            sink: None,
            state: Arc::new(Mutex::new(SamplerState::Idle)),
            stats: Arc::new(SamplerStats::default()),
            stop_tx: None,
            task: None,
            stop_requested: false,
        }
    }

    /// Forward every appended sample, then the terminal status, to `sink`.
    pub fn with_sink(mut self, sink: mpsc::Sender<SessionEvent>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn state(&self) -> SamplerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stats(&self) -> SamplerStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Checks the target exists, then spawns the polling loop. Tick 0 fires immediately.
    pub async fn start(&mut self) -> Result<(), SessionError> {
        match self.state() {
            SamplerState::Idle => {}
            SamplerState::Running => return Err(SessionError::AlreadyRunning),
            SamplerState::Stopped | SamplerState::Failed => {
                return Err(SessionError::AlreadyStopped);
            }
        }
        let pid = self.probe.pid();
        if let Err(e) = self.probe.check_alive().await {
            debug!(pid, error = %e, "target validation failed");
            return Err(SessionError::TargetNotFound { pid });
        }

        let bindings = self.bindings.take().unwrap_or_default();
        let series_names = bindings
            .iter()
            .map(|b| b.source.descriptor().name)
            .collect::<Vec<_>>();
        let (stop_tx, stop_rx) = watch::channel(false);
        set_state(&self.state, SamplerState::Running);

        let interval_ms = self.config.interval.as_millis() as u64;
        info!(pid, interval_ms, series = ?series_names, "sampler started");

        let ctx = LoopContext {
            session: self.session.clone(),
            probe: self.probe.clone(),
            bindings,
            series_names,
            sink: self.sink.take(),
            state: self.state.clone(),
            stats: self.stats.clone(),
            config: self.config,
            stop_rx,
            epoch: Instant::now(),
        };
        let span = tracing::span!(tracing::Level::DEBUG, "sampler", pid, interval_ms);
        self.task = Some(tokio::spawn(run(ctx).instrument(span)));
        self.stop_tx = Some(stop_tx);
        Ok(())
    }

    /// Asks the loop to exit after the in-flight tick and waits for the session to be
    /// finalized. A second call returns `AlreadyStopped`.
    pub async fn stop(&mut self) -> Result<SessionStatus, SessionError> {
        if self.stop_requested {
            return Err(SessionError::AlreadyStopped);
        }
        self.stop_requested = true;
        if let Some(stop_tx) = self.stop_tx.as_ref() {
            let _ = stop_tx.send(true);
        }
        match self.task.take() {
            Some(task) => Ok(self.joined(task.await)),
            None if self.state() == SamplerState::Idle => {
                set_state(&self.state, SamplerState::Stopped);
                let status = self
                    .session
                    .finalize(SessionStatus::Complete(CompletionReason::Stopped));
                if let Some(sink) = self.sink.take() {
                    let _ = sink.send(SessionEvent::Finished(status.clone())).await;
                }
                Ok(status)
            }
            None => Err(SessionError::AlreadyStopped),
        }
    }

    /// Waits for the loop to end on its own (target exit or fatal store error).
    /// Cancel-safe: dropping the future leaves the loop running and `stop` usable.
    pub async fn wait(&mut self) -> SessionStatus {
        let Some(task) = self.task.as_mut() else {
            return self.session.status();
        };
        let result = task.await;
        self.task = None;
        self.joined(result)
    }

    fn joined(&self, result: Result<SessionStatus, JoinError>) -> SessionStatus {
        match result {
            Ok(status) => status,
            Err(e) => {
                error!(error = %e, "sampler task panicked");
                set_state(&self.state, SamplerState::Failed);
                self.session
                    .finalize(SessionStatus::Failed(format!("sampler task: {}", e)))
            }
        }
    }
}

fn set_state(state: &Mutex<SamplerState>, next: SamplerState) {
    *state.lock().unwrap_or_else(PoisonError::into_inner) = next;
}

struct LoopContext {
    session: Arc<Session>,
    probe: Arc<dyn TargetProbe>,
    bindings: Vec<Binding>,
    series_names: Vec<String>,
    sink: Option<mpsc::Sender<SessionEvent>>,
    state: Arc<Mutex<SamplerState>>,
    stats: Arc<SamplerStats>,
    config: SamplerConfig,
    stop_rx: watch::Receiver<bool>,
    epoch: Instant,
}

enum TickOutcome {
    Continue,
    TargetGone,
    Fatal(String),
}

/// Consecutive failures of one source; logs the first failure and the recovery only.
#[derive(Debug, Clone, Default)]
struct FailureStreak {
    count: u64,
}

impl FailureStreak {
    fn failed(&mut self, series: &str, err: &SourceError) {
        if self.count == 0 {
            warn!(series, error = %err, "source failed; recording gaps");
        } else {
            debug!(series, error = %err, failed_ticks = self.count + 1, "source still failing");
        }
        self.count += 1;
    }

    fn succeeded(&mut self, series: &str) {
        if self.count > 0 {
            info!(series, failed_ticks = self.count, "source recovered");
        }
        self.count = 0;
    }
}

async fn run(mut ctx: LoopContext) -> SessionStatus {
    let interval_ms = (ctx.config.interval.as_millis() as u64).max(1);
    let mut streaks = vec![FailureStreak::default(); ctx.bindings.len()];
    let mut last_stats_log = Instant::now();
    let mut slot: u64 = 0;

    let outcome = loop {
        if *ctx.stop_rx.borrow() {
            break SessionStatus::Complete(CompletionReason::Stopped);
        }
        // Deadlines are anchored to the epoch so slow ticks never accumulate drift.
        let deadline = ctx.epoch + Duration::from_millis(slot.saturating_mul(interval_ms));
        tokio::select! {
            biased;
            // Ok: stop requested. Err: the Sampler handle was dropped.
            _ = ctx.stop_rx.changed() => {
                break SessionStatus::Complete(CompletionReason::Stopped);
            }
            _ = tokio::time::sleep_until(deadline) => {}
        }

        match tick(&mut ctx, slot, &mut streaks).await {
            TickOutcome::Continue => {}
            TickOutcome::TargetGone => break SessionStatus::Complete(CompletionReason::TargetExited),
            TickOutcome::Fatal(msg) => break SessionStatus::Failed(msg),
        }

        let elapsed_ms = ctx.epoch.elapsed().as_millis() as u64;
        let next = slot + 1;
        if elapsed_ms > next.saturating_mul(interval_ms) {
            // Overran the next deadline: count every deadline already behind us,
            // run the latest due slot now and drop the rest.
            let passed = elapsed_ms.div_ceil(interval_ms) - 1 - slot;
            let due = (elapsed_ms / interval_ms).max(next);
            ctx.stats.skipped_ticks.fetch_add(passed, Ordering::Relaxed);
            debug!(slot, due, passed, "tick overran its interval");
            slot = due;
        } else {
            slot = next;
        }

        if last_stats_log.elapsed() >= ctx.config.stats_log_interval {
            let s = ctx.stats.snapshot();
            info!(
                ticks = s.ticks,
                skipped_ticks = s.skipped_ticks,
                samples = s.samples,
                gaps = s.gaps,
                "sampler stats"
            );
            last_stats_log = Instant::now();
        }
    };

    let status = ctx.session.finalize(outcome);
    let final_state = match status {
        SessionStatus::Failed(_) => SamplerState::Failed,
        _ => SamplerState::Stopped,
    };
    set_state(&ctx.state, final_state);
    if let Some(sink) = ctx.sink.take()
        && sink.send(SessionEvent::Finished(status.clone())).await.is_err()
    {
        debug!("session writer closed before the final status");
    }
    let s = ctx.stats.snapshot();
    info!(
        status = ?status,
        ticks = s.ticks,
        skipped_ticks = s.skipped_ticks,
        samples = s.samples,
        gaps = s.gaps,
        "sampler finished"
    );
    status
}

async fn tick(ctx: &mut LoopContext, slot: u64, streaks: &mut [FailureStreak]) -> TickOutcome {
    let timestamp = ctx.epoch.elapsed().as_millis() as u64;
    let timeout = ctx.config.source_timeout;

    match tokio::time::timeout(timeout, ctx.probe.check_alive()).await {
        Ok(Ok(())) => {}
        Ok(Err(SourceError::TargetGone { pid })) => {
            info!(pid, timestamp, "target exited; finalizing session");
            return TickOutcome::TargetGone;
        }
        Ok(Err(e)) => warn!(error = %e, operation = "check_alive", "liveness check failed"),
        Err(_) => warn!(operation = "check_alive", "liveness check timed out"),
    }

    let polls = ctx.bindings.iter().map(|b| async move {
        match tokio::time::timeout(timeout, b.source.poll()).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::Transient(format!(
                "poll timed out after {} ms",
                timeout.as_millis()
            ))),
        }
    });
    let results = join_all(polls).await;

    let mut forwarded: Vec<(SeriesId, Sample)> = Vec::with_capacity(results.len());
    let mut rejected: Option<String> = None;
    for (i, result) in results.into_iter().enumerate() {
        let binding = &ctx.bindings[i];
        let name = ctx.series_names[i].as_str();
        let result = match result {
            Ok(Value::Scalar(v)) if !v.is_finite() => {
                Err(SourceError::Transient(format!("non-finite reading {}", v)))
            }
            other => other,
        };
        match result {
            Ok(value) => {
                streaks[i].succeeded(name);
                let sample = Sample { timestamp, value };
                if let Err(e) = ctx.session.store().append(binding.series, sample.clone()) {
                    error!(error = %e, series = name, "store rejected sample; sampler failed");
                    rejected = Some(e.to_string());
                    break;
                }
                ctx.stats.samples.fetch_add(1, Ordering::Relaxed);
                forwarded.push((binding.series, sample));
            }
            Err(e) => {
                ctx.stats.gaps.fetch_add(1, Ordering::Relaxed);
                streaks[i].failed(name, &e);
            }
        }
    }

    if rejected.is_none() {
        ctx.stats.ticks.fetch_add(1, Ordering::Relaxed);
        ctx.stats.last_slot.store(slot, Ordering::Relaxed);
        ctx.stats.last_tick_ms.store(timestamp, Ordering::Relaxed);
    }

    // Forward whatever reached the store, including on a failing tick.
    let mut writer_closed = false;
    if let Some(sink) = ctx.sink.as_ref() {
        for (series, sample) in forwarded {
            if sink
                .send(SessionEvent::Sample { series, sample })
                .await
                .is_err()
            {
                debug!("session writer channel closed");
                writer_closed = true;
                break;
            }
        }
    }
    if writer_closed {
        ctx.sink = None;
    }
    match rejected {
        Some(msg) => TickOutcome::Fatal(msg),
        None => TickOutcome::Continue,
    }
}
