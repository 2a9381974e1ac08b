// Session writer task: receives events from the sampler and persists them in batches.
// The sampler never waits on the database; the channel provides backpressure only.

use super::SessionRepo;
use crate::models::{Sample, SeriesId, SessionStatus};
use crate::session::SessionEvent;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::time::{Duration, interval};

/// Channel capacity for the session writer (backpressure if the writer falls behind).
pub fn writer_channel_capacity(flush_rate: u64) -> usize {
    (flush_rate as usize * 2).max(32)
}

/// Batching for the session writer task.
#[derive(Debug, Clone, Copy)]
pub struct SessionWriterConfig {
    pub flush_rate: u64,
    pub flush_interval_secs: u64,
}

/// Spawns the task that persists samples of `session_id`.
/// Flushes when buffer len >= flush_rate, every flush_interval_secs, and on exit.
/// Exits on `Finished` (after recording the final status) or when the sender is dropped.
pub fn spawn_session_writer(
    mut rx: mpsc::Receiver<SessionEvent>,
    repo: Arc<SessionRepo>,
    session_id: i64,
    config: SessionWriterConfig,
    samples_saved_total: Arc<AtomicU64>,
) -> tokio::task::JoinHandle<()> {
    let flush_interval = Duration::from_secs(config.flush_interval_secs.max(1));
    let flush_rate = config.flush_rate.max(1) as usize;
    tokio::spawn(async move {
        let mut buffer: Vec<(SeriesId, Sample)> = Vec::new();
        let mut flush_tick = interval(flush_interval);
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut final_status: Option<SessionStatus> = None;

        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Some(SessionEvent::Sample { series, sample }) => {
                            buffer.push((series, sample));
                            if buffer.len() >= flush_rate
                                && let Err(e) = flush_buffer(&repo, session_id, &mut buffer, &samples_saved_total).await
                            {
                                tracing::warn!(error = %e, "session writer: save_samples failed");
                            }
                        }
                        Some(SessionEvent::Finished(status)) => {
                            final_status = Some(status);
                            break;
                        }
                        None => break,
                    }
                }
                _ = flush_tick.tick() => {
                    if let Err(e) = flush_buffer(&repo, session_id, &mut buffer, &samples_saved_total).await {
                        tracing::warn!(error = %e, "session writer: save_samples failed");
                    }
                }
            }
        }
        if let Err(e) = flush_buffer(&repo, session_id, &mut buffer, &samples_saved_total).await {
            tracing::warn!(error = %e, "session writer: final flush failed");
        }

        let status = final_status.unwrap_or_else(|| {
            SessionStatus::Failed("collector stopped without a final status".to_string())
        });
        let ended_at = chrono::Utc::now().timestamp_millis();
        if let Err(e) = repo.finish_session(session_id, &status, ended_at).await {
            tracing::warn!(error = %e, "session writer: finish_session failed");
        }
        tracing::debug!(session_id, status = ?status, "Session writer shutting down");
    })
}

async fn flush_buffer(
    repo: &SessionRepo,
    session_id: i64,
    buffer: &mut Vec<(SeriesId, Sample)>,
    samples_saved_total: &AtomicU64,
) -> anyhow::Result<()> {
    if buffer.is_empty() {
        return Ok(());
    }
    let n = buffer.len();
    repo.save_samples(session_id, buffer).await?;
    samples_saved_total.fetch_add(n as u64, Ordering::Relaxed);
    buffer.clear();
    tracing::debug!(
        operation = "save_samples",
        samples_count = n,
        "Samples saved"
    );
    Ok(())
}
