use anyhow::Result;
use proctimeline::config::AppConfig;
use proctimeline::models::{SessionInfo, SessionStatus};
use proctimeline::sampler::{Sampler, SamplerConfig};
use proctimeline::session::Session;
use proctimeline::session_repo::SessionRepo;
use proctimeline::session_repo::writer::{
    SessionWriterConfig, spawn_session_writer, writer_channel_capacity,
};
use proctimeline::source::{self, GpuProbe, ProcessProbe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(
            w,
            "{}",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z")
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_timer(LocalTimer)
        .with_env_filter(filter)
        .init();

    let app_config = AppConfig::load()?;
    let pid = app_config.target_pid()?;
    let collector = &app_config.collector;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        pid,
        interval_ms = collector.interval_ms,
        metrics = ?collector.metrics,
        "Starting proctimeline"
    );

    let repo = Arc::new(SessionRepo::connect(&app_config.session.path).await?);
    repo.init().await?;

    let process = Arc::new(ProcessProbe::new(pid, collector.include_children));
    let gpu = Arc::new(GpuProbe::new());
    let host = source::host_info(&process, &gpu).await;
    tracing::info!(cpu_cores = host.cpu_cores, gpus = ?host.gpus, "Host inventory");
    let sources = source::build_sources(&collector.metrics, process.clone(), gpu).await;
    anyhow::ensure!(
        !sources.is_empty(),
        "none of the configured metrics {:?} is available on this host",
        collector.metrics
    );
    let descriptors: Vec<_> = sources.iter().map(|s| s.descriptor()).collect();

    let started_at = chrono::Utc::now().timestamp_millis();
    let session_id = repo
        .create_session(pid, collector.interval_ms, started_at, &host, &descriptors)
        .await?;
    let (session, bindings) = Session::open(
        SessionInfo::running(session_id, pid, collector.interval_ms, started_at).with_host(host),
        app_config.store,
        sources,
    );
    let session = Arc::new(session);

    let (write_tx, write_rx) = mpsc::channel(writer_channel_capacity(app_config.session.flush_rate));
    let samples_saved_total = Arc::new(AtomicU64::new(0));
    let writer = spawn_session_writer(
        write_rx,
        repo.clone(),
        session_id,
        SessionWriterConfig {
            flush_rate: app_config.session.flush_rate,
            flush_interval_secs: app_config.session.flush_interval_secs,
        },
        samples_saved_total.clone(),
    );

    let mut sampler = Sampler::new(
        session.clone(),
        bindings,
        process,
        SamplerConfig {
            interval: Duration::from_millis(collector.interval_ms),
            source_timeout: Duration::from_millis(collector.source_timeout_ms()),
            stats_log_interval: Duration::from_secs(app_config.monitoring.stats_log_interval_secs),
        },
    )
    .with_sink(write_tx);

    if let Err(e) = sampler.start().await {
        drop(sampler);
        let _ = writer.await;
        repo.finish_session(
            session_id,
            &SessionStatus::Failed(e.to_string()),
            chrono::Utc::now().timestamp_millis(),
        )
        .await?;
        return Err(e.into());
    }
    tracing::info!(session_id, "Recording session");

    let status = tokio::select! {
        status = sampler.wait() => status,
        _ = shutdown_signal() => {
            tracing::info!("Received shutdown signal");
            match sampler.stop().await {
                Ok(status) => status,
                Err(_) => session.status(),
            }
        }
    };
    drop(sampler);

    if let Err(e) = writer.await {
        tracing::warn!(error = %e, "session writer task failed");
    }
    tracing::info!(
        session_id,
        status = ?status,
        samples_saved = samples_saved_total.load(Ordering::Relaxed),
        "Session recorded"
    );
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(_) => {
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
