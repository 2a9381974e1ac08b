// SessionRepo tests: schema, save/load round trip, writer task, end-to-end recording

mod common;

use common::{FakeProbe, ScriptedSource};
use proctimeline::models::*;
use proctimeline::sampler::{Sampler, SamplerConfig};
use proctimeline::session::{Session, SessionEvent};
use proctimeline::session_repo::SessionRepo;
use proctimeline::session_repo::writer::{
    SessionWriterConfig, spawn_session_writer, writer_channel_capacity,
};
use proctimeline::source::MetricSource;
use proctimeline::store::StoreConfig;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

async fn repo_in(dir: &TempDir) -> SessionRepo {
    let path = dir.path().join("sessions.db");
    let repo = SessionRepo::connect(path.to_str().unwrap())
        .await
        .expect("connect");
    repo.init().await.expect("init");
    repo
}

fn descriptors() -> Vec<SeriesDescriptor> {
    vec![
        SeriesDescriptor::new("process.cpu", "%", MetricKind::Cpu),
        SeriesDescriptor::new("process.threads", "threads", MetricKind::Threads),
    ]
}

fn threads(running: usize) -> Value {
    Value::Threads(
        (0..running as u32 + 1)
            .map(|i| ThreadEntry {
                pid: 100,
                tid: 100 + i,
                name: format!("worker-{i}"),
                state: if (i as usize) < running {
                    ThreadState::Running
                } else {
                    ThreadState::Sleeping
                },
                core: Some(i % 4),
            })
            .collect(),
    )
}

fn host() -> HostInfo {
    HostInfo {
        cpu_cores: 16,
        gpus: vec![GpuDevice {
            index: 0,
            name: "NVIDIA GeForce RTX 3090".into(),
            driver: "550.54.14".into(),
        }],
    }
}

#[tokio::test]
async fn session_repo_connect_creates_parent_dir() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("sessions.db");
    let repo = SessionRepo::connect(path.to_str().unwrap()).await.unwrap();
    repo.init().await.unwrap();
    // init is idempotent
    repo.init().await.unwrap();
    assert!(path.exists());
    assert!(repo.list_sessions().await.unwrap().is_empty());
}

#[tokio::test]
async fn session_repo_round_trip_preserves_series_and_samples() {
    let dir = TempDir::new().unwrap();
    let repo = repo_in(&dir).await;
    let id = repo
        .create_session(100, 1_000, 1_700_000_000_000, &host(), &descriptors())
        .await
        .unwrap();

    let mut batch = Vec::new();
    for tick in 0..50u64 {
        let ts = tick * 1_000;
        batch.push((SeriesId(0), Sample::scalar(ts, 0.1 + tick as f64 / 3.0)));
        batch.push((
            SeriesId(1),
            Sample {
                timestamp: ts,
                value: threads((tick % 3) as usize),
            },
        ));
    }
    repo.save_samples(id, &batch[..40]).await.unwrap();
    repo.save_samples(id, &batch[40..]).await.unwrap();
    repo.finish_session(
        id,
        &SessionStatus::Complete(CompletionReason::TargetExited),
        1_700_000_050_000,
    )
    .await
    .unwrap();

    let session = repo.load_session(id, StoreConfig::default()).await.unwrap();
    let info = session.info();
    assert_eq!(info.id, id);
    assert_eq!(info.target_pid, 100);
    assert_eq!(info.interval_ms, 1_000);
    assert_eq!(info.started_at, 1_700_000_000_000);
    assert_eq!(info.host, host());
    assert_eq!(
        info.status,
        SessionStatus::Complete(CompletionReason::TargetExited)
    );

    let query = session.query();
    let series: Vec<SeriesDescriptor> = query.series().into_iter().map(|(_, d)| d).collect();
    assert_eq!(series, descriptors());

    let store = session.store();
    for (series, offset) in [(SeriesId(0), 0usize), (SeriesId(1), 1)] {
        let loaded = store.range(series, 0, u64::MAX).unwrap();
        let appended: Vec<Sample> = batch
            .iter()
            .skip(offset)
            .step_by(2)
            .map(|(_, s)| s.clone())
            .collect();
        assert_eq!(loaded, appended, "{series}");
    }
}

#[tokio::test]
async fn session_repo_preserves_scalar_bits() {
    let dir = TempDir::new().unwrap();
    let repo = repo_in(&dir).await;
    let id = repo.create_session(1, 1_000, 0, &HostInfo::default(), &descriptors()).await.unwrap();
    let values = [
        -0.0,
        0.0,
        1.0,
        -3.0,
        f64::MIN_POSITIVE,
        f64::MIN_POSITIVE / 2.0,
        f64::MAX,
        f64::MIN,
        0.1 + 0.2,
        1e300,
        f64::INFINITY,
        f64::NEG_INFINITY,
    ];
    let batch: Vec<(SeriesId, Sample)> = values
        .iter()
        .enumerate()
        .map(|(i, v)| (SeriesId(0), Sample::scalar(i as u64, *v)))
        .collect();
    repo.save_samples(id, &batch).await.unwrap();

    let session = repo.load_session(id, StoreConfig::default()).await.unwrap();
    let loaded: Vec<u64> = session
        .store()
        .range(SeriesId(0), 0, u64::MAX)
        .unwrap()
        .iter()
        .map(|s| match s.value {
            Value::Scalar(v) => v.to_bits(),
            ref other => panic!("expected scalar, got {other:?}"),
        })
        .collect();
    let saved: Vec<u64> = values.iter().map(|v| v.to_bits()).collect();
    assert_eq!(loaded, saved);
}

#[tokio::test]
async fn session_repo_round_trips_process_tree_records() {
    let dir = TempDir::new().unwrap();
    let repo = repo_in(&dir).await;
    let series = vec![SeriesDescriptor::new(
        "process.tree",
        "processes",
        MetricKind::Processes,
    )];
    let id = repo
        .create_session(4242, 1_000, 0, &HostInfo::default(), &series)
        .await
        .unwrap();
    let tree = Value::Processes(vec![
        ProcessEntry {
            pid: 4242,
            parent: Some(1),
            name: "python3".into(),
            command: "python3 train.py --epochs 3".into(),
        },
        ProcessEntry {
            pid: 4250,
            parent: Some(4242),
            name: "worker".into(),
            command: "worker".into(),
        },
    ]);
    let sample = Sample {
        timestamp: 0,
        value: tree,
    };
    repo.save_samples(id, &[(SeriesId(0), sample.clone())])
        .await
        .unwrap();

    let session = repo.load_session(id, StoreConfig::default()).await.unwrap();
    assert_eq!(session.info().host, HostInfo::default());
    assert_eq!(
        session.store().range(SeriesId(0), 0, u64::MAX).unwrap(),
        vec![sample]
    );
    assert_eq!(session.store().descriptor(SeriesId(0)).unwrap(), series[0]);
}

#[tokio::test]
async fn session_repo_lists_sessions_with_status() {
    let dir = TempDir::new().unwrap();
    let repo = repo_in(&dir).await;
    let a = repo.create_session(1, 500, 10, &HostInfo::default(), &descriptors()).await.unwrap();
    let b = repo.create_session(2, 250, 20, &HostInfo::default(), &descriptors()).await.unwrap();
    repo.finish_session(a, &SessionStatus::Failed("store rejected sample".into()), 30)
        .await
        .unwrap();

    let sessions = repo.list_sessions().await.unwrap();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0].id, a);
    assert_eq!(
        sessions[0].status,
        SessionStatus::Failed("store rejected sample".into())
    );
    assert_eq!(sessions[1].id, b);
    assert_eq!(sessions[1].status, SessionStatus::Running);
    assert!(repo.get_session(b + 100).await.unwrap().is_none());
}

#[tokio::test]
async fn session_repo_load_missing_session_fails() {
    let dir = TempDir::new().unwrap();
    let repo = repo_in(&dir).await;
    let err = repo
        .load_session(42, StoreConfig::default())
        .await
        .err()
        .expect("missing session");
    assert!(err.to_string().contains("42"));
}

#[tokio::test]
async fn session_repo_delete_session_removes_rows() {
    let dir = TempDir::new().unwrap();
    let repo = repo_in(&dir).await;
    let id = repo.create_session(1, 1_000, 0, &HostInfo::default(), &descriptors()).await.unwrap();
    repo.save_samples(id, &[(SeriesId(0), Sample::scalar(0, 1.0))])
        .await
        .unwrap();
    assert_eq!(repo.delete_session(id).await.unwrap(), 1);
    assert!(repo.list_sessions().await.unwrap().is_empty());
}

#[tokio::test]
async fn session_writer_flushes_and_records_final_status() {
    let dir = TempDir::new().unwrap();
    let repo = Arc::new(repo_in(&dir).await);
    let id = repo.create_session(7, 1_000, 0, &HostInfo::default(), &descriptors()).await.unwrap();

    let (tx, rx) = mpsc::channel(writer_channel_capacity(4));
    let saved = Arc::new(AtomicU64::new(0));
    let writer = spawn_session_writer(
        rx,
        repo.clone(),
        id,
        SessionWriterConfig {
            flush_rate: 4,
            flush_interval_secs: 60,
        },
        saved.clone(),
    );
    for ts in 0..10u64 {
        tx.send(SessionEvent::Sample {
            series: SeriesId(0),
            sample: Sample::scalar(ts * 1_000, ts as f64),
        })
        .await
        .unwrap();
    }
    tx.send(SessionEvent::Finished(SessionStatus::Complete(
        CompletionReason::Stopped,
    )))
    .await
    .unwrap();
    writer.await.unwrap();

    assert_eq!(saved.load(Ordering::Relaxed), 10);
    let session = repo.load_session(id, StoreConfig::default()).await.unwrap();
    assert_eq!(session.store().sample_count(SeriesId(0)).unwrap(), 10);
    assert_eq!(
        session.status(),
        SessionStatus::Complete(CompletionReason::Stopped)
    );
}

#[tokio::test]
async fn session_writer_without_final_status_marks_failed() {
    let dir = TempDir::new().unwrap();
    let repo = Arc::new(repo_in(&dir).await);
    let id = repo.create_session(7, 1_000, 0, &HostInfo::default(), &descriptors()).await.unwrap();
    let (tx, rx) = mpsc::channel(8);
    let writer = spawn_session_writer(
        rx,
        repo.clone(),
        id,
        SessionWriterConfig {
            flush_rate: 100,
            flush_interval_secs: 60,
        },
        Arc::new(AtomicU64::new(0)),
    );
    tx.send(SessionEvent::Sample {
        series: SeriesId(0),
        sample: Sample::scalar(0, 3.0),
    })
    .await
    .unwrap();
    drop(tx);
    writer.await.unwrap();

    let info = repo.get_session(id).await.unwrap().unwrap();
    assert!(matches!(info.status, SessionStatus::Failed(_)));
    let session = repo.load_session(id, StoreConfig::default()).await.unwrap();
    assert_eq!(session.store().sample_count(SeriesId(0)).unwrap(), 1);
}

#[tokio::test]
async fn recorded_session_reloads_with_identical_views() {
    let dir = TempDir::new().unwrap();
    let repo = Arc::new(repo_in(&dir).await);
    let sources = vec![
        ScriptedSource::new("cpu", |n| Ok(Value::Scalar((n % 5) as f64))).boxed(),
        ScriptedSource::new("threads", |n| Ok(threads((n % 4) as usize))).boxed(),
    ];
    let descriptors: Vec<_> = sources.iter().map(|s| s.descriptor()).collect();
    let id = repo.create_session(common::FAKE_PID, 10, 0, &HostInfo::default(), &descriptors).await.unwrap();
    let store_config = StoreConfig {
        base_bucket_ms: 10,
        branching_factor: 4,
    };
    let (session, bindings) = Session::open(
        SessionInfo::running(id, common::FAKE_PID, 10, 0),
        store_config,
        sources,
    );
    let session = Arc::new(session);

    let (tx, rx) = mpsc::channel(writer_channel_capacity(8));
    let writer = spawn_session_writer(
        rx,
        repo.clone(),
        id,
        SessionWriterConfig {
            flush_rate: 8,
            flush_interval_secs: 1,
        },
        Arc::new(AtomicU64::new(0)),
    );
    let mut sampler = Sampler::new(
        session.clone(),
        bindings,
        FakeProbe::for_ticks(25),
        SamplerConfig::new(Duration::from_millis(10)),
    )
    .with_sink(tx);
    sampler.start().await.unwrap();
    let status = sampler.wait().await;
    drop(sampler);
    writer.await.unwrap();

    assert_eq!(
        status,
        SessionStatus::Complete(CompletionReason::TargetExited)
    );
    let reloaded = repo.load_session(id, store_config).await.unwrap();
    assert_eq!(reloaded.status(), status);

    let live = session.query();
    let stored = reloaded.query();
    let ids = [SeriesId(0), SeriesId(1)];
    let (t0, t1) = live.time_bounds().expect("samples recorded");
    assert_eq!(stored.time_bounds(), Some((t0, t1)));
    for budget in [3, 10, 1_000] {
        assert_eq!(
            live.view(&ids, t0, t1, budget).unwrap(),
            stored.view(&ids, t0, t1, budget).unwrap()
        );
    }
}
