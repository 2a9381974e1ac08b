// Metric source tests against the test process itself and a scripted GPU query tool

use proctimeline::error::SourceError;
use proctimeline::models::*;
use proctimeline::source::{
    GpuMemorySource, GpuProbe, GpuProcessMemorySource, GpuTemperatureSource, GpuUtilizationSource,
    MetricSource, ProcessMemorySource, ProcessProbe, ProcessTreeSource, TargetProbe,
    ThreadStateSource, build_sources, host_info,
};
use std::sync::Arc;

const MISSING_PID: u32 = u32::MAX - 1;

fn names(sources: &[Box<dyn MetricSource>]) -> Vec<String> {
    sources.iter().map(|s| s.descriptor().name).collect()
}

#[tokio::test]
async fn own_process_is_alive_and_uses_memory() {
    let probe = Arc::new(ProcessProbe::new(std::process::id(), true));
    probe.check_alive().await.unwrap();
    let rss = ProcessMemorySource::new(probe.clone()).poll().await.unwrap();
    assert!(rss.as_scalar().unwrap() > 0.0);
}

#[tokio::test]
async fn missing_process_is_target_gone() {
    let probe = Arc::new(ProcessProbe::new(MISSING_PID, false));
    assert_eq!(
        probe.check_alive().await,
        Err(SourceError::TargetGone { pid: MISSING_PID })
    );
    let err = ProcessMemorySource::new(probe).poll().await.unwrap_err();
    assert_eq!(err, SourceError::TargetGone { pid: MISSING_PID });
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn own_threads_are_listed() {
    let probe = Arc::new(ProcessProbe::new(std::process::id(), false));
    let value = ThreadStateSource::new(probe).poll().await.unwrap();
    let Value::Threads(threads) = value else {
        panic!("expected a thread record");
    };
    assert!(!threads.is_empty());
    assert!(threads.iter().any(|t| t.tid == std::process::id()));
    assert!(threads.windows(2).all(|w| w[0].tid < w[1].tid));
}

#[tokio::test]
async fn own_process_tree_has_name_and_command() {
    let pid = std::process::id();
    let probe = Arc::new(ProcessProbe::new(pid, true));
    let value = ProcessTreeSource::new(probe.clone()).poll().await.unwrap();
    let Value::Processes(processes) = value else {
        panic!("expected a process record");
    };
    let me = &processes[0];
    assert_eq!(me.pid, pid);
    assert!(!me.name.is_empty());
    assert!(!me.command.is_empty());
    assert_eq!(me.label(), format!("{} (PID {})", me.name, pid));
    assert_eq!(probe.tree_pids().await.unwrap()[0], pid);
}

#[tokio::test]
async fn host_info_counts_cores_without_gpus() {
    let process = ProcessProbe::new(std::process::id(), false);
    let gpu = GpuProbe::with_command("definitely-not-nvidia-smi-4242");
    let host = host_info(&process, &gpu).await;
    assert!(host.cpu_cores >= 1);
    assert!(host.gpus.is_empty());
}

#[tokio::test]
async fn gpu_metrics_are_skipped_without_driver() {
    let process = Arc::new(ProcessProbe::new(std::process::id(), true));
    let gpu = Arc::new(GpuProbe::with_command("definitely-not-nvidia-smi-4242"));
    let sources = build_sources(
        &[
            MetricKind::Cpu,
            MetricKind::GpuUtilization,
            MetricKind::Memory,
            MetricKind::Cpu,
            MetricKind::GpuMemory,
            MetricKind::GpuTemperature,
            MetricKind::GpuProcessMemory,
        ],
        process,
        gpu,
    )
    .await;
    assert_eq!(names(&sources), vec!["process.cpu", "process.rss"]);
}

#[cfg(unix)]
#[tokio::test]
async fn gpu_sources_read_scripted_query_tool() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::TempDir::new().unwrap();
    let script = dir.path().join("fake-nvidia-smi");
    let pid = std::process::id();
    std::fs::write(
        &script,
        format!(
            "#!/bin/sh\n\
             case \"$1\" in\n\
             --query-compute-apps*)\n\
             echo '{pid}, /usr/bin/test-binary, 1536'\n\
             echo '1, /sbin/init, 64'\n\
             ;;\n\
             *)\n\
             echo '0, NVIDIA GeForce RTX 3090, 550.54.14, 37, 2048, 8192, 61'\n\
             echo '1, Tesla T4, 550.54.14, [N/A], 10, 24576, [N/A]'\n\
             ;;\n\
             esac\n"
        ),
    )
    .unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let gpu = Arc::new(GpuProbe::with_command(script.to_str().unwrap()));
    assert_eq!(gpu.discover().await.unwrap(), vec![0, 1]);

    let util0 = GpuUtilizationSource::new(gpu.clone(), 0).poll().await.unwrap();
    assert_eq!(util0, Value::Scalar(37.0));
    let mem0 = GpuMemorySource::new(gpu.clone(), 0).poll().await.unwrap();
    assert_eq!(mem0, Value::Scalar(25.0));
    let util1 = GpuUtilizationSource::new(gpu.clone(), 1).poll().await.unwrap_err();
    assert!(matches!(util1, SourceError::Unsupported(_)));
    let missing = GpuMemorySource::new(gpu.clone(), 3).poll().await.unwrap_err();
    assert!(matches!(missing, SourceError::Transient(_)));
    let temp0 = GpuTemperatureSource::new(gpu.clone(), 0).poll().await.unwrap();
    assert_eq!(temp0, Value::Scalar(61.0));
    let temp1 = GpuTemperatureSource::new(gpu.clone(), 1).poll().await.unwrap_err();
    assert!(matches!(temp1, SourceError::Unsupported(_)));

    let devices = gpu.devices().await.unwrap();
    assert_eq!(devices[1].name, "Tesla T4");
    assert_eq!(devices[1].driver, "550.54.14");

    let process = Arc::new(ProcessProbe::new(pid, false));
    let used = GpuProcessMemorySource::new(process.clone(), gpu.clone())
        .poll()
        .await
        .unwrap();
    assert_eq!(used, Value::Scalar(1536.0));

    let host = host_info(&process, &gpu).await;
    assert_eq!(host.gpus, devices);

    let sources = build_sources(
        &[
            MetricKind::GpuUtilization,
            MetricKind::Threads,
            MetricKind::GpuMemory,
            MetricKind::GpuTemperature,
            MetricKind::GpuProcessMemory,
            MetricKind::Processes,
        ],
        process,
        gpu,
    )
    .await;
    assert_eq!(
        names(&sources),
        vec![
            "gpu#0.utilization",
            "gpu#1.utilization",
            "process.threads",
            "gpu#0.memory",
            "gpu#1.memory",
            "gpu#0.temperature",
            "gpu#1.temperature",
            "process.gpu_memory",
            "process.tree",
        ]
    );
}
