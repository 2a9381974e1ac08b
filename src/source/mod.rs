// Metric sources: one measurable quantity each, polled once per tick.

mod gpu;
mod linux;
mod process;

pub use gpu::{
    GpuMemorySource, GpuProbe, GpuProcess, GpuProcessMemorySource, GpuReading,
    GpuTemperatureSource, GpuUtilizationSource, parse_compute_apps_csv, parse_gpu_csv,
};
pub use linux::parse_task_stat;
pub use process::{
    ProcessCpuSource, ProcessMemorySource, ProcessProbe, ProcessTreeSource, ThreadStateSource,
};

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::SourceError;
use crate::models::{HostInfo, MetricKind, SeriesDescriptor, Value};

/// A single measurable quantity. `poll` may suspend; the sampler bounds it with a timeout.
#[async_trait]
pub trait MetricSource: Send + Sync {
    fn descriptor(&self) -> SeriesDescriptor;

    async fn poll(&self) -> Result<Value, SourceError>;
}

/// Process-scoped liveness check run at the start of every tick.
#[async_trait]
pub trait TargetProbe: Send + Sync {
    fn pid(&self) -> u32;

    /// `Err(TargetGone)` once the target has exited.
    async fn check_alive(&self) -> Result<(), SourceError>;
}

/// Sources for `metrics`, in the order given (duplicates ignored). GPU metrics get one
/// source per device found by `gpu`; without a usable driver they are left out.
pub async fn build_sources(
    metrics: &[MetricKind],
    process: Arc<ProcessProbe>,
    gpu: Arc<GpuProbe>,
) -> Vec<Box<dyn MetricSource>> {
    let mut seen = Vec::with_capacity(metrics.len());
    let mut devices: Option<Vec<u32>> = None;
    let mut sources: Vec<Box<dyn MetricSource>> = Vec::new();

    for &kind in metrics {
        if seen.contains(&kind) {
            continue;
        }
        seen.push(kind);
        match kind {
            MetricKind::Cpu => sources.push(Box::new(ProcessCpuSource::new(process.clone()))),
            MetricKind::Memory => sources.push(Box::new(ProcessMemorySource::new(process.clone()))),
            MetricKind::Threads => sources.push(Box::new(ThreadStateSource::new(process.clone()))),
            MetricKind::Processes => sources.push(Box::new(ProcessTreeSource::new(process.clone()))),
            MetricKind::GpuUtilization | MetricKind::GpuMemory | MetricKind::GpuTemperature => {
                if devices.is_none() {
                    devices = Some(discover_gpus(&gpu).await);
                }
                for &index in devices.iter().flatten() {
                    let source: Box<dyn MetricSource> = match kind {
                        MetricKind::GpuUtilization => {
                            Box::new(GpuUtilizationSource::new(gpu.clone(), index))
                        }
                        MetricKind::GpuMemory => Box::new(GpuMemorySource::new(gpu.clone(), index)),
                        _ => Box::new(GpuTemperatureSource::new(gpu.clone(), index)),
                    };
                    sources.push(source);
                }
            }
            MetricKind::GpuProcessMemory => {
                if devices.is_none() {
                    devices = Some(discover_gpus(&gpu).await);
                }
                if devices.as_ref().is_some_and(|d| !d.is_empty()) {
                    sources.push(Box::new(GpuProcessMemorySource::new(
                        process.clone(),
                        gpu.clone(),
                    )));
                }
            }
        }
    }
    sources
}

async fn discover_gpus(gpu: &GpuProbe) -> Vec<u32> {
    match gpu.discover().await {
        Ok(devices) => {
            if devices.is_empty() {
                warn!(operation = "discover_gpus", "no GPU devices reported; GPU series skipped");
            }
            devices
        }
        Err(SourceError::Unsupported(msg)) => {
            warn!(operation = "discover_gpus", reason = %msg, "GPU metrics unsupported on this host; GPU series skipped");
            Vec::new()
        }
        Err(e) => {
            // The driver may come back; keep device 0 and let the sampler record gaps.
            warn!(operation = "discover_gpus", error = %e, "GPU discovery failed; assuming device 0");
            vec![0]
        }
    }
}

/// Core count and GPU inventory recorded with a session. Missing facts are left empty.
pub async fn host_info(process: &ProcessProbe, gpu: &GpuProbe) -> HostInfo {
    let cpu_cores = process.cpu_cores().await.unwrap_or_else(|e| {
        warn!(operation = "host_info", error = %e, "could not count CPU cores");
        0
    });
    let gpus = gpu.devices().await.unwrap_or_else(|e| {
        debug!(operation = "host_info", error = %e, "no GPU inventory");
        Vec::new()
    });
    HostInfo { cpu_cores, gpus }
}
