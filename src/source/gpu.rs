// GPU sources via nvidia-smi. One device query per tick is shared by every GPU series;
// per-process GPU memory comes from a separate compute-apps query.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::{MetricSource, ProcessProbe};
use crate::error::SourceError;
use crate::models::{GpuDevice, MetricKind, SeriesDescriptor, Value};

const QUERY_ARGS: [&str; 2] = [
    "--query-gpu=index,name,driver_version,utilization.gpu,memory.used,memory.total,temperature.gpu",
    "--format=csv,noheader,nounits",
];

const COMPUTE_APPS_ARGS: [&str; 2] = [
    "--query-compute-apps=pid,process_name,used_memory",
    "--format=csv,noheader,nounits",
];

/// Readings younger than this are reused by the next GPU series polled in the same tick.
const CACHE_MAX_AGE: Duration = Duration::from_millis(200);

/// One device line of the query. Fields nvidia-smi reports as "[N/A]" are `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct GpuReading {
    pub index: u32,
    pub name: String,
    pub driver: String,
    pub utilization_percent: Option<f64>,
    pub memory_used_mb: Option<f64>,
    pub memory_total_mb: Option<f64>,
    pub temperature_c: Option<f64>,
}

impl GpuReading {
    pub fn device(&self) -> GpuDevice {
        GpuDevice {
            index: self.index,
            name: self.name.clone(),
            driver: self.driver.clone(),
        }
    }

    pub fn memory_percent(&self) -> Option<f64> {
        let used = self.memory_used_mb?;
        let total = self.memory_total_mb?;
        if total > 0.0 {
            Some((used / total) * 100.0)
        } else {
            Some(0.0)
        }
    }
}

fn parse_field(s: &str, field: &str) -> Result<Option<f64>, SourceError> {
    let s = s.trim();
    if s.starts_with('[') || s.eq_ignore_ascii_case("n/a") {
        return Ok(None);
    }
    s.parse::<f64>()
        .map(Some)
        .map_err(|_| SourceError::Transient(format!("nvidia-smi {}: bad value {:?}", field, s)))
}

/// Parses `index, name, driver_version, utilization, memory.used, memory.total,
/// temperature` lines. The name may itself contain commas.
pub fn parse_gpu_csv(raw: &str) -> Result<Vec<GpuReading>, SourceError> {
    let mut out = Vec::new();
    for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if parts.len() < 7 {
            return Err(SourceError::Transient(format!(
                "nvidia-smi: expected 7 fields, got {} in {:?}",
                parts.len(),
                line
            )));
        }
        let index = parts[0].parse::<u32>().map_err(|_| {
            SourceError::Transient(format!("nvidia-smi index: bad value {:?}", parts[0]))
        })?;
        let tail = &parts[parts.len() - 5..];
        out.push(GpuReading {
            index,
            name: parts[1..parts.len() - 5].join(","),
            driver: tail[0].to_string(),
            utilization_percent: parse_field(tail[1], "utilization.gpu")?,
            memory_used_mb: parse_field(tail[2], "memory.used")?,
            memory_total_mb: parse_field(tail[3], "memory.total")?,
            temperature_c: parse_field(tail[4], "temperature.gpu")?,
        });
    }
    Ok(out)
}

/// One line of the compute-apps query: a process holding GPU memory on some device.
#[derive(Debug, Clone, PartialEq)]
pub struct GpuProcess {
    pub pid: u32,
    pub process_name: String,
    pub used_memory_mb: Option<f64>,
}

/// Parses `pid, process_name, used_memory` lines. The name may contain commas.
pub fn parse_compute_apps_csv(raw: &str) -> Result<Vec<GpuProcess>, SourceError> {
    let mut out = Vec::new();
    for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if parts.len() < 3 {
            return Err(SourceError::Transient(format!(
                "nvidia-smi compute apps: expected 3 fields, got {} in {:?}",
                parts.len(),
                line
            )));
        }
        let pid = parts[0].parse::<u32>().map_err(|_| {
            SourceError::Transient(format!("nvidia-smi pid: bad value {:?}", parts[0]))
        })?;
        out.push(GpuProcess {
            pid,
            process_name: parts[1..parts.len() - 1].join(","),
            used_memory_mb: parse_field(parts[parts.len() - 1], "used_memory")?,
        });
    }
    Ok(out)
}

/// Runs (and briefly caches) the nvidia-smi query.
pub struct GpuProbe {
    command: String,
    cache: Mutex<Option<(Instant, Vec<GpuReading>)>>,
}

impl Default for GpuProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuProbe {
    pub fn new() -> Self {
        Self::with_command("nvidia-smi")
    }

    pub fn with_command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            cache: Mutex::new(None),
        }
    }

    /// Device indices present right now.
    pub async fn discover(&self) -> Result<Vec<u32>, SourceError> {
        Ok(self.readings().await?.into_iter().map(|r| r.index).collect())
    }

    /// Name and driver of every device present right now.
    pub async fn devices(&self) -> Result<Vec<GpuDevice>, SourceError> {
        Ok(self.readings().await?.iter().map(GpuReading::device).collect())
    }

    /// Processes currently holding GPU memory, on any device.
    pub async fn compute_apps(&self) -> Result<Vec<GpuProcess>, SourceError> {
        parse_compute_apps_csv(&self.run(&COMPUTE_APPS_ARGS).await?)
    }

    async fn readings(&self) -> Result<Vec<GpuReading>, SourceError> {
        let mut cache = self.cache.lock().await;
        if let Some((at, readings)) = cache.as_ref()
            && at.elapsed() < CACHE_MAX_AGE
        {
            return Ok(readings.clone());
        }
        let readings = parse_gpu_csv(&self.run(&QUERY_ARGS).await?)?;
        *cache = Some((Instant::now(), readings.clone()));
        Ok(readings)
    }

    async fn reading(&self, index: u32) -> Result<GpuReading, SourceError> {
        self.readings()
            .await?
            .into_iter()
            .find(|r| r.index == index)
            .ok_or_else(|| SourceError::Transient(format!("GPU #{} missing from query", index)))
    }

    async fn run(&self, args: &[&str]) -> Result<String, SourceError> {
        // kill_on_drop: the sampler's timeout drops this future on a hung driver.
        let output = tokio::process::Command::new(&self.command)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    SourceError::Unsupported(format!("{}: {}", self.command, e))
                }
                _ => SourceError::Transient(format!("{}: {}", self.command, e)),
            })?;
        if !output.status.success() {
            return Err(SourceError::Transient(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Utilization of one GPU in percent.
pub struct GpuUtilizationSource {
    probe: Arc<GpuProbe>,
    index: u32,
}

impl GpuUtilizationSource {
    pub fn new(probe: Arc<GpuProbe>, index: u32) -> Self {
        Self { probe, index }
    }
}

#[async_trait]
impl MetricSource for GpuUtilizationSource {
    fn descriptor(&self) -> SeriesDescriptor {
        SeriesDescriptor::new(
            format!("gpu#{}.utilization", self.index),
            "%",
            MetricKind::GpuUtilization,
        )
    }

    async fn poll(&self) -> Result<Value, SourceError> {
        let reading = self.probe.reading(self.index).await?;
        reading
            .utilization_percent
            .map(|v| Value::Scalar(v.clamp(0.0, 100.0)))
            .ok_or_else(|| SourceError::Unsupported(format!("GPU #{} utilization", self.index)))
    }
}

/// Memory in use on one GPU, in percent of its total.
pub struct GpuMemorySource {
    probe: Arc<GpuProbe>,
    index: u32,
}

impl GpuMemorySource {
    pub fn new(probe: Arc<GpuProbe>, index: u32) -> Self {
        Self { probe, index }
    }
}

#[async_trait]
impl MetricSource for GpuMemorySource {
    fn descriptor(&self) -> SeriesDescriptor {
        SeriesDescriptor::new(
            format!("gpu#{}.memory", self.index),
            "%",
            MetricKind::GpuMemory,
        )
    }

    async fn poll(&self) -> Result<Value, SourceError> {
        let reading = self.probe.reading(self.index).await?;
        reading
            .memory_percent()
            .map(Value::Scalar)
            .ok_or_else(|| SourceError::Unsupported(format!("GPU #{} memory", self.index)))
    }
}

/// Temperature of one GPU in degrees Celsius.
pub struct GpuTemperatureSource {
    probe: Arc<GpuProbe>,
    index: u32,
}

impl GpuTemperatureSource {
    pub fn new(probe: Arc<GpuProbe>, index: u32) -> Self {
        Self { probe, index }
    }
}

#[async_trait]
impl MetricSource for GpuTemperatureSource {
    fn descriptor(&self) -> SeriesDescriptor {
        SeriesDescriptor::new(
            format!("gpu#{}.temperature", self.index),
            "°C",
            MetricKind::GpuTemperature,
        )
    }

    async fn poll(&self) -> Result<Value, SourceError> {
        let reading = self.probe.reading(self.index).await?;
        reading
            .temperature_c
            .map(Value::Scalar)
            .ok_or_else(|| SourceError::Unsupported(format!("GPU #{} temperature", self.index)))
    }
}

/// GPU memory held by the monitored tree, summed over every device, in MiB.
pub struct GpuProcessMemorySource {
    process: Arc<ProcessProbe>,
    gpu: Arc<GpuProbe>,
}

impl GpuProcessMemorySource {
    pub fn new(process: Arc<ProcessProbe>, gpu: Arc<GpuProbe>) -> Self {
        Self { process, gpu }
    }
}

#[async_trait]
impl MetricSource for GpuProcessMemorySource {
    fn descriptor(&self) -> SeriesDescriptor {
        SeriesDescriptor::new("process.gpu_memory", "MiB", MetricKind::GpuProcessMemory)
    }

    async fn poll(&self) -> Result<Value, SourceError> {
        let tree = self.process.tree_pids().await?;
        let apps = self.gpu.compute_apps().await?;
        let used: f64 = apps
            .iter()
            .filter(|app| tree.contains(&app.pid))
            .filter_map(|app| app.used_memory_mb)
            .sum();
        Ok(Value::Scalar(used))
    }
}
