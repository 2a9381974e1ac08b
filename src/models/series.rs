// Series identity and metric kinds

use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of a series inside its store; also the series' ordinal in the artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeriesId(pub u32);

impl fmt::Display for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "series#{}", self.0)
    }
}

/// Metric kinds selectable in `[collector] metrics`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Cpu,
    Memory,
    Threads,
    Processes,
    GpuUtilization,
    GpuMemory,
    GpuTemperature,
    GpuProcessMemory,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Cpu => "cpu",
            MetricKind::Memory => "memory",
            MetricKind::Threads => "threads",
            MetricKind::Processes => "processes",
            MetricKind::GpuUtilization => "gpu_utilization",
            MetricKind::GpuMemory => "gpu_memory",
            MetricKind::GpuTemperature => "gpu_temperature",
            MetricKind::GpuProcessMemory => "gpu_process_memory",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cpu" => Some(MetricKind::Cpu),
            "memory" => Some(MetricKind::Memory),
            "threads" => Some(MetricKind::Threads),
            "processes" => Some(MetricKind::Processes),
            "gpu_utilization" => Some(MetricKind::GpuUtilization),
            "gpu_memory" => Some(MetricKind::GpuMemory),
            "gpu_temperature" => Some(MetricKind::GpuTemperature),
            "gpu_process_memory" => Some(MetricKind::GpuProcessMemory),
            _ => None,
        }
    }

    /// Process-scoped metrics depend on the target being alive; device-wide GPU
    /// metrics do not.
    pub fn is_process_scoped(&self) -> bool {
        matches!(
            self,
            MetricKind::Cpu
                | MetricKind::Memory
                | MetricKind::Threads
                | MetricKind::Processes
                | MetricKind::GpuProcessMemory
        )
    }
}

/// Name, unit and kind of one series, e.g. ("gpu#0.utilization", "%", GpuUtilization).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesDescriptor {
    pub name: String,
    pub unit: String,
    pub kind: MetricKind,
}

impl SeriesDescriptor {
    pub fn new(name: impl Into<String>, unit: impl Into<String>, kind: MetricKind) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
            kind,
        }
    }
}
