// Session metadata and lifecycle status

use serde::{Deserialize, Serialize};
use wincode::{SchemaRead, SchemaWrite};

/// Why a session ended without failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CompletionReason {
    TargetExited,
    Stopped,
}

impl CompletionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionReason::TargetExited => "target_exited",
            CompletionReason::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "camelCase")]
pub enum SessionStatus {
    Running,
    Complete(CompletionReason),
    Failed(String),
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Running)
    }

    /// (status, detail) columns of the session table.
    pub fn to_columns(&self) -> (&'static str, Option<String>) {
        match self {
            SessionStatus::Running => ("running", None),
            SessionStatus::Complete(reason) => ("complete", Some(reason.as_str().to_string())),
            SessionStatus::Failed(msg) => ("failed", Some(msg.clone())),
        }
    }

    pub fn from_columns(status: &str, detail: Option<&str>) -> Self {
        match (status, detail) {
            ("running", _) => SessionStatus::Running,
            ("complete", Some("target_exited")) => {
                SessionStatus::Complete(CompletionReason::TargetExited)
            }
            ("complete", _) => SessionStatus::Complete(CompletionReason::Stopped),
            (_, detail) => SessionStatus::Failed(detail.unwrap_or_default().to_string()),
        }
    }
}

/// A GPU as nvidia-smi reported it at session start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SchemaRead, SchemaWrite)]
#[serde(rename_all = "camelCase")]
pub struct GpuDevice {
    pub index: u32,
    pub name: String,
    pub driver: String,
}

/// Host facts captured once per session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostInfo {
    /// Logical CPUs; the viewer divides the running-thread trace by it.
    pub cpu_cores: u32,
    pub gpus: Vec<GpuDevice>,
}

/// One monitoring run against one target process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: i64,
    pub target_pid: u32,
    pub interval_ms: u64,
    /// Wall-clock start (unix ms), for display only. Sample timestamps never use it.
    pub started_at: i64,
    pub host: HostInfo,
    pub status: SessionStatus,
}

impl SessionInfo {
    pub fn running(id: i64, target_pid: u32, interval_ms: u64, started_at: i64) -> Self {
        Self {
            id,
            target_pid,
            interval_ms,
            started_at,
            host: HostInfo::default(),
            status: SessionStatus::Running,
        }
    }

    pub fn with_host(mut self, host: HostInfo) -> Self {
        self.host = host;
        self
    }
}
