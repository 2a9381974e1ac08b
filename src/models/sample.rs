// Samples and the values sources produce

use serde::{Deserialize, Serialize};
use wincode::{SchemaRead, SchemaWrite};

/// Milliseconds since session start on the session's monotonic clock.
pub type Timestamp = u64;

/// Linux task state, from the state letter in /proc/<pid>/task/<tid>/stat.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, SchemaRead, SchemaWrite,
)]
#[serde(rename_all = "camelCase")]
pub enum ThreadState {
    Running,
    Sleeping,
    DiskSleep,
    Zombie,
    Stopped,
    Idle,
    Other,
}

impl ThreadState {
    pub fn from_proc_char(c: char) -> Self {
        match c {
            'R' => ThreadState::Running,
            'S' => ThreadState::Sleeping,
            'D' => ThreadState::DiskSleep,
            'Z' | 'X' => ThreadState::Zombie,
            'T' | 't' => ThreadState::Stopped,
            'I' => ThreadState::Idle,
            _ => ThreadState::Other,
        }
    }
}

/// One thread of the target (or of one of its descendants) at one tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SchemaRead, SchemaWrite)]
#[serde(rename_all = "camelCase")]
pub struct ThreadEntry {
    pub pid: u32,
    pub tid: u32,
    pub name: String,
    pub state: ThreadState,
    /// CPU the thread last ran on.
    pub core: Option<u32>,
}

/// One process of the monitored tree at one tick; rows are labelled "{name} (PID {pid})".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SchemaRead, SchemaWrite)]
#[serde(rename_all = "camelCase")]
pub struct ProcessEntry {
    pub pid: u32,
    pub parent: Option<u32>,
    pub name: String,
    /// Command line joined by spaces; the process name when the kernel hides it.
    pub command: String,
}

impl ProcessEntry {
    pub fn label(&self) -> String {
        format!("{} (PID {})", self.name, self.pid)
    }
}

/// Value of one sample: a scalar reading, a per-thread record or a process-tree record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum Value {
    Scalar(f64),
    Threads(Vec<ThreadEntry>),
    Processes(Vec<ProcessEntry>),
}

impl Value {
    /// Number fed into the aggregate ladder. Thread records count running threads,
    /// process records count processes.
    pub fn numeric(&self) -> f64 {
        match self {
            Value::Scalar(v) => *v,
            Value::Threads(threads) => threads
                .iter()
                .filter(|t| t.state == ThreadState::Running)
                .count() as f64,
            Value::Processes(processes) => processes.len() as f64,
        }
    }

    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Value::Scalar(v) => Some(*v),
            Value::Threads(_) | Value::Processes(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub timestamp: Timestamp,
    pub value: Value,
}

impl Sample {
    pub fn scalar(timestamp: Timestamp, value: f64) -> Self {
        Self {
            timestamp,
            value: Value::Scalar(value),
        }
    }
}
