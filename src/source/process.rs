// Process-scoped sources via sysinfo (CPU, RSS) and /proc (thread states).
// All of them share one ProcessProbe so a tick refreshes the process table once.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};
use tracing::instrument;

use super::{MetricSource, TargetProbe, linux};
use crate::error::SourceError;
use crate::models::{MetricKind, ProcessEntry, SeriesDescriptor, Value};

/// Sources polled within this window of the last refresh reuse the same process table.
const REFRESH_MAX_AGE: Duration = Duration::from_millis(200);

struct ProbeState {
    sys: System,
    refreshed_at: Option<Instant>,
}

/// Handle on the target process (and optionally its descendants).
pub struct ProcessProbe {
    pid: u32,
    include_children: bool,
    state: Arc<Mutex<ProbeState>>,
}

impl ProcessProbe {
    pub fn new(pid: u32, include_children: bool) -> Self {
        Self {
            pid,
            include_children,
            state: Arc::new(Mutex::new(ProbeState {
                sys: System::new(),
                refreshed_at: None,
            })),
        }
    }

    pub fn include_children(&self) -> bool {
        self.include_children
    }

    /// Pids of the monitored tree, target first.
    pub async fn tree_pids(&self) -> Result<Vec<u32>, SourceError> {
        self.with_tree(|_, tree| Ok(tree.iter().map(|p| p.as_u32()).collect()))
            .await
    }

    /// Logical CPUs of the host.
    pub async fn cpu_cores(&self) -> Result<u32, SourceError> {
        let state = self.state.clone();
        tokio::task::spawn_blocking(move || {
            let mut state = state
                .lock()
                .map_err(|e| SourceError::Transient(format!("process table lock poisoned: {}", e)))?;
            state.sys.refresh_cpu_all();
            Ok(state.sys.cpus().len() as u32)
        })
        .await
        .map_err(|e| SourceError::Transient(format!("process probe task join: {}", e)))?
    }

    /// Runs `f` on the blocking pool against a fresh process table and the pids of the
    /// monitored tree (target first). Fails with TargetGone when the target has exited.
    async fn with_tree<T, F>(&self, f: F) -> Result<T, SourceError>
    where
        T: Send + 'static,
        F: FnOnce(&System, &[Pid]) -> Result<T, SourceError> + Send + 'static,
    {
        let state = self.state.clone();
        let pid = self.pid;
        let include_children = self.include_children;
        tokio::task::spawn_blocking(move || {
            let mut state = state
                .lock()
                .map_err(|e| SourceError::Transient(format!("process table lock poisoned: {}", e)))?;
            let stale = state
                .refreshed_at
                .is_none_or(|t| t.elapsed() >= REFRESH_MAX_AGE);
            if stale {
                state.sys.refresh_processes_specifics(
                    ProcessesToUpdate::All,
                    true,
                    ProcessRefreshKind::nothing()
                        .with_cpu()
                        .with_memory()
                        .with_cmd(UpdateKind::OnlyIfNotSet),
                );
                state.refreshed_at = Some(Instant::now());
            }
            let root = Pid::from_u32(pid);
            match state.sys.process(root).map(|p| p.status()) {
                None | Some(ProcessStatus::Zombie) | Some(ProcessStatus::Dead) => {
                    return Err(SourceError::TargetGone { pid });
                }
                Some(_) => {}
            }
            let tree = process_tree(&state.sys, root, include_children);
            f(&state.sys, &tree)
        })
        .await
        .map_err(|e| SourceError::Transient(format!("process probe task join: {}", e)))?
    }
}

/// `root` followed by all of its descendants (breadth first) when `include_children`.
/// Thread entries that sysinfo lists as processes are ignored.
fn process_tree(sys: &System, root: Pid, include_children: bool) -> Vec<Pid> {
    let mut tree = vec![root];
    if !include_children {
        return tree;
    }
    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (pid, process) in sys.processes() {
        if process.thread_kind().is_some() {
            continue;
        }
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*pid);
        }
    }
    let mut i = 0;
    while i < tree.len() {
        if let Some(kids) = children.get(&tree[i]) {
            let mut kids = kids.clone();
            kids.sort();
            tree.extend(kids);
        }
        i += 1;
    }
    tree
}

#[async_trait]
impl TargetProbe for ProcessProbe {
    fn pid(&self) -> u32 {
        self.pid
    }

    #[instrument(skip(self), fields(source = "process", operation = "check_alive", pid = self.pid))]
    async fn check_alive(&self) -> Result<(), SourceError> {
        self.with_tree(|_, _| Ok(())).await
    }
}

/// CPU usage of the tree in percent of one core (can exceed 100 on multi-core).
pub struct ProcessCpuSource {
    probe: Arc<ProcessProbe>,
}

impl ProcessCpuSource {
    pub fn new(probe: Arc<ProcessProbe>) -> Self {
        Self { probe }
    }
}

#[async_trait]
impl MetricSource for ProcessCpuSource {
    fn descriptor(&self) -> SeriesDescriptor {
        SeriesDescriptor::new("process.cpu", "%", MetricKind::Cpu)
    }

    async fn poll(&self) -> Result<Value, SourceError> {
        self.probe
            .with_tree(|sys, tree| {
                let usage: f64 = tree
                    .iter()
                    .filter_map(|pid| sys.process(*pid))
                    .map(|p| p.cpu_usage() as f64)
                    .sum();
                Ok(Value::Scalar(usage.max(0.0)))
            })
            .await
    }
}

/// Resident set size of the tree in bytes.
pub struct ProcessMemorySource {
    probe: Arc<ProcessProbe>,
}

impl ProcessMemorySource {
    pub fn new(probe: Arc<ProcessProbe>) -> Self {
        Self { probe }
    }
}

#[async_trait]
impl MetricSource for ProcessMemorySource {
    fn descriptor(&self) -> SeriesDescriptor {
        SeriesDescriptor::new("process.rss", "bytes", MetricKind::Memory)
    }

    async fn poll(&self) -> Result<Value, SourceError> {
        self.probe
            .with_tree(|sys, tree| {
                let rss: u64 = tree
                    .iter()
                    .filter_map(|pid| sys.process(*pid))
                    .map(|p| p.memory())
                    .sum();
                Ok(Value::Scalar(rss as f64))
            })
            .await
    }
}

/// State of every thread in the tree, as a record per tick.
pub struct ThreadStateSource {
    probe: Arc<ProcessProbe>,
}

impl ThreadStateSource {
    pub fn new(probe: Arc<ProcessProbe>) -> Self {
        Self { probe }
    }
}

#[async_trait]
impl MetricSource for ThreadStateSource {
    fn descriptor(&self) -> SeriesDescriptor {
        SeriesDescriptor::new("process.threads", "threads", MetricKind::Threads)
    }

    async fn poll(&self) -> Result<Value, SourceError> {
        let target = self.probe.pid;
        self.probe
            .with_tree(move |_, tree| {
                let mut threads = Vec::new();
                for pid in tree {
                    match linux::read_threads(pid.as_u32()) {
                        Ok(t) => threads.extend(t),
                        Err(e) if e.kind() == std::io::ErrorKind::Unsupported => {
                            return Err(SourceError::Unsupported(e.to_string()));
                        }
                        Err(e) if pid.as_u32() == target => {
                            return Err(match e.kind() {
                                std::io::ErrorKind::NotFound => SourceError::TargetGone { pid: target },
                                _ => SourceError::Transient(format!("read threads: {}", e)),
                            });
                        }
                        // a descendant exited between the refresh and the scan
                        Err(_) => {}
                    }
                }
                Ok(Value::Threads(threads))
            })
            .await
    }
}

/// Name, command line and parent of every process in the tree, as a record per tick.
pub struct ProcessTreeSource {
    probe: Arc<ProcessProbe>,
}

impl ProcessTreeSource {
    pub fn new(probe: Arc<ProcessProbe>) -> Self {
        Self { probe }
    }
}

#[async_trait]
impl MetricSource for ProcessTreeSource {
    fn descriptor(&self) -> SeriesDescriptor {
        SeriesDescriptor::new("process.tree", "processes", MetricKind::Processes)
    }

    async fn poll(&self) -> Result<Value, SourceError> {
        self.probe
            .with_tree(|sys, tree| {
                let processes = tree
                    .iter()
                    .filter_map(|pid| {
                        let p = sys.process(*pid)?;
                        let name = p.name().to_string_lossy().into_owned();
                        let args: Vec<_> = p.cmd().iter().map(|a| a.to_string_lossy()).collect();
                        let command = if args.is_empty() {
                            name.clone()
                        } else {
                            args.join(" ")
                        };
                        Some(ProcessEntry {
                            pid: pid.as_u32(),
                            parent: p.parent().map(|pp| pp.as_u32()),
                            name,
                            command,
                        })
                    })
                    .collect();
                Ok(Value::Processes(processes))
            })
            .await
    }
}
