// Linux-specific helpers: per-thread state from /proc/<pid>/task.

use crate::models::{ThreadEntry, ThreadState};

/// Threads of `pid` from /proc/<pid>/task/*/stat. Threads that exit mid-scan are skipped.
/// Fails with NotFound when the process itself is gone.
#[cfg(target_os = "linux")]
pub(super) fn read_threads(pid: u32) -> std::io::Result<Vec<ThreadEntry>> {
    let task_dir = format!("/proc/{}/task", pid);
    let mut threads = Vec::new();
    for entry in std::fs::read_dir(&task_dir)? {
        let Ok(entry) = entry else { continue };
        let Some(tid) = entry
            .file_name()
            .to_str()
            .and_then(|s| s.parse::<u32>().ok())
        else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        if let Some(thread) = parse_task_stat(pid, tid, &stat) {
            threads.push(thread);
        }
    }
    threads.sort_by_key(|t| t.tid);
    Ok(threads)
}

#[cfg(not(target_os = "linux"))]
pub(super) fn read_threads(_pid: u32) -> std::io::Result<Vec<ThreadEntry>> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "per-thread state needs /proc",
    ))
}

/// Parses one task stat line: `tid (comm) state ... processor ...`.
/// comm may contain spaces and parentheses, so fields are counted after the last ')'.
pub fn parse_task_stat(pid: u32, tid: u32, stat: &str) -> Option<ThreadEntry> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    let name = stat.get(open + 1..close)?.to_string();
    let fields: Vec<&str> = stat.get(close + 1..)?.split_whitespace().collect();
    let state = fields.first()?.chars().next()?;
    // fields[0] is stat field 3 (state); field 39 (processor) is fields[36]
    let core = fields.get(36).and_then(|f| f.parse::<u32>().ok());
    Some(ThreadEntry {
        pid,
        tid,
        name,
        state: ThreadState::from_proc_char(state),
        core,
    })
}
