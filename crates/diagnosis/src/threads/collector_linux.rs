//! Linux /proc filesystem thread listing

#![cfg_attr(not(feature = "threads"), allow(dead_code))]

use super::ThreadSample;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

static CLOCK_TICKS: OnceLock<u64> = OnceLock::new();
static PAGE_SIZE: OnceLock<u64> = OnceLock::new();

fn clock_ticks_per_sec() -> u64 {
    *CLOCK_TICKS.get_or_init(|| {
        let v = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if v <= 0 {
            100
        } else {
            v as u64
        }
    })
}

fn page_size() -> u64 {
    *PAGE_SIZE.get_or_init(|| {
        let v = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if v <= 0 {
            4096
        } else {
            v as u64
        }
    })
}

pub(crate) fn collect_thread_samples() -> Result<Vec<ThreadSample>, String> {
    let ticks_per_sec = clock_ticks_per_sec() as f64;
    let entries = fs::read_dir(Path::new("/proc/self/task"))
        .map_err(|e| format!("Failed to read /proc/self/task: {}", e))?;

    let mut samples = Vec::new();
    for entry in entries.flatten() {
        let Ok(tid) = entry.file_name().to_string_lossy().parse::<u64>() else {
            continue;
        };
        // Threads may exit between read_dir and reading their stat file.
        match read_thread(tid, ticks_per_sec) {
            Ok(sample) => samples.push(sample),
            Err(e) => tracing::debug!(tid, error = %e, "skipping thread"),
        }
    }
    samples.sort_by_key(|s| s.os_tid);
    Ok(samples)
}

pub(crate) fn thread_count() -> Option<u64> {
    fs::read_dir("/proc/self/task")
        .ok()
        .map(|entries| entries.flatten().count() as u64)
}

pub(crate) fn rss_bytes() -> Option<u64> {
    let statm = fs::read_to_string("/proc/self/statm").ok()?;
    let resident: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident * page_size())
}

fn read_thread(tid: u64, ticks_per_sec: f64) -> Result<ThreadSample, String> {
    let stat_path = format!("/proc/self/task/{}/stat", tid);
    let comm_path = format!("/proc/self/task/{}/comm", tid);

    let name = fs::read_to_string(&comm_path)
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| format!("thread_{}", tid));

    let stat = fs::read_to_string(&stat_path)
        .map_err(|e| format!("Failed to read {}: {}", stat_path, e))?;
    parse_stat(tid, name, &stat, ticks_per_sec)
}

/// Parses `pid (comm) state ... utime stime ...`; comm may contain spaces and parens.
fn parse_stat(tid: u64, name: String, stat: &str, ticks_per_sec: f64) -> Result<ThreadSample, String> {
    let after_comm = stat
        .rfind(')')
        .and_then(|i| stat.get(i + 2..))
        .ok_or_else(|| "Invalid stat format".to_string())?;

    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // [0]=state ... [11]=utime [12]=stime
    if fields.len() < 13 {
        return Err(format!("stat file has too few fields: {}", fields.len()));
    }

    let utime: u64 = fields[11]
        .parse()
        .map_err(|_| "Failed to parse utime".to_string())?;
    let stime: u64 = fields[12]
        .parse()
        .map_err(|_| "Failed to parse stime".to_string())?;

    Ok(ThreadSample::new(
        tid,
        name,
        fields[0].to_string(),
        utime as f64 / ticks_per_sec,
        stime as f64 / ticks_per_sec,
    ))
}
