//! Point-in-time OS thread listing for the `threads` profile.

use serde::{Deserialize, Serialize};

#[cfg(target_os = "linux")]
#[path = "threads/collector_linux.rs"]
mod collector;

/// One OS thread of the current process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadSample {
    pub os_tid: u64,
    pub name: String,
    /// Single-letter kernel state (`R`, `S`, `D`, ...)
    pub state: String,
    /// CPU time spent in user mode (seconds)
    pub cpu_user: f64,
    /// CPU time spent in kernel mode (seconds)
    pub cpu_sys: f64,
    pub cpu_total: f64,
}

impl ThreadSample {
    pub fn new(os_tid: u64, name: String, state: String, cpu_user: f64, cpu_sys: f64) -> Self {
        Self {
            os_tid,
            name,
            state,
            cpu_user,
            cpu_sys,
            cpu_total: cpu_user + cpu_sys,
        }
    }
}

/// JSON body of `/diagnosis/pprof/threads`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadsJson {
    pub thread_count: usize,
    pub threads: Vec<ThreadSample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rss_bytes: Option<u64>,
}

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "linux", feature = "threads"))] {
        pub fn collect() -> Result<Vec<ThreadSample>, String> {
            collector::collect_thread_samples()
        }

        pub fn thread_count() -> Option<u64> {
            collector::thread_count()
        }

        pub fn rss_bytes() -> Option<u64> {
            collector::rss_bytes()
        }
    } else {
        pub fn collect() -> Result<Vec<ThreadSample>, String> {
            Err("thread listing is only supported on Linux".to_string())
        }

        pub fn thread_count() -> Option<u64> {
            None
        }

        pub fn rss_bytes() -> Option<u64> {
            None
        }
    }
}

pub fn snapshot() -> Result<ThreadsJson, String> {
    let threads = collect()?;
    Ok(ThreadsJson {
        thread_count: threads.len(),
        threads,
        rss_bytes: rss_bytes(),
    })
}
