//! Named, instantaneous profiles that are dumped without a time window.
//!
//! Lookups are lock-free and safe for concurrent readers. The only side
//! effect is the optional reclaim pass before a `heap` dump, which pauses
//! allocator activity process-wide for its duration. That pause is the price
//! of a heap dump that reflects live memory instead of freed-but-retained pages.

use crate::alloc::AllocStats;
use crate::error::DiagnosisError;
use crate::sync::{self, ContentionKind};
use crate::threads;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

pub const HEAP: &str = "heap";
pub const ALLOCS: &str = "allocs";
pub const THREADS: &str = "threads";
/// Same content as `threads`, under the name pprof clients ask for.
pub const GOROUTINE: &str = "goroutine";
pub const MUTEX: &str = "mutex";
pub const BLOCK: &str = "block";

/// A pre-registered snapshot source.
pub trait NamedProfile: Send + Sync {
    fn description(&self) -> &str;

    /// Entry count shown on the index page, if the profile has one.
    fn count(&self) -> Option<u64> {
        None
    }

    fn content_type(&self, debug: i32) -> &'static str {
        if debug > 0 {
            "text/plain; charset=utf-8"
        } else {
            "application/octet-stream"
        }
    }

    fn write_to(&self, out: &mut dyn Write, debug: i32) -> io::Result<()>;
}

type Reclaim = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone)]
pub struct ProfileRegistry {
    profiles: BTreeMap<String, Arc<dyn NamedProfile>>,
    reclaim: Reclaim,
}

impl fmt::Debug for ProfileRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfileRegistry")
            .field("profiles", &self.profiles.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self::empty()
            .register(HEAP, HeapProfile)
            .register(ALLOCS, AllocsProfile)
            .register(THREADS, ThreadsProfile)
            .register(GOROUTINE, ThreadsProfile)
            .register(MUTEX, ContentionProfile(ContentionKind::Mutex))
            .register(BLOCK, ContentionProfile(ContentionKind::Block))
    }
}

impl ProfileRegistry {
    /// A registry without the built-in profiles.
    pub fn empty() -> Self {
        Self {
            profiles: BTreeMap::new(),
            reclaim: Arc::new(reclaim_allocator_memory),
        }
    }

    pub fn register(mut self, name: impl Into<String>, profile: impl NamedProfile + 'static) -> Self {
        self.profiles.insert(name.into(), Arc::new(profile));
        self
    }

    /// Replaces the pass run before `heap` dumps requested with `gc`.
    pub fn with_reclaim(mut self, reclaim: impl Fn() + Send + Sync + 'static) -> Self {
        self.reclaim = Arc::new(reclaim);
        self
    }

    pub fn lookup(&self, name: &str) -> Option<&Arc<dyn NamedProfile>> {
        self.profiles.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn NamedProfile>)> {
        self.profiles.iter().map(|(name, p)| (name.as_str(), p))
    }

    pub fn dump(
        &self,
        name: &str,
        sink: &mut dyn Write,
        debug: i32,
        gc_first: bool,
    ) -> Result<(), DiagnosisError> {
        let profile = self
            .lookup(name)
            .ok_or_else(|| DiagnosisError::UnknownProfile(name.to_string()))?;
        if name == HEAP && gc_first {
            (self.reclaim)();
        }
        profile.write_to(sink, debug)?;
        Ok(())
    }
}

fn reclaim_allocator_memory() {
    cfg_if::cfg_if! {
        if #[cfg(all(target_os = "linux", target_env = "gnu"))] {
            unsafe {
                libc::malloc_trim(0);
            }
        }
    }
}

fn write_json<T: Serialize>(out: &mut dyn Write, value: &T) -> io::Result<()> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    out.write_all(b"\n")
}

#[derive(Serialize)]
struct HeapJson {
    allocator_installed: bool,
    live_bytes: u64,
    live_objects: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    rss_bytes: Option<u64>,
}

struct HeapProfile;

impl NamedProfile for HeapProfile {
    fn description(&self) -> &str {
        "Live heap bytes and objects tracked by CountingAllocator"
    }

    fn count(&self) -> Option<u64> {
        Some(AllocStats::current().live_objects())
    }

    fn content_type(&self, debug: i32) -> &'static str {
        json_or_text(debug)
    }

    fn write_to(&self, out: &mut dyn Write, debug: i32) -> io::Result<()> {
        let stats = AllocStats::current();
        let heap = HeapJson {
            allocator_installed: stats.allocator_installed(),
            live_bytes: stats.live_bytes(),
            live_objects: stats.live_objects(),
            rss_bytes: threads::rss_bytes(),
        };
        if debug <= 0 {
            return write_json(out, &heap);
        }
        writeln!(
            out,
            "heap profile: {} objects, {} bytes live",
            heap.live_objects, heap.live_bytes
        )?;
        if let Some(rss) = heap.rss_bytes {
            writeln!(out, "# rss_bytes = {}", rss)?;
        }
        if !heap.allocator_installed {
            writeln!(out, "# CountingAllocator is not the global allocator")?;
        }
        Ok(())
    }
}

struct AllocsProfile;

impl NamedProfile for AllocsProfile {
    fn description(&self) -> &str {
        "Cumulative allocations and deallocations since process start"
    }

    fn count(&self) -> Option<u64> {
        Some(AllocStats::current().alloc_count)
    }

    fn content_type(&self, debug: i32) -> &'static str {
        json_or_text(debug)
    }

    fn write_to(&self, out: &mut dyn Write, debug: i32) -> io::Result<()> {
        let stats = AllocStats::current();
        if debug <= 0 {
            return write_json(out, &stats);
        }
        writeln!(
            out,
            "allocs profile: {} allocations, {} bytes",
            stats.alloc_count, stats.alloc_bytes
        )?;
        writeln!(
            out,
            "# freed: {} deallocations, {} bytes",
            stats.dealloc_count, stats.dealloc_bytes
        )
    }
}

struct ThreadsProfile;

impl NamedProfile for ThreadsProfile {
    fn description(&self) -> &str {
        "OS threads of this process with state and CPU time"
    }

    fn count(&self) -> Option<u64> {
        threads::thread_count()
    }

    fn content_type(&self, debug: i32) -> &'static str {
        json_or_text(debug)
    }

    fn write_to(&self, out: &mut dyn Write, debug: i32) -> io::Result<()> {
        let snapshot = threads::snapshot().map_err(io::Error::other)?;
        if debug <= 0 {
            return write_json(out, &snapshot);
        }
        writeln!(out, "threads profile: total {}", snapshot.thread_count)?;
        for t in &snapshot.threads {
            writeln!(
                out,
                "{:>8} {:<16} {} user={:.2}s sys={:.2}s",
                t.os_tid, t.name, t.state, t.cpu_user, t.cpu_sys
            )?;
        }
        Ok(())
    }
}

/// Waits recorded by the lock wrappers in [`crate::sync`].
struct ContentionProfile(ContentionKind);

impl NamedProfile for ContentionProfile {
    fn description(&self) -> &str {
        match self.0 {
            ContentionKind::Mutex => "Contended diagnosis::sync::Mutex acquisitions by call site",
            ContentionKind::Block => "Time blocked on diagnosis::sync locks by call site",
        }
    }

    fn count(&self) -> Option<u64> {
        Some(sync::contention(self.0).len() as u64)
    }

    fn content_type(&self, debug: i32) -> &'static str {
        json_or_text(debug)
    }

    fn write_to(&self, out: &mut dyn Write, debug: i32) -> io::Result<()> {
        let records = sync::contention(self.0);
        if debug <= 0 {
            return write_json(out, &records);
        }
        let name = match self.0 {
            ContentionKind::Mutex => MUTEX,
            ContentionKind::Block => BLOCK,
        };
        writeln!(out, "{} profile: {} sites", name, records.len())?;
        for r in &records {
            writeln!(
                out,
                "{:>12}ns {:>8} {} @ {}",
                r.wait_ns, r.contentions, r.lock, r.site
            )?;
        }
        Ok(())
    }
}

fn json_or_text(debug: i32) -> &'static str {
    if debug > 0 {
        "text/plain; charset=utf-8"
    } else {
        "application/json"
    }
}
