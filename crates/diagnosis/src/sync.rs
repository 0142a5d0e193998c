//! Lock wrappers that record contention for the `mutex` and `block` profiles.
//!
//! Uncontended acquisitions cost one `try_lock`. When the fast path fails,
//! the time spent waiting is charged to the caller's source location. Waits on
//! [`Mutex`] count towards both profiles, waits on [`RwLock`] only towards
//! `block`.

use parking_lot::{MutexGuard, RwLockReadGuard, RwLockWriteGuard};
use serde::Serialize;
use std::collections::HashMap;
use std::panic::Location;
use std::sync::LazyLock;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentionKind {
    Mutex,
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContentionRecord {
    pub lock: &'static str,
    /// `file:line` of the waiting acquisition.
    pub site: String,
    pub contentions: u64,
    pub wait_ns: u64,
}

#[derive(Default)]
struct Totals {
    contentions: u64,
    wait_ns: u64,
}

type Key = (ContentionKind, &'static str, &'static Location<'static>);

static CONTENTION: LazyLock<parking_lot::Mutex<HashMap<Key, Totals>>> =
    LazyLock::new(Default::default);

fn charge(kinds: &[ContentionKind], lock: &'static str, site: &'static Location<'static>, since: Instant) {
    let wait_ns = since.elapsed().as_nanos().min(u64::MAX as u128) as u64;
    let mut table = CONTENTION.lock();
    for &kind in kinds {
        let totals = table.entry((kind, lock, site)).or_default();
        totals.contentions += 1;
        totals.wait_ns = totals.wait_ns.saturating_add(wait_ns);
    }
}

/// Recorded waits of one kind, longest total wait first.
pub fn contention(kind: ContentionKind) -> Vec<ContentionRecord> {
    let mut records: Vec<_> = CONTENTION
        .lock()
        .iter()
        .filter(|((k, _, _), _)| *k == kind)
        .map(|((_, lock, site), totals)| ContentionRecord {
            lock,
            site: format!("{}:{}", site.file(), site.line()),
            contentions: totals.contentions,
            wait_ns: totals.wait_ns,
        })
        .collect();
    records.sort_by(|a, b| b.wait_ns.cmp(&a.wait_ns).then_with(|| a.site.cmp(&b.site)));
    records
}

/// A named mutex whose contended acquisitions show up in the `mutex` profile.
pub struct Mutex<T> {
    name: &'static str,
    inner: parking_lot::Mutex<T>,
}

impl<T> Mutex<T> {
    pub const fn new(name: &'static str, value: T) -> Self {
        Self {
            name,
            inner: parking_lot::Mutex::new(value),
        }
    }

    #[track_caller]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        if let Some(guard) = self.inner.try_lock() {
            return guard;
        }
        let site = Location::caller();
        let since = Instant::now();
        let guard = self.inner.lock();
        charge(&[ContentionKind::Mutex, ContentionKind::Block], self.name, site, since);
        guard
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.inner.try_lock()
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

pub struct RwLock<T> {
    name: &'static str,
    inner: parking_lot::RwLock<T>,
}

impl<T> RwLock<T> {
    pub const fn new(name: &'static str, value: T) -> Self {
        Self {
            name,
            inner: parking_lot::RwLock::new(value),
        }
    }

    #[track_caller]
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        if let Some(guard) = self.inner.try_read() {
            return guard;
        }
        let site = Location::caller();
        let since = Instant::now();
        let guard = self.inner.read();
        charge(&[ContentionKind::Block], self.name, site, since);
        guard
    }

    #[track_caller]
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        if let Some(guard) = self.inner.try_write() {
            return guard;
        }
        let site = Location::caller();
        let since = Instant::now();
        let guard = self.inner.write();
        charge(&[ContentionKind::Block], self.name, site, since);
        guard
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}
