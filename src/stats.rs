//! Access statistics for I/O port and MMIO registrations.
//!
//! Slots are reserved at registration time (one per port, one per MMIO
//! region) but only become visible in listings while the registration is
//! mapped, so unmapped entries stay out of user-facing output. Counters
//! are plain atomics bumped from the dispatch path without extra locking.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};

/// Upper bound on statistics slots per table.
const MAX_STATS_ENTRIES: u32 = 0x1_0000;

/// A monotonically increasing event counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Callback overhead profile: invocation count and cumulative time.
#[derive(Debug, Default)]
pub struct Profile {
    calls: AtomicU64,
    nanos: AtomicU64,
}

impl Profile {
    pub fn record(&self, elapsed: Duration) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::Relaxed))
    }
}

/// Per-port counters. A range of ports owns one entry per port; range-wide
/// totals go to the first port's entry.
#[derive(Debug, Default)]
pub struct IoPortStats {
    /// All accesses, bumped on the range's first entry only.
    pub total: Counter,
    pub in_slow: Counter,
    pub out_slow: Counter,
    pub in_fast: Counter,
    pub out_fast: Counter,
    /// Reads that began in the fast context and escalated.
    pub in_fast_to_slow: Counter,
    /// Writes that began in the fast context and escalated.
    pub out_fast_to_slow: Counter,
    pub prof_in: Profile,
    pub prof_out: Profile,
    registered: AtomicBool,
}

/// Per-region MMIO counters.
#[derive(Debug, Default)]
pub struct MmioStats {
    pub reads: Counter,
    pub writes: Counter,
    pub read_fast_to_slow: Counter,
    pub write_fast_to_slow: Counter,
    /// Writes buffered for slow-context commit.
    pub commit_fast_to_slow: Counter,
    pub complicated_reads: Counter,
    pub complicated_writes: Counter,
    /// Reads answered with synthesized all-ones or all-zeros.
    pub ff_or_00_reads: Counter,
    pub prof_read: Profile,
    pub prof_write: Profile,
    registered: AtomicBool,
}

pub(crate) trait Visible {
    fn set_registered(&self, on: bool);
    fn is_registered(&self) -> bool;
}

impl Visible for IoPortStats {
    fn set_registered(&self, on: bool) {
        self.registered.store(on, Ordering::Relaxed);
    }
    fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Relaxed)
    }
}

impl Visible for MmioStats {
    fn set_registered(&self, on: bool) {
        self.registered.store(on, Ordering::Relaxed);
    }
    fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Relaxed)
    }
}

/// Growable table of statistics entries shared with the dispatch path.
#[derive(Debug)]
pub(crate) struct StatsTable<S> {
    entries: Vec<Arc<S>>,
    pub frozen: bool,
}

impl<S: Default + Visible> Default for StatsTable<S> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            frozen: false,
        }
    }
}

impl<S: Default + Visible> StatsTable<S> {
    /// Reserves `count` fresh slots and returns the index of the first.
    pub fn reserve(&mut self, count: usize) -> Result<u16> {
        if self.frozen {
            return Err(Error::WrongOrder);
        }
        let first = self.entries.len();
        if first + count > MAX_STATS_ENTRIES as usize {
            return Err(Error::TooManyRegistrations(MAX_STATS_ENTRIES));
        }
        self.entries
            .try_reserve(count)
            .map_err(|_| Error::OutOfMemory)?;
        for _ in 0..count {
            self.entries.push(Arc::new(S::default()));
        }
        Ok(first as u16)
    }

    /// The entry at `base + offset`, or `None` when stats are disabled for
    /// the registration or the slot is out of range.
    pub fn get(&self, base: Option<u16>, offset: u16) -> Option<Arc<S>> {
        let idx = usize::from(base?) + usize::from(offset);
        self.entries.get(idx).cloned()
    }

    /// Flips the visibility of `count` slots starting at `base`.
    pub fn set_registered(&self, base: Option<u16>, count: usize, on: bool) {
        let Some(base) = base else { return };
        for off in 0..count {
            if let Some(s) = self.entries.get(usize::from(base) + off) {
                s.set_registered(on);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// VM-wide dispatch counters, independent of any registration.
#[derive(Debug, Default)]
pub struct DispatchCounters {
    pub port_in: Counter,
    pub port_out: Counter,
    pub port_in_string: Counter,
    pub port_out_string: Counter,
    /// Slow-context commits of deferred port writes.
    pub port_commits: Counter,
    pub mmio_handler_calls: Counter,
    pub mmio_reads_to_slow: Counter,
    pub mmio_writes_to_slow: Counter,
    pub mmio_commits_to_slow: Counter,
    /// Commits served directly through the region hint.
    pub mmio_commits_direct: Counter,
    /// Commits that fell back to the generic memory-manager write.
    pub mmio_commits_fallback: Counter,
    pub mmio_stale_mappings: Counter,
    pub mmio_too_deep_recursion: Counter,
    pub mmio_dev_lock_contention: Counter,
}
