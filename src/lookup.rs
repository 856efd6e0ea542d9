//! Sorted-interval lookup tables mapping a port number or guest-physical
//! address to a registration index.
//!
//! One generic implementation serves both the 16-bit port space and the
//! 64-bit physical address space. The table is a flat array of closed,
//! non-overlapping intervals sorted by first address; resolution is a
//! binary search biased by a caller-provided hint, since guest I/O tends
//! to hit the same range repeatedly.

use crate::error::{Error, Result};

/// Address types the interval table can be keyed on.
pub(crate) trait SpanAddr: Copy + Ord + std::fmt::Debug {
    /// Widens to `u64` for diagnostics and size arithmetic.
    fn as_u64(self) -> u64;
}

impl SpanAddr for u16 {
    fn as_u64(self) -> u64 {
        u64::from(self)
    }
}

impl SpanAddr for u64 {
    fn as_u64(self) -> u64 {
        self
    }
}

/// One interval: `[first, last]` owned by registration `idx`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SpanEntry<A> {
    pub first: A,
    pub last: A,
    pub idx: u16,
}

/// Sorted, disjoint interval table.
#[derive(Debug, Default)]
pub(crate) struct SpanTable<A> {
    entries: Vec<SpanEntry<A>>,
}

impl<A: SpanAddr> SpanTable<A> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SpanEntry<A>> {
        self.entries.iter()
    }

    /// Resolves `addr` to `(registration index, interval first address)`.
    ///
    /// The probe starts at `*hint` (the table position of the previous hit
    /// on this CPU) and falls back to midpoint bisection. On a hit the
    /// hint is updated.
    pub fn find(&self, addr: A, hint: &mut u16) -> Option<(u16, A)> {
        let mut end = self.entries.len();
        if end == 0 {
            return None;
        }
        let mut first = 0usize;
        let mut i = *hint as usize;
        if i >= end {
            i = end / 2;
        }
        loop {
            let cur = &self.entries[i];
            if cur.first > addr {
                if i > first {
                    end = i;
                } else {
                    return None;
                }
            } else if cur.last < addr {
                i += 1;
                if i < end {
                    first = i;
                } else {
                    return None;
                }
            } else {
                *hint = i as u16;
                return Some((cur.idx, cur.first));
            }
            i = first + (end - first) / 2;
        }
    }

    /// True when `[first, last]` overlaps any existing interval.
    pub fn conflicts(&self, first: A, last: A) -> bool {
        let count = self.entries.len();
        if count == 0 {
            return false;
        }
        let mut lo = 0usize;
        let mut hi = count;
        let mut i = count / 2;
        loop {
            let cur = &self.entries[i];
            if cur.last < first {
                i += 1;
                if i >= hi {
                    return false;
                }
                lo = i;
            } else if cur.first > last {
                if i <= lo {
                    return false;
                }
                hi = i;
            } else {
                return true;
            }
            i = lo + (hi - lo) / 2;
        }
    }

    /// Inserts `[first, last]` for registration `idx`.
    ///
    /// Any overlap with an existing interval, including equality at a
    /// single endpoint, is a conflict and leaves the table unchanged.
    pub fn insert(&mut self, idx: u16, first: A, last: A) -> Result<()> {
        debug_assert!(first <= last);
        let count = self.entries.len();
        let mut pos = count;
        if count > 0 {
            let mut lo = 0usize;
            let mut hi = count;
            let mut i = count / 2;
            loop {
                let cur = &self.entries[i];
                if cur.last < first {
                    i += 1;
                    if i < hi {
                        lo = i;
                    } else {
                        pos = i;
                        break;
                    }
                } else if cur.first > last {
                    if i > lo {
                        hi = i;
                    } else {
                        pos = i;
                        break;
                    }
                } else {
                    return Err(Error::RangeConflict {
                        first: first.as_u64(),
                        last: last.as_u64(),
                    });
                }
                i = lo + (hi - lo) / 2;
            }
        }
        self.entries
            .try_reserve(1)
            .map_err(|_| Error::OutOfMemory)?;
        self.entries.insert(pos, SpanEntry { first, last, idx });
        Ok(())
    }

    /// Removes the interval `[first, last]` belonging to registration
    /// `idx`. The interval must exist and must belong to `idx`; anything
    /// else means the lookup table and the registration table diverged.
    pub fn remove(&mut self, idx: u16, first: A, last: A) -> Result<()> {
        let count = self.entries.len();
        let mut lo = 0usize;
        let mut hi = count;
        let mut i = count / 2;
        while lo < hi {
            let cur = &self.entries[i];
            if cur.last < first {
                i += 1;
                if i >= hi {
                    break;
                }
                lo = i;
            } else if cur.first > last {
                if i <= lo {
                    break;
                }
                hi = i;
            } else if cur.idx == idx {
                debug_assert_eq!(cur.first, first);
                debug_assert_eq!(cur.last, last);
                self.entries.remove(i);
                return Ok(());
            } else {
                return Err(Error::Internal("lookup entry owned by another registration"));
            }
            i = lo + (hi - lo) / 2;
        }
        Err(Error::Internal("mapped registration missing from lookup table"))
    }

    /// Debug-build sanity pass: intervals ordered, disjoint, and each
    /// matching the registered size reported by `size_of`.
    #[cfg(debug_assertions)]
    pub fn assert_sane(&self, size_of: impl Fn(u16) -> u64) {
        let mut prev_last: Option<A> = None;
        for e in &self.entries {
            assert!(e.first <= e.last, "interval inverted");
            if let Some(p) = prev_last {
                assert!(p < e.first, "intervals overlap or are unordered");
            }
            let span = e.last.as_u64() - e.first.as_u64() + 1;
            assert_eq!(span, size_of(e.idx), "interval length != registration size");
            prev_last = Some(e.last);
        }
    }

    #[cfg(not(debug_assertions))]
    pub fn assert_sane(&self, _size_of: impl Fn(u16) -> u64) {}
}
