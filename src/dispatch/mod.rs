//! The dispatcher: hot-path routing of guest I/O to registered devices.
//!
//! Every intercepted `IN`/`OUT` or MMIO access lands here. The same code
//! runs in two contexts that differ only in blocking policy:
//!
//! - **Fast context** (kernel/driverless execution): may not block. Lock
//!   contention, missing callbacks and oversized accesses all turn into
//!   the deferral protocol so the execution engine can retry in the slow
//!   context.
//! - **Slow context** (the full user-space monitor): blocks on locks and
//!   must be able to complete every access.
//!
//! Deferred *writes* carry their data along in per-CPU state so the slow
//! context can commit them without re-decoding the faulting instruction:
//!
//! ```text
//!  fast context                     per-CPU state            slow context
//!  ─────────────                    ─────────────            ────────────
//!  port_write ──(callback defers)──► pending port write ──► commit_pending_writes
//!  mmio_write ──(callback defers)──► pending MMIO write ──►   └─ re-runs the write,
//!                                    (≤ 128 bytes)              merges statuses
//! ```
//!
//! A fixed-depth recursion guard protects against device topologies whose
//! MMIO callbacks synchronously trigger further MMIO on the same CPU.

mod commit;
mod ioport;
mod mmio;

pub use mmio::MmioDirection;

use std::cell::{Cell, RefCell};
use std::sync::Arc;

use vm_memory::GuestAddress;

use crate::device::DeviceInstance;
use crate::error::{Error, Result};
use crate::status::IoStatus;

/// Execution context of a dispatcher call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Context {
    /// Non-blocking context; contention escalates to the slow context.
    Fast,
    /// Blocking context with complete emulation available.
    Slow,
}

impl Context {
    pub(crate) fn is_fast(self) -> bool {
        matches!(self, Context::Fast)
    }
}

/// Capacity of the per-CPU deferred MMIO write buffer.
pub const PENDING_MMIO_BUFFER: usize = 128;

/// Largest scalar MMIO access the dispatcher accepts.
pub const MAX_MMIO_ACCESS: usize = 16;

/// Maximum in-progress MMIO dispatches per CPU before the guard trips.
pub const MMIO_RECURSION_LIMIT: u8 = 2;

/// A buffered I/O port write awaiting its slow-context commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingPortWrite {
    pub port: u16,
    pub value: u32,
    /// 1, 2 or 4.
    pub width: usize,
}

/// A buffered MMIO write awaiting its slow-context commit.
#[derive(Debug, Clone, Copy)]
pub struct PendingMmioWrite {
    pub addr: GuestAddress,
    pub len: usize,
    /// Registration index observed when the write was buffered; lets the
    /// commit bypass the lookup when it still resolves.
    pub region_hint: u16,
    pub data: [u8; PENDING_MMIO_BUFFER],
}

impl PendingMmioWrite {
    /// The buffered bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

/// Per-virtual-CPU dispatch state.
///
/// Strictly owned by its CPU thread (`!Sync`); interior mutability lets a
/// device callback re-enter the dispatcher on the same CPU, which is what
/// the recursion guard exists to bound.
pub struct VcpuIo {
    pending_port: Cell<Option<PendingPortWrite>>,
    pending_mmio: Cell<Option<PendingMmioWrite>>,
    pub(crate) hint_port_read: Cell<u16>,
    pub(crate) hint_port_write: Cell<u16>,
    pub(crate) hint_port_read_string: Cell<u16>,
    pub(crate) hint_port_write_string: Cell<u16>,
    pub(crate) hint_mmio: Cell<u16>,
    recursion_depth: Cell<u8>,
    recursion_stack: RefCell<[Option<Arc<DeviceInstance>>; MMIO_RECURSION_LIMIT as usize]>,
}

impl VcpuIo {
    /// Fresh per-CPU state with empty deferral slots.
    pub fn new() -> Self {
        Self {
            pending_port: Cell::new(None),
            pending_mmio: Cell::new(None),
            hint_port_read: Cell::new(0),
            hint_port_write: Cell::new(0),
            hint_port_read_string: Cell::new(0),
            hint_port_write_string: Cell::new(0),
            hint_mmio: Cell::new(0),
            recursion_depth: Cell::new(0),
            recursion_stack: RefCell::new([None, None]),
        }
    }

    /// Snapshot of the pending port write, if any.
    pub fn pending_port_write(&self) -> Option<PendingPortWrite> {
        self.pending_port.get()
    }

    /// Snapshot of the pending MMIO write, if any.
    pub fn pending_mmio_write(&self) -> Option<PendingMmioWrite> {
        self.pending_mmio.get()
    }

    /// True when either deferral slot is occupied.
    pub fn has_pending_writes(&self) -> bool {
        self.pending_port.get().is_some() || self.pending_mmio.get().is_some()
    }

    /// Current MMIO recursion depth on this CPU.
    pub fn mmio_recursion_depth(&self) -> u8 {
        self.recursion_depth.get()
    }

    /// Buffers a deferred port write. The engine drains the slot before
    /// issuing the next instruction, so an occupied slot is a protocol
    /// violation.
    pub(crate) fn buffer_port_write(
        &self,
        port: u16,
        value: u32,
        width: usize,
    ) -> Result<IoStatus> {
        if self.pending_port.get().is_some() {
            return Err(Error::Internal("port write already pending"));
        }
        log::trace!("buffering port write {value:#x}/{width} -> {port:#x}");
        self.pending_port
            .set(Some(PendingPortWrite { port, value, width }));
        Ok(IoStatus::CommitToSlow)
    }

    pub(crate) fn take_pending_port_write(&self) -> Option<PendingPortWrite> {
        self.pending_port.take()
    }

    /// Buffers a deferred MMIO write, concatenating onto a pending one
    /// when the new bytes start exactly where it ends. That happens when
    /// an unaligned push straddles a page boundary and arrives as two
    /// bounce-buffered halves.
    pub(crate) fn buffer_mmio_write(
        &self,
        addr: GuestAddress,
        bytes: &[u8],
        region_hint: u16,
    ) -> Result<IoStatus> {
        match self.pending_mmio.get() {
            None => self.buffer_mmio_write_fresh(addr, bytes, region_hint),
            Some(mut pending) => {
                let expected = pending
                    .addr
                    .0
                    .checked_add(pending.len as u64)
                    .ok_or(Error::Internal("pending MMIO write wraps"))?;
                if addr.0 != expected {
                    return Err(Error::Internal("pending MMIO write is not adjacent"));
                }
                if pending.len + bytes.len() > PENDING_MMIO_BUFFER {
                    return Err(Error::Internal("pending MMIO write overflows buffer"));
                }
                log::trace!(
                    "merging {} deferred MMIO bytes onto {:#x}+{}",
                    bytes.len(),
                    pending.addr.0,
                    pending.len
                );
                pending.data[pending.len..pending.len + bytes.len()].copy_from_slice(bytes);
                pending.len += bytes.len();
                self.pending_mmio.set(Some(pending));
                Ok(IoStatus::CommitToSlow)
            }
        }
    }

    /// Buffers a deferred MMIO write into an empty slot; an occupied slot
    /// means a split write already buffered its merged data.
    pub(crate) fn buffer_mmio_write_fresh(
        &self,
        addr: GuestAddress,
        bytes: &[u8],
        region_hint: u16,
    ) -> Result<IoStatus> {
        if self.pending_mmio.get().is_some() {
            return Err(Error::Internal("MMIO write already pending"));
        }
        if bytes.len() > PENDING_MMIO_BUFFER {
            return Err(Error::Internal("deferred MMIO write too large"));
        }
        let mut data = [0u8; PENDING_MMIO_BUFFER];
        data[..bytes.len()].copy_from_slice(bytes);
        log::trace!("buffering MMIO write of {} bytes at {:#x}", bytes.len(), addr.0);
        self.pending_mmio.set(Some(PendingMmioWrite {
            addr,
            len: bytes.len(),
            region_hint,
            data,
        }));
        Ok(IoStatus::CommitToSlow)
    }

    pub(crate) fn take_pending_mmio_write(&self) -> Option<PendingMmioWrite> {
        self.pending_mmio.take()
    }

    /// Enters the MMIO recursion guard. Returns `false` when the limit is
    /// reached; the caller then takes the default action without touching
    /// the device.
    pub(crate) fn enter_mmio_recursion(&self, device: &Arc<DeviceInstance>) -> bool {
        let depth = self.recursion_depth.get();
        if depth >= MMIO_RECURSION_LIMIT {
            return false;
        }
        self.recursion_stack.borrow_mut()[usize::from(depth)] = Some(Arc::clone(device));
        self.recursion_depth.set(depth + 1);
        true
    }

    pub(crate) fn leave_mmio_recursion(&self) {
        let depth = self.recursion_depth.get();
        debug_assert!(depth > 0);
        self.recursion_depth.set(depth.saturating_sub(1));
    }

    /// Names of the devices currently on the recursion stack, for the
    /// too-deep diagnostic.
    pub(crate) fn recursion_trace(&self) -> String {
        self.recursion_stack
            .borrow()
            .iter()
            .flatten()
            .map(|d| d.name().to_owned())
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}

impl Default for VcpuIo {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for VcpuIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VcpuIo")
            .field("pending_port", &self.pending_port.get())
            .field("pending_mmio_len", &self.pending_mmio.get().map(|p| p.len))
            .field("recursion_depth", &self.recursion_depth.get())
            .finish()
    }
}

/// Enters a device critical section with the context's blocking policy;
/// `None` means fast-context contention and the caller must defer.
pub(crate) fn enter_device<'a>(
    device: &'a Arc<DeviceInstance>,
    ctx: Context,
) -> Option<std::sync::MutexGuard<'a, Box<crate::device::DeviceState>>> {
    if ctx.is_fast() {
        device.try_enter()
    } else {
        Some(device.enter())
    }
}

/// Bumps a statistics entry when statistics are enabled for the
/// registration.
pub(crate) fn bump<S>(stats: &Option<Arc<S>>, f: impl FnOnce(&S)) {
    if let Some(s) = stats {
        f(s);
    }
}

/// All-ones value of the given access width.
pub(crate) fn ones_value(width: usize) -> u32 {
    match width {
        1 => 0xff,
        2 => 0xffff,
        _ => u32::MAX,
    }
}

/// Validates a scalar port access width.
pub(crate) fn check_port_width(width: usize) -> Result<()> {
    match width {
        1 | 2 | 4 => Ok(()),
        _ => Err(Error::InvalidParameter("port access width must be 1, 2 or 4")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_slots_start_empty() {
        let vcpu = VcpuIo::new();
        assert!(!vcpu.has_pending_writes());
        assert_eq!(vcpu.mmio_recursion_depth(), 0);
    }

    #[test]
    fn test_port_write_buffering_is_single_slot() {
        let vcpu = VcpuIo::new();
        assert_eq!(
            vcpu.buffer_port_write(0x80, 0xaa, 1).unwrap(),
            IoStatus::CommitToSlow
        );
        assert!(matches!(
            vcpu.buffer_port_write(0x80, 0xbb, 1),
            Err(Error::Internal(_))
        ));
        let p = vcpu.take_pending_port_write().unwrap();
        assert_eq!(p, PendingPortWrite { port: 0x80, value: 0xaa, width: 1 });
        assert!(vcpu.take_pending_port_write().is_none());
    }

    #[test]
    fn test_mmio_adjacency_merge() {
        let vcpu = VcpuIo::new();
        vcpu.buffer_mmio_write(GuestAddress(0x1000), &[1, 2, 3, 4], 7)
            .unwrap();
        // Contiguous second half merges.
        vcpu.buffer_mmio_write(GuestAddress(0x1004), &[5, 6], 7)
            .unwrap();
        let p = vcpu.take_pending_mmio_write().unwrap();
        assert_eq!(p.addr, GuestAddress(0x1000));
        assert_eq!(p.bytes(), &[1, 2, 3, 4, 5, 6]);
        assert_eq!(p.region_hint, 7);
    }

    #[test]
    fn test_mmio_non_adjacent_is_internal_error() {
        let vcpu = VcpuIo::new();
        vcpu.buffer_mmio_write(GuestAddress(0x1000), &[1], 0).unwrap();
        assert!(matches!(
            vcpu.buffer_mmio_write(GuestAddress(0x2000), &[2], 0),
            Err(Error::Internal(_))
        ));
    }

    #[test]
    fn test_mmio_merge_respects_capacity() {
        let vcpu = VcpuIo::new();
        let big = [0u8; PENDING_MMIO_BUFFER];
        vcpu.buffer_mmio_write(GuestAddress(0x1000), &big, 0).unwrap();
        assert!(matches!(
            vcpu.buffer_mmio_write(GuestAddress(0x1000 + PENDING_MMIO_BUFFER as u64), &[1], 0),
            Err(Error::Internal(_))
        ));
    }

    #[test]
    fn test_recursion_guard_depth_limit() {
        let vcpu = VcpuIo::new();
        let a = DeviceInstance::new("a", ());
        let b = DeviceInstance::new("b", ());
        let c = DeviceInstance::new("c", ());
        assert!(vcpu.enter_mmio_recursion(&a));
        assert!(vcpu.enter_mmio_recursion(&b));
        assert!(!vcpu.enter_mmio_recursion(&c));
        assert_eq!(vcpu.mmio_recursion_depth(), 2);
        assert_eq!(vcpu.recursion_trace(), "a -> b");
        vcpu.leave_mmio_recursion();
        vcpu.leave_mmio_recursion();
        assert_eq!(vcpu.mmio_recursion_depth(), 0);
    }

    #[test]
    fn test_ones_value_by_width() {
        assert_eq!(ones_value(1), 0xff);
        assert_eq!(ones_value(2), 0xffff);
        assert_eq!(ones_value(4), 0xffff_ffff);
    }
}
