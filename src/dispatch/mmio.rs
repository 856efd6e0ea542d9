//! MMIO dispatch: scalar accesses, complicated-access splitting and the
//! physical-handler entry invoked on MMIO page faults.
//!
//! An access is *simple* when it matches the region's declared width and
//! alignment (an aligned dword, an aligned qword where the mode allows it,
//! or anything in passthrough mode) and is forwarded in one callback.
//! Everything else is *complicated* and gets synthesized from aligned
//! dword transactions according to the region's read/write mode.

use std::sync::Arc;
use std::time::Instant;

use vm_memory::GuestAddress;

use crate::device::{DeviceInstance, DeviceState, MmioCallbacks};
use crate::dispatch::{
    bump, enter_device, Context, VcpuIo, MAX_MMIO_ACCESS, PENDING_MMIO_BUFFER,
};
use crate::error::{Error, Result};
use crate::registry::{MmioFlags, MmioRegistration, MmioWriteMode};
use crate::stats::MmioStats;
use crate::status::{fold_engine, DeviceAccess, IoStatus};
use crate::vm::VmIo;

/// Direction of an MMIO access dispatched through the physical handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmioDirection {
    Read,
    Write,
}

/// Outcome of a shared-lock MMIO lookup.
enum MmioResolution {
    /// Fast context found the lock write-contended.
    Contended,
    /// No registration covers the address.
    Miss,
    /// Snapshot plus the in-region offset of the accessed address.
    Hit(MmioSnapshot, u64),
}

/// Registration snapshot taken under the shared lock.
struct MmioSnapshot {
    device: Arc<DeviceInstance>,
    cookie: u64,
    flags: MmioFlags,
    callbacks: MmioCallbacks,
    size: u64,
    mapping: Option<GuestAddress>,
    idx: u16,
    stats: Option<Arc<MmioStats>>,
}

impl MmioSnapshot {
    fn of(entry: &MmioRegistration, stats: Option<Arc<MmioStats>>) -> Self {
        Self {
            device: Arc::clone(&entry.device),
            cookie: entry.cookie,
            flags: entry.flags,
            callbacks: entry.callbacks,
            size: entry.size,
            mapping: entry.mapping(),
            idx: entry.idx_self,
            stats,
        }
    }

    /// The address argument a callback receives for an access at `offset`
    /// into the region.
    fn callback_addr(&self, addr: u64, offset: u64) -> u64 {
        if self.flags.absolute {
            addr
        } else {
            offset
        }
    }

    fn has_callback(&self, dir: MmioDirection) -> bool {
        match dir {
            MmioDirection::Read => self.callbacks.read.is_some(),
            MmioDirection::Write => self.callbacks.write.is_some(),
        }
    }
}

fn fill_ones(buf: &mut [u8]) {
    buf.fill(0xff);
}

impl VmIo {
    /// Reads `buf.len()` bytes (1..=16) of MMIO at `addr`.
    ///
    /// Reads from unregistered addresses complete with all-ones.
    pub fn mmio_read(
        &self,
        vcpu: &VcpuIo,
        ctx: Context,
        addr: GuestAddress,
        buf: &mut [u8],
    ) -> Result<IoStatus> {
        check_scalar_len(buf.len())?;
        match self.resolve_mmio(vcpu, ctx, addr) {
            MmioResolution::Contended => Ok(IoStatus::DeferToSlow),
            MmioResolution::Miss => {
                log::trace!("MMIO read {:#x}: no handler, all-ones", addr.0);
                fill_ones(buf);
                Ok(IoStatus::Ok)
            }
            MmioResolution::Hit(snap, offset) => {
                self.dispatch_mmio(vcpu, ctx, &snap, addr, offset, buf, MmioDirection::Read)
            }
        }
    }

    /// Writes `buf.len()` bytes (1..=16) of MMIO at `addr`.
    ///
    /// Writes to unregistered addresses are dropped.
    pub fn mmio_write(
        &self,
        vcpu: &VcpuIo,
        ctx: Context,
        addr: GuestAddress,
        buf: &[u8],
    ) -> Result<IoStatus> {
        check_scalar_len(buf.len())?;
        match self.resolve_mmio(vcpu, ctx, addr) {
            MmioResolution::Contended => Ok(IoStatus::DeferToSlow),
            MmioResolution::Miss => {
                log::trace!("MMIO write {:#x}: no handler, dropped", addr.0);
                Ok(IoStatus::Ok)
            }
            MmioResolution::Hit(snap, offset) => {
                let mut data = [0u8; MAX_MMIO_ACCESS];
                data[..buf.len()].copy_from_slice(buf);
                self.dispatch_mmio(
                    vcpu,
                    ctx,
                    &snap,
                    addr,
                    offset,
                    &mut data[..buf.len()],
                    MmioDirection::Write,
                )
            }
        }
    }

    /// The physical-handler entry: dispatches an access the memory
    /// manager intercepted on an MMIO page.
    ///
    /// `cookie` is the registration handle stored when the handler range
    /// was installed. Stale hits (the region was remapped while the fault
    /// was in flight) are tolerated: reads complete with all-ones, writes
    /// are dropped, and the fast context defers instead.
    pub fn handle_mmio_access(
        &self,
        vcpu: &VcpuIo,
        ctx: Context,
        cookie: u64,
        fault: GuestAddress,
        buf: &mut [u8],
        dir: MmioDirection,
    ) -> Result<IoStatus> {
        self.counters().mmio_handler_calls.inc();
        if buf.is_empty() {
            return Err(Error::InvalidParameter("zero-length MMIO access"));
        }

        let Some(state) = self.lock_shared(ctx) else {
            return Ok(IoStatus::DeferToSlow);
        };
        let idx =
            u16::try_from(cookie).map_err(|_| Error::InvalidHandle(u32::try_from(cookie).unwrap_or(u32::MAX)))?;
        let Some(entry) = state.mmio.get_by_index(idx) else {
            return Err(Error::InvalidHandle(u32::from(idx)));
        };
        let snap = MmioSnapshot::of(entry, state.mmio_stats.get(entry.idx_stats, 0));
        drop(state);

        // Bulk accesses and directions the fast context cannot serve are
        // redone in the slow context.
        if ctx.is_fast() && (buf.len() > PENDING_MMIO_BUFFER || !snap.has_callback(dir)) {
            self.note_mmio_escalation(&snap, dir);
            return Ok(IoStatus::DeferToSlow);
        }

        let offset = match snap.mapping {
            Some(base) if fault.0.wrapping_sub(base.0) < snap.size => fault.0 - base.0,
            _ => {
                self.counters().mmio_stale_mappings.inc();
                log::warn!(
                    "stale MMIO access at {:#x}: region #{} now at {:?}",
                    fault.0,
                    snap.idx,
                    snap.mapping
                );
                if ctx.is_fast() {
                    self.note_mmio_escalation(&snap, dir);
                    return Ok(IoStatus::DeferToSlow);
                }
                if dir == MmioDirection::Read {
                    fill_ones(buf);
                    bump(&snap.stats, |s| s.ff_or_00_reads.inc());
                }
                return Ok(IoStatus::Ok);
            }
        };
        self.dispatch_mmio(vcpu, ctx, &snap, fault, offset, buf, dir)
    }

    /// Page-fault entry: validates the faulting registration and lets the
    /// instruction emulator re-run the access. The emulator calls back
    /// through [`VmIo::handle_mmio_access`] or the scalar entry points.
    pub fn mmio_pf_handler<F>(
        &self,
        vcpu: &VcpuIo,
        ctx: Context,
        write_fault: bool,
        fault: GuestAddress,
        cookie: u64,
        emulate: F,
    ) -> Result<IoStatus>
    where
        F: FnOnce(&VmIo, &VcpuIo) -> Result<IoStatus>,
    {
        let Some(state) = self.lock_shared(ctx) else {
            return Ok(IoStatus::DeferToSlow);
        };
        let idx = u16::try_from(cookie)
            .map_err(|_| Error::InvalidHandle(u32::try_from(cookie).unwrap_or(u32::MAX)))?;
        let Some(entry) = state.mmio.get_by_index(idx) else {
            return Err(Error::RangeNotFound(fault.0));
        };
        let snap = MmioSnapshot::of(entry, None);
        drop(state);

        log::trace!(
            "MMIO #PF at {:#x} (write={write_fault}) for region #{idx}",
            fault.0
        );
        if ctx.is_fast() {
            let dir = if write_fault {
                MmioDirection::Write
            } else {
                MmioDirection::Read
            };
            if !snap.has_callback(dir) {
                return Ok(IoStatus::DeferToSlow);
            }
        }
        emulate(self, vcpu)
    }

    /// Fills `count` items of `width` bytes starting at `addr`, through
    /// the region's fill callback when present and otherwise as a train
    /// of scalar writes.
    pub fn mmio_fill(
        &self,
        vcpu: &VcpuIo,
        ctx: Context,
        addr: GuestAddress,
        item: u32,
        width: usize,
        count: usize,
    ) -> Result<IoStatus> {
        crate::dispatch::check_port_width(width)?;
        if count == 0 {
            return Err(Error::InvalidParameter("fill count must be non-zero"));
        }
        let (snap, offset) = match self.resolve_mmio(vcpu, ctx, addr) {
            MmioResolution::Contended => return Ok(IoStatus::DeferToSlow),
            MmioResolution::Miss => return Ok(IoStatus::Ok),
            MmioResolution::Hit(snap, offset) => (snap, offset),
        };

        if let Some(fill_cb) = snap.callbacks.fill {
            let Some(mut dev) = enter_device(&snap.device, ctx) else {
                self.counters().mmio_dev_lock_contention.inc();
                return Ok(IoStatus::DeferToSlow);
            };
            let access = fill_cb(
                dev.as_mut(),
                snap.cookie,
                snap.callback_addr(addr.0, offset),
                item,
                width,
                count,
            )?;
            return match access {
                DeviceAccess::Ok => Ok(IoStatus::Ok),
                DeviceAccess::Engine(k) => Ok(IoStatus::Engine(k)),
                DeviceAccess::Defer if ctx.is_fast() => Ok(IoStatus::DeferToSlow),
                DeviceAccess::Defer => {
                    Err(Error::Internal("device deferred a slow-context fill"))
                }
                DeviceAccess::UnusedOnes | DeviceAccess::UnusedZeros => {
                    Err(Error::Internal("unused result from a fill handler"))
                }
            };
        }

        // No fill handler: replay as scalar writes.
        let bytes = item.to_le_bytes();
        for i in 0..count {
            let mut data = [0u8; 4];
            data[..width].copy_from_slice(&bytes[..width]);
            let at = GuestAddress(addr.0 + (i * width) as u64);
            let status = self.dispatch_mmio(
                vcpu,
                ctx,
                &snap,
                at,
                offset + (i * width) as u64,
                &mut data[..width],
                MmioDirection::Write,
            )?;
            if status != IoStatus::Ok {
                return Ok(status);
            }
        }
        Ok(IoStatus::Ok)
    }

    /// Shared-lock lookup returning a snapshot plus the in-region offset.
    fn resolve_mmio(&self, vcpu: &VcpuIo, ctx: Context, addr: GuestAddress) -> MmioResolution {
        let Some(state) = self.lock_shared(ctx) else {
            return MmioResolution::Contended;
        };
        let mut hint = vcpu.hint_mmio.get();
        let found = state.mmio_lookup.find(addr.0, &mut hint);
        vcpu.hint_mmio.set(hint);
        let Some((idx, first)) = found else {
            return MmioResolution::Miss;
        };
        let Some(entry) = state.mmio.get_by_index(idx) else {
            return MmioResolution::Miss;
        };
        let snap = MmioSnapshot::of(entry, state.mmio_stats.get(entry.idx_stats, 0));
        MmioResolution::Hit(snap, addr.0 - first)
    }

    fn note_mmio_escalation(&self, snap: &MmioSnapshot, dir: MmioDirection) {
        match dir {
            MmioDirection::Read => {
                self.counters().mmio_reads_to_slow.inc();
                bump(&snap.stats, |s| s.read_fast_to_slow.inc());
            }
            MmioDirection::Write => {
                self.counters().mmio_writes_to_slow.inc();
                bump(&snap.stats, |s| s.write_fast_to_slow.inc());
            }
        }
    }

    /// Runs one resolved MMIO access: recursion guard, device critical
    /// section, simple-or-complicated forwarding, deferral buffering.
    fn dispatch_mmio(
        &self,
        vcpu: &VcpuIo,
        ctx: Context,
        snap: &MmioSnapshot,
        addr: GuestAddress,
        offset: u64,
        buf: &mut [u8],
        dir: MmioDirection,
    ) -> Result<IoStatus> {
        if !vcpu.enter_mmio_recursion(&snap.device) {
            self.counters().mmio_too_deep_recursion.inc();
            log::warn!(
                "MMIO recursion limit hit at {:#x} via {}",
                addr.0,
                vcpu.recursion_trace()
            );
            return Ok(IoStatus::DefaultAction);
        }
        let result = self.dispatch_mmio_in_guard(vcpu, ctx, snap, addr, offset, buf, dir);
        vcpu.leave_mmio_recursion();
        result
    }

    fn dispatch_mmio_in_guard(
        &self,
        vcpu: &VcpuIo,
        ctx: Context,
        snap: &MmioSnapshot,
        addr: GuestAddress,
        offset: u64,
        buf: &mut [u8],
        dir: MmioDirection,
    ) -> Result<IoStatus> {
        let Some(mut dev) = enter_device(&snap.device, ctx) else {
            self.counters().mmio_dev_lock_contention.inc();
            return match dir {
                MmioDirection::Read => {
                    self.note_mmio_escalation(snap, dir);
                    Ok(IoStatus::DeferToSlow)
                }
                MmioDirection::Write => {
                    // Keep the data so the slow context can commit it.
                    bump(&snap.stats, |s| s.commit_fast_to_slow.inc());
                    self.counters().mmio_commits_to_slow.inc();
                    vcpu.buffer_mmio_write(addr, buf, snap.idx)
                }
            };
        };

        let started = Instant::now();
        match dir {
            MmioDirection::Read => {
                let status = self.do_mmio_read(dev.as_mut(), ctx, snap, addr, offset, buf)?;
                drop(dev);
                bump(&snap.stats, |s| s.prof_read.record(started.elapsed()));
                if status == IoStatus::DeferToSlow {
                    self.note_mmio_escalation(snap, dir);
                } else {
                    bump(&snap.stats, |s| s.reads.inc());
                }
                Ok(status)
            }
            MmioDirection::Write => {
                let status =
                    self.do_mmio_write(vcpu, dev.as_mut(), ctx, snap, addr, offset, buf)?;
                drop(dev);
                bump(&snap.stats, |s| s.prof_write.record(started.elapsed()));
                match status {
                    IoStatus::DeferToSlow => {
                        bump(&snap.stats, |s| s.commit_fast_to_slow.inc());
                        self.counters().mmio_commits_to_slow.inc();
                        vcpu.buffer_mmio_write(addr, buf, snap.idx)
                    }
                    IoStatus::CommitToSlow => {
                        bump(&snap.stats, |s| s.commit_fast_to_slow.inc());
                        self.counters().mmio_commits_to_slow.inc();
                        Ok(status)
                    }
                    _ => {
                        bump(&snap.stats, |s| s.writes.inc());
                        Ok(status)
                    }
                }
            }
        }
    }

    /// Forwards a read, splitting it when the region's mode requires.
    pub(crate) fn do_mmio_read(
        &self,
        dev: &mut DeviceState,
        ctx: Context,
        snap: &MmioSnapshot,
        addr: GuestAddress,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<IoStatus> {
        let Some(read_cb) = snap.callbacks.read else {
            fill_ones(buf);
            bump(&snap.stats, |s| s.ff_or_00_reads.inc());
            return Ok(IoStatus::Ok);
        };
        let len = buf.len();
        let simple = (len == 4 && offset % 4 == 0)
            || snap.flags.read_mode == crate::registry::MmioReadMode::Passthrough
            || (len == 8 && offset % 8 == 0 && snap.flags.read_mode.allows_qword());
        if !simple {
            return self.complicated_mmio_read(dev, ctx, snap, addr, offset, buf);
        }

        let access = read_cb(dev, snap.cookie, snap.callback_addr(addr.0, offset), buf)?;
        match access {
            DeviceAccess::Ok => Ok(IoStatus::Ok),
            DeviceAccess::UnusedOnes => {
                fill_ones(buf);
                bump(&snap.stats, |s| s.ff_or_00_reads.inc());
                Ok(IoStatus::Ok)
            }
            DeviceAccess::UnusedZeros => {
                buf.fill(0);
                bump(&snap.stats, |s| s.ff_or_00_reads.inc());
                Ok(IoStatus::Ok)
            }
            DeviceAccess::Engine(k) => Ok(IoStatus::Engine(k)),
            DeviceAccess::Defer if ctx.is_fast() => Ok(IoStatus::DeferToSlow),
            DeviceAccess::Defer => Err(Error::Internal("device deferred a slow-context read")),
        }
    }

    /// Synthesizes a narrow or misaligned read from aligned dword reads.
    fn complicated_mmio_read(
        &self,
        dev: &mut DeviceState,
        ctx: Context,
        snap: &MmioSnapshot,
        addr: GuestAddress,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<IoStatus> {
        let read_cb = snap
            .callbacks
            .read
            .ok_or(Error::Internal("complicated read without a read handler"))?;
        if buf.len() > MAX_MMIO_ACCESS {
            return Err(Error::Internal("complicated read too large"));
        }
        if snap.flags.dbgstop_on_complicated_read {
            if ctx.is_fast() {
                return Ok(IoStatus::DeferToSlow);
            }
            log::warn!(
                "complicated {}-byte read at {:#x}; debugger stop requested but none attached",
                buf.len(),
                addr.0
            );
        }
        bump(&snap.stats, |s| s.complicated_reads.inc());

        let mut status = IoStatus::Ok;
        let len = buf.len();
        let mut pos = 0usize;
        while pos < len {
            let cur_off = offset + pos as u64;
            let sub = (cur_off % 4) as usize;
            let arg = snap.callback_addr((addr.0 + pos as u64) & !3, cur_off & !3);
            let mut dword = [0u8; 4];
            let access = read_cb(dev, snap.cookie, arg, &mut dword)?;
            let mut value = u32::from_le_bytes(dword);
            match access {
                DeviceAccess::Ok => {}
                DeviceAccess::UnusedOnes => {
                    value = u32::MAX;
                    bump(&snap.stats, |s| s.ff_or_00_reads.inc());
                }
                DeviceAccess::UnusedZeros => {
                    value = 0;
                    bump(&snap.stats, |s| s.ff_or_00_reads.inc());
                }
                DeviceAccess::Defer if ctx.is_fast() => return Ok(IoStatus::DeferToSlow),
                DeviceAccess::Defer => {
                    return Err(Error::Internal("device deferred a slow-context read"))
                }
                DeviceAccess::Engine(k) => status = fold_engine(status, k),
            }
            value >>= sub * 8;

            let this_part = usize::min(4 - sub, len - pos);
            buf[pos..pos + this_part].copy_from_slice(&value.to_le_bytes()[..this_part]);
            pos += this_part;
        }
        Ok(status)
    }

    /// Forwards a write, splitting it when the region's mode requires.
    pub(crate) fn do_mmio_write(
        &self,
        vcpu: &VcpuIo,
        dev: &mut DeviceState,
        ctx: Context,
        snap: &MmioSnapshot,
        addr: GuestAddress,
        offset: u64,
        buf: &[u8],
    ) -> Result<IoStatus> {
        let Some(write_cb) = snap.callbacks.write else {
            return Ok(IoStatus::Ok);
        };
        let len = buf.len();
        let simple = (len == 4 && offset % 4 == 0)
            || snap.flags.write_mode == MmioWriteMode::Passthrough
            || (len == 8 && offset % 8 == 0 && snap.flags.write_mode.allows_qword());
        if !simple {
            return self.complicated_mmio_write(vcpu, dev, ctx, snap, addr, offset, buf);
        }

        let access = write_cb(dev, snap.cookie, snap.callback_addr(addr.0, offset), buf)?;
        match access {
            DeviceAccess::Ok => Ok(IoStatus::Ok),
            DeviceAccess::Engine(k) => Ok(IoStatus::Engine(k)),
            DeviceAccess::Defer if ctx.is_fast() => Ok(IoStatus::DeferToSlow),
            DeviceAccess::Defer => Err(Error::Internal("device deferred a slow-context write")),
            DeviceAccess::UnusedOnes | DeviceAccess::UnusedZeros => {
                Err(Error::Internal("unused result from a write handler"))
            }
        }
    }

    /// Splits a narrow or misaligned write into merged aligned-dword
    /// writes according to the region's write mode.
    fn complicated_mmio_write(
        &self,
        vcpu: &VcpuIo,
        dev: &mut DeviceState,
        ctx: Context,
        snap: &MmioSnapshot,
        addr: GuestAddress,
        offset: u64,
        buf: &[u8],
    ) -> Result<IoStatus> {
        let mode = snap.flags.write_mode;
        debug_assert_ne!(mode, MmioWriteMode::Passthrough);
        let write_cb = snap
            .callbacks
            .write
            .ok_or(Error::Internal("complicated write without a write handler"))?;
        if buf.is_empty() || buf.len() > MAX_MMIO_ACCESS {
            return Err(Error::Internal("complicated write size out of range"));
        }
        if snap.flags.dbgstop_on_complicated_write {
            if ctx.is_fast() {
                return Ok(IoStatus::DeferToSlow);
            }
            log::warn!(
                "complicated {}-byte write at {:#x}; debugger stop requested but none attached",
                buf.len(),
                addr.0
            );
        }
        bump(&snap.stats, |s| s.complicated_writes.inc());

        if mode.drops_complicated() {
            return Ok(IoStatus::Ok);
        }
        let read_missing = mode.reads_missing();

        let mut status = IoStatus::Ok;
        let len = buf.len();
        let mut pos = 0usize;
        while pos < len {
            let cur_addr = addr.0 + pos as u64;
            let cur_off = offset + pos as u64;
            let sub = (cur_off % 4) as usize;
            let this_part = usize::min(4 - sub, len - pos);
            let arg = snap.callback_addr(cur_addr & !3, cur_off & !3);

            // Fetch the background the narrow bytes are merged into.
            let mut missing = 0u32;
            if read_missing && this_part != 4 {
                if let Some(read_cb) = snap.callbacks.read {
                    let mut dword = [0u8; 4];
                    let access = read_cb(dev, snap.cookie, arg, &mut dword)?;
                    missing = u32::from_le_bytes(dword);
                    match access {
                        DeviceAccess::Ok => {}
                        DeviceAccess::UnusedOnes => {
                            missing = u32::MAX;
                            bump(&snap.stats, |s| s.ff_or_00_reads.inc());
                        }
                        DeviceAccess::UnusedZeros => {
                            missing = 0;
                            bump(&snap.stats, |s| s.ff_or_00_reads.inc());
                        }
                        DeviceAccess::Defer if ctx.is_fast() => {
                            // Park everything still unwritten for the
                            // slow-context commit.
                            return vcpu.buffer_mmio_write_fresh(
                                GuestAddress(cur_addr),
                                &buf[pos..],
                                snap.idx,
                            );
                        }
                        DeviceAccess::Defer => {
                            return Err(Error::Internal(
                                "device deferred a slow-context read",
                            ))
                        }
                        DeviceAccess::Engine(k) => status = fold_engine(status, k),
                    }
                }
            }

            // Skip partial units in modes that forward whole dwords only.
            if matches!(mode, MmioWriteMode::Dword | MmioWriteMode::DwordQword)
                && this_part != 4
            {
                pos += this_part;
                continue;
            }

            // Overlay the given bytes onto the background.
            let mask = match this_part {
                1 => 0x0000_00ffu32,
                2 => 0x0000_ffff,
                3 => 0x00ff_ffff,
                _ => u32::MAX,
            };
            let mut raw = [0u8; 4];
            raw[..this_part].copy_from_slice(&buf[pos..pos + this_part]);
            let given = u32::from_le_bytes(raw) << (sub * 8);
            let mask = mask << (sub * 8);
            let value = (missing & !mask) | (given & mask);

            let access = write_cb(dev, snap.cookie, arg, &value.to_le_bytes())?;
            match access {
                DeviceAccess::Ok => {}
                DeviceAccess::Engine(k) => status = fold_engine(status, k),
                DeviceAccess::Defer if ctx.is_fast() => {
                    // Buffer the merged dword head plus the unwritten tail
                    // at the containing aligned-dword address.
                    let tail = &buf[pos + this_part..];
                    let total = sub + this_part + tail.len();
                    let mut pending = [0u8; PENDING_MMIO_BUFFER];
                    let head = usize::min(4, total);
                    pending[..head].copy_from_slice(&value.to_le_bytes()[..head]);
                    pending[head..head + tail.len()].copy_from_slice(tail);
                    return vcpu.buffer_mmio_write_fresh(
                        GuestAddress(cur_addr & !3),
                        &pending[..head + tail.len()],
                        snap.idx,
                    );
                }
                DeviceAccess::Defer => {
                    return Err(Error::Internal("device deferred a slow-context write"))
                }
                DeviceAccess::UnusedOnes | DeviceAccess::UnusedZeros => {
                    return Err(Error::Internal("unused result from a write handler"))
                }
            }

            pos += this_part;
        }
        Ok(status)
    }

    /// Re-runs a buffered write against its region, used by the commit
    /// path once the hint has been re-validated.
    pub(crate) fn commit_mmio_to_region(
        &self,
        vcpu: &VcpuIo,
        idx: u16,
        addr: GuestAddress,
        offset: u64,
        bytes: &[u8],
    ) -> Result<IoStatus> {
        let state = self.state_read();
        let Some(entry) = state.mmio.get_by_index(idx) else {
            return Err(Error::InvalidHandle(u32::from(idx)));
        };
        let snap = MmioSnapshot::of(entry, state.mmio_stats.get(entry.idx_stats, 0));
        drop(state);

        let mut dev = snap.device.enter();
        let status =
            self.do_mmio_write(vcpu, dev.as_mut(), Context::Slow, &snap, addr, offset, bytes)?;
        drop(dev);
        bump(&snap.stats, |s| s.writes.inc());
        Ok(status)
    }
}

fn check_scalar_len(len: usize) -> Result<()> {
    if len == 0 || len > MAX_MMIO_ACCESS {
        return Err(Error::InvalidParameter(
            "MMIO access length must be 1..=16 bytes",
        ));
    }
    Ok(())
}
