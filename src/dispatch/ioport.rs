//! Scalar and string I/O port dispatch.
//!
//! Reads from unregistered ports return all-ones, writes to them are
//! dropped; the guest never observes an error for a missing device. A
//! scalar write that cannot finish in the fast context is buffered into
//! the per-CPU pending slot so the slow context can commit it without
//! re-decoding the instruction; reads and string operations are simply
//! redone over there.

use std::cell::Cell;
use std::sync::Arc;
use std::time::Instant;

use crate::device::{DeviceInstance, PortCallbacks};
use crate::dispatch::{bump, check_port_width, enter_device, ones_value, Context, VcpuIo};
use crate::error::{Error, Result};
use crate::registry::PortFlags;
use crate::stats::IoPortStats;
use crate::status::{DeviceAccess, IoStatus};
use crate::vm::{IoState, VmIo};

/// Everything the dispatcher needs from a port registration, copied out
/// under the shared lock so the lock can drop before the device call.
struct PortSnapshot {
    device: Arc<DeviceInstance>,
    cookie: u64,
    flags: PortFlags,
    callbacks: PortCallbacks,
    /// Offset of the accessed port within the registration.
    offset: u16,
    stats: Option<Arc<IoPortStats>>,
    /// First port's entry, carrying the range-wide total.
    stats_first: Option<Arc<IoPortStats>>,
}

impl PortSnapshot {
    fn callback_port(&self, port: u16) -> u16 {
        if self.flags.absolute {
            port
        } else {
            self.offset
        }
    }

    fn complete(&self, ctx: Context, read: bool) {
        bump(&self.stats, |s| {
            match (ctx, read) {
                (Context::Fast, true) => s.in_fast.inc(),
                (Context::Fast, false) => s.out_fast.inc(),
                (Context::Slow, true) => s.in_slow.inc(),
                (Context::Slow, false) => s.out_slow.inc(),
            };
        });
        bump(&self.stats_first, |s| s.total.inc());
    }
}

fn snapshot_port(state: &IoState, port: u16, hint: &Cell<u16>) -> Option<PortSnapshot> {
    let mut h = hint.get();
    let found = state.port_lookup.find(port, &mut h);
    hint.set(h);
    let (idx, first) = found?;
    let entry = state.ports.get_by_index(idx)?;
    let offset = port - first;
    Some(PortSnapshot {
        device: Arc::clone(&entry.device),
        cookie: entry.cookie,
        flags: entry.flags,
        callbacks: entry.callbacks,
        offset,
        stats: state.port_stats.get(entry.idx_stats, offset),
        stats_first: state.port_stats.get(entry.idx_stats, 0),
    })
}

impl VmIo {
    /// Reads an I/O port register of 1, 2 or 4 bytes.
    ///
    /// The returned value is meaningful only when the status is a
    /// completed one; on `DeferToSlow` the engine re-runs the read in the
    /// slow context.
    pub fn port_read(
        &self,
        vcpu: &VcpuIo,
        ctx: Context,
        port: u16,
        width: usize,
    ) -> Result<(u32, IoStatus)> {
        self.counters().port_in.inc();
        check_port_width(width)?;
        debug_assert!(vcpu.pending_port_write().is_none());

        let Some(state) = self.lock_shared(ctx) else {
            return Ok((0, IoStatus::DeferToSlow));
        };
        let Some(snap) = snapshot_port(&state, port, &vcpu.hint_port_read) else {
            drop(state);
            log::trace!("port read {port:#06x}/{width}: no handler, all-ones");
            return Ok((ones_value(width), IoStatus::Ok));
        };
        drop(state);

        let Some(callback) = snap.callbacks.input else {
            if ctx.is_fast() {
                bump(&snap.stats, |s| s.in_fast_to_slow.inc());
                return Ok((0, IoStatus::DeferToSlow));
            }
            // No IN handler: reads behave like an unimplemented register.
            snap.complete(ctx, true);
            return Ok((ones_value(width), IoStatus::Ok));
        };

        let Some(mut dev) = enter_device(&snap.device, ctx) else {
            bump(&snap.stats, |s| s.in_fast_to_slow.inc());
            return Ok((0, IoStatus::DeferToSlow));
        };
        let mut value = 0u32;
        let started = Instant::now();
        let access = callback(
            dev.as_mut(),
            snap.cookie,
            snap.callback_port(port),
            &mut value,
            width,
        )?;
        drop(dev);
        bump(&snap.stats, |s| s.prof_in.record(started.elapsed()));

        let result = match access {
            DeviceAccess::Ok => (value, IoStatus::Ok),
            DeviceAccess::UnusedOnes => (ones_value(width), IoStatus::Ok),
            DeviceAccess::UnusedZeros => (0, IoStatus::Ok),
            DeviceAccess::Engine(k) => (value, IoStatus::Engine(k)),
            DeviceAccess::Defer => {
                if !ctx.is_fast() {
                    return Err(Error::Internal("device deferred a slow-context read"));
                }
                bump(&snap.stats, |s| s.in_fast_to_slow.inc());
                return Ok((0, IoStatus::DeferToSlow));
            }
        };
        snap.complete(ctx, true);
        log::trace!("port read {port:#06x}/{width} -> {:#x}", result.0);
        Ok(result)
    }

    /// Writes an I/O port register of 1, 2 or 4 bytes.
    pub fn port_write(
        &self,
        vcpu: &VcpuIo,
        ctx: Context,
        port: u16,
        width: usize,
        value: u32,
    ) -> Result<IoStatus> {
        self.counters().port_out.inc();
        check_port_width(width)?;

        let Some(state) = self.lock_shared(ctx) else {
            // Carry the data along so the slow context can commit the
            // write without re-decoding the instruction.
            return vcpu.buffer_port_write(port, value, width);
        };
        let Some(snap) = snapshot_port(&state, port, &vcpu.hint_port_write) else {
            drop(state);
            log::trace!("port write {value:#x} -> {port:#06x}/{width}: no handler, dropped");
            return Ok(IoStatus::Ok);
        };
        drop(state);

        let Some(callback) = snap.callbacks.out else {
            if ctx.is_fast() {
                bump(&snap.stats, |s| s.out_fast_to_slow.inc());
                return vcpu.buffer_port_write(port, value, width);
            }
            // No OUT handler: the write is dropped.
            snap.complete(ctx, false);
            return Ok(IoStatus::Ok);
        };

        let Some(mut dev) = enter_device(&snap.device, ctx) else {
            bump(&snap.stats, |s| s.out_fast_to_slow.inc());
            return vcpu.buffer_port_write(port, value, width);
        };
        let started = Instant::now();
        let access = callback(
            dev.as_mut(),
            snap.cookie,
            snap.callback_port(port),
            value,
            width,
        )?;
        drop(dev);
        bump(&snap.stats, |s| s.prof_out.record(started.elapsed()));

        match access {
            DeviceAccess::Ok => {
                snap.complete(ctx, false);
                Ok(IoStatus::Ok)
            }
            DeviceAccess::Engine(k) => {
                snap.complete(ctx, false);
                Ok(IoStatus::Engine(k))
            }
            DeviceAccess::Defer => {
                if !ctx.is_fast() {
                    return Err(Error::Internal("device deferred a slow-context write"));
                }
                bump(&snap.stats, |s| s.out_fast_to_slow.inc());
                vcpu.buffer_port_write(port, value, width)
            }
            DeviceAccess::UnusedOnes | DeviceAccess::UnusedZeros => {
                Err(Error::Internal("unused result from an OUT handler"))
            }
        }
    }

    /// Reads a sequence of units from an I/O port (`INS`).
    ///
    /// `transfers` holds the unit count and is updated to the number of
    /// units still to be done when the call cannot finish them all.
    pub fn port_read_string(
        &self,
        vcpu: &VcpuIo,
        ctx: Context,
        port: u16,
        dst: &mut [u8],
        transfers: &mut u32,
        width: usize,
    ) -> Result<IoStatus> {
        self.counters().port_in_string.inc();
        check_port_width(width)?;
        let requested = *transfers as usize;
        if requested == 0 {
            return Err(Error::InvalidParameter("transfer count must be non-zero"));
        }
        if dst.len() < requested * width {
            return Err(Error::InvalidParameter("destination buffer too small"));
        }

        let Some(state) = self.lock_shared(ctx) else {
            return Ok(IoStatus::DeferToSlow);
        };
        let Some(snap) = snapshot_port(&state, port, &vcpu.hint_port_read_string) else {
            drop(state);
            dst[..requested * width].fill(0xff);
            *transfers = 0;
            return Ok(IoStatus::Ok);
        };
        drop(state);

        if ctx.is_fast() && snap.callbacks.input.is_none() {
            bump(&snap.stats, |s| s.in_fast_to_slow.inc());
            return Ok(IoStatus::DeferToSlow);
        }

        let Some(mut dev) = enter_device(&snap.device, ctx) else {
            bump(&snap.stats, |s| s.in_fast_to_slow.inc());
            return Ok(IoStatus::DeferToSlow);
        };
        let arg_port = snap.callback_port(port);
        let mut status = IoStatus::Ok;
        let started = Instant::now();

        // Prefer the string handler, then finish leftovers one unit at a
        // time through the scalar handler.
        if let Some(string_cb) = snap.callbacks.in_string {
            let access = string_cb(
                dev.as_mut(),
                snap.cookie,
                arg_port,
                &mut dst[..requested * width],
                transfers,
                width,
            )?;
            status = match access {
                DeviceAccess::Ok => IoStatus::Ok,
                DeviceAccess::Engine(k) => IoStatus::Engine(k),
                DeviceAccess::Defer if ctx.is_fast() => IoStatus::DeferToSlow,
                DeviceAccess::Defer => {
                    return Err(Error::Internal("device deferred a slow-context read"))
                }
                DeviceAccess::UnusedOnes | DeviceAccess::UnusedZeros => {
                    return Err(Error::Internal("unused result from a string IN handler"))
                }
            };
        }

        while *transfers > 0 && status == IoStatus::Ok {
            let mut value = 0u32;
            let access = match snap.callbacks.input {
                Some(cb) => cb(dev.as_mut(), snap.cookie, arg_port, &mut value, width)?,
                None => DeviceAccess::UnusedOnes,
            };
            let store = match access {
                DeviceAccess::Ok => Some(value),
                DeviceAccess::UnusedOnes => Some(ones_value(width)),
                DeviceAccess::UnusedZeros => Some(0),
                DeviceAccess::Engine(k) => {
                    status = IoStatus::Engine(k);
                    Some(value)
                }
                DeviceAccess::Defer => {
                    if !ctx.is_fast() {
                        return Err(Error::Internal("device deferred a slow-context read"));
                    }
                    bump(&snap.stats, |s| s.in_fast_to_slow.inc());
                    status = IoStatus::DeferToSlow;
                    None
                }
            };
            if let Some(v) = store {
                let at = (requested - *transfers as usize) * width;
                dst[at..at + width].copy_from_slice(&v.to_le_bytes()[..width]);
                *transfers -= 1;
            } else {
                break;
            }
        }
        drop(dev);
        bump(&snap.stats, |s| s.prof_in.record(started.elapsed()));
        if status != IoStatus::DeferToSlow {
            snap.complete(ctx, true);
        }
        Ok(status)
    }

    /// Writes a sequence of units to an I/O port (`OUTS`).
    pub fn port_write_string(
        &self,
        vcpu: &VcpuIo,
        ctx: Context,
        port: u16,
        src: &[u8],
        transfers: &mut u32,
        width: usize,
    ) -> Result<IoStatus> {
        self.counters().port_out_string.inc();
        check_port_width(width)?;
        let requested = *transfers as usize;
        if requested == 0 {
            return Err(Error::InvalidParameter("transfer count must be non-zero"));
        }
        if src.len() < requested * width {
            return Err(Error::InvalidParameter("source buffer too small"));
        }

        let Some(state) = self.lock_shared(ctx) else {
            return Ok(IoStatus::DeferToSlow);
        };
        let Some(snap) = snapshot_port(&state, port, &vcpu.hint_port_write_string) else {
            drop(state);
            *transfers = 0;
            return Ok(IoStatus::Ok);
        };
        drop(state);

        if ctx.is_fast() && snap.callbacks.out.is_none() {
            bump(&snap.stats, |s| s.out_fast_to_slow.inc());
            return Ok(IoStatus::DeferToSlow);
        }

        let Some(mut dev) = enter_device(&snap.device, ctx) else {
            bump(&snap.stats, |s| s.out_fast_to_slow.inc());
            return Ok(IoStatus::DeferToSlow);
        };
        let arg_port = snap.callback_port(port);
        let mut status = IoStatus::Ok;
        let started = Instant::now();

        if let Some(string_cb) = snap.callbacks.out_string {
            let access = string_cb(
                dev.as_mut(),
                snap.cookie,
                arg_port,
                &src[..requested * width],
                transfers,
                width,
            )?;
            status = match access {
                DeviceAccess::Ok => IoStatus::Ok,
                DeviceAccess::Engine(k) => IoStatus::Engine(k),
                DeviceAccess::Defer if ctx.is_fast() => IoStatus::DeferToSlow,
                DeviceAccess::Defer => {
                    return Err(Error::Internal("device deferred a slow-context write"))
                }
                DeviceAccess::UnusedOnes | DeviceAccess::UnusedZeros => {
                    return Err(Error::Internal("unused result from a string OUT handler"))
                }
            };
        }

        while *transfers > 0 && status == IoStatus::Ok {
            let at = (requested - *transfers as usize) * width;
            let mut raw = [0u8; 4];
            raw[..width].copy_from_slice(&src[at..at + width]);
            let value = u32::from_le_bytes(raw);
            let access = match snap.callbacks.out {
                Some(cb) => cb(dev.as_mut(), snap.cookie, arg_port, value, width)?,
                None => DeviceAccess::Ok,
            };
            match access {
                DeviceAccess::Ok => *transfers -= 1,
                DeviceAccess::Engine(k) => {
                    *transfers -= 1;
                    status = IoStatus::Engine(k);
                }
                DeviceAccess::Defer => {
                    if !ctx.is_fast() {
                        return Err(Error::Internal("device deferred a slow-context write"));
                    }
                    bump(&snap.stats, |s| s.out_fast_to_slow.inc());
                    // A single leftover unit can ride the pending slot;
                    // longer tails are redone in the slow context.
                    if *transfers == 1 {
                        status = vcpu.buffer_port_write(port, value, width)?;
                        *transfers -= 1;
                    } else {
                        status = IoStatus::DeferToSlow;
                    }
                }
                DeviceAccess::UnusedOnes | DeviceAccess::UnusedZeros => {
                    return Err(Error::Internal("unused result from an OUT handler"))
                }
            }
            if status != IoStatus::Ok {
                break;
            }
        }
        drop(dev);
        bump(&snap.stats, |s| s.prof_out.record(started.elapsed()));
        if status != IoStatus::DeferToSlow {
            snap.complete(ctx, false);
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::PortFlags;
    use crate::status::EngineStatus;
    use crate::testutil::{test_port_callbacks, MockMemory, TestDevice, TestDeviceState};

    fn setup(ports: u16, base: u16, flags: PortFlags) -> (VmIo, TestDevice) {
        let vm = VmIo::new(Arc::new(MockMemory::new())).unwrap();
        let dev = TestDevice::new("testdev");
        let h = vm
            .create_ioport(
                &dev.instance,
                ports,
                flags,
                None,
                test_port_callbacks(),
                0xc0ffee,
                "testdev ports",
                None,
            )
            .unwrap();
        vm.map_ioport(&dev.instance, h, base).unwrap();
        (vm, dev)
    }

    #[test]
    fn test_simple_register_map_read() {
        let (vm, dev) = setup(1, 0x3f8, PortFlags::default());
        dev.set_register(0, 0x42);
        let vcpu = VcpuIo::new();
        let (value, status) = vm.port_read(&vcpu, Context::Slow, 0x3f8, 1).unwrap();
        assert_eq!(status, IoStatus::Ok);
        assert_eq!(value, 0x42);
    }

    #[test]
    fn test_unregistered_port_reads_all_ones() {
        let (vm, _dev) = setup(1, 0x3f8, PortFlags::default());
        let vcpu = VcpuIo::new();
        for (width, expected) in [(1usize, 0xffu32), (2, 0xffff), (4, 0xffff_ffff)] {
            let (value, status) = vm.port_read(&vcpu, Context::Slow, 0x80, width).unwrap();
            assert_eq!(status, IoStatus::Ok);
            assert_eq!(value, expected);
        }
    }

    #[test]
    fn test_unregistered_port_write_is_dropped() {
        let (vm, dev) = setup(1, 0x3f8, PortFlags::default());
        let vcpu = VcpuIo::new();
        let status = vm
            .port_write(&vcpu, Context::Slow, 0x80, 1, 0xaa)
            .unwrap();
        assert_eq!(status, IoStatus::Ok);
        assert!(dev.writes().is_empty());
    }

    #[test]
    fn test_invalid_width_is_rejected() {
        let (vm, _dev) = setup(1, 0x3f8, PortFlags::default());
        let vcpu = VcpuIo::new();
        assert!(vm.port_read(&vcpu, Context::Slow, 0x3f8, 3).is_err());
        assert!(vm.port_write(&vcpu, Context::Slow, 0x3f8, 8, 0).is_err());
    }

    #[test]
    fn test_offset_vs_absolute_port_argument() {
        let (vm, dev) = setup(8, 0x3f8, PortFlags::default());
        let vcpu = VcpuIo::new();
        vm.port_write(&vcpu, Context::Slow, 0x3fb, 1, 0x11).unwrap();
        assert_eq!(dev.writes(), vec![(3, 0x11, 1)]);

        let (vm, dev) = setup(8, 0x3f8, PortFlags { absolute: true });
        vm.port_write(&vcpu, Context::Slow, 0x3fb, 1, 0x22).unwrap();
        assert_eq!(dev.writes(), vec![(0x3fb, 0x22, 1)]);
    }

    #[test]
    fn test_wide_write_to_single_port_range() {
        // A width-4 write to a one-port registration arrives as one
        // callback carrying the full 32-bit value.
        let (vm, dev) = setup(1, 0x400, PortFlags::default());
        let vcpu = VcpuIo::new();
        vm.port_write(&vcpu, Context::Slow, 0x400, 4, 0xdead_beef)
            .unwrap();
        assert_eq!(dev.writes(), vec![(0, 0xdead_beef, 4)]);
    }

    #[test]
    fn test_unused_read_synthesizes_ones_and_zeros() {
        let (vm, dev) = setup(1, 0x100, PortFlags::default());
        let vcpu = VcpuIo::new();
        dev.push_read_response(DeviceAccess::UnusedOnes);
        let (value, _) = vm.port_read(&vcpu, Context::Slow, 0x100, 2).unwrap();
        assert_eq!(value, 0xffff);
        dev.push_read_response(DeviceAccess::UnusedZeros);
        let (value, _) = vm.port_read(&vcpu, Context::Slow, 0x100, 2).unwrap();
        assert_eq!(value, 0);
    }

    #[test]
    fn test_engine_status_passes_through() {
        let (vm, dev) = setup(1, 0x100, PortFlags::default());
        let vcpu = VcpuIo::new();
        dev.push_write_response(DeviceAccess::Engine(EngineStatus::Halt));
        let status = vm.port_write(&vcpu, Context::Slow, 0x100, 1, 1).unwrap();
        assert_eq!(status, IoStatus::Engine(EngineStatus::Halt));
    }

    #[test]
    fn test_fast_write_deferral_buffers_value() {
        let (vm, dev) = setup(1, 0x80, PortFlags::default());
        let vcpu = VcpuIo::new();
        dev.push_write_response(DeviceAccess::Defer);
        let status = vm.port_write(&vcpu, Context::Fast, 0x80, 1, 0xaa).unwrap();
        assert_eq!(status, IoStatus::CommitToSlow);
        assert_eq!(
            vcpu.pending_port_write().unwrap(),
            crate::dispatch::PendingPortWrite {
                port: 0x80,
                value: 0xaa,
                width: 1
            }
        );
        // The device saw the first (deferring) invocation only.
        assert!(dev.writes().is_empty());
    }

    #[test]
    fn test_fast_read_deferral_does_not_buffer() {
        let (vm, dev) = setup(1, 0x80, PortFlags::default());
        let vcpu = VcpuIo::new();
        dev.push_read_response(DeviceAccess::Defer);
        let (_, status) = vm.port_read(&vcpu, Context::Fast, 0x80, 1).unwrap();
        assert_eq!(status, IoStatus::DeferToSlow);
        assert!(!vcpu.has_pending_writes());
    }

    #[test]
    fn test_slow_context_deferral_is_a_protocol_violation() {
        let (vm, dev) = setup(1, 0x80, PortFlags::default());
        let vcpu = VcpuIo::new();
        dev.push_write_response(DeviceAccess::Defer);
        assert!(vm.port_write(&vcpu, Context::Slow, 0x80, 1, 0).is_err());
    }

    #[test]
    fn test_fast_context_defers_on_contended_device() {
        let (vm, dev) = setup(1, 0x80, PortFlags::default());
        let vcpu = VcpuIo::new();
        let _hold = dev.instance.enter();
        let (_, status) = vm.port_read(&vcpu, Context::Fast, 0x80, 1).unwrap();
        assert_eq!(status, IoStatus::DeferToSlow);
        let status = vm.port_write(&vcpu, Context::Fast, 0x80, 1, 5).unwrap();
        assert_eq!(status, IoStatus::CommitToSlow);
    }

    #[test]
    fn test_read_string_scalar_fallback() {
        let (vm, dev) = setup(1, 0x200, PortFlags::default());
        dev.set_register(0, 0x31);
        let vcpu = VcpuIo::new();
        let mut dst = [0u8; 8];
        let mut transfers = 4u32;
        let status = vm
            .port_read_string(&vcpu, Context::Slow, 0x200, &mut dst, &mut transfers, 2)
            .unwrap();
        assert_eq!(status, IoStatus::Ok);
        assert_eq!(transfers, 0);
        assert_eq!(dst, [0x31, 0, 0x31, 0, 0x31, 0, 0x31, 0]);
    }

    #[test]
    fn test_read_string_prefers_string_callback() {
        let (vm, dev) = setup(1, 0x200, PortFlags::default());
        dev.set_string_data(b"hey!".to_vec());
        let vcpu = VcpuIo::new();
        let mut dst = [0u8; 4];
        let mut transfers = 4u32;
        let status = vm
            .port_read_string(&vcpu, Context::Slow, 0x200, &mut dst, &mut transfers, 1)
            .unwrap();
        assert_eq!(status, IoStatus::Ok);
        assert_eq!(transfers, 0);
        assert_eq!(&dst, b"hey!");
        // The string handler consumed everything; no scalar reads ran.
        assert_eq!(dev.with(|s: &mut TestDeviceState| s.scalar_reads), 0);
    }

    #[test]
    fn test_write_string_drains_through_scalar() {
        let (vm, dev) = setup(1, 0x200, PortFlags::default());
        let vcpu = VcpuIo::new();
        let mut transfers = 3u32;
        let status = vm
            .port_write_string(&vcpu, Context::Slow, 0x200, &[1, 2, 3], &mut transfers, 1)
            .unwrap();
        assert_eq!(status, IoStatus::Ok);
        assert_eq!(transfers, 0);
        assert_eq!(dev.writes(), vec![(0, 1, 1), (0, 2, 1), (0, 3, 1)]);
    }

    #[test]
    fn test_write_string_buffers_single_trailing_unit() {
        let (vm, dev) = setup(1, 0x200, PortFlags::default());
        let vcpu = VcpuIo::new();
        // Succeed twice, then defer on the final unit.
        dev.push_write_response(DeviceAccess::Ok);
        dev.push_write_response(DeviceAccess::Ok);
        dev.push_write_response(DeviceAccess::Defer);
        let mut transfers = 3u32;
        let status = vm
            .port_write_string(&vcpu, Context::Fast, 0x200, &[7, 8, 9], &mut transfers, 1)
            .unwrap();
        assert_eq!(status, IoStatus::CommitToSlow);
        assert_eq!(transfers, 0);
        assert_eq!(vcpu.pending_port_write().unwrap().value, 9);
    }

    #[test]
    fn test_write_string_long_tail_defers_without_buffering() {
        let (vm, dev) = setup(1, 0x200, PortFlags::default());
        let vcpu = VcpuIo::new();
        dev.push_write_response(DeviceAccess::Defer);
        let mut transfers = 3u32;
        let status = vm
            .port_write_string(&vcpu, Context::Fast, 0x200, &[7, 8, 9], &mut transfers, 1)
            .unwrap();
        assert_eq!(status, IoStatus::DeferToSlow);
        assert_eq!(transfers, 3);
        assert!(!vcpu.has_pending_writes());
    }

    #[test]
    fn test_string_miss_fills_ones_and_consumes() {
        let (vm, _dev) = setup(1, 0x200, PortFlags::default());
        let vcpu = VcpuIo::new();
        let mut dst = [0u8; 4];
        let mut transfers = 2u32;
        let status = vm
            .port_read_string(&vcpu, Context::Slow, 0x500, &mut dst, &mut transfers, 2)
            .unwrap();
        assert_eq!(status, IoStatus::Ok);
        assert_eq!(transfers, 0);
        assert_eq!(dst, [0xff; 4]);

        let mut transfers = 2u32;
        let status = vm
            .port_write_string(&vcpu, Context::Slow, 0x500, &[0; 4], &mut transfers, 2)
            .unwrap();
        assert_eq!(status, IoStatus::Ok);
        assert_eq!(transfers, 0);
    }

    #[test]
    fn test_port_statistics_accumulate() {
        let (vm, dev) = setup(2, 0x60, PortFlags::default());
        let vcpu = VcpuIo::new();
        vm.port_read(&vcpu, Context::Slow, 0x60, 1).unwrap();
        vm.port_read(&vcpu, Context::Slow, 0x61, 1).unwrap();
        vm.port_write(&vcpu, Context::Slow, 0x61, 1, 1).unwrap();
        let _ = dev;
        assert_eq!(vm.counters().port_in.get(), 2);
        assert_eq!(vm.counters().port_out.get(), 1);
    }
}
