//! Routing of KVM vcpu exits into the dispatcher.
//!
//! The user-space VMM is the slow context: every exit handled here may
//! block and must complete. Port and MMIO exits carry their data in KVM's
//! run-structure buffers, which kvm-ioctls exposes as slices on the exit
//! value; reads are answered by writing back into those slices before the
//! next `vcpu.run()`.

use kvm_ioctls::VcpuExit;
use vm_memory::GuestAddress;

use crate::dispatch::{Context, VcpuIo};
use crate::error::Result;
use crate::vm::VmIo;

/// What the VMM's run loop should do after an exit was routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDisposition {
    /// The I/O was dispatched; run the vCPU again.
    Handled,
    /// Guest executed HLT.
    Halt,
    /// Guest requested shutdown (triple fault or explicit).
    Shutdown,
    /// KVM reported an internal error.
    InternalError,
    /// Failed to enter guest mode, with the hardware reason code.
    FailEntry(u64),
    /// System event (reset, panic, ...) with its type code.
    SystemEvent(u32),
    /// An exit this bridge does not handle.
    Unhandled(&'static str),
}

/// Dispatches one vcpu exit. I/O and MMIO exits are routed through the
/// VM's dispatch tables; everything else is mapped to a disposition for
/// the run loop.
pub fn route_exit(vm: &VmIo, vcpu_io: &VcpuIo, exit: VcpuExit<'_>) -> Result<ExitDisposition> {
    match exit {
        VcpuExit::IoIn(port, data) => {
            let width = data.len().min(4);
            let (value, _status) = vm.port_read(vcpu_io, Context::Slow, port, width)?;
            data[..width].copy_from_slice(&value.to_le_bytes()[..width]);
            Ok(ExitDisposition::Handled)
        }
        VcpuExit::IoOut(port, data) => {
            let width = data.len().min(4);
            let mut raw = [0u8; 4];
            raw[..width].copy_from_slice(&data[..width]);
            vm.port_write(vcpu_io, Context::Slow, port, width, u32::from_le_bytes(raw))?;
            Ok(ExitDisposition::Handled)
        }
        VcpuExit::MmioRead(addr, data) => {
            vm.mmio_read(vcpu_io, Context::Slow, GuestAddress(addr), data)?;
            Ok(ExitDisposition::Handled)
        }
        VcpuExit::MmioWrite(addr, data) => {
            vm.mmio_write(vcpu_io, Context::Slow, GuestAddress(addr), data)?;
            Ok(ExitDisposition::Handled)
        }
        VcpuExit::Hlt => Ok(ExitDisposition::Halt),
        VcpuExit::Shutdown => Ok(ExitDisposition::Shutdown),
        VcpuExit::InternalError => Ok(ExitDisposition::InternalError),
        VcpuExit::SystemEvent(event, _) => Ok(ExitDisposition::SystemEvent(event)),
        VcpuExit::FailEntry(reason, _) => Ok(ExitDisposition::FailEntry(reason)),
        _ => Ok(ExitDisposition::Unhandled("other")),
    }
}
