//! iobus - guest I/O dispatch for a KVM-based virtual machine monitor.
//!
//! This crate is the I/O routing core of a VMM: it intercepts a guest's
//! port I/O and MMIO accesses and delivers them to the emulated device
//! that owns the address, handling width adaptation, deferral between
//! execution contexts, and mapping management along the way.
//!
//! # Architecture
//!
//! Four layers, with dependencies pointing downward:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │ Mapping coordinator (mapping)                          │
//! │   map/unmap, conflict rules, page-handler installs     │
//! ├────────────────────────────────────────────────────────┤
//! │ Dispatcher (dispatch)                                  │
//! │   port + MMIO hot path, splitting, deferral, commit    │
//! ├────────────────────────────────────────────────────────┤
//! │ Lookup index (lookup)                                  │
//! │   sorted interval tables, hint-biased binary search    │
//! ├────────────────────────────────────────────────────────┤
//! │ Registration tables (registry)                         │
//! │   stable handles, per-VM port and MMIO entries         │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! # Life of a guest I/O
//!
//! 1. The execution engine traps an `IN`/`OUT` or an access to an MMIO
//!    page and calls [`VmIo::port_read`]/[`VmIo::port_write`] or one of
//!    the MMIO entry points with the address and width.
//! 2. The dispatcher resolves the owning registration through the lookup
//!    index under the shared VM I/O lock, snapshots the entry, and drops
//!    the lock.
//! 3. It enters the device's critical section and invokes the registered
//!    callback, splitting complicated accesses per the region's mode.
//! 4. The returned [`IoStatus`] either completes the instruction, asks
//!    the engine to retry in the slow context, or signals that a write
//!    was buffered for [`VmIo::commit_pending_writes`].
//!
//! # Contexts
//!
//! The dispatcher is compiled once and called from two environments: the
//! *fast* context (kernel or JIT execution, may never block) and the
//! *slow* context (the user-space monitor, blocks freely). The
//! [`Context`] argument selects the blocking policy; everything else is
//! identical.
//!
//! # Setup order
//!
//! Create [`VmIo`] with the VM's [`MemoryManager`], let devices register
//! and map their ranges, then call [`VmIo::freeze`] before running the
//! guest. Registrations are permanent until VM teardown; mappings may
//! come and go at runtime.

pub mod device;
pub mod dispatch;
mod error;
#[cfg(target_os = "linux")]
pub mod kvm;
mod lookup;
pub mod mapping;
mod memmgr;
pub mod registry;
pub mod stats;
mod status;
#[cfg(test)]
pub(crate) mod testutil;
mod vm;

pub use device::{
    DeviceInstance, DeviceState, MmioCallbacks, MmioFillFn, MmioReadFn, MmioWriteFn,
    PortCallbacks, PortInFn, PortInStringFn, PortOutFn, PortOutStringFn,
};
pub use dispatch::{
    Context, MmioDirection, PendingMmioWrite, PendingPortWrite, VcpuIo, MAX_MMIO_ACCESS,
    MMIO_RECURSION_LIMIT, PENDING_MMIO_BUFFER,
};
pub use error::{Error, Result};
pub use mapping::ALIAS_PAGE_READ_WRITE;
pub use memmgr::{MemoryManager, PhysHandlerType};
pub use registry::{
    IoPortHandle, IoPortRegistration, MmioFlags, MmioHandle, MmioReadMode, MmioRegistration,
    MmioWriteMode, PciAssociation, PortDesc, PortFlags, MAX_DESCRIPTION, MAX_REGISTRATIONS,
};
pub use status::{DeviceAccess, DeviceResult, EngineStatus, IoStatus};
pub use vm::VmIo;
