//! Per-VM dispatch state: registration tables, lookup indexes, statistics
//! and the VM-wide I/O lock.
//!
//! Initialization order is fixed: create [`VmIo`] (which registers the
//! "MMIO" physical-handler type with the memory manager), let devices
//! register and map through it, then [`freeze`](VmIo::freeze) before the
//! guest runs. After the freeze the tables never grow again; map/unmap
//! stays legal for the lifetime of the VM.

use std::fmt::Write as _;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};

use vm_memory::GuestAddress;

use crate::device::{DeviceInstance, MmioCallbacks, PortCallbacks};
use crate::error::Result;
use crate::lookup::SpanTable;
use crate::memmgr::{MemoryManager, PhysHandlerType};
use crate::registry::{
    IoPortHandle, IoPortTable, MmioFlags, MmioHandle, MmioTable, PciAssociation, PortDesc,
    PortFlags,
};
use crate::stats::{DispatchCounters, IoPortStats, MmioStats, StatsTable, Visible};

/// Everything guarded by the VM-wide reader-writer I/O lock.
///
/// The dispatcher holds this shared for lookup plus entry snapshot and
/// releases it before invoking the device; the mapping coordinator holds
/// it exclusively while it mutates the lookup tables.
pub(crate) struct IoState {
    pub ports: IoPortTable,
    pub mmio: MmioTable,
    pub port_lookup: SpanTable<u16>,
    pub mmio_lookup: SpanTable<u64>,
    pub port_stats: StatsTable<IoPortStats>,
    pub mmio_stats: StatsTable<MmioStats>,
}

/// The per-VM I/O dispatch subsystem.
pub struct VmIo {
    state: RwLock<IoState>,
    memory: Arc<dyn MemoryManager>,
    mmio_handler_type: PhysHandlerType,
    counters: DispatchCounters,
}

impl VmIo {
    /// Creates the dispatch state for a new VM and registers the MMIO
    /// physical-handler type with the memory manager.
    pub fn new(memory: Arc<dyn MemoryManager>) -> Result<Self> {
        let mmio_handler_type = memory.register_handler_type("MMIO")?;
        log::debug!("registered MMIO handler type {mmio_handler_type:?}");
        Ok(Self {
            state: RwLock::new(IoState {
                ports: IoPortTable::default(),
                mmio: MmioTable::default(),
                port_lookup: SpanTable::new(),
                mmio_lookup: SpanTable::new(),
                port_stats: StatsTable::default(),
                mmio_stats: StatsTable::default(),
            }),
            memory,
            mmio_handler_type,
            counters: DispatchCounters::default(),
        })
    }

    /// The physical-handler type installed over mapped MMIO regions.
    pub fn mmio_handler_type(&self) -> PhysHandlerType {
        self.mmio_handler_type
    }

    /// The external memory manager this VM was created with.
    pub fn memory(&self) -> &Arc<dyn MemoryManager> {
        &self.memory
    }

    /// VM-wide dispatch counters.
    pub fn counters(&self) -> &DispatchCounters {
        &self.counters
    }

    /// Registers a range of I/O ports for `device` and returns its stable
    /// handle. Allowed only before [`freeze`](VmIo::freeze).
    #[allow(clippy::too_many_arguments)]
    pub fn create_ioport(
        &self,
        device: &Arc<DeviceInstance>,
        ports: u16,
        flags: PortFlags,
        pci: Option<PciAssociation>,
        callbacks: PortCallbacks,
        cookie: u64,
        desc: &str,
        ext_descs: Option<Vec<PortDesc>>,
    ) -> Result<IoPortHandle> {
        let mut state = self.state_write();
        state
            .ports
            .validate_create(ports, &callbacks, desc, ext_descs.as_deref())?;
        let idx_stats = Some(state.port_stats.reserve(usize::from(ports))?);
        let handle = state.ports.create(
            device, ports, flags, pci, callbacks, cookie, desc, ext_descs, idx_stats,
        )?;
        log::debug!(
            "created ioport registration #{} '{desc}' ({ports} ports) for {}",
            handle.index(),
            device.name()
        );
        Ok(handle)
    }

    /// Registers an MMIO region for `device` and returns its stable
    /// handle. Allowed only before [`freeze`](VmIo::freeze).
    #[allow(clippy::too_many_arguments)]
    pub fn create_mmio(
        &self,
        device: &Arc<DeviceInstance>,
        size: u64,
        flags: MmioFlags,
        pci: Option<PciAssociation>,
        callbacks: MmioCallbacks,
        cookie: u64,
        desc: &str,
    ) -> Result<MmioHandle> {
        let mut state = self.state_write();
        state.mmio.validate_create(size, &callbacks, desc)?;
        let idx_stats = Some(state.mmio_stats.reserve(1)?);
        let handle = state
            .mmio
            .create(device, size, flags, pci, callbacks, cookie, desc, idx_stats)?;
        log::debug!(
            "created MMIO registration #{} '{desc}' ({size:#x} bytes) for {}",
            handle.index(),
            device.name()
        );
        Ok(handle)
    }

    /// Ends the registration phase: all further create calls and
    /// statistics growth fail with `WrongOrder`.
    pub fn freeze(&self) {
        let mut state = self.state_write();
        state.ports.frozen = true;
        state.mmio.frozen = true;
        state.port_stats.frozen = true;
        state.mmio_stats.frozen = true;
        log::debug!(
            "froze I/O registrations ({} port ranges, {} MMIO regions)",
            state.ports.len(),
            state.mmio.len()
        );
    }

    /// Checks that `handle` is valid and owned by `device`.
    pub fn validate_ioport_handle(
        &self,
        device: &Arc<DeviceInstance>,
        handle: IoPortHandle,
    ) -> Result<()> {
        self.state_read().ports.validate_owner(handle, device)?;
        Ok(())
    }

    /// Checks that `handle` is valid and owned by `device`.
    pub fn validate_mmio_handle(
        &self,
        device: &Arc<DeviceInstance>,
        handle: MmioHandle,
    ) -> Result<()> {
        self.state_read().mmio.validate_owner(handle, device)?;
        Ok(())
    }

    /// Current base port of `handle`, or `None` when unmapped or the
    /// handle does not belong to `device`.
    pub fn ioport_mapping(
        &self,
        device: &Arc<DeviceInstance>,
        handle: IoPortHandle,
    ) -> Option<u16> {
        let state = self.state_read();
        state
            .ports
            .validate_owner(handle, device)
            .ok()?
            .mapped_base()
    }

    /// Current base address of `handle`, or `None` when unmapped or the
    /// handle does not belong to `device`.
    pub fn mmio_mapping(
        &self,
        device: &Arc<DeviceInstance>,
        handle: MmioHandle,
    ) -> Option<GuestAddress> {
        let state = self.state_read();
        state.mmio.validate_owner(handle, device).ok()?.mapping()
    }

    /// Renders every port registration for diagnostics.
    pub fn format_ioport_registrations(&self) -> String {
        let state = self.state_read();
        let mut out = String::new();
        let _ = writeln!(out, "I/O port registrations: {}", state.ports.len());
        let _ = writeln!(out, " ## Ports Mapping     Device           Description");
        for entry in state.ports.iter() {
            let mapping = match entry.mapped_base() {
                Some(base) => format!(
                    "{:#06x}-{:#06x}",
                    base,
                    base + (entry.ports() - 1)
                ),
                None => "unmapped".to_owned(),
            };
            let _ = writeln!(
                out,
                "{:3} {:5} {:11} {:16} {}",
                entry.idx_self,
                entry.ports(),
                mapping,
                entry.device.name(),
                entry.description()
            );
        }
        out
    }

    /// Renders every MMIO registration for diagnostics.
    pub fn format_mmio_registrations(&self) -> String {
        let state = self.state_read();
        let mut out = String::new();
        let _ = writeln!(out, "MMIO registrations: {}", state.mmio.len());
        let _ = writeln!(out, " ## Size       Mapping                Device           Description");
        for entry in state.mmio.iter() {
            let mapping = match entry.mapping() {
                Some(base) => format!(
                    "{:#012x}-{:#012x}",
                    base.0,
                    base.0 + (entry.size() - 1)
                ),
                None => "unmapped".to_owned(),
            };
            let _ = writeln!(
                out,
                "{:3} {:#010x} {:22} {:16} {}",
                entry.idx_self,
                entry.size(),
                mapping,
                entry.device.name(),
                entry.description()
            );
        }
        out
    }

    /// Names of port statistics entries currently visible, i.e. belonging
    /// to mapped registrations.
    pub fn visible_port_stats(&self) -> Vec<String> {
        let state = self.state_read();
        let mut names = Vec::new();
        for entry in state.ports.iter() {
            let Some(base) = entry.mapped_base() else {
                continue;
            };
            for off in 0..entry.ports() {
                if let Some(s) = state.port_stats.get(entry.idx_stats, off) {
                    if s.is_registered() {
                        names.push(format!("{}/{:#06x}", entry.description(), base + off));
                    }
                }
            }
        }
        names
    }

    /// Names of MMIO statistics entries currently visible.
    pub fn visible_mmio_stats(&self) -> Vec<String> {
        let state = self.state_read();
        let mut names = Vec::new();
        for entry in state.mmio.iter() {
            if let Some(s) = state.mmio_stats.get(entry.idx_stats, 0) {
                if s.is_registered() {
                    names.push(entry.description().to_owned());
                }
            }
        }
        names
    }

    /// Blocking shared acquisition of the VM I/O lock. Poisoning is
    /// recovered; the lock only ever guards this module's own code.
    pub(crate) fn state_read(&self) -> RwLockReadGuard<'_, IoState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Non-blocking shared acquisition; `None` means write-contended and
    /// the fast context must defer.
    pub(crate) fn state_try_read(&self) -> Option<RwLockReadGuard<'_, IoState>> {
        match self.state.try_read() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// Shared acquisition with the context's blocking policy.
    pub(crate) fn lock_shared(
        &self,
        ctx: crate::dispatch::Context,
    ) -> Option<RwLockReadGuard<'_, IoState>> {
        if ctx.is_fast() {
            self.state_try_read()
        } else {
            Some(self.state_read())
        }
    }

    /// Exclusive acquisition of the VM I/O lock.
    pub(crate) fn state_write(&self) -> RwLockWriteGuard<'_, IoState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for VmIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state_read();
        f.debug_struct("VmIo")
            .field("ioports", &state.ports.len())
            .field("mmio_regions", &state.mmio.len())
            .field("handler_type", &self.mmio_handler_type)
            .finish()
    }
}
