//! The mapping coordinator: placing registrations into the guest port and
//! physical address spaces.
//!
//! Mapping and unmapping run under the exclusive VM I/O lock. For MMIO the
//! registration's atomic mapping word is published *before* the memory
//! manager installs the page handlers, so concurrent fast-path readers
//! always observe a consistent `(mapped, base)` pair; on install failure
//! the store is rolled back.

use std::sync::Arc;

use vm_memory::GuestAddress;

use crate::device::DeviceInstance;
use crate::error::{Error, Result};
use crate::registry::ioport::PORT_SPACE_SIZE;
use crate::registry::mmio::PAGE_SIZE;
use crate::registry::{IoPortHandle, MmioHandle};
use crate::vm::VmIo;

/// Required page flags for [`VmIo::alias_mmio_page`]: present + writable.
pub const ALIAS_PAGE_READ_WRITE: u64 = 0x3;

impl VmIo {
    /// Maps an I/O port registration at `base`.
    pub fn map_ioport(
        &self,
        device: &Arc<DeviceInstance>,
        handle: IoPortHandle,
        base: u16,
    ) -> Result<()> {
        let mut guard = self.state_write();
        let state = &mut *guard;

        let entry = state.ports.validate_owner(handle, device)?;
        let ports = entry.ports();
        let idx_stats = entry.idx_stats;
        if u32::from(base) + u32::from(ports) > PORT_SPACE_SIZE {
            return Err(Error::InvalidParameter("port range exceeds the port space"));
        }
        if entry.is_mapped() {
            return Err(Error::AlreadyMapped);
        }

        let last = base + (ports - 1);
        state.port_lookup.insert(handle.index(), base, last)?;
        state.ports.get_mut(handle)?.mapped_base = Some(base);
        state
            .port_stats
            .set_registered(idx_stats, usize::from(ports), true);

        let ports_table = &state.ports;
        state.port_lookup.assert_sane(|idx| {
            ports_table
                .get_by_index(idx)
                .map_or(0, |e| u64::from(e.ports()))
        });
        log::debug!(
            "mapped ioport registration #{} at {base:#06x}..={last:#06x}",
            handle.index()
        );
        Ok(())
    }

    /// Unmaps an I/O port registration.
    pub fn unmap_ioport(&self, device: &Arc<DeviceInstance>, handle: IoPortHandle) -> Result<()> {
        let mut guard = self.state_write();
        let state = &mut *guard;

        let entry = state.ports.validate_owner(handle, device)?;
        let ports = entry.ports();
        let idx_stats = entry.idx_stats;
        let base = entry.mapped_base().ok_or(Error::NotMapped)?;

        let last = base + (ports - 1);
        state.port_lookup.remove(handle.index(), base, last)?;
        state.ports.get_mut(handle)?.mapped_base = None;
        state
            .port_stats
            .set_registered(idx_stats, usize::from(ports), false);
        log::debug!(
            "unmapped ioport registration #{} from {base:#06x}..={last:#06x}",
            handle.index()
        );
        Ok(())
    }

    /// Maps an MMIO registration at the page-aligned `base`.
    pub fn map_mmio(
        &self,
        device: &Arc<DeviceInstance>,
        handle: MmioHandle,
        base: GuestAddress,
    ) -> Result<()> {
        if base.0 % PAGE_SIZE != 0 {
            return Err(Error::InvalidParameter("MMIO base must be page-aligned"));
        }

        let mut guard = self.state_write();
        let state = &mut *guard;

        let entry = state.mmio.validate_owner(handle, device)?;
        let size = entry.size();
        let idx_stats = entry.idx_stats;
        let desc = entry.description().to_owned();
        if entry.is_mapped() {
            return Err(Error::AlreadyMapped);
        }
        let last = base
            .0
            .checked_add(size - 1)
            .ok_or(Error::InvalidParameter("MMIO range wraps the address space"))?;
        if state.mmio_lookup.conflicts(base.0, last) {
            return Err(Error::RangeConflict {
                first: base.0,
                last,
            });
        }

        // Publish the mapping before the handlers go live, then install;
        // a failed install rolls the store back.
        let entry = state.mmio.get(handle)?;
        entry.set_mapping(Some(base));
        if let Err(e) = self.memory().install_handler(
            self.mmio_handler_type(),
            base,
            size,
            u64::from(handle.index()),
            &desc,
        ) {
            state.mmio.get(handle)?.set_mapping(None);
            return Err(e);
        }
        if let Err(e) = state.mmio_lookup.insert(handle.index(), base.0, last) {
            let _ = self.memory().remove_handler(base, size);
            state.mmio.get(handle)?.set_mapping(None);
            return Err(e);
        }
        state.mmio_stats.set_registered(idx_stats, 1, true);

        let mmio_table = &state.mmio;
        state
            .mmio_lookup
            .assert_sane(|idx| mmio_table.get_by_index(idx).map_or(0, |e| e.size()));
        log::debug!(
            "mapped MMIO registration #{} '{desc}' at {:#x}..={last:#x}",
            handle.index(),
            base.0
        );
        Ok(())
    }

    /// Unmaps an MMIO registration and removes its page handlers.
    pub fn unmap_mmio(&self, device: &Arc<DeviceInstance>, handle: MmioHandle) -> Result<()> {
        let mut guard = self.state_write();
        let state = &mut *guard;

        let entry = state.mmio.validate_owner(handle, device)?;
        let size = entry.size();
        let idx_stats = entry.idx_stats;
        let base = entry.mapping().ok_or(Error::NotMapped)?;
        let last = base.0 + (size - 1);

        state.mmio_lookup.remove(handle.index(), base.0, last)?;
        if let Err(e) = self.memory().remove_handler(base, size) {
            // The range is already gone from the lookup table; finish the
            // unmap so the registration can be remapped.
            log::error!(
                "memory manager failed to drop handlers for {:#x}+{size:#x}: {e}",
                base.0
            );
        }
        state.mmio.get(handle)?.set_mapping(None);
        state.mmio_stats.set_registered(idx_stats, 1, false);
        log::debug!(
            "unmapped MMIO registration #{} from {:#x}..={last:#x}",
            handle.index(),
            base.0
        );
        Ok(())
    }

    /// Backs one page of a mapped region directly by another memory
    /// object, bypassing dispatch for that page. A no-op when the memory
    /// manager cannot alias pages.
    pub fn alias_mmio_page(
        &self,
        device: &Arc<DeviceInstance>,
        handle: MmioHandle,
        offset_in_region: u64,
        backing: u64,
        backing_offset: u64,
        page_flags: u64,
    ) -> Result<()> {
        if page_flags != ALIAS_PAGE_READ_WRITE {
            return Err(Error::InvalidParameter(
                "alias pages must be present and writable",
            ));
        }
        if !self.memory().supports_aliasing() {
            return Ok(());
        }

        let state = self.state_read();
        let entry = state.mmio.validate_owner(handle, device)?;
        if offset_in_region >= entry.size() {
            return Err(Error::InvalidParameter("alias offset outside the region"));
        }
        let base = entry.mapping().ok_or(Error::NotMapped)?;
        let page = GuestAddress(base.0 + (offset_in_region & !(PAGE_SIZE - 1)));
        log::debug!(
            "aliasing page {:#x} of region #{} to backing {backing:#x}+{backing_offset:#x}",
            page.0,
            handle.index()
        );
        self.memory()
            .alias_page(page, backing, backing_offset & !(PAGE_SIZE - 1))
    }

    /// Undoes every alias established over `handle`'s region.
    pub fn reset_mapped_region(
        &self,
        device: &Arc<DeviceInstance>,
        handle: MmioHandle,
    ) -> Result<()> {
        if !self.memory().supports_aliasing() {
            return Ok(());
        }
        let state = self.state_read();
        let entry = state.mmio.validate_owner(handle, device)?;
        let base = entry.mapping().ok_or(Error::NotMapped)?;
        self.memory().reset_aliases(base, entry.size())
    }
}
