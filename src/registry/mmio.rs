//! MMIO region registration entries and their table.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use vm_memory::GuestAddress;

use crate::device::{DeviceInstance, MmioCallbacks};
use crate::error::{Error, Result};
use crate::registry::ioport::validate_desc;
use crate::registry::{MmioHandle, PciAssociation, MAX_REGISTRATIONS};

/// Guest page size; MMIO regions are placed at page granularity.
pub(crate) const PAGE_SIZE: u64 = 0x1000;

/// Largest MMIO region a registration may cover (1 TiB).
pub(crate) const MAX_REGION_SIZE: u64 = 1 << 40;

/// Sentinel for "not mapped" in the packed atomic mapping word.
const UNMAPPED: u64 = u64::MAX;

/// How reads narrower or wider than the region's natural width are served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MmioReadMode {
    /// Forward every read verbatim.
    #[default]
    Passthrough,
    /// Device handles aligned dword reads only; everything else is
    /// synthesized from dword reads.
    Dword,
    /// Like [`MmioReadMode::Dword`] but aligned qword reads also pass
    /// through.
    DwordQword,
}

impl MmioReadMode {
    pub(crate) fn allows_qword(self) -> bool {
        matches!(self, MmioReadMode::DwordQword)
    }
}

/// How writes narrower or wider than the region's natural width are served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MmioWriteMode {
    /// Forward every write verbatim.
    #[default]
    Passthrough,
    /// Forward full aligned dwords; drop partial units.
    Dword,
    /// Widen partial units by zero-filling the missing bytes.
    DwordZeroed,
    /// Read the containing dword back from the device, overlay the new
    /// bytes, and write the merged dword.
    DwordReadMissing,
    /// Like [`MmioWriteMode::Dword`] with aligned qwords passing through.
    DwordQword,
    /// Like [`MmioWriteMode::DwordReadMissing`] with aligned qwords
    /// passing through.
    DwordQwordReadMissing,
    /// Silently drop any access that is not an aligned dword.
    DwordOnly,
    /// Silently drop any access that is not an aligned dword or qword.
    DwordQwordOnly,
}

impl MmioWriteMode {
    pub(crate) fn allows_qword(self) -> bool {
        matches!(
            self,
            MmioWriteMode::DwordQword
                | MmioWriteMode::DwordQwordReadMissing
                | MmioWriteMode::DwordQwordOnly
        )
    }

    pub(crate) fn reads_missing(self) -> bool {
        matches!(
            self,
            MmioWriteMode::DwordReadMissing | MmioWriteMode::DwordQwordReadMissing
        )
    }

    /// Modes that drop complicated accesses outright.
    pub(crate) fn drops_complicated(self) -> bool {
        matches!(self, MmioWriteMode::DwordOnly | MmioWriteMode::DwordQwordOnly)
    }
}

/// Behavior flags of an MMIO registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MmioFlags {
    /// Read splitting policy.
    pub read_mode: MmioReadMode,
    /// Write splitting policy.
    pub write_mode: MmioWriteMode,
    /// Pass absolute guest-physical addresses to callbacks instead of
    /// in-region offsets.
    pub absolute: bool,
    /// Break into the debugger when a read takes the complicated path.
    pub dbgstop_on_complicated_read: bool,
    /// Break into the debugger when a write takes the complicated path.
    pub dbgstop_on_complicated_write: bool,
}

/// One MMIO region registration.
pub struct MmioRegistration {
    pub(crate) device: Arc<DeviceInstance>,
    pub(crate) cookie: u64,
    pub(crate) callbacks: MmioCallbacks,
    pub(crate) size: u64,
    pub(crate) pci: Option<PciAssociation>,
    pub(crate) desc: String,
    pub(crate) flags: MmioFlags,
    /// Packed `(mapped, base)` pair: the base address while mapped,
    /// `UNMAPPED` otherwise. Stored atomically so the page-fault path can
    /// snapshot a consistent mapping without the VM I/O lock.
    mapping: AtomicU64,
    pub(crate) idx_stats: Option<u16>,
    pub(crate) idx_self: u16,
}

impl MmioRegistration {
    /// Region size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Human-readable description given at registration.
    pub fn description(&self) -> &str {
        &self.desc
    }

    /// The owning device.
    pub fn device(&self) -> &Arc<DeviceInstance> {
        &self.device
    }

    /// Snapshot of the current mapping base, if mapped.
    pub fn mapping(&self) -> Option<GuestAddress> {
        match self.mapping.load(Ordering::Acquire) {
            UNMAPPED => None,
            base => Some(GuestAddress(base)),
        }
    }

    pub(crate) fn is_mapped(&self) -> bool {
        self.mapping().is_some()
    }

    pub(crate) fn set_mapping(&self, base: Option<GuestAddress>) {
        let raw = base.map_or(UNMAPPED, |a| a.0);
        self.mapping.store(raw, Ordering::Release);
    }
}

impl std::fmt::Debug for MmioRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmioRegistration")
            .field("desc", &self.desc)
            .field("device", &self.device.name())
            .field("size", &self.size)
            .field("mapping", &self.mapping())
            .finish()
    }
}

/// The per-VM table of MMIO registrations.
#[derive(Debug, Default)]
pub(crate) struct MmioTable {
    entries: Vec<MmioRegistration>,
    pub frozen: bool,
}

impl MmioTable {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MmioRegistration> {
        self.entries.iter()
    }

    /// Checks every caller-supplied field of a prospective registration
    /// without touching the table.
    pub fn validate_create(&self, size: u64, callbacks: &MmioCallbacks, desc: &str) -> Result<()> {
        if self.frozen {
            return Err(Error::WrongOrder);
        }
        if size == 0 || size > MAX_REGION_SIZE {
            return Err(Error::InvalidParameter("region size must be 1 byte..=1 TiB"));
        }
        if size % PAGE_SIZE != 0 {
            return Err(Error::InvalidParameter("region size must be page-aligned"));
        }
        if !callbacks.any_direction() {
            return Err(Error::InvalidParameter(
                "an MMIO registration needs a read or write callback",
            ));
        }
        validate_desc(desc)?;
        if self.entries.len() >= MAX_REGISTRATIONS as usize {
            return Err(Error::TooManyRegistrations(MAX_REGISTRATIONS));
        }
        Ok(())
    }

    /// Appends a new registration, validating every caller-supplied field.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &mut self,
        device: &Arc<DeviceInstance>,
        size: u64,
        flags: MmioFlags,
        pci: Option<PciAssociation>,
        callbacks: MmioCallbacks,
        cookie: u64,
        desc: &str,
        idx_stats: Option<u16>,
    ) -> Result<MmioHandle> {
        self.validate_create(size, &callbacks, desc)?;
        let idx = self.entries.len();
        self.entries
            .try_reserve(1)
            .map_err(|_| Error::OutOfMemory)?;
        self.entries.push(MmioRegistration {
            device: Arc::clone(device),
            cookie,
            callbacks,
            size,
            pci,
            desc: desc.to_owned(),
            flags,
            mapping: AtomicU64::new(UNMAPPED),
            idx_stats,
            idx_self: idx as u16,
        });
        Ok(MmioHandle(idx as u16))
    }

    pub fn get(&self, handle: MmioHandle) -> Result<&MmioRegistration> {
        self.entries
            .get(usize::from(handle.0))
            .ok_or(Error::InvalidHandle(u32::from(handle.0)))
    }

    /// Raw index access for the dispatch path.
    pub fn get_by_index(&self, idx: u16) -> Option<&MmioRegistration> {
        self.entries.get(usize::from(idx))
    }

    /// Checks that `device` really owns `handle`.
    pub fn validate_owner(
        &self,
        handle: MmioHandle,
        device: &Arc<DeviceInstance>,
    ) -> Result<&MmioRegistration> {
        let entry = self.get(handle)?;
        if !Arc::ptr_eq(&entry.device, device) {
            return Err(Error::InvalidHandle(u32::from(handle.0)));
        }
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{DeviceAccess, DeviceResult};

    fn nop_read(
        _state: &mut crate::device::DeviceState,
        _cookie: u64,
        _off: u64,
        buf: &mut [u8],
    ) -> DeviceResult {
        buf.fill(0);
        Ok(DeviceAccess::Ok)
    }

    fn callbacks() -> MmioCallbacks {
        MmioCallbacks {
            read: Some(nop_read),
            ..Default::default()
        }
    }

    fn device() -> Arc<DeviceInstance> {
        DeviceInstance::new("dev", ())
    }

    #[test]
    fn test_create_and_mapping_snapshot() {
        let dev = device();
        let mut table = MmioTable::default();
        let h = table
            .create(&dev, 0x2000, MmioFlags::default(), None, callbacks(), 0, "fb", None)
            .unwrap();
        let entry = table.get(h).unwrap();
        assert_eq!(entry.size(), 0x2000);
        assert_eq!(entry.mapping(), None);
        entry.set_mapping(Some(GuestAddress(0x1000_0000)));
        assert_eq!(entry.mapping(), Some(GuestAddress(0x1000_0000)));
        entry.set_mapping(None);
        assert!(!entry.is_mapped());
    }

    #[test]
    fn test_create_validates_size_and_callbacks() {
        let dev = device();
        let mut table = MmioTable::default();
        let f = MmioFlags::default();
        assert!(matches!(
            table.create(&dev, 0, f, None, callbacks(), 0, "r", None),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            table.create(&dev, 0x800, f, None, callbacks(), 0, "r", None),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            table.create(&dev, MAX_REGION_SIZE + PAGE_SIZE, f, None, callbacks(), 0, "r", None),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            table.create(&dev, 0x1000, f, None, MmioCallbacks::default(), 0, "r", None),
            Err(Error::InvalidParameter(_))
        ));
        // Fill alone does not satisfy the direction requirement.
        fn nop_fill(
            _s: &mut crate::device::DeviceState,
            _c: u64,
            _o: u64,
            _item: u32,
            _w: usize,
            _n: usize,
        ) -> DeviceResult {
            Ok(DeviceAccess::Ok)
        }
        let fill_only = MmioCallbacks {
            fill: Some(nop_fill),
            ..Default::default()
        };
        assert!(matches!(
            table.create(&dev, 0x1000, f, None, fill_only, 0, "r", None),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_write_mode_predicates() {
        assert!(MmioWriteMode::DwordQword.allows_qword());
        assert!(MmioWriteMode::DwordQwordOnly.allows_qword());
        assert!(!MmioWriteMode::Dword.allows_qword());
        assert!(MmioWriteMode::DwordReadMissing.reads_missing());
        assert!(MmioWriteMode::DwordQwordReadMissing.reads_missing());
        assert!(MmioWriteMode::DwordOnly.drops_complicated());
        assert!(!MmioWriteMode::DwordZeroed.drops_complicated());
    }
}
