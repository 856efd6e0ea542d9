//! Per-VM registration tables for I/O ports and MMIO regions.
//!
//! Registrations are created during VM construction only and live until
//! teardown. Handles are stable indices into the backing tables, never
//! pointers, so the tables can grow without invalidating anything handed
//! out. The two handle kinds use disjoint types so a port handle cannot be
//! confused with an MMIO handle.

pub(crate) mod ioport;
pub(crate) mod mmio;

pub use ioport::{IoPortRegistration, PortDesc, PortFlags};
pub(crate) use ioport::IoPortTable;
pub use mmio::{MmioFlags, MmioReadMode, MmioRegistration, MmioWriteMode};
pub(crate) use mmio::MmioTable;

/// Upper bound on registrations per table.
pub const MAX_REGISTRATIONS: u32 = 4096;

/// Maximum length of a registration description, in bytes.
pub const MAX_DESCRIPTION: usize = 128;

/// Stable identifier of an I/O port registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoPortHandle(pub(crate) u16);

impl IoPortHandle {
    /// The raw table index behind this handle.
    pub fn index(self) -> u16 {
        self.0
    }
}

/// Stable identifier of an MMIO region registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MmioHandle(pub(crate) u16);

impl MmioHandle {
    /// The raw table index behind this handle.
    pub fn index(self) -> u16 {
        self.0
    }
}

/// Optional PCI device/BAR association of a registration, carried for
/// diagnostics listings only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciAssociation {
    /// PCI region (BAR) number.
    pub region: u16,
    /// Subregion within the BAR.
    pub subregion: u16,
}
