//! Interface to the external guest-physical memory manager.
//!
//! The dispatch core does not manage guest memory itself. It registers one
//! physical-handler type ("MMIO") at VM init, asks the manager to install
//! that handler over each mapped region, and hands the registration handle
//! back as the per-range cookie so page faults come back with it. The
//! embedding VMM implements this trait on whatever actually owns the
//! guest address space.

use vm_memory::GuestAddress;

use crate::error::Result;
use crate::status::IoStatus;

/// Identifier of a registered physical-handler type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysHandlerType(pub u32);

/// Services the dispatch core requires from the physical memory manager.
pub trait MemoryManager: Send + Sync {
    /// Registers a handler type with the given diagnostic kind name and
    /// returns its identifier. Called once per VM during init.
    fn register_handler_type(&self, kind: &str) -> Result<PhysHandlerType>;

    /// Installs a handler of type `htype` over `[base, base + size)`.
    /// `cookie` is delivered back on every fault in the range.
    fn install_handler(
        &self,
        htype: PhysHandlerType,
        base: GuestAddress,
        size: u64,
        cookie: u64,
        desc: &str,
    ) -> Result<()>;

    /// Removes the handler previously installed over `[base, base + size)`.
    fn remove_handler(&self, base: GuestAddress, size: u64) -> Result<()>;

    /// Whether page aliasing is available (nested/shadow paging).
    fn supports_aliasing(&self) -> bool {
        false
    }

    /// Backs the handler page at `page` directly by `backing_offset` bytes
    /// into the memory object identified by `backing`.
    fn alias_page(&self, page: GuestAddress, backing: u64, backing_offset: u64) -> Result<()>;

    /// Undoes every alias inside `[base, base + size)`, restoring handler
    /// coverage.
    fn reset_aliases(&self, base: GuestAddress, size: u64) -> Result<()>;

    /// Generic guest-physical write used when a deferred MMIO commit can
    /// no longer be routed through its region hint.
    fn write_phys(&self, addr: GuestAddress, data: &[u8]) -> Result<IoStatus>;
}
