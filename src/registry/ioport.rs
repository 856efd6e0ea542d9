//! I/O port registration entries and their table.

use std::sync::Arc;

use crate::device::{DeviceInstance, PortCallbacks};
use crate::error::{Error, Result};
use crate::registry::{IoPortHandle, PciAssociation, MAX_DESCRIPTION, MAX_REGISTRATIONS};

/// Largest number of contiguous ports a single registration may claim.
pub(crate) const MAX_PORTS_PER_REGISTRATION: u16 = 8192;

/// Size of the guest port space.
pub(crate) const PORT_SPACE_SIZE: u32 = 0x1_0000;

/// Behavior flags of an I/O port registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortFlags {
    /// Pass the absolute port number to callbacks instead of the
    /// in-registration offset.
    pub absolute: bool,
}

/// Optional per-port descriptions for debugger listings. A registration
/// supplies one entry per port, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortDesc {
    /// Description of reads from this port.
    pub input: Option<String>,
    /// Description of writes to this port.
    pub output: Option<String>,
}

/// One I/O port registration.
pub struct IoPortRegistration {
    pub(crate) device: Arc<DeviceInstance>,
    pub(crate) cookie: u64,
    pub(crate) callbacks: PortCallbacks,
    pub(crate) ports: u16,
    pub(crate) pci: Option<PciAssociation>,
    pub(crate) desc: String,
    pub(crate) ext_descs: Option<Vec<PortDesc>>,
    pub(crate) flags: PortFlags,
    /// Current mapping base; `None` while unmapped. Updated only under the
    /// exclusive VM I/O lock and mirrored by exactly one lookup entry.
    pub(crate) mapped_base: Option<u16>,
    pub(crate) idx_stats: Option<u16>,
    pub(crate) idx_self: u16,
}

impl IoPortRegistration {
    /// Human-readable description given at registration.
    pub fn description(&self) -> &str {
        &self.desc
    }

    /// Number of contiguous ports covered.
    pub fn ports(&self) -> u16 {
        self.ports
    }

    /// Current base port, if mapped.
    pub fn mapped_base(&self) -> Option<u16> {
        self.mapped_base
    }

    /// The owning device.
    pub fn device(&self) -> &Arc<DeviceInstance> {
        &self.device
    }

    pub(crate) fn is_mapped(&self) -> bool {
        self.mapped_base.is_some()
    }
}

impl std::fmt::Debug for IoPortRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoPortRegistration")
            .field("desc", &self.desc)
            .field("device", &self.device.name())
            .field("ports", &self.ports)
            .field("mapped_base", &self.mapped_base)
            .finish()
    }
}

/// The per-VM table of I/O port registrations.
#[derive(Debug, Default)]
pub(crate) struct IoPortTable {
    entries: Vec<IoPortRegistration>,
    pub frozen: bool,
}

impl IoPortTable {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IoPortRegistration> {
        self.entries.iter()
    }

    /// Checks every caller-supplied field of a prospective registration
    /// without touching the table.
    pub fn validate_create(
        &self,
        ports: u16,
        callbacks: &PortCallbacks,
        desc: &str,
        ext_descs: Option<&[PortDesc]>,
    ) -> Result<()> {
        if self.frozen {
            return Err(Error::WrongOrder);
        }
        if ports == 0 || ports > MAX_PORTS_PER_REGISTRATION {
            return Err(Error::InvalidParameter("port count must be 1..=8192"));
        }
        if !callbacks.any() {
            return Err(Error::InvalidParameter(
                "at least one port callback is required",
            ));
        }
        validate_desc(desc)?;
        if let Some(descs) = ext_descs {
            if descs.len() > usize::from(MAX_PORTS_PER_REGISTRATION) {
                return Err(Error::InvalidParameter("too many extended descriptions"));
            }
            for d in descs {
                for text in [&d.input, &d.output].into_iter().flatten() {
                    if text.len() >= MAX_DESCRIPTION {
                        return Err(Error::InvalidParameter(
                            "extended description too long",
                        ));
                    }
                }
            }
        }
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
        ports: u16,
        flags: PortFlags,
        pci: Option<PciAssociation>,
        callbacks: PortCallbacks,
        cookie: u64,
        desc: &str,
        ext_descs: Option<Vec<PortDesc>>,
        idx_stats: Option<u16>,
    ) -> Result<IoPortHandle> {
        self.validate_create(ports, &callbacks, desc, ext_descs.as_deref())?;
        let idx = self.entries.len();
        self.entries
            .try_reserve(1)
            .map_err(|_| Error::OutOfMemory)?;
        self.entries.push(IoPortRegistration {
            device: Arc::clone(device),
            cookie,
            callbacks,
            ports,
            pci,
            desc: desc.to_owned(),
            ext_descs,
            flags,
            mapped_base: None,
            idx_stats,
            idx_self: idx as u16,
        });
        Ok(IoPortHandle(idx as u16))
    }

    pub fn get(&self, handle: IoPortHandle) -> Result<&IoPortRegistration> {
        self.entries
            .get(usize::from(handle.0))
            .ok_or(Error::InvalidHandle(u32::from(handle.0)))
    }

    pub fn get_mut(&mut self, handle: IoPortHandle) -> Result<&mut IoPortRegistration> {
        self.entries
            .get_mut(usize::from(handle.0))
            .ok_or(Error::InvalidHandle(u32::from(handle.0)))
    }

    /// Raw index access for the dispatch path (hint-validated callers).
    pub fn get_by_index(&self, idx: u16) -> Option<&IoPortRegistration> {
        self.entries.get(usize::from(idx))
    }

    /// Checks that `device` really owns `handle`.
    pub fn validate_owner(
        &self,
        handle: IoPortHandle,
        device: &Arc<DeviceInstance>,
    ) -> Result<&IoPortRegistration> {
        let entry = self.get(handle)?;
        if !Arc::ptr_eq(&entry.device, device) {
            return Err(Error::InvalidHandle(u32::from(handle.0)));
        }
        Ok(entry)
    }
}

pub(crate) fn validate_desc(desc: &str) -> Result<()> {
    if desc.is_empty() || desc.len() >= MAX_DESCRIPTION {
        return Err(Error::InvalidParameter(
            "description must be non-empty and shorter than 128 bytes",
        ));
    }
    Ok(())
}
