//! Shared mocks for in-crate tests: a scriptable device and a recording
//! memory manager.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use vm_memory::GuestAddress;

use crate::device::{DeviceInstance, DeviceState, MmioCallbacks, PortCallbacks};
use crate::error::{Error, Result};
use crate::memmgr::{MemoryManager, PhysHandlerType};
use crate::status::{DeviceAccess, DeviceResult, IoStatus};

/// One handler range installed through the mock memory manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InstalledRange {
    pub base: GuestAddress,
    pub size: u64,
    pub cookie: u64,
    pub desc: String,
}

#[derive(Default)]
struct MockMemoryState {
    kinds: Vec<String>,
    installed: Vec<InstalledRange>,
    fail_next_install: bool,
    aliased: Vec<(GuestAddress, u64, u64)>,
    resets: Vec<(GuestAddress, u64)>,
    phys_writes: Vec<(GuestAddress, Vec<u8>)>,
}

/// Memory manager double that records every interaction.
pub(crate) struct MockMemory {
    state: Mutex<MockMemoryState>,
    aliasing: AtomicBool,
}

impl MockMemory {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockMemoryState::default()),
            aliasing: AtomicBool::new(false),
        }
    }

    pub fn registered_kinds(&self) -> Vec<String> {
        self.state.lock().unwrap().kinds.clone()
    }

    pub fn installed_ranges(&self) -> Vec<InstalledRange> {
        self.state.lock().unwrap().installed.clone()
    }

    pub fn fail_next_install(&self) {
        self.state.lock().unwrap().fail_next_install = true;
    }

    pub fn set_aliasing(&self, on: bool) {
        self.aliasing.store(on, Ordering::Relaxed);
    }

    pub fn aliased_pages(&self) -> Vec<(GuestAddress, u64, u64)> {
        self.state.lock().unwrap().aliased.clone()
    }

    pub fn reset_ranges(&self) -> Vec<(GuestAddress, u64)> {
        self.state.lock().unwrap().resets.clone()
    }

    pub fn phys_writes(&self) -> Vec<(GuestAddress, Vec<u8>)> {
        self.state.lock().unwrap().phys_writes.clone()
    }
}

impl MemoryManager for MockMemory {
    fn register_handler_type(&self, kind: &str) -> Result<PhysHandlerType> {
        let mut state = self.state.lock().unwrap();
        state.kinds.push(kind.to_owned());
        Ok(PhysHandlerType(state.kinds.len() as u32))
    }

    fn install_handler(
        &self,
        _htype: PhysHandlerType,
        base: GuestAddress,
        size: u64,
        cookie: u64,
        desc: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_next_install {
            state.fail_next_install = false;
            return Err(Error::MemoryManager("install rejected"));
        }
        state.installed.push(InstalledRange {
            base,
            size,
            cookie,
            desc: desc.to_owned(),
        });
        Ok(())
    }

    fn remove_handler(&self, base: GuestAddress, size: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let before = state.installed.len();
        state
            .installed
            .retain(|r| !(r.base == base && r.size == size));
        if state.installed.len() == before {
            return Err(Error::MemoryManager("no such handler range"));
        }
        Ok(())
    }

    fn supports_aliasing(&self) -> bool {
        self.aliasing.load(Ordering::Relaxed)
    }

    fn alias_page(&self, page: GuestAddress, backing: u64, backing_offset: u64) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .aliased
            .push((page, backing, backing_offset));
        Ok(())
    }

    fn reset_aliases(&self, base: GuestAddress, size: u64) -> Result<()> {
        self.state.lock().unwrap().resets.push((base, size));
        Ok(())
    }

    fn write_phys(&self, addr: GuestAddress, data: &[u8]) -> Result<IoStatus> {
        self.state
            .lock()
            .unwrap()
            .phys_writes
            .push((addr, data.to_vec()));
        Ok(IoStatus::Ok)
    }
}

/// Backing state for [`TestDevice`]: scriptable responses plus recordings
/// of everything the dispatcher delivered.
#[derive(Default)]
pub(crate) struct TestDeviceState {
    pub regs: [u32; 16],
    pub mem: Vec<u8>,
    /// Port writes as `(port argument, value, width)`.
    pub writes: Vec<(u16, u32, usize)>,
    /// MMIO callback invocations as `("r"/"w", address argument, length)`.
    pub mmio_ops: Vec<(String, u64, usize)>,
    pub read_responses: VecDeque<DeviceAccess>,
    pub write_responses: VecDeque<DeviceAccess>,
    pub string_data: Vec<u8>,
    pub scalar_reads: usize,
}

/// A device whose callbacks record accesses and can be told to answer
/// with any [`DeviceAccess`] once per queued response.
pub(crate) struct TestDevice {
    pub instance: Arc<DeviceInstance>,
}

impl TestDevice {
    pub fn new(name: &str) -> Self {
        let state = TestDeviceState {
            mem: vec![0; 0x1000],
            ..Default::default()
        };
        Self {
            instance: DeviceInstance::new(name, state),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut TestDeviceState) -> R) -> R {
        self.instance
            .with_state(|s| f(s.downcast_mut::<TestDeviceState>().unwrap()))
    }

    pub fn set_register(&self, idx: usize, value: u32) {
        self.with(|s| s.regs[idx] = value);
    }

    pub fn set_mem(&self, offset: usize, bytes: &[u8]) {
        self.with(|s| s.mem[offset..offset + bytes.len()].copy_from_slice(bytes));
    }

    pub fn mem_at(&self, offset: usize, len: usize) -> Vec<u8> {
        self.with(|s| s.mem[offset..offset + len].to_vec())
    }

    pub fn set_string_data(&self, data: Vec<u8>) {
        self.with(|s| s.string_data = data);
    }

    pub fn push_read_response(&self, access: DeviceAccess) {
        self.with(|s| s.read_responses.push_back(access));
    }

    pub fn push_write_response(&self, access: DeviceAccess) {
        self.with(|s| s.write_responses.push_back(access));
    }

    pub fn writes(&self) -> Vec<(u16, u32, usize)> {
        self.with(|s| s.writes.clone())
    }

    pub fn mmio_ops(&self) -> Vec<(String, u64, usize)> {
        self.with(|s| s.mmio_ops.clone())
    }
}

fn cast(state: &mut DeviceState) -> &mut TestDeviceState {
    state.downcast_mut::<TestDeviceState>().unwrap()
}

fn port_in(
    state: &mut DeviceState,
    _cookie: u64,
    port: u16,
    value: &mut u32,
    _width: usize,
) -> DeviceResult {
    let s = cast(state);
    if let Some(resp) = s.read_responses.pop_front() {
        if resp != DeviceAccess::Ok {
            return Ok(resp);
        }
    }
    s.scalar_reads += 1;
    *value = s.regs[usize::from(port) % 16];
    Ok(DeviceAccess::Ok)
}

fn port_out(
    state: &mut DeviceState,
    _cookie: u64,
    port: u16,
    value: u32,
    width: usize,
) -> DeviceResult {
    let s = cast(state);
    if let Some(resp) = s.write_responses.pop_front() {
        if resp != DeviceAccess::Ok {
            return Ok(resp);
        }
    }
    s.writes.push((port, value, width));
    Ok(DeviceAccess::Ok)
}

fn port_in_string(
    state: &mut DeviceState,
    _cookie: u64,
    _port: u16,
    dst: &mut [u8],
    transfers: &mut u32,
    width: usize,
) -> DeviceResult {
    let s = cast(state);
    if s.string_data.is_empty() {
        return Ok(DeviceAccess::Ok);
    }
    let units = usize::min(*transfers as usize, s.string_data.len() / width);
    let bytes = units * width;
    dst[..bytes].copy_from_slice(&s.string_data[..bytes]);
    *transfers -= units as u32;
    Ok(DeviceAccess::Ok)
}

fn mmio_read(state: &mut DeviceState, _cookie: u64, addr: u64, buf: &mut [u8]) -> DeviceResult {
    let s = cast(state);
    if let Some(resp) = s.read_responses.pop_front() {
        if resp != DeviceAccess::Ok {
            return Ok(resp);
        }
    }
    s.mmio_ops.push(("r".to_owned(), addr, buf.len()));
    let at = addr as usize % s.mem.len();
    buf.copy_from_slice(&s.mem[at..at + buf.len()]);
    Ok(DeviceAccess::Ok)
}

fn mmio_write(state: &mut DeviceState, _cookie: u64, addr: u64, buf: &[u8]) -> DeviceResult {
    let s = cast(state);
    if let Some(resp) = s.write_responses.pop_front() {
        if resp != DeviceAccess::Ok {
            return Ok(resp);
        }
    }
    s.mmio_ops.push(("w".to_owned(), addr, buf.len()));
    let at = addr as usize % s.mem.len();
    s.mem[at..at + buf.len()].copy_from_slice(buf);
    Ok(DeviceAccess::Ok)
}

fn nop_port_out(
    _state: &mut DeviceState,
    _cookie: u64,
    _port: u16,
    _value: u32,
    _width: usize,
) -> DeviceResult {
    Ok(DeviceAccess::Ok)
}

fn nop_mmio_read(
    _state: &mut DeviceState,
    _cookie: u64,
    _addr: u64,
    buf: &mut [u8],
) -> DeviceResult {
    buf.fill(0);
    Ok(DeviceAccess::Ok)
}

/// Minimal callbacks for registration-focused tests.
pub(crate) fn nop_port_callbacks() -> PortCallbacks {
    PortCallbacks {
        out: Some(nop_port_out),
        ..Default::default()
    }
}

/// Minimal callbacks for registration-focused tests.
pub(crate) fn nop_mmio_callbacks() -> MmioCallbacks {
    MmioCallbacks {
        read: Some(nop_mmio_read),
        ..Default::default()
    }
}

/// Full recording callbacks for dispatch tests. No string OUT handler, so
/// write-string tests exercise the scalar fallback.
pub(crate) fn test_port_callbacks() -> PortCallbacks {
    PortCallbacks {
        out: Some(port_out),
        input: Some(port_in),
        out_string: None,
        in_string: Some(port_in_string),
    }
}

/// Full recording callbacks for MMIO dispatch tests.
pub(crate) fn test_mmio_callbacks() -> MmioCallbacks {
    MmioCallbacks {
        write: Some(mmio_write),
        read: Some(mmio_read),
        fill: None,
    }
}
