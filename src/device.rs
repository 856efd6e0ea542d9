//! Device instances and the callback surface the dispatcher invokes.
//!
//! A [`DeviceInstance`] is the dispatcher's view of an emulated device: a
//! name for diagnostics and the device-private state behind a per-device
//! mutex (the device critical section). The dispatcher enters that mutex
//! around every callback invocation; in the fast context a contended mutex
//! turns into a deferral instead of blocking.
//!
//! Callbacks are plain function pointers collected in a struct, one
//! optional slot per capability. A registration must provide at least one
//! scalar callback for some direction; everything else may be absent.

use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use crate::status::DeviceResult;

/// Device-private state as seen by callbacks. Callbacks downcast to their
/// concrete type.
pub type DeviceState = dyn Any + Send;

/// I/O port OUT callback: `(state, cookie, port, value, width)`.
///
/// `port` is the absolute port number or the in-registration offset,
/// depending on the registration's absolute flag. `width` is 1, 2 or 4.
pub type PortOutFn = fn(&mut DeviceState, u64, u16, u32, usize) -> DeviceResult;

/// I/O port IN callback: `(state, cookie, port, value-out, width)`.
pub type PortInFn = fn(&mut DeviceState, u64, u16, &mut u32, usize) -> DeviceResult;

/// String OUT callback: `(state, cookie, port, src, transfers, width)`.
///
/// `transfers` holds the number of units left; the callback decrements it
/// by however many units it consumed from the front of `src`.
pub type PortOutStringFn = fn(&mut DeviceState, u64, u16, &[u8], &mut u32, usize) -> DeviceResult;

/// String IN callback: `(state, cookie, port, dst, transfers, width)`.
pub type PortInStringFn =
    fn(&mut DeviceState, u64, u16, &mut [u8], &mut u32, usize) -> DeviceResult;

/// MMIO read callback: `(state, cookie, offset-or-address, buffer)`.
pub type MmioReadFn = fn(&mut DeviceState, u64, u64, &mut [u8]) -> DeviceResult;

/// MMIO write callback: `(state, cookie, offset-or-address, bytes)`.
pub type MmioWriteFn = fn(&mut DeviceState, u64, u64, &[u8]) -> DeviceResult;

/// MMIO fill callback: `(state, cookie, offset-or-address, item, width, count)`.
pub type MmioFillFn = fn(&mut DeviceState, u64, u64, u32, usize, usize) -> DeviceResult;

/// The optional I/O port callbacks of one registration.
#[derive(Clone, Copy, Default)]
pub struct PortCallbacks {
    /// Scalar OUT handler.
    pub out: Option<PortOutFn>,
    /// Scalar IN handler.
    pub input: Option<PortInFn>,
    /// String OUT handler, preferred over a scalar loop when present.
    pub out_string: Option<PortOutStringFn>,
    /// String IN handler.
    pub in_string: Option<PortInStringFn>,
}

impl PortCallbacks {
    /// True if any callback is present.
    pub fn any(&self) -> bool {
        self.out.is_some()
            || self.input.is_some()
            || self.out_string.is_some()
            || self.in_string.is_some()
    }
}

impl std::fmt::Debug for PortCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortCallbacks")
            .field("out", &self.out.is_some())
            .field("input", &self.input.is_some())
            .field("out_string", &self.out_string.is_some())
            .field("in_string", &self.in_string.is_some())
            .finish()
    }
}

/// The optional MMIO callbacks of one registration.
#[derive(Clone, Copy, Default)]
pub struct MmioCallbacks {
    /// Write handler.
    pub write: Option<MmioWriteFn>,
    /// Read handler.
    pub read: Option<MmioReadFn>,
    /// Fill handler, preferred by the fill operation when present.
    pub fill: Option<MmioFillFn>,
}

impl MmioCallbacks {
    /// True if at least one direction has a handler.
    pub fn any_direction(&self) -> bool {
        self.write.is_some() || self.read.is_some()
    }
}

impl std::fmt::Debug for MmioCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmioCallbacks")
            .field("write", &self.write.is_some())
            .field("read", &self.read.is_some())
            .field("fill", &self.fill.is_some())
            .finish()
    }
}

/// An emulated device as seen by the dispatcher.
///
/// Registrations hold a non-owning (`Arc`) reference back to their device;
/// the device is constructed before its registrations and outlives them.
pub struct DeviceInstance {
    name: String,
    state: Mutex<Box<DeviceState>>,
}

impl DeviceInstance {
    /// Creates a device with the given diagnostic name and private state.
    pub fn new(name: impl Into<String>, state: impl Any + Send) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: Mutex::new(Box::new(state)),
        })
    }

    /// The device's diagnostic name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enters the device critical section, blocking if contended.
    ///
    /// A poisoned mutex (a previous callback panicked) is recovered; the
    /// device state may be inconsistent but the VM must keep running.
    pub(crate) fn enter(&self) -> MutexGuard<'_, Box<DeviceState>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Tries to enter the device critical section without blocking.
    pub(crate) fn try_enter(&self) -> Option<MutexGuard<'_, Box<DeviceState>>> {
        match self.state.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// Runs `f` against the device state from outside the dispatcher,
    /// e.g. for test assertions or VMM-side device poking.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut DeviceState) -> R) -> R {
        let mut guard = self.enter();
        f(guard.as_mut())
    }
}

impl std::fmt::Debug for DeviceInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceInstance")
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::DeviceAccess;

    struct Scratch {
        value: u32,
    }

    fn scratch_in(
        state: &mut DeviceState,
        _cookie: u64,
        _port: u16,
        value: &mut u32,
        _width: usize,
    ) -> DeviceResult {
        let s = state.downcast_mut::<Scratch>().unwrap();
        *value = s.value;
        Ok(DeviceAccess::Ok)
    }

    #[test]
    fn test_state_roundtrip_through_callback() {
        let dev = DeviceInstance::new("scratch", Scratch { value: 0x42 });
        let mut guard = dev.enter();
        let mut out = 0u32;
        let cb: PortInFn = scratch_in;
        cb(guard.as_mut(), 0, 0, &mut out, 1).unwrap();
        assert_eq!(out, 0x42);
    }

    #[test]
    fn test_try_enter_reports_contention() {
        let dev = DeviceInstance::new("scratch", Scratch { value: 0 });
        let _held = dev.enter();
        assert!(dev.try_enter().is_none());
    }

    #[test]
    fn test_callback_presence_checks() {
        let none = PortCallbacks::default();
        assert!(!none.any());
        let some = PortCallbacks {
            input: Some(scratch_in),
            ..Default::default()
        };
        assert!(some.any());

        let mmio = MmioCallbacks::default();
        assert!(!mmio.any_direction());
    }
}
