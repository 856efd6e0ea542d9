//! Status vocabulary shared between the dispatcher, device callbacks and
//! the execution engine.
//!
//! The dispatcher is compiled once but runs in two contexts with different
//! blocking rules. Anything that cannot be completed in the fast
//! (non-blocking) context is reported through these values rather than
//! through errors, so the execution engine can re-run or commit the access
//! in the slow context.

use crate::error::{Error, Result};

/// Execution-engine scheduling codes a device callback may return.
///
/// Variants are declared most-urgent first; when two codes must be merged
/// the smaller (more urgent) one wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EngineStatus {
    /// Power the VM off.
    Off,
    /// Suspend the VM.
    Suspend,
    /// Reset the VM.
    Reset,
    /// Stop in the attached debugger.
    DebugStop,
    /// Deliver a debug event.
    DebugEvent,
    /// Debugger breakpoint hit.
    DebugBreakpoint,
    /// Halt the virtual CPU until the next interrupt.
    Halt,
}

/// Outcome of a device callback invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAccess {
    /// The access completed.
    Ok,
    /// The access needs the slow context (only valid from the fast one).
    Defer,
    /// Read from a register the device does not implement; the dispatcher
    /// synthesizes all-ones of the requested width.
    UnusedOnes,
    /// Like [`DeviceAccess::UnusedOnes`] but synthesizing all-zeros.
    UnusedZeros,
    /// Completed, and the engine must act on the given scheduling code.
    Engine(EngineStatus),
}

/// Result type for device callbacks; failures propagate verbatim.
pub type DeviceResult = std::result::Result<DeviceAccess, Error>;

/// Status returned by the dispatcher entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// The access completed.
    Ok,
    /// The access must be redone in the slow context.
    DeferToSlow,
    /// A write was buffered in per-CPU state; the engine commits the
    /// instruction and then calls
    /// [`commit_pending_writes`](crate::VmIo::commit_pending_writes) from
    /// the slow context.
    CommitToSlow,
    /// MMIO recursion depth was exceeded; the memory manager should treat
    /// the access as hitting an absent page.
    DefaultAction,
    /// Completed with an engine scheduling code to be propagated verbatim.
    Engine(EngineStatus),
}

impl IoStatus {
    /// True for outcomes the execution engine treats as a completed access.
    pub fn is_complete(self) -> bool {
        matches!(self, IoStatus::Ok | IoStatus::Engine(_))
    }
}

/// Merges the status of an original deferred access with the status of its
/// slow-context commit.
///
/// Success absorbs into the other side, two engine codes pick the more
/// urgent one, and a genuinely diverging pair is a protocol violation.
/// Deferral codes on the current side count as success: by the time the
/// commit runs, "write commit needed" has been honored.
pub(crate) fn merge_status(current: IoStatus, commit: IoStatus) -> Result<IoStatus> {
    match (current, commit) {
        (IoStatus::Ok | IoStatus::CommitToSlow | IoStatus::DeferToSlow, c) => Ok(c),
        (cur, IoStatus::Ok) => Ok(cur),
        (IoStatus::Engine(a), IoStatus::Engine(b)) => Ok(IoStatus::Engine(a.min(b))),
        (a, b) if a == b => Ok(a),
        _ => Err(Error::Internal("unmergeable commit status pair")),
    }
}

/// Folds a sub-access status into the running status of a split access,
/// keeping the most urgent engine code seen so far.
pub(crate) fn fold_engine(current: IoStatus, sub: EngineStatus) -> IoStatus {
    match current {
        IoStatus::Ok => IoStatus::Engine(sub),
        IoStatus::Engine(prev) => IoStatus::Engine(prev.min(sub)),
        other => other,
    }
}
