//! Slow-context commit of writes deferred by the fast context.
//!
//! The execution engine calls [`VmIo::commit_pending_writes`] once it has
//! committed the instruction that produced a `CommitToSlow`. Port writes
//! re-enter the normal write path; MMIO writes go straight to their region
//! when the buffered hint still resolves, and otherwise fall back to the
//! memory manager's generic physical write.

use crate::dispatch::{Context, PendingMmioWrite, VcpuIo};
use crate::error::Result;
use crate::status::{merge_status, IoStatus};
use crate::vm::VmIo;

impl VmIo {
    /// Commits any pending port and MMIO writes on this CPU and merges
    /// their outcomes into `current`, the status the engine is carrying
    /// (its "write commit needed" code counts as success here). Both
    /// pending slots are empty afterwards.
    pub fn commit_pending_writes(&self, vcpu: &VcpuIo, current: IoStatus) -> Result<IoStatus> {
        let mut status = match current {
            IoStatus::CommitToSlow | IoStatus::DeferToSlow => IoStatus::Ok,
            other => other,
        };

        if let Some(p) = vcpu.take_pending_port_write() {
            self.counters().port_commits.inc();
            log::trace!(
                "committing pending port write {:#x}/{} -> {:#06x}",
                p.value,
                p.width,
                p.port
            );
            let commit = self.port_write(vcpu, Context::Slow, p.port, p.width, p.value)?;
            status = merge_status(status, commit)?;
        }

        if let Some(p) = vcpu.take_pending_mmio_write() {
            log::trace!(
                "committing pending MMIO write of {} bytes at {:#x}",
                p.len,
                p.addr.0
            );
            let commit = self.commit_mmio(vcpu, &p)?;
            status = merge_status(status, commit)?;
        }
        Ok(status)
    }

    fn commit_mmio(&self, vcpu: &VcpuIo, p: &PendingMmioWrite) -> Result<IoStatus> {
        // The hint names the region observed when the write was buffered.
        // If it still covers the address, bypass the lookup entirely.
        let direct = {
            let state = self.state_read();
            state.mmio.get_by_index(p.region_hint).and_then(|entry| {
                let base = entry.mapping()?;
                let offset = p.addr.0.wrapping_sub(base.0);
                (offset < entry.size()).then_some(offset)
            })
        };
        if let Some(offset) = direct {
            self.counters().mmio_commits_direct.inc();
            return self.commit_mmio_to_region(vcpu, p.region_hint, p.addr, offset, p.bytes());
        }
        self.counters().mmio_commits_fallback.inc();
        self.memory().write_phys(p.addr, p.bytes())
    }
}
