//! Fence-gated deferred frees.
//!
//! Buffer objects dropped while the GPU may still use them park their
//! allocation here; [`ReclaimQueue::reap`] returns each one to the allocator
//! once its fence has signaled.

use std::time::Duration;

use crossbeam_queue::SegQueue;

use crate::gpu::{Fence, FenceWait, GpuAllocation, GpuMemoryAllocator, SubmissionQueue};

/// An allocation waiting for its fence.
#[derive(Debug)]
struct PendingFree {
    allocation: GpuAllocation,
    fence: Fence,
}

/// Counts from one reap pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapStats {
    /// Allocations returned to the allocator
    pub freed: usize,
    /// Allocations still waiting
    pub pending: usize,
    /// Bytes returned
    pub bytes: u64,
}

/// Lock-free queue of pending frees.
#[derive(Debug, Default)]
pub(crate) struct ReclaimQueue {
    queue: SegQueue<PendingFree>,
}

impl ReclaimQueue {
    pub fn new() -> Self {
        Self {
            queue: SegQueue::new(),
        }
    }

    /// Park an allocation until `fence` signals.
    pub fn push(&self, allocation: GpuAllocation, fence: Fence) {
        log::trace!(
            "parking handle {} on fence {}:{}",
            allocation.handle,
            fence.id,
            fence.value
        );
        self.queue.push(PendingFree { allocation, fence });
    }

    /// Free everything whose fence has signaled.
    ///
    /// With `block` set every fence is waited; allocations whose wait fails
    /// stay parked either way.
    pub fn reap(
        &self,
        allocator: &dyn GpuMemoryAllocator,
        queue: &dyn SubmissionQueue,
        block: bool,
    ) -> ReapStats {
        let timeout = if block { None } else { Some(Duration::ZERO) };
        let mut stats = ReapStats::default();
        let mut keep = Vec::new();

        while let Some(pending) = self.queue.pop() {
            match queue.wait_fence(pending.fence, timeout) {
                Ok(FenceWait::Signaled) => {
                    stats.freed += 1;
                    stats.bytes += pending.allocation.size;
                    allocator.free(pending.allocation);
                }
                Ok(FenceWait::TimedOut) => keep.push(pending),
                Err(e) => {
                    log::warn!(
                        "fence wait for parked handle {} failed: {}",
                        pending.allocation.handle,
                        e
                    );
                    keep.push(pending);
                }
            }
        }

        stats.pending = keep.len();
        for pending in keep {
            self.queue.push(pending);
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Hand back every parked allocation regardless of its fence.
    pub fn drain(&self) -> Vec<GpuAllocation> {
        let mut out = Vec::with_capacity(self.queue.len());
        while let Some(pending) = self.queue.pop() {
            out.push(pending.allocation);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::flags::Domain;
    use crate::gpu::{DummyAllocator, DummyQueue, GpuAllocRequirements, SubmitBatch};

    #[test]
    fn test_reap_waits_for_fence() {
        let alloc = DummyAllocator::new();
        let gpu = DummyQueue::new();
        let ch = gpu.open_channel();
        let fence = gpu
            .submit(ch, &SubmitBatch { buffers: &[], relocs: &[], pushes: &[] })
            .unwrap();

        let reclaim = ReclaimQueue::new();
        let a = alloc.allocate(&GpuAllocRequirements::new(128, Domain::GART)).unwrap();
        reclaim.push(a, fence);

        let stats = reclaim.reap(&alloc, &gpu, false);
        assert_eq!(stats, ReapStats { freed: 0, pending: 1, bytes: 0 });
        assert_eq!(alloc.live_count(), 1);

        gpu.complete_all();
        let stats = reclaim.reap(&alloc, &gpu, false);
        assert_eq!(stats.freed, 1);
        assert_eq!(stats.bytes, 128);
        assert!(reclaim.is_empty());
        assert_eq!(alloc.live_count(), 0);
    }

    #[test]
    fn test_failed_wait_stays_parked() {
        let alloc = DummyAllocator::new();
        let gpu = DummyQueue::new();
        let ch = gpu.open_channel();
        let fence = gpu
            .submit(ch, &SubmitBatch { buffers: &[], relocs: &[], pushes: &[] })
            .unwrap();

        let reclaim = ReclaimQueue::new();
        let a = alloc.allocate(&GpuAllocRequirements::new(64, Domain::GART)).unwrap();
        reclaim.push(a, fence);
        gpu.fail_next_wait();
        assert_eq!(reclaim.reap(&alloc, &gpu, true).pending, 1);
        assert_eq!(reclaim.reap(&alloc, &gpu, true).freed, 1);
    }
}
