//! Host-memory implementations of the GPU collaborators
//!
//! `DummyAllocator` backs every allocation with heap memory and hands out a
//! bump-allocated fake GPU address. `DummyQueue` records submissions and
//! completes fences in software; it can be stalled to simulate a busy GPU.

use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex as StdMutex, MutexGuard as StdMutexGuard};
use std::time::{Duration, Instant};

use super::traits::*;
use crate::sync::atomics::AtomicCounter;
use crate::sync::mutex::Mutex;
use crate::util::size::align_up;

/// Byte written over fresh allocations so missing zero-fill is visible.
pub const POISON_BYTE: u8 = 0xCD;

/// Host alignment bounds; GPU addresses keep the full requested alignment.
const MIN_HOST_ALIGN: usize = 8;
const MAX_HOST_ALIGN: usize = 4096;

/// Base of the fake GPU address space.
const VA_BASE: u64 = 0x1_0000_0000;

struct HostBlock {
    ptr: NonNull<u8>,
    layout: Layout,
}

struct AllocState {
    next_handle: u32,
    next_va: u64,
    used: u64,
    live: HashMap<u32, HostBlock>,
}

/// RAM-backed allocator.
pub struct DummyAllocator {
    capacity: u64,
    poison: bool,
    fail_next: AtomicBool,
    state: Mutex<AllocState>,
    allocations: AtomicCounter,
    frees: AtomicCounter,
}

// SAFETY: host blocks are only touched under the state mutex or by the owner
// of the matching `GpuAllocation`.
unsafe impl Send for DummyAllocator {}
unsafe impl Sync for DummyAllocator {}

impl DummyAllocator {
    /// Allocator with effectively unlimited capacity.
    pub fn new() -> Self {
        Self::with_capacity(u64::MAX)
    }

    /// Allocator that reports `OutOfMemory` past `capacity` live bytes.
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            capacity,
            poison: true,
            fail_next: AtomicBool::new(false),
            state: Mutex::new(AllocState {
                next_handle: 1,
                next_va: VA_BASE,
                used: 0,
                live: HashMap::new(),
            }),
            allocations: AtomicCounter::default(),
            frees: AtomicCounter::default(),
        }
    }

    /// Disable the poison fill of fresh allocations.
    pub fn without_poison(mut self) -> Self {
        self.poison = false;
        self
    }

    /// Make the next allocation fail with `OutOfMemory`.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::Release);
    }

    /// Number of allocations not yet freed.
    pub fn live_count(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Bytes currently allocated.
    pub fn used_bytes(&self) -> u64 {
        self.state.lock().used
    }

    /// Total successful allocations.
    pub fn allocation_count(&self) -> u64 {
        self.allocations.get()
    }

    /// Total frees.
    pub fn free_count(&self) -> u64 {
        self.frees.get()
    }

    /// Whether `handle` is still allocated.
    pub fn is_live(&self, handle: u32) -> bool {
        self.state.lock().live.contains_key(&handle)
    }
}

impl Default for DummyAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DummyAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DummyAllocator")
            .field("capacity", &self.capacity)
            .field("live", &self.live_count())
            .field("used", &self.used_bytes())
            .finish()
    }
}

impl GpuMemoryAllocator for DummyAllocator {
    fn allocate(&self, req: &GpuAllocRequirements) -> Result<GpuAllocation, GpuAllocError> {
        if self.fail_next.swap(false, Ordering::AcqRel) {
            return Err(GpuAllocError::OutOfMemory);
        }
        if req.size == 0 || req.size > isize::MAX as u64 {
            return Err(GpuAllocError::InvalidSize);
        }
        if !req.alignment.is_power_of_two() {
            return Err(GpuAllocError::AlignmentFailed);
        }

        let mut state = self.state.lock();
        if state.used.saturating_add(req.size) > self.capacity {
            return Err(GpuAllocError::OutOfMemory);
        }

        let host_align = (req.alignment as usize).clamp(MIN_HOST_ALIGN, MAX_HOST_ALIGN);
        let layout = Layout::from_size_align(req.size as usize, host_align)
            .map_err(|_| GpuAllocError::AlignmentFailed)?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc(layout) };
        let ptr = NonNull::new(raw).ok_or(GpuAllocError::OutOfMemory)?;
        if self.poison {
            // SAFETY: freshly allocated block of `layout.size()` bytes.
            unsafe { std::ptr::write_bytes(ptr.as_ptr(), POISON_BYTE, layout.size()) };
        }

        let handle = state.next_handle;
        state.next_handle = state.next_handle.wrapping_add(1).max(1);
        let gpu_offset = align_up(state.next_va, req.alignment);
        state.next_va = gpu_offset + align_up(req.size, 0x1000);
        state.used += req.size;
        state.live.insert(handle, HostBlock { ptr, layout });
        drop(state);

        self.allocations.increment();
        log::trace!(
            "dummy alloc handle={} size={} va={:#x} domain={:?}",
            handle,
            req.size,
            gpu_offset,
            req.domain
        );

        Ok(GpuAllocation {
            handle,
            gpu_offset,
            size: req.size,
            cpu_ptr: Some(ptr),
        })
    }

    fn free(&self, allocation: GpuAllocation) {
        let block = {
            let mut state = self.state.lock();
            let block = state.live.remove(&allocation.handle);
            if block.is_some() {
                state.used = state.used.saturating_sub(allocation.size);
            }
            block
        };
        match block {
            Some(block) => {
                // SAFETY: block was produced by `alloc::alloc` with this layout.
                unsafe { alloc::dealloc(block.ptr.as_ptr(), block.layout) };
                self.frees.increment();
            }
            None => log::warn!("dummy free of unknown handle {}", allocation.handle),
        }
    }
}

impl Drop for DummyAllocator {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for (_, block) in state.live.drain() {
            // SAFETY: see `free`.
            unsafe { alloc::dealloc(block.ptr.as_ptr(), block.layout) };
        }
    }
}

/// A batch as seen by the dummy queue.
#[derive(Debug, Clone)]
pub struct RecordedSubmission {
    /// Channel it was queued on
    pub channel: ChannelId,
    /// Buffer references, in batch order
    pub buffers: Vec<KernelRef>,
    /// Relocations
    pub relocs: Vec<Reloc>,
    /// Push descriptors
    pub pushes: Vec<PushDescriptor>,
    /// Command words of every CPU-visible span, concatenated
    pub words: Vec<u32>,
    /// Fence returned for the batch
    pub fence: Fence,
}

impl RecordedSubmission {
    /// Handles of the referenced buffers.
    pub fn handles(&self) -> Vec<u32> {
        self.buffers.iter().map(|b| b.handle).collect()
    }
}

#[derive(Debug, Default)]
struct Syncpoint {
    submitted: u32,
    completed: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    syncpoints: Vec<Syncpoint>,
    submissions: Vec<RecordedSubmission>,
    reject_next: Option<i32>,
    fail_next_wait: bool,
    stalled: bool,
    waits: u64,
}

/// Software submission queue with one syncpoint per channel.
///
/// Unless stalled, a blocking wait completes the awaited work immediately;
/// a zero-timeout poll only reports what has already completed.
#[derive(Debug, Default)]
pub struct DummyQueue {
    state: StdMutex<QueueState>,
    cond: Condvar,
}

impl DummyQueue {
    /// Create a queue with no channels.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StdMutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Open a channel; its syncpoint id equals the channel id.
    pub fn open_channel(&self) -> ChannelId {
        let mut state = self.lock();
        state.syncpoints.push(Syncpoint::default());
        ChannelId((state.syncpoints.len() - 1) as u32)
    }

    /// Refuse the next submission with `code`.
    pub fn reject_next(&self, code: i32) {
        self.lock().reject_next = Some(code);
    }

    /// Fail the next fence wait.
    pub fn fail_next_wait(&self) {
        self.lock().fail_next_wait = true;
    }

    /// Stop or resume completing work. Stalled waits block until
    /// [`complete_all`](Self::complete_all) or their timeout.
    pub fn set_stalled(&self, stalled: bool) {
        self.lock().stalled = stalled;
        self.cond.notify_all();
    }

    /// Complete every submitted batch.
    pub fn complete_all(&self) {
        let mut state = self.lock();
        for sp in state.syncpoints.iter_mut() {
            sp.completed = sp.submitted;
        }
        drop(state);
        self.cond.notify_all();
    }

    /// Whether `fence` has completed.
    pub fn is_signaled(&self, fence: Fence) -> bool {
        if !fence.is_valid() {
            return true;
        }
        let state = self.lock();
        state
            .syncpoints
            .get(fence.id as usize)
            .map_or(true, |sp| sp.completed >= fence.value)
    }

    /// Copies of all recorded submissions.
    pub fn submissions(&self) -> Vec<RecordedSubmission> {
        self.lock().submissions.clone()
    }

    /// Number of accepted submissions.
    pub fn submission_count(&self) -> usize {
        self.lock().submissions.len()
    }

    /// Number of fence waits, polls included.
    pub fn wait_count(&self) -> u64 {
        self.lock().waits
    }
}

impl SubmissionQueue for DummyQueue {
    fn submit(&self, channel: ChannelId, batch: &SubmitBatch<'_>) -> Result<Fence, SubmitError> {
        let mut state = self.lock();
        if state.syncpoints.get(channel.0 as usize).is_none() {
            return Err(SubmitError::UnknownChannel(channel));
        }
        if let Some(code) = state.reject_next.take() {
            return Err(SubmitError::Rejected(code));
        }

        let sp = &mut state.syncpoints[channel.0 as usize];
        sp.submitted = sp.submitted.wrapping_add(1);
        let fence = Fence::new(channel.0, sp.submitted);

        let words = batch
            .pushes
            .iter()
            .filter_map(|p| p.words)
            .flat_map(|w| w.iter().copied())
            .collect();
        state.submissions.push(RecordedSubmission {
            channel,
            buffers: batch.buffers.to_vec(),
            relocs: batch.relocs.to_vec(),
            pushes: batch.pushes.iter().map(|p| p.desc).collect(),
            words,
            fence,
        });
        Ok(fence)
    }

    fn wait_fence(&self, fence: Fence, timeout: Option<Duration>) -> Result<FenceWait, SubmitError> {
        if !fence.is_valid() {
            return Ok(FenceWait::Signaled);
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let poll = timeout == Some(Duration::ZERO);

        let mut state = self.lock();
        state.waits += 1;
        if std::mem::take(&mut state.fail_next_wait) {
            return Err(SubmitError::FenceFailed("injected failure".to_string()));
        }
        let idx = fence.id as usize;
        if idx >= state.syncpoints.len() {
            return Err(SubmitError::FenceFailed(format!("unknown syncpoint {}", fence.id)));
        }

        loop {
            let sp = &mut state.syncpoints[idx];
            if sp.completed >= fence.value {
                return Ok(FenceWait::Signaled);
            }
            if poll {
                return Ok(FenceWait::TimedOut);
            }
            if !state.stalled {
                let sp = &mut state.syncpoints[idx];
                sp.completed = sp.completed.max(fence.value.min(sp.submitted));
                return Ok(FenceWait::Signaled);
            }
            state = match deadline {
                None => self.cond.wait(state).unwrap_or_else(|p| p.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(FenceWait::TimedOut);
                    }
                    self.cond
                        .wait_timeout(state, deadline - now)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|p| p.into_inner().0)
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::flags::Domain;
    use std::sync::Arc;

    #[test]
    fn test_allocate_poisoned_and_aligned() {
        let alloc = DummyAllocator::new();
        let req = GpuAllocRequirements::new(64, Domain::GART).with_alignment(0x10000);
        let a = alloc.allocate(&req).unwrap();
        assert_eq!(a.gpu_offset % 0x10000, 0);
        let ptr = a.cpu_ptr.unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 64) };
        assert!(bytes.iter().all(|&b| b == POISON_BYTE));
        assert_eq!(alloc.live_count(), 1);
        alloc.free(a);
        assert_eq!(alloc.live_count(), 0);
        assert_eq!(alloc.used_bytes(), 0);
    }

    #[test]
    fn test_allocate_errors() {
        let alloc = DummyAllocator::with_capacity(4096);
        let zero = GpuAllocRequirements::new(0, Domain::GART);
        assert_eq!(alloc.allocate(&zero).unwrap_err(), GpuAllocError::InvalidSize);

        let odd = GpuAllocRequirements::new(16, Domain::GART).with_alignment(3);
        assert_eq!(alloc.allocate(&odd).unwrap_err(), GpuAllocError::AlignmentFailed);

        let big = GpuAllocRequirements::new(8192, Domain::VRAM);
        assert_eq!(alloc.allocate(&big).unwrap_err(), GpuAllocError::OutOfMemory);

        alloc.fail_next();
        let ok = GpuAllocRequirements::new(16, Domain::GART);
        assert_eq!(alloc.allocate(&ok).unwrap_err(), GpuAllocError::OutOfMemory);
        let a = alloc.allocate(&ok).unwrap();
        alloc.free(a);
    }

    #[test]
    fn test_queue_fences_per_channel() {
        let queue = DummyQueue::new();
        let ch0 = queue.open_channel();
        let ch1 = queue.open_channel();
        let batch = SubmitBatch { buffers: &[], relocs: &[], pushes: &[] };

        let f0 = queue.submit(ch0, &batch).unwrap();
        let f1 = queue.submit(ch0, &batch).unwrap();
        let g0 = queue.submit(ch1, &batch).unwrap();
        assert_eq!((f0.id, f0.value), (0, 1));
        assert_eq!((f1.id, f1.value), (0, 2));
        assert_eq!((g0.id, g0.value), (1, 1));

        assert_eq!(queue.wait_fence(f1, Some(Duration::ZERO)).unwrap(), FenceWait::TimedOut);
        assert_eq!(queue.wait_fence(f0, None).unwrap(), FenceWait::Signaled);
        assert!(queue.is_signaled(f0));
        assert!(!queue.is_signaled(f1));
        queue.complete_all();
        assert!(queue.is_signaled(f1));
    }

    #[test]
    fn test_queue_rejection_and_unknown_channel() {
        let queue = DummyQueue::new();
        let ch = queue.open_channel();
        let batch = SubmitBatch { buffers: &[], relocs: &[], pushes: &[] };
        queue.reject_next(-22);
        assert_eq!(queue.submit(ch, &batch).unwrap_err(), SubmitError::Rejected(-22));
        assert!(queue.submit(ch, &batch).is_ok());
        assert!(matches!(
            queue.submit(ChannelId(9), &batch),
            Err(SubmitError::UnknownChannel(ChannelId(9)))
        ));
        assert_eq!(queue.submission_count(), 1);
    }

    #[test]
    fn test_stalled_wait_times_out_then_completes() {
        let queue = Arc::new(DummyQueue::new());
        let ch = queue.open_channel();
        let batch = SubmitBatch { buffers: &[], relocs: &[], pushes: &[] };
        let fence = queue.submit(ch, &batch).unwrap();
        queue.set_stalled(true);

        let res = queue.wait_fence(fence, Some(Duration::from_millis(5))).unwrap();
        assert_eq!(res, FenceWait::TimedOut);

        let q = Arc::clone(&queue);
        let waiter = std::thread::spawn(move || q.wait_fence(fence, None));
        std::thread::sleep(Duration::from_millis(10));
        queue.complete_all();
        assert_eq!(waiter.join().unwrap().unwrap(), FenceWait::Signaled);
    }

    #[test]
    fn test_injected_wait_failure() {
        let queue = DummyQueue::new();
        let ch = queue.open_channel();
        let batch = SubmitBatch { buffers: &[], relocs: &[], pushes: &[] };
        let fence = queue.submit(ch, &batch).unwrap();
        queue.fail_next_wait();
        assert!(queue.wait_fence(fence, None).is_err());
        assert!(queue.wait_fence(fence, None).is_ok());
    }
}
