//! Buffer objects: GPU allocations with a CPU mapping and a pending fence.
//!
//! A [`BufferObject`] is a counted handle. Cloning retains, dropping releases;
//! the allocation is returned once the last handle is gone and the GPU has
//! signaled the object's fence.

use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

use crate::api::client::Client;
use crate::api::config::ReclaimMode;
use crate::api::device::Device;
use crate::api::error::{PushbufError, Result};
use crate::api::flags::{BoConfig, BoFlags, Domain};
use crate::gpu::{Fence, FenceWait, GpuAllocRequirements, GpuAllocation};
use crate::pb_emit;
use crate::sync::mutex::Mutex;

#[derive(Debug, Default)]
struct BoState {
    fence: Fence,
    access: BoFlags,
    mapped: bool,
}

pub(crate) struct BoInner {
    device: Device,
    handle: u32,
    size: u64,
    offset: u64,
    flags: BoFlags,
    config: BoConfig,
    allocation: Option<GpuAllocation>,
    state: Mutex<BoState>,
}

/// Counted handle to a GPU allocation.
#[derive(Clone)]
pub struct BufferObject {
    inner: Arc<BoInner>,
}

impl BufferObject {
    /// Allocate a zero-filled buffer object.
    ///
    /// `alignment` 0 selects the device default (4096). The placement bits
    /// of `flags` choose the domain; `COHERENT` requests a coherent mapping.
    pub fn new(
        device: &Device,
        flags: BoFlags,
        alignment: u64,
        size: u64,
        config: Option<&BoConfig>,
    ) -> Result<Self> {
        let config = config.copied().unwrap_or_default();
        let alignment = if alignment == 0 {
            device.config().default_alignment
        } else {
            alignment
        };

        let mut domain = flags.placement();
        if domain.is_empty() {
            domain = Domain::GART;
        }
        if flags.contains(BoFlags::MAP) {
            domain |= Domain::MAPPABLE;
        }
        let req = GpuAllocRequirements::new(size, domain)
            .with_alignment(alignment)
            .with_kind(config.kind)
            .with_coherent(flags.contains(BoFlags::COHERENT));

        let allocation = device.allocator().allocate(&req)?;
        if let Some(ptr) = allocation.cpu_ptr {
            // SAFETY: the mapping covers `allocation.size` bytes and nobody
            // else can see the allocation yet.
            unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, allocation.size as usize) };
        }

        let stats = &device.shared.stats;
        stats.objects_created.increment();
        stats.live_bytes.add(allocation.size);
        log::trace!(
            "bo {} created: {} bytes at {:#x} ({:?})",
            allocation.handle,
            allocation.size,
            allocation.gpu_offset,
            flags
        );

        Ok(Self {
            inner: Arc::new(BoInner {
                device: device.clone(),
                handle: allocation.handle,
                size: allocation.size,
                offset: allocation.gpu_offset,
                flags,
                config,
                allocation: Some(allocation),
                state: Mutex::new(BoState::default()),
            }),
        })
    }

    /// Kernel handle.
    pub fn handle(&self) -> u32 {
        self.inner.handle
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.inner.size
    }

    /// GPU virtual address.
    pub fn offset(&self) -> u64 {
        self.inner.offset
    }

    /// Creation flags.
    pub fn flags(&self) -> BoFlags {
        self.inner.flags
    }

    /// Creation configuration.
    pub fn config(&self) -> BoConfig {
        self.inner.config
    }

    /// The owning device.
    pub fn device(&self) -> &Device {
        &self.inner.device
    }

    /// Take another counted reference.
    pub fn retain(&self) -> Self {
        self.clone()
    }

    /// Give up this reference, destroying the object if it was the last.
    pub fn release(self) {
        drop(self);
    }

    /// Number of live references.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Whether two handles refer to the same object.
    pub fn ptr_eq(&self, other: &BufferObject) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Pending fence as `(syncpoint id, threshold)`.
    pub fn syncpoint(&self) -> Option<(u32, u32)> {
        let fence = self.inner.state.lock().fence;
        fence.is_valid().then_some((fence.id, fence.value))
    }

    /// Access mode of the last submission that touched the object.
    pub fn access(&self) -> BoFlags {
        self.inner.state.lock().access
    }

    /// Wait until `access` is safe with respect to the pending fence.
    ///
    /// Read-after-read never waits. With `NOBLOCK` a busy object reports
    /// [`PushbufError::WouldBlock`] instead of waiting.
    pub fn wait_access(&self, access: BoFlags) -> Result<()> {
        let (fence, prev) = {
            let state = self.inner.state.lock();
            (state.fence, state.access)
        };
        if !fence.is_valid() {
            return Ok(());
        }
        if !prev.contains(BoFlags::WR) && !access.contains(BoFlags::WR) {
            return Ok(());
        }

        let device = &self.inner.device;
        let nonblock = access.contains(BoFlags::NOBLOCK);
        let timeout = if nonblock {
            Some(Duration::ZERO)
        } else {
            device.config().fence_timeout
        };
        device.shared.stats.fence_waits.increment();
        match device.queue().wait_fence(fence, timeout) {
            Ok(FenceWait::Signaled) => {
                self.clear_fence_if(fence);
                Ok(())
            }
            Ok(FenceWait::TimedOut) if nonblock => Err(PushbufError::WouldBlock),
            Ok(FenceWait::TimedOut) => {
                log::debug!("bo {}: fence {}:{} timed out", self.inner.handle, fence.id, fence.value);
                Err(PushbufError::TryAgain)
            }
            Err(e) => {
                log::warn!("bo {}: fence wait failed: {}", self.inner.handle, e);
                Err(PushbufError::TryAgain)
            }
        }
    }

    /// Wait for `access`, first kicking the client's channel-bound command
    /// buffer if it still holds the object in an unsubmitted batch.
    pub fn wait(&self, access: BoFlags, client: Option<&Client>) -> Result<()> {
        if !access.intersects(BoFlags::RDWR) {
            return Ok(());
        }
        if let Some(client) = client {
            if let Some(push) = client.owner_of(self) {
                if let Some(channel) = push.channel() {
                    log::trace!("bo {}: kicking owner before wait", self.inner.handle);
                    push.kick(channel)?;
                }
            }
        }
        self.wait_access(access)
    }

    /// Wait for `access` and expose the CPU mapping.
    pub fn map(&self, access: BoFlags, client: Option<&Client>) -> Result<NonNull<u8>> {
        let ptr = self.cpu_ptr().ok_or(PushbufError::NotMappable)?;
        self.wait(access, client)?;
        self.inner.state.lock().mapped = true;
        Ok(ptr)
    }

    /// Hide the CPU mapping again.
    pub fn unmap(&self) {
        self.inner.state.lock().mapped = false;
    }

    /// Whether [`map`](Self::map) was called without a matching `unmap`.
    pub fn is_mapped(&self) -> bool {
        self.inner.state.lock().mapped
    }

    /// Copy bytes out of the mapping. Does not wait on the fence.
    pub fn read(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        let src = self.bytes_at(offset, dst.len() as u64)?;
        // SAFETY: `bytes_at` checked the range against the mapping.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    /// Copy bytes into the mapping. Does not wait on the fence.
    pub fn write(&self, offset: u64, src: &[u8]) -> Result<()> {
        let dst = self.bytes_at(offset, src.len() as u64)?;
        // SAFETY: `bytes_at` checked the range against the mapping.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), src.len()) };
        Ok(())
    }

    fn cpu_ptr(&self) -> Option<NonNull<u8>> {
        self.inner.allocation.as_ref().and_then(|a| a.cpu_ptr)
    }

    fn bytes_at(&self, offset: u64, len: u64) -> Result<NonNull<u8>> {
        let base = self.cpu_ptr().ok_or(PushbufError::NotMappable)?;
        match offset.checked_add(len) {
            Some(end) if end <= self.inner.size => {
                // SAFETY: offset is within the mapping.
                Ok(unsafe { NonNull::new_unchecked(base.as_ptr().add(offset as usize)) })
            }
            _ => Err(PushbufError::InsufficientSpace),
        }
    }

    /// Store command words at `word_offset`.
    pub(crate) fn write_words(&self, word_offset: usize, words: &[u32]) -> Result<()> {
        let dst = self.bytes_at(word_offset as u64 * 4, words.len() as u64 * 4)?;
        // SAFETY: range checked; the allocator maps with at least word alignment.
        unsafe {
            std::ptr::copy_nonoverlapping(words.as_ptr(), dst.as_ptr() as *mut u32, words.len())
        };
        Ok(())
    }

    /// CPU view of `len` bytes at byte `offset`, when mapped and word aligned.
    pub(crate) fn words(&self, offset: u64, len: u64) -> Option<&[u32]> {
        if offset % 4 != 0 || len % 4 != 0 {
            return None;
        }
        let ptr = self.bytes_at(offset, len).ok()?;
        if (ptr.as_ptr() as usize) % std::mem::align_of::<u32>() != 0 {
            return None;
        }
        // SAFETY: aligned, in bounds and valid while `self` holds the
        // allocation. Writers go through the owning command buffer's lock.
        Some(unsafe { std::slice::from_raw_parts(ptr.as_ptr() as *const u32, (len / 4) as usize) })
    }

    /// Record the fence of a submission that touched the object.
    pub(crate) fn attach_fence(&self, fence: Fence, access: BoFlags) {
        let mut state = self.inner.state.lock();
        state.fence = fence;
        state.access = access;
    }

    /// Clear the fence if it is still `fence`.
    pub(crate) fn clear_fence_if(&self, fence: Fence) {
        let mut state = self.inner.state.lock();
        if state.fence == fence {
            state.fence = Fence::NONE;
            state.access = BoFlags::empty();
        }
    }
}

impl std::fmt::Debug for BufferObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferObject")
            .field("handle", &self.inner.handle)
            .field("size", &self.inner.size)
            .field("offset", &format_args!("{:#x}", self.inner.offset))
            .field("flags", &self.inner.flags)
            .finish()
    }
}

impl Drop for BoInner {
    fn drop(&mut self) {
        let Some(allocation) = self.allocation.take() else {
            return;
        };
        let fence = self.state.get_mut().fence;
        let shared = &self.device.shared;
        shared.stats.objects_destroyed.increment();
        shared.stats.live_bytes.sub(allocation.size);

        if fence.is_valid() {
            let timeout = match shared.config.reclaim_mode {
                ReclaimMode::Blocking => None,
                ReclaimMode::Deferred => Some(Duration::ZERO),
            };
            shared.stats.fence_waits.increment();
            match shared.queue.wait_fence(fence, timeout) {
                Ok(FenceWait::Signaled) => {}
                Ok(FenceWait::TimedOut) => {
                    log::trace!("bo {} parked until fence {}:{}", self.handle, fence.id, fence.value);
                    shared.stats.deferred_frees.increment();
                    shared.reclaim.push(allocation, fence);
                    return;
                }
                Err(e) => {
                    pb_emit!(PB201, "bo {}: {}", self.handle, e);
                    shared.stats.deferred_frees.increment();
                    shared.reclaim.push(allocation, fence);
                    return;
                }
            }
        }

        log::trace!("bo {} destroyed", self.handle);
        shared.allocator.free(allocation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::config::DeviceConfig;
    use crate::gpu::{DummyAllocator, DummyQueue, SubmissionQueue, SubmitBatch};

    fn setup(config: DeviceConfig) -> (Device, Arc<DummyAllocator>, Arc<DummyQueue>) {
        let alloc = Arc::new(DummyAllocator::new());
        let queue = Arc::new(DummyQueue::new());
        let dev = Device::new(alloc.clone(), queue.clone(), config);
        (dev, alloc, queue)
    }

    fn submit_empty(queue: &DummyQueue) -> Fence {
        let ch = queue.open_channel();
        queue
            .submit(ch, &SubmitBatch { buffers: &[], relocs: &[], pushes: &[] })
            .unwrap()
    }

    #[test]
    fn test_new_zero_filled_and_aligned() {
        let (dev, alloc, _) = setup(DeviceConfig::minimal());
        let bo = BufferObject::new(&dev, BoFlags::GART | BoFlags::MAP, 0, 4096, None).unwrap();
        assert_eq!(bo.offset() % 4096, 0);
        assert_eq!(bo.ref_count(), 1);
        assert!(bo.syncpoint().is_none());

        let mut bytes = vec![0xffu8; 4096];
        bo.read(0, &mut bytes).unwrap();
        assert!(bytes.iter().all(|&b| b == 0));

        assert_eq!(alloc.live_count(), 1);
        bo.release();
        assert_eq!(alloc.live_count(), 0);
    }

    #[test]
    fn test_allocation_failure() {
        let (dev, alloc, _) = setup(DeviceConfig::minimal());
        alloc.fail_next();
        let err = BufferObject::new(&dev, BoFlags::VRAM, 0, 64, None).unwrap_err();
        assert!(matches!(err, PushbufError::OutOfMemory(_)));
        assert_eq!(dev.stats().objects_created, 0);
    }

    #[test]
    fn test_retain_release_counts() {
        let (dev, alloc, _) = setup(DeviceConfig::minimal());
        let bo = BufferObject::new(&dev, BoFlags::GART, 0, 256, None).unwrap();
        let extra = bo.retain();
        assert_eq!(bo.ref_count(), 2);
        assert!(extra.ptr_eq(&bo));
        extra.release();
        assert_eq!(bo.ref_count(), 1);
        assert_eq!(alloc.live_count(), 1);
    }

    #[test]
    fn test_read_after_read_does_not_wait() {
        let (dev, _, queue) = setup(DeviceConfig::minimal());
        let bo = BufferObject::new(&dev, BoFlags::GART, 0, 256, None).unwrap();
        let fence = submit_empty(&queue);
        bo.attach_fence(fence, BoFlags::RD);

        let waits = queue.wait_count();
        bo.wait_access(BoFlags::RD | BoFlags::NOBLOCK).unwrap();
        assert_eq!(queue.wait_count(), waits);
        assert_eq!(bo.syncpoint(), Some((fence.id, fence.value)));
    }

    #[test]
    fn test_write_access_waits_and_clears() {
        let (dev, _, queue) = setup(DeviceConfig::minimal());
        let bo = BufferObject::new(&dev, BoFlags::GART, 0, 256, None).unwrap();
        let fence = submit_empty(&queue);
        bo.attach_fence(fence, BoFlags::RD);

        assert_eq!(
            bo.wait_access(BoFlags::WR | BoFlags::NOBLOCK).unwrap_err(),
            PushbufError::WouldBlock
        );
        bo.wait_access(BoFlags::WR).unwrap();
        assert!(bo.syncpoint().is_none());
        assert!(bo.access().is_empty());
    }

    #[test]
    fn test_wait_failure_is_try_again() {
        let (dev, _, queue) = setup(DeviceConfig::minimal());
        let bo = BufferObject::new(&dev, BoFlags::GART, 0, 256, None).unwrap();
        bo.attach_fence(submit_empty(&queue), BoFlags::WR);
        queue.fail_next_wait();
        assert_eq!(bo.wait_access(BoFlags::RD).unwrap_err(), PushbufError::TryAgain);
        assert!(bo.syncpoint().is_some());
    }

    #[test]
    fn test_access_without_rdwr_is_noop() {
        let (dev, _, queue) = setup(DeviceConfig::minimal());
        let bo = BufferObject::new(&dev, BoFlags::GART, 0, 256, None).unwrap();
        bo.attach_fence(submit_empty(&queue), BoFlags::WR);
        bo.wait(BoFlags::NOBLOCK, None).unwrap();
        assert!(bo.syncpoint().is_some());
    }

    #[test]
    fn test_deferred_reclaim() {
        let config = DeviceConfig::minimal().with_reclaim_mode(ReclaimMode::Deferred);
        let (dev, alloc, queue) = setup(config);
        let bo = BufferObject::new(&dev, BoFlags::GART, 0, 512, None).unwrap();
        bo.attach_fence(submit_empty(&queue), BoFlags::WR);
        drop(bo);

        assert_eq!(dev.pending_reclaims(), 1);
        assert_eq!(alloc.live_count(), 1);
        assert_eq!(dev.reclaim().freed, 0);

        queue.complete_all();
        assert_eq!(dev.reclaim().freed, 1);
        assert_eq!(alloc.live_count(), 0);
        let stats = dev.stats();
        assert_eq!((stats.deferred_frees, stats.reclaimed), (1, 1));
    }

    #[test]
    fn test_blocking_destroy_waits() {
        let (dev, alloc, queue) = setup(DeviceConfig::minimal());
        let bo = BufferObject::new(&dev, BoFlags::GART, 0, 512, None).unwrap();
        let fence = submit_empty(&queue);
        bo.attach_fence(fence, BoFlags::WR);
        drop(bo);
        assert!(queue.is_signaled(fence));
        assert_eq!(alloc.live_count(), 0);
    }

    #[test]
    fn test_map_and_bounds() {
        let (dev, _, _) = setup(DeviceConfig::minimal());
        let bo = BufferObject::new(&dev, BoFlags::GART | BoFlags::MAP, 0, 64, None).unwrap();
        let ptr = bo.map(BoFlags::RDWR, None).unwrap();
        assert!(bo.is_mapped());
        unsafe { *ptr.as_ptr() = 7 };
        let mut one = [0u8; 1];
        bo.read(0, &mut one).unwrap();
        assert_eq!(one[0], 7);
        bo.unmap();
        assert!(!bo.is_mapped());

        assert_eq!(bo.write(60, &[0; 8]).unwrap_err(), PushbufError::InsufficientSpace);
        bo.write_words(15, &[0xdead_beef]).unwrap();
        assert_eq!(bo.words(60, 4).unwrap(), &[0xdead_beef]);
        assert!(bo.words(2, 4).is_none());
    }
}
