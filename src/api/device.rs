//! Device: collaborators, configuration and shared bookkeeping.

use std::sync::Arc;

use crate::api::client::Client;
use crate::api::config::DeviceConfig;
use crate::api::error::{PushbufError, Result};
use crate::api::stats::{DeviceStats, StatsCounters};
use crate::core::krec::BatchLimits;
use crate::core::reclaim::{ReapStats, ReclaimQueue};
use crate::gpu::{GpuMemoryAllocator, SubmissionQueue};
use crate::pb_emit;
use crate::sync::mutex::Mutex;

pub(crate) struct DeviceShared {
    pub allocator: Arc<dyn GpuMemoryAllocator>,
    pub queue: Arc<dyn SubmissionQueue>,
    pub config: DeviceConfig,
    pub limits: BatchLimits,
    client_ids: Mutex<Vec<u32>>,
    pub reclaim: ReclaimQueue,
    pub stats: StatsCounters,
}

/// Handle to a GPU device.
///
/// Cheap to clone; every buffer object, client and command buffer keeps the
/// device alive.
#[derive(Clone)]
pub struct Device {
    pub(crate) shared: Arc<DeviceShared>,
}

impl Device {
    /// Create a device on top of an allocator and a submission queue.
    pub fn new(
        allocator: Arc<dyn GpuMemoryAllocator>,
        queue: Arc<dyn SubmissionQueue>,
        config: DeviceConfig,
    ) -> Self {
        let limits = BatchLimits {
            vram: config.vram_limit(),
            gart: config.gart_limit(),
            max_buffers: config.max_buffers,
            max_relocs: config.max_relocs,
            max_push: config.max_push,
        };
        log::debug!(
            "device: vram limit {} gart limit {} bounds {}/{}/{}",
            limits.vram,
            limits.gart,
            limits.max_buffers,
            limits.max_relocs,
            limits.max_push
        );
        Self {
            shared: Arc::new(DeviceShared {
                allocator,
                queue,
                config,
                limits,
                client_ids: Mutex::new(Vec::new()),
                reclaim: ReclaimQueue::new(),
                stats: StatsCounters::default(),
            }),
        }
    }

    /// Device configuration.
    pub fn config(&self) -> &DeviceConfig {
        &self.shared.config
    }

    /// Per-batch bounds and budgets derived from the configuration.
    pub fn limits(&self) -> BatchLimits {
        self.shared.limits
    }

    /// The memory allocator.
    pub fn allocator(&self) -> &Arc<dyn GpuMemoryAllocator> {
        &self.shared.allocator
    }

    /// The submission queue.
    pub fn queue(&self) -> &Arc<dyn SubmissionQueue> {
        &self.shared.queue
    }

    /// Create a client on this device.
    pub fn client(&self) -> Result<Client> {
        Client::new(self)
    }

    /// Free parked allocations whose fence has signaled. Never blocks.
    pub fn reclaim(&self) -> ReapStats {
        self.shared.reap(false)
    }

    /// Allocations still parked on the reclaim queue.
    pub fn pending_reclaims(&self) -> usize {
        self.shared.reclaim.len()
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> DeviceStats {
        self.shared.stats.snapshot()
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("config", &self.shared.config)
            .field("pending_reclaims", &self.shared.reclaim.len())
            .finish()
    }
}

impl DeviceShared {
    pub fn reap(&self, block: bool) -> ReapStats {
        let stats = self.reclaim.reap(self.allocator.as_ref(), self.queue.as_ref(), block);
        for _ in 0..stats.freed {
            self.stats.reclaimed.increment();
        }
        if stats.freed > 0 {
            log::debug!("reclaimed {} allocations ({} bytes)", stats.freed, stats.bytes);
        }
        stats
    }

    /// Take the lowest free client id.
    pub fn alloc_client_id(&self) -> Result<u32> {
        let mut ids = self.client_ids.lock();
        for (word_idx, word) in ids.iter_mut().enumerate() {
            if *word != u32::MAX {
                let bit = (!*word).trailing_zeros();
                let id = word_idx as u32 * 32 + bit;
                if id as usize >= self.config.max_clients {
                    return Err(PushbufError::ClientLimit);
                }
                *word |= 1 << bit;
                return Ok(id);
            }
        }
        let id = ids.len() as u32 * 32;
        if id as usize >= self.config.max_clients {
            return Err(PushbufError::ClientLimit);
        }
        ids.push(1);
        Ok(id)
    }

    pub fn release_client_id(&self, id: u32) {
        let mut ids = self.client_ids.lock();
        if let Some(word) = ids.get_mut((id / 32) as usize) {
            *word &= !(1 << (id % 32));
        }
    }
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        if self.reclaim.is_empty() {
            return;
        }
        let stats = self.reap(true);
        if stats.pending > 0 {
            pb_emit!(PB202, "{} allocations leaked", stats.pending);
            // Dropping the allocation records without `free` leaks their memory.
            drop(self.reclaim.drain());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{DummyAllocator, DummyQueue};

    fn device(max_clients: usize) -> Device {
        Device::new(
            Arc::new(DummyAllocator::new()),
            Arc::new(DummyQueue::new()),
            DeviceConfig::minimal().with_max_clients(max_clients),
        )
    }

    #[test]
    fn test_client_ids_reuse_lowest() {
        let dev = device(64);
        let a = dev.shared.alloc_client_id().unwrap();
        let b = dev.shared.alloc_client_id().unwrap();
        let c = dev.shared.alloc_client_id().unwrap();
        assert_eq!((a, b, c), (0, 1, 2));
        dev.shared.release_client_id(b);
        assert_eq!(dev.shared.alloc_client_id().unwrap(), 1);
    }

    #[test]
    fn test_client_ids_span_words() {
        let dev = device(40);
        for expected in 0..40 {
            assert_eq!(dev.shared.alloc_client_id().unwrap(), expected);
        }
        assert_eq!(dev.shared.alloc_client_id().unwrap_err(), PushbufError::ClientLimit);
        dev.shared.release_client_id(33);
        assert_eq!(dev.shared.alloc_client_id().unwrap(), 33);
    }

    #[test]
    fn test_limits_follow_config() {
        let dev = device(8);
        let limits = dev.limits();
        assert_eq!(limits.vram, dev.config().vram_limit());
        assert_eq!(limits.max_push, 32);
        assert_eq!(dev.pending_reclaims(), 0);
    }
}
