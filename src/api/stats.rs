//! Device statistics.

use crate::sync::atomics::{AtomicCounter, AtomicGauge};
use crate::util::size::format_bytes;

/// Snapshot of device activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStats {
    /// Batches accepted by the submission service.
    pub submissions: u64,

    /// Batches refused by the submission service.
    pub rejections: u64,

    /// Flushes, including those that submitted nothing.
    pub flushes: u64,

    /// Fence waits performed (polls included).
    pub fence_waits: u64,

    /// Buffer objects created.
    pub objects_created: u64,

    /// Buffer objects destroyed.
    pub objects_destroyed: u64,

    /// Bytes held by live buffer objects.
    pub live_bytes: u64,

    /// High water mark of `live_bytes`.
    pub peak_bytes: u64,

    /// Allocations parked on the reclaim queue.
    pub deferred_frees: u64,

    /// Parked allocations later returned to the allocator.
    pub reclaimed: u64,
}

impl DeviceStats {
    /// Buffer objects currently alive.
    pub fn live_objects(&self) -> u64 {
        self.objects_created.saturating_sub(self.objects_destroyed)
    }
}

impl std::fmt::Display for DeviceStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Device Statistics:")?;
        writeln!(f, "  Submissions:     {}", self.submissions)?;
        writeln!(f, "  Rejections:      {}", self.rejections)?;
        writeln!(f, "  Flushes:         {}", self.flushes)?;
        writeln!(f, "  Fence waits:     {}", self.fence_waits)?;
        writeln!(f, "  Live objects:    {}", self.live_objects())?;
        writeln!(f, "  Live memory:     {}", format_bytes(self.live_bytes))?;
        writeln!(f, "  Peak memory:     {}", format_bytes(self.peak_bytes))?;
        writeln!(f, "  Deferred frees:  {}", self.deferred_frees)?;
        writeln!(f, "  Reclaimed:       {}", self.reclaimed)?;
        Ok(())
    }
}

/// Live counters behind [`DeviceStats`].
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub submissions: AtomicCounter,
    pub rejections: AtomicCounter,
    pub flushes: AtomicCounter,
    pub fence_waits: AtomicCounter,
    pub objects_created: AtomicCounter,
    pub objects_destroyed: AtomicCounter,
    pub live_bytes: AtomicGauge,
    pub deferred_frees: AtomicCounter,
    pub reclaimed: AtomicCounter,
}

impl StatsCounters {
    pub fn snapshot(&self) -> DeviceStats {
        DeviceStats {
            submissions: self.submissions.get(),
            rejections: self.rejections.get(),
            flushes: self.flushes.get(),
            fence_waits: self.fence_waits.get(),
            objects_created: self.objects_created.get(),
            objects_destroyed: self.objects_destroyed.get(),
            live_bytes: self.live_bytes.get(),
            peak_bytes: self.live_bytes.peak(),
            deferred_frees: self.deferred_frees.get(),
            reclaimed: self.reclaimed.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_and_display() {
        let counters = StatsCounters::default();
        counters.objects_created.increment();
        counters.objects_created.increment();
        counters.objects_destroyed.increment();
        counters.live_bytes.add(8192);
        counters.live_bytes.sub(4096);

        let stats = counters.snapshot();
        assert_eq!(stats.live_objects(), 1);
        assert_eq!(stats.live_bytes, 4096);
        assert_eq!(stats.peak_bytes, 8192);

        let text = stats.to_string();
        assert!(text.contains("Live objects:    1"));
        assert!(text.contains("4.00 KB"));
    }
}
