//! Device configuration.

use std::time::Duration;

use crate::util::size::mb;

/// Environment variable overriding [`DeviceConfig::vram_limit_percent`].
pub const ENV_VRAM_LIMIT: &str = "PUSHBUF_VRAM_LIMIT_PERCENT";

/// Environment variable overriding [`DeviceConfig::gart_limit_percent`].
pub const ENV_GART_LIMIT: &str = "PUSHBUF_GART_LIMIT_PERCENT";

/// How a flush treats the fence of a submitted batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubmitMode {
    /// Wait for every batch to complete before returning from flush
    #[default]
    Synchronous,
    /// Keep batches in flight; their fences gate later CPU access
    Asynchronous,
}

/// What happens to a buffer object dropped while its fence is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReclaimMode {
    /// Wait for the fence in the dropping thread
    #[default]
    Blocking,
    /// Park the allocation on the device reclaim queue
    Deferred,
}

/// Configuration for a [`Device`](crate::Device).
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// VRAM size in bytes (default: 256 MB)
    pub vram_size: u64,

    /// GART size in bytes (default: 512 MB)
    pub gart_size: u64,

    /// Share of VRAM one batch may reference (default: 80)
    pub vram_limit_percent: u8,

    /// Share of GART one batch may reference (default: 80)
    pub gart_limit_percent: u8,

    /// Buffer references per batch (default: 1024)
    pub max_buffers: usize,

    /// Relocations per batch (default: 1024)
    pub max_relocs: usize,

    /// Push descriptors per batch (default: 512)
    pub max_push: usize,

    /// Alignment used when a buffer object is created with alignment 0
    pub default_alignment: u64,

    /// Maximum number of live clients
    pub max_clients: usize,

    /// Flush behaviour after submission
    pub submit_mode: SubmitMode,

    /// Timeout for blocking fence waits (`None` = infinite)
    pub fence_timeout: Option<Duration>,

    /// Buffer object destruction behaviour
    pub reclaim_mode: ReclaimMode,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            vram_size: mb(256),
            gart_size: mb(512),
            vram_limit_percent: 80,
            gart_limit_percent: 80,
            max_buffers: 1024,
            max_relocs: 1024,
            max_push: 512,
            default_alignment: 0x1000,
            max_clients: 256,
            submit_mode: SubmitMode::Synchronous,
            fence_timeout: None,
            reclaim_mode: ReclaimMode::Blocking,
        }
    }
}

impl DeviceConfig {
    /// Create a minimal config for testing or constrained environments.
    pub fn minimal() -> Self {
        Self {
            vram_size: mb(16),
            gart_size: mb(16),
            max_buffers: 64,
            max_relocs: 64,
            max_push: 32,
            max_clients: 8,
            ..Self::default()
        }
    }

    /// Default config with limit percentages taken from the environment.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `PUSHBUF_VRAM_LIMIT_PERCENT` / `PUSHBUF_GART_LIMIT_PERCENT`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(pct) = read_percent(ENV_VRAM_LIMIT) {
            self.vram_limit_percent = pct;
        }
        if let Some(pct) = read_percent(ENV_GART_LIMIT) {
            self.gart_limit_percent = pct;
        }
        self
    }

    /// Bytes of VRAM one batch may reference.
    pub fn vram_limit(&self) -> u64 {
        self.vram_size / 100 * self.vram_limit_percent as u64
    }

    /// Bytes of GART one batch may reference.
    pub fn gart_limit(&self) -> u64 {
        self.gart_size / 100 * self.gart_limit_percent as u64
    }

    /// Builder pattern: set domain sizes.
    pub fn with_domain_sizes(mut self, vram: u64, gart: u64) -> Self {
        self.vram_size = vram;
        self.gart_size = gart;
        self
    }

    /// Builder pattern: set limit percentages (clamped to 100).
    pub fn with_limit_percent(mut self, vram: u8, gart: u8) -> Self {
        self.vram_limit_percent = vram.min(100);
        self.gart_limit_percent = gart.min(100);
        self
    }

    /// Builder pattern: set batch bounds.
    pub fn with_batch_bounds(mut self, buffers: usize, relocs: usize, push: usize) -> Self {
        self.max_buffers = buffers;
        self.max_relocs = relocs;
        self.max_push = push;
        self
    }

    /// Builder pattern: set default alignment.
    pub fn with_default_alignment(mut self, alignment: u64) -> Self {
        self.default_alignment = alignment;
        self
    }

    /// Builder pattern: set the client limit.
    pub fn with_max_clients(mut self, max: usize) -> Self {
        self.max_clients = max;
        self
    }

    /// Builder pattern: set submit mode.
    pub fn with_submit_mode(mut self, mode: SubmitMode) -> Self {
        self.submit_mode = mode;
        self
    }

    /// Builder pattern: set fence timeout.
    pub fn with_fence_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.fence_timeout = timeout;
        self
    }

    /// Builder pattern: set reclaim mode.
    pub fn with_reclaim_mode(mut self, mode: ReclaimMode) -> Self {
        self.reclaim_mode = mode;
        self
    }
}

fn read_percent(var: &str) -> Option<u8> {
    let raw = std::env::var(var).ok()?;
    match raw.trim().parse::<u8>() {
        Ok(pct) if pct <= 100 => {
            log::debug!("{} = {}", var, pct);
            Some(pct)
        }
        _ => {
            log::warn!("ignoring invalid {}={:?}", var, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let cfg = DeviceConfig::default();
        assert_eq!(cfg.vram_limit(), mb(256) / 100 * 80);
        assert_eq!(cfg.max_push, 512);
        assert_eq!(cfg.submit_mode, SubmitMode::Synchronous);
    }

    #[test]
    fn test_builder() {
        let cfg = DeviceConfig::minimal()
            .with_limit_percent(150, 50)
            .with_batch_bounds(4, 4, 2)
            .with_reclaim_mode(ReclaimMode::Deferred);
        assert_eq!(cfg.vram_limit_percent, 100);
        assert_eq!(cfg.gart_limit(), mb(16) / 100 * 50);
        assert_eq!((cfg.max_buffers, cfg.max_relocs, cfg.max_push), (4, 4, 2));
        assert_eq!(cfg.reclaim_mode, ReclaimMode::Deferred);
    }

    #[test]
    fn test_env_override() {
        std::env::set_var(ENV_GART_LIMIT, "40");
        std::env::set_var(ENV_VRAM_LIMIT, "bogus");
        let cfg = DeviceConfig::from_env();
        std::env::remove_var(ENV_GART_LIMIT);
        std::env::remove_var(ENV_VRAM_LIMIT);
        assert_eq!(cfg.gart_limit_percent, 40);
        assert_eq!(cfg.vram_limit_percent, 80);
    }
}
