//! # pushbuf
//!
//! Userspace GPU command submission: buffer objects, command buffers that
//! batch buffer references, relocations and command ranges, and fence-gated
//! reclamation of GPU memory.
//!
//! ## Features
//!
//! - Buffer objects with domain placement, CPU mappings and fence tracking
//! - Per-client reference cache shared by all command buffers of a client
//! - Bounded submission batches with VRAM/GART budgets
//! - Automatic flushing when a batch, region or sibling buffer requires it
//! - Channel-bound (immediate) and deferred command buffers
//! - Deferred frees gated on the last fence that touched an object
//! - Coded diagnostics with an optional strict mode
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pushbuf::{BoFlags, BufferObject, Device, DeviceConfig, PushBuf, PushRef};
//! use pushbuf::gpu::{DummyAllocator, DummyQueue};
//!
//! let queue = Arc::new(DummyQueue::new());
//! let channel = queue.open_channel();
//! let device = Device::new(Arc::new(DummyAllocator::new()), queue, DeviceConfig::default());
//! let client = device.client().unwrap();
//!
//! let target = BufferObject::new(&device, BoFlags::VRAM, 0, 64 * 1024, None).unwrap();
//! let push = PushBuf::new(&client, Some(channel), 4, 32 * 1024, true).unwrap();
//!
//! push.space(4, 1, 0).unwrap();
//! push.refn(&[PushRef::new(&target, BoFlags::VRAM | BoFlags::WR)]).unwrap();
//! push.emit(&[0x2001_0000]).unwrap();
//! push.reloc(&target, 0, BoFlags::LOW, 0, 0).unwrap();
//! push.kick(channel).unwrap();
//! ```

pub mod api;
pub mod diagnostics;
pub mod gpu;

mod core;
mod sync;
mod util;

// Re-export public API at crate root for convenience
pub use api::bo::BufferObject;
pub use api::client::Client;
pub use api::config::{DeviceConfig, ReclaimMode, SubmitMode};
pub use api::device::Device;
pub use api::error::{Exhaustion, PushbufError, Result};
pub use api::flags::{BoConfig, BoFlags, Domain, MemoryKind, RelocFlags};
pub use api::pushbuf::{Cursor, KickHook, KickWriter, PushBuf, PushRef};
pub use api::stats::DeviceStats;

// Batch bookkeeping visible through the API
pub use crate::core::krec::{BatchLimits, RefOutcome};
pub use crate::core::reclaim::ReapStats;
pub use crate::core::refcache::PushBufId;

// Diagnostics - Core types and predefined codes
pub use diagnostics::{Diagnostic, DiagnosticKind};
pub use diagnostics::{set_strict_mode, StrictMode, StrictModeGuard};
pub use diagnostics::{PB001, PB002, PB003, PB101, PB102, PB201, PB202, PB901};
