//! GPU collaborator interfaces
//!
//! The engine consumes two services it does not implement:
//! - a [`GpuMemoryAllocator`] that hands out GPU memory with optional CPU mappings
//! - a [`SubmissionQueue`] that executes batches and signals fences
//!
//! [`DummyAllocator`] and [`DummyQueue`] implement both in host memory for tests
//! and tooling.

pub mod traits;
pub use traits::{
    ChannelId, Fence, FenceWait, GpuAllocError, GpuAllocRequirements, GpuAllocation,
    GpuMemoryAllocator, KernelRef, PushDescriptor, PushSpan, Reloc, SubmissionQueue,
    SubmitBatch, SubmitError,
};

pub mod dummy;
pub use dummy::{DummyAllocator, DummyQueue, RecordedSubmission};
