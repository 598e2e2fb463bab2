//! GPU collaborator traits and wire types
//!
//! The engine never allocates GPU memory or talks to hardware itself. It is
//! handed a [`GpuMemoryAllocator`] and a [`SubmissionQueue`] and only moves
//! handles, fences and opaque command words between them.

use std::fmt;
use std::ptr::NonNull;
use std::time::Duration;

use crate::api::flags::{Domain, MemoryKind, RelocFlags};

/// Identifier of a hardware channel (FIFO context) owned by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u32);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

/// Completion fence: a syncpoint id and the value it must reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fence {
    /// Syncpoint id, `u32::MAX` when there is no fence
    pub id: u32,
    /// Threshold the syncpoint must reach
    pub value: u32,
}

impl Fence {
    /// The "no fence" sentinel.
    pub const NONE: Fence = Fence { id: u32::MAX, value: 0 };

    /// Create a fence on a syncpoint.
    pub const fn new(id: u32, value: u32) -> Self {
        Self { id, value }
    }

    /// Whether this refers to a real syncpoint.
    pub const fn is_valid(&self) -> bool {
        (self.id as i32) >= 0
    }
}

impl Default for Fence {
    fn default() -> Self {
        Self::NONE
    }
}

/// Outcome of a fence wait that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceWait {
    /// The fence reached its threshold
    Signaled,
    /// The timeout elapsed first
    TimedOut,
}

/// Errors from the memory allocator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuAllocError {
    /// Out of memory
    OutOfMemory,
    /// Invalid buffer size
    InvalidSize,
    /// Alignment requirements not met
    AlignmentFailed,
    /// Backend-specific error (opaque)
    BackendError(String),
}

impl fmt::Display for GpuAllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuAllocError::OutOfMemory => write!(f, "GPU out of memory"),
            GpuAllocError::InvalidSize => write!(f, "Invalid buffer size"),
            GpuAllocError::AlignmentFailed => write!(f, "Alignment requirements not met"),
            GpuAllocError::BackendError(msg) => write!(f, "Backend error: {}", msg),
        }
    }
}

impl std::error::Error for GpuAllocError {}

/// Errors from the submission service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// The queue refused the batch, with a backend result code
    Rejected(i32),
    /// The channel is not known to the queue
    UnknownChannel(ChannelId),
    /// Waiting on a fence failed on the kernel side
    FenceFailed(String),
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::Rejected(code) => write!(f, "submission rejected (code {:#x})", code),
            SubmitError::UnknownChannel(ch) => write!(f, "unknown channel {}", ch),
            SubmitError::FenceFailed(msg) => write!(f, "fence wait failed: {}", msg),
        }
    }
}

impl std::error::Error for SubmitError {}

/// Allocation request handed to the allocator.
#[derive(Debug, Clone)]
pub struct GpuAllocRequirements {
    /// Size in bytes
    pub size: u64,
    /// Alignment in bytes (power of two)
    pub alignment: u64,
    /// Preferred residency
    pub domain: Domain,
    /// Tiling / memory kind hint
    pub kind: MemoryKind,
    /// CPU mapping must be coherent (uncached)
    pub coherent: bool,
}

impl GpuAllocRequirements {
    /// Create a requirements struct for a pitch-linear allocation.
    pub fn new(size: u64, domain: Domain) -> Self {
        Self {
            size,
            alignment: 0x1000,
            domain,
            kind: MemoryKind::PITCH,
            coherent: false,
        }
    }

    /// Set alignment requirement.
    pub fn with_alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }

    /// Set the memory kind hint.
    pub fn with_kind(mut self, kind: MemoryKind) -> Self {
        self.kind = kind;
        self
    }

    /// Request a coherent mapping.
    pub fn with_coherent(mut self, coherent: bool) -> Self {
        self.coherent = coherent;
        self
    }
}

/// A live allocation returned by the allocator.
#[derive(Debug)]
pub struct GpuAllocation {
    /// Allocator-unique handle
    pub handle: u32,
    /// GPU virtual address
    pub gpu_offset: u64,
    /// Size actually allocated
    pub size: u64,
    /// CPU mapping, `None` for memory the CPU cannot see
    pub cpu_ptr: Option<NonNull<u8>>,
}

// SAFETY: the mapping is owned by the allocation and only freed through
// `GpuMemoryAllocator::free`, which consumes it.
unsafe impl Send for GpuAllocation {}
unsafe impl Sync for GpuAllocation {}

/// Kernel-side reference record for one buffer object in a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelRef {
    /// Buffer object handle
    pub handle: u32,
    /// Domains the object may reside in for this batch
    pub valid_domains: Domain,
    /// Domains the GPU reads through
    pub read_domains: Domain,
    /// Domains the GPU writes through
    pub write_domains: Domain,
    /// Address the commands were written against
    pub presumed_offset: u64,
    /// Domain the commands were written against
    pub presumed_domain: Domain,
}

/// Relocation record: patch a word in one buffer with another's address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reloc {
    /// Index (in the batch's buffers) of the buffer holding the word
    pub reloc_bo_index: u32,
    /// Byte offset of the word inside that buffer
    pub reloc_bo_offset: u32,
    /// Index of the buffer whose address is written
    pub bo_index: u32,
    /// Which half of the address, and whether to OR in a domain value
    pub flags: RelocFlags,
    /// Offset added to the address
    pub data: u32,
    /// Value OR'd in when the target lives in VRAM
    pub vor: u32,
    /// Value OR'd in when the target lives in GART
    pub tor: u32,
}

/// A range of command words inside a referenced buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushDescriptor {
    /// Index (in the batch's buffers) of the buffer holding the words
    pub bo_index: u32,
    /// Byte offset of the first word
    pub offset: u64,
    /// Length in bytes
    pub length: u64,
}

/// A push descriptor together with a CPU view of its words, when visible.
#[derive(Debug, Clone, Copy)]
pub struct PushSpan<'a> {
    /// The descriptor submitted to hardware
    pub desc: PushDescriptor,
    /// CPU view of the words, `None` for unmapped or unaligned ranges
    pub words: Option<&'a [u32]>,
}

/// One batch handed to the submission service.
#[derive(Debug, Clone, Copy)]
pub struct SubmitBatch<'a> {
    /// Every buffer the commands touch
    pub buffers: &'a [KernelRef],
    /// Relocations to apply before execution
    pub relocs: &'a [Reloc],
    /// Command word ranges, in execution order
    pub pushes: &'a [PushSpan<'a>],
}

impl<'a> SubmitBatch<'a> {
    /// Total number of command words across all spans.
    pub fn word_count(&self) -> u64 {
        self.pushes.iter().map(|p| p.desc.length / 4).sum()
    }
}

/// Raw GPU memory provider.
pub trait GpuMemoryAllocator: Send + Sync {
    /// Allocate GPU-visible memory.
    fn allocate(&self, req: &GpuAllocRequirements) -> Result<GpuAllocation, GpuAllocError>;

    /// Return an allocation. The caller guarantees the GPU is done with it.
    fn free(&self, allocation: GpuAllocation);
}

/// Hardware submission service and fence primitive.
pub trait SubmissionQueue: Send + Sync {
    /// Queue a batch on `channel` and return its completion fence.
    fn submit(&self, channel: ChannelId, batch: &SubmitBatch<'_>) -> Result<Fence, SubmitError>;

    /// Wait for `fence`. `None` waits forever, `Some(Duration::ZERO)` polls.
    fn wait_fence(&self, fence: Fence, timeout: Option<Duration>) -> Result<FenceWait, SubmitError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fence_sentinel() {
        assert!(!Fence::NONE.is_valid());
        assert!(!Fence::default().is_valid());
        assert!(Fence::new(3, 10).is_valid());
    }

    #[test]
    fn test_batch_word_count() {
        let spans = [
            PushSpan {
                desc: PushDescriptor { bo_index: 0, offset: 0, length: 16 },
                words: None,
            },
            PushSpan {
                desc: PushDescriptor { bo_index: 0, offset: 16, length: 8 },
                words: None,
            },
        ];
        let batch = SubmitBatch { buffers: &[], relocs: &[], pushes: &spans };
        assert_eq!(batch.word_count(), 6);
    }
}
