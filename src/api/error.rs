//! Error types.

use std::fmt;

use crate::gpu::{GpuAllocError, SubmitError};

/// Which bound or budget refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Exhaustion {
    /// The batch's buffer array is full
    BufferLimit,
    /// The batch's relocation array is full
    RelocLimit,
    /// The batch's push descriptor array is full
    PushLimit,
    /// Placing the object would exceed the VRAM budget
    VramBudget,
    /// Placing the object would exceed the GART budget
    GartBudget,
    /// The request is larger than a whole backing region
    RegionTooSmall,
}

impl fmt::Display for Exhaustion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self {
            Exhaustion::BufferLimit => "buffer reference limit",
            Exhaustion::RelocLimit => "relocation limit",
            Exhaustion::PushLimit => "push descriptor limit",
            Exhaustion::VramBudget => "VRAM budget",
            Exhaustion::GartBudget => "GART budget",
            Exhaustion::RegionTooSmall => "backing region size",
        };
        f.write_str(what)
    }
}

/// Errors surfaced by buffer objects and command buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushbufError {
    /// The allocator could not satisfy a request
    OutOfMemory(GpuAllocError),
    /// A bound or budget was exceeded and a flush did not help
    ResourceExhausted(Exhaustion),
    /// A non-blocking wait found the object busy
    WouldBlock,
    /// A fence wait failed or timed out
    TryAgain,
    /// The submission service refused a batch
    SubmissionRejected(SubmitError),
    /// Words were written past the reserved space
    InsufficientSpace,
    /// The object is not referenced by this command buffer
    NotReferenced,
    /// No client ids left on the device
    ClientLimit,
    /// The allocation has no CPU mapping
    NotMappable,
    /// A reference's domains conflict with an earlier one that a flush could not clear
    DomainConflict,
}

impl fmt::Display for PushbufError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushbufError::OutOfMemory(e) => write!(f, "allocation failed: {}", e),
            PushbufError::ResourceExhausted(what) => write!(f, "resource exhausted: {}", what),
            PushbufError::WouldBlock => write!(f, "buffer object is busy"),
            PushbufError::TryAgain => write!(f, "fence wait failed, try again"),
            PushbufError::SubmissionRejected(e) => write!(f, "submission rejected: {}", e),
            PushbufError::InsufficientSpace => write!(f, "write exceeds reserved space"),
            PushbufError::NotReferenced => {
                write!(f, "buffer object is not referenced by this command buffer")
            }
            PushbufError::ClientLimit => write!(f, "client id table is full"),
            PushbufError::NotMappable => write!(f, "buffer object has no CPU mapping"),
            PushbufError::DomainConflict => write!(f, "conflicting memory domains for one buffer object"),
        }
    }
}

impl std::error::Error for PushbufError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PushbufError::OutOfMemory(e) => Some(e),
            PushbufError::SubmissionRejected(e) => Some(e),
            _ => None,
        }
    }
}

impl From<GpuAllocError> for PushbufError {
    fn from(e: GpuAllocError) -> Self {
        PushbufError::OutOfMemory(e)
    }
}

impl From<SubmitError> for PushbufError {
    fn from(e: SubmitError) -> Self {
        PushbufError::SubmissionRejected(e)
    }
}

impl From<Exhaustion> for PushbufError {
    fn from(e: Exhaustion) -> Self {
        PushbufError::ResourceExhausted(e)
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PushbufError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_display_and_source() {
        let e = PushbufError::from(GpuAllocError::OutOfMemory);
        assert_eq!(e.to_string(), "allocation failed: GPU out of memory");
        assert!(e.source().is_some());

        let e = PushbufError::from(Exhaustion::VramBudget);
        assert_eq!(e.to_string(), "resource exhausted: VRAM budget");
        assert!(e.source().is_none());
    }
}
