//! Diagnostic kinds and predefined diagnostics.

/// The severity level of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// Something is definitely wrong; commands or memory were lost.
    Error,
    /// Something is probably wrong or suboptimal.
    Warning,
    /// Additional context.
    Note,
}

impl DiagnosticKind {
    /// Get the display prefix for this kind.
    pub fn prefix(&self) -> &'static str {
        match self {
            DiagnosticKind::Error => "error",
            DiagnosticKind::Warning => "warning",
            DiagnosticKind::Note => "note",
        }
    }

    /// Matching `log` level.
    pub fn level(&self) -> log::Level {
        match self {
            DiagnosticKind::Error => log::Level::Error,
            DiagnosticKind::Warning => log::Level::Warn,
            DiagnosticKind::Note => log::Level::Info,
        }
    }
}

/// A coded diagnostic.
///
/// Codes follow the pattern:
/// - `PB0xx` - submission
/// - `PB1xx` - batch bounds and domain budgets
/// - `PB2xx` - fences and reclamation
/// - `PB9xx` - internal errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Severity level.
    pub kind: DiagnosticKind,
    /// Diagnostic code (e.g., "PB001").
    pub code: &'static str,
    /// Primary message.
    pub message: &'static str,
    /// Optional additional context.
    pub note: Option<&'static str>,
    /// Optional fix suggestion.
    pub help: Option<&'static str>,
}

impl Diagnostic {
    /// Create a new error diagnostic.
    pub const fn error(code: &'static str, message: &'static str) -> Self {
        Self {
            kind: DiagnosticKind::Error,
            code,
            message,
            note: None,
            help: None,
        }
    }

    /// Create a new warning diagnostic.
    pub const fn warning(code: &'static str, message: &'static str) -> Self {
        Self {
            kind: DiagnosticKind::Warning,
            code,
            message,
            note: None,
            help: None,
        }
    }

    /// Add a note to this diagnostic.
    pub const fn with_note(mut self, note: &'static str) -> Self {
        self.note = Some(note);
        self
    }

    /// Add a help message to this diagnostic.
    pub const fn with_help(mut self, help: &'static str) -> Self {
        self.help = Some(help);
        self
    }
}

// =============================================================================
// PB0xx - Submission
// =============================================================================

/// PB001: The submission service refused a batch.
pub const PB001: Diagnostic = Diagnostic::error(
    "PB001",
    "command buffer submission rejected"
).with_note("the batch's references were released and its commands discarded")
 .with_help("enable debug logging to see the first rejected span of this command buffer");

/// PB002: A deferred command buffer was dropped with unsubmitted batches.
pub const PB002: Diagnostic = Diagnostic::warning(
    "PB002",
    "unsubmitted deferred batch discarded"
).with_note("the command buffer was dropped before it was kicked on a channel")
 .with_help("call kick(channel) before dropping a deferred command buffer");

/// PB003: A synchronous flush could not confirm completion.
pub const PB003: Diagnostic = Diagnostic::warning(
    "PB003",
    "submitted batch did not complete within the fence timeout"
).with_note("the batch stays attached to its buffer objects, later waits will retry")
 .with_help("raise DeviceConfig::fence_timeout or use SubmitMode::Asynchronous");

// =============================================================================
// PB1xx - Batch bounds and budgets
// =============================================================================

/// PB101: A reference cannot be placed even in an empty batch.
pub const PB101: Diagnostic = Diagnostic::warning(
    "PB101",
    "buffer reference exceeds the per-batch budget"
).with_note("a flush was attempted and the reference still did not fit")
 .with_help("raise the VRAM/GART limit percentages or split the work across smaller buffers");

/// PB102: A space request is larger than a backing region.
pub const PB102: Diagnostic = Diagnostic::error(
    "PB102",
    "space request larger than a command buffer region"
).with_note("regions are never split or grown")
 .with_help("create the command buffer with a larger region size");

// =============================================================================
// PB2xx - Fences and reclamation
// =============================================================================

/// PB201: Fence wait failed while destroying a buffer object.
pub const PB201: Diagnostic = Diagnostic::warning(
    "PB201",
    "fence wait failed while destroying a buffer object"
).with_note("the allocation was parked on the device reclaim queue instead of freed")
 .with_help("call Device::reclaim() once the GPU has caught up");

/// PB202: Allocations still parked when the device was torn down.
pub const PB202: Diagnostic = Diagnostic::warning(
    "PB202",
    "reclaim queue not empty at device teardown"
).with_note("allocations whose fence never signaled are leaked rather than freed")
 .with_help("make sure submitted work completes before dropping the device");

// =============================================================================
// PB9xx - Internal
// =============================================================================

/// PB901: Internal engine error.
pub const PB901: Diagnostic = Diagnostic::error(
    "PB901",
    "internal command buffer error"
).with_note("the current region was not referenced by its own batch");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predefined() {
        assert_eq!(PB001.kind, DiagnosticKind::Error);
        assert_eq!(PB002.kind, DiagnosticKind::Warning);
        assert!(PB201.help.is_some());
        assert_eq!(PB101.kind.level(), log::Level::Warn);
    }
}
