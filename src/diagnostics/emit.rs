//! Diagnostic emission backend.
//!
//! Diagnostics go to the `log` facade and, when installed, to a global
//! [`DiagnosticSink`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use super::kind::{Diagnostic, DiagnosticKind};
use super::strict::{should_panic, should_panic_on_warning};

/// Global flag to suppress diagnostic output.
static DIAGNOSTICS_SUPPRESSED: AtomicBool = AtomicBool::new(false);

/// Installed sink, if any.
static SINK: RwLock<Option<Arc<dyn DiagnosticSink>>> = RwLock::new(None);

/// Suppress all diagnostic output.
pub fn suppress_diagnostics(suppress: bool) {
    DIAGNOSTICS_SUPPRESSED.store(suppress, Ordering::Relaxed);
}

/// Check if diagnostics are suppressed.
pub fn is_suppressed() -> bool {
    DIAGNOSTICS_SUPPRESSED.load(Ordering::Relaxed)
}

/// Install a sink that receives every emitted diagnostic.
pub fn set_sink(sink: Arc<dyn DiagnosticSink>) {
    *SINK.write().unwrap_or_else(|p| p.into_inner()) = Some(sink);
}

/// Remove the installed sink.
pub fn clear_sink() {
    *SINK.write().unwrap_or_else(|p| p.into_inner()) = None;
}

/// Emit a diagnostic.
pub fn emit(diag: &Diagnostic) {
    emit_inner(diag, None);
}

/// Emit a diagnostic with additional runtime context.
pub fn emit_with_context(diag: &Diagnostic, context: &str) {
    emit_inner(diag, Some(context));
}

fn emit_inner(diag: &Diagnostic, context: Option<&str>) {
    if is_suppressed() {
        return;
    }

    let level = diag.kind.level();
    match context {
        Some(ctx) => log::log!(level, "[{}] {}: {}", diag.code, diag.message, ctx),
        None => log::log!(level, "[{}] {}", diag.code, diag.message),
    }

    #[cfg(any(debug_assertions, feature = "diagnostics"))]
    {
        if let Some(note) = diag.note {
            log::debug!("  note: {}", note);
        }
        if let Some(help) = diag.help {
            log::debug!("  help: {}", help);
        }
    }

    let sink = SINK.read().unwrap_or_else(|p| p.into_inner()).clone();
    if let Some(sink) = sink {
        sink.emit(diag);
    }

    let fatal = match diag.kind {
        DiagnosticKind::Error => should_panic(),
        DiagnosticKind::Warning => should_panic_on_warning(),
        DiagnosticKind::Note => false,
    };
    if fatal {
        panic!(
            "[pushbuf][{}] {}\nStrict mode enabled - diagnostics are fatal.",
            diag.code, diag.message
        );
    }
}

/// A diagnostic sink trait for custom output.
pub trait DiagnosticSink: Send + Sync {
    /// Handle a diagnostic.
    fn emit(&self, diag: &Diagnostic);
}

/// A simple sink that collects diagnostics.
#[derive(Default)]
pub struct CollectingSink {
    diagnostics: Mutex<Vec<Diagnostic>>,
}

impl CollectingSink {
    /// Create a new collecting sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all collected diagnostics.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Whether a diagnostic with `code` was collected.
    pub fn contains(&self, code: &str) -> bool {
        self.diagnostics
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .any(|d| d.code == code)
    }

    /// Clear collected diagnostics.
    pub fn clear(&self) {
        self.diagnostics.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    /// Check if any errors were collected.
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .any(|d| d.kind == DiagnosticKind::Error)
    }
}

impl DiagnosticSink for CollectingSink {
    fn emit(&self, diag: &Diagnostic) {
        self.diagnostics
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(diag.clone());
    }
}
