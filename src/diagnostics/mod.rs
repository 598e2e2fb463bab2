//! Coded runtime diagnostics.
//!
//! ## Diagnostic Codes
//!
//! | Code  | Meaning                          |
//! |-------|----------------------------------|
//! | PB0xx | Submission                       |
//! | PB1xx | Batch bounds and domain budgets  |
//! | PB2xx | Fences and reclamation           |
//! | PB9xx | Internal errors                  |
//!
//! Diagnostics are logged through `log` and forwarded to an optional global
//! [`DiagnosticSink`]. Set `PUSHBUF_STRICT=1` (and call [`init_from_env`]) to
//! turn error diagnostics into panics.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pushbuf::diagnostics::{set_sink, CollectingSink};
//! use std::sync::Arc;
//!
//! let sink = Arc::new(CollectingSink::new());
//! set_sink(sink.clone());
//! // ... drive command buffers ...
//! assert!(!sink.has_errors());
//! ```

pub mod emit;
pub mod kind;
pub mod macros;
pub mod strict;

pub use emit::{clear_sink, emit, emit_with_context, set_sink, suppress_diagnostics, CollectingSink, DiagnosticSink};
pub use kind::{Diagnostic, DiagnosticKind};
pub use strict::{init_from_env, set_strict_mode, strict_mode, StrictMode, StrictModeGuard};

pub use kind::{PB001, PB002, PB003, PB101, PB102, PB201, PB202, PB901};
