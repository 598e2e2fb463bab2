//! Diagnostic macros.

/// Emit a predefined diagnostic by code, optionally with formatted context.
///
/// # Example
///
/// ```rust,ignore
/// pb_emit!(PB001);
/// pb_emit!(PB001, "channel {} rejected batch with {} pushes", ch, n);
/// ```
#[macro_export]
macro_rules! pb_emit {
    ($code:ident) => {{
        $crate::diagnostics::emit::emit(&$crate::diagnostics::$code);
    }};
    ($code:ident, $($arg:tt)+) => {{
        $crate::diagnostics::emit::emit_with_context(
            &$crate::diagnostics::$code,
            &format!($($arg)+),
        );
    }};
}

/// Assert a condition or emit a diagnostic.
///
/// # Example
///
/// ```rust,ignore
/// pb_assert!(region_referenced, PB901);
/// ```
#[macro_export]
macro_rules! pb_assert {
    ($cond:expr, $code:ident) => {{
        if !$cond {
            $crate::pb_emit!($code);
        }
    }};
    ($cond:expr, $code:ident, $($arg:tt)+) => {{
        if !$cond {
            $crate::pb_emit!($code, $($arg)+);
        }
    }};
}
