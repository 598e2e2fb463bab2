//! Synchronization primitives.
//!
//! Thin mutex wrapper (std or parking_lot) and relaxed atomic counters
//! used for device statistics.

pub(crate) mod atomics;
pub(crate) mod mutex;
