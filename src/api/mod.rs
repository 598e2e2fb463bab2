//! Public API for pushbuf.
//!
//! This module contains all user-facing types.
//! Most users should only interact with types re-exported at the crate root.

pub mod bo;
pub mod client;
pub mod config;
pub mod device;
pub mod error;
pub mod flags;
pub mod pushbuf;
pub mod stats;
