//! Engine internals: reference cache, batch records and deferred reclamation.

pub(crate) mod krec;
pub(crate) mod reclaim;
pub(crate) mod refcache;
