//! Submission batch ("krec") and domain placement.
//!
//! A batch holds bounded arrays of buffer references, relocations and push
//! descriptors together with the bytes it charges to each memory domain.
//! Placement never lets a batch exceed the device's per-batch budgets; a
//! refused placement is resolved by the caller with a flush.

use crate::api::error::Exhaustion;
use crate::api::flags::Domain;
use crate::gpu::{KernelRef, PushDescriptor, Reloc};

/// Per-batch bounds and domain budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    /// VRAM bytes one batch may reference
    pub vram: u64,
    /// GART bytes one batch may reference
    pub gart: u64,
    /// Buffer references per batch
    pub max_buffers: usize,
    /// Relocations per batch
    pub max_relocs: usize,
    /// Push descriptors per batch
    pub max_push: usize,
}

/// Result of recording a buffer reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefOutcome {
    /// Recorded (new or merged) in this batch slot
    Inserted(usize),
    /// The requested domains are disjoint from those already recorded
    Conflict,
    /// A bound or budget refused the reference
    Exhausted(Exhaustion),
}

impl RefOutcome {
    /// Slot index on success.
    pub fn slot(self) -> Option<usize> {
        match self {
            RefOutcome::Inserted(slot) => Some(slot),
            _ => None,
        }
    }
}

/// A buffer reference together with what the batch keeps alive for it.
#[derive(Debug)]
pub(crate) struct KrecEntry<O> {
    pub kref: KernelRef,
    pub size: u64,
    pub obj: O,
}

impl<O> KrecEntry<O> {
    /// Charged to VRAM only when VRAM is the single valid domain.
    fn charges_vram(&self) -> bool {
        self.kref.valid_domains == Domain::VRAM
    }
}

#[derive(Debug)]
pub(crate) struct Krec<O> {
    pub entries: Vec<KrecEntry<O>>,
    pub relocs: Vec<Reloc>,
    pub pushes: Vec<PushDescriptor>,
    pub vram_used: u64,
    pub gart_used: u64,
}

impl<O> Krec<O> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            relocs: Vec::new(),
            pushes: Vec::new(),
            vram_used: 0,
            gart_used: 0,
        }
    }

    /// Place a new object of `size` bytes, possibly narrowing `domains`.
    ///
    /// VRAM-only objects charge VRAM. Everything else charges GART; when GART
    /// is full a VRAM|GART object falls back to VRAM, and as a last resort
    /// already-recorded VRAM|GART references migrate to VRAM to free GART.
    pub fn fits(&mut self, size: u64, domains: &mut Domain, limits: &BatchLimits) -> bool {
        if *domains == Domain::VRAM {
            if self.vram_used + size > limits.vram {
                return false;
            }
            self.vram_used += size;
            return true;
        }

        if self.gart_used + size <= limits.gart {
            self.gart_used += size;
            return true;
        }

        if domains.contains(Domain::VRAM) && self.vram_used + size <= limits.vram {
            *domains = Domain::VRAM;
            self.vram_used += size;
            return true;
        }

        // Migration is only started when it is known to make room.
        if !self.would_fit(size, *domains, limits) {
            return false;
        }
        for entry in self.entries.iter_mut() {
            let valid = entry.kref.valid_domains;
            if !valid.contains(Domain::VRAM | Domain::GART) {
                continue;
            }
            if self.vram_used + entry.size > limits.vram {
                continue;
            }
            entry.kref.valid_domains = Domain::VRAM;
            self.gart_used -= entry.size;
            self.vram_used += entry.size;
            log::trace!("migrated handle {} to VRAM", entry.kref.handle);

            if self.gart_used + size <= limits.gart {
                self.gart_used += size;
                return true;
            }
        }
        false
    }

    /// Whether [`fits`](Self::fits) would succeed, without changing anything.
    pub fn would_fit(&self, size: u64, domains: Domain, limits: &BatchLimits) -> bool {
        if domains == Domain::VRAM {
            return self.vram_used + size <= limits.vram;
        }
        if self.gart_used + size <= limits.gart {
            return true;
        }
        if domains.contains(Domain::VRAM) && self.vram_used + size <= limits.vram {
            return true;
        }
        let mut vram = self.vram_used;
        let mut gart = self.gart_used;
        for entry in self.entries.iter() {
            if !entry.kref.valid_domains.contains(Domain::VRAM | Domain::GART) {
                continue;
            }
            if vram + entry.size > limits.vram {
                continue;
            }
            gart -= entry.size;
            vram += entry.size;
            if gart + size <= limits.gart {
                return true;
            }
        }
        false
    }

    /// Merge a repeat reference into `slot`.
    pub fn merge(
        &mut self,
        slot: usize,
        domains: Domain,
        read: Domain,
        write: Domain,
        limits: &BatchLimits,
    ) -> RefOutcome {
        let Some(entry) = self.entries.get_mut(slot) else {
            return RefOutcome::Conflict;
        };
        if !entry.kref.valid_domains.intersects(domains) {
            return RefOutcome::Conflict;
        }
        if entry.kref.valid_domains.contains(Domain::GART) && domains == Domain::VRAM {
            if self.vram_used + entry.size > limits.vram {
                return RefOutcome::Exhausted(Exhaustion::VramBudget);
            }
            self.vram_used += entry.size;
            self.gart_used -= entry.size;
        }
        entry.kref.valid_domains &= domains;
        entry.kref.read_domains |= read;
        entry.kref.write_domains |= write;
        RefOutcome::Inserted(slot)
    }

    /// Append a new reference. `kref.valid_domains` may be narrowed by placement.
    pub fn insert(&mut self, mut kref: KernelRef, size: u64, obj: O, limits: &BatchLimits) -> (RefOutcome, Option<O>) {
        if self.entries.len() >= limits.max_buffers {
            return (RefOutcome::Exhausted(Exhaustion::BufferLimit), Some(obj));
        }
        let mut domains = kref.valid_domains;
        if !self.fits(size, &mut domains, limits) {
            let which = if domains == Domain::VRAM {
                Exhaustion::VramBudget
            } else {
                Exhaustion::GartBudget
            };
            return (RefOutcome::Exhausted(which), Some(obj));
        }
        kref.valid_domains = domains;
        self.entries.push(KrecEntry { kref, size, obj });
        (RefOutcome::Inserted(self.entries.len() - 1), None)
    }

    /// Drop buffer references from `sref` on and relocations from `srel` on.
    pub fn rollback(&mut self, sref: usize, srel: usize) -> Vec<KrecEntry<O>> {
        let removed: Vec<_> = if sref < self.entries.len() {
            self.entries.drain(sref..).collect()
        } else {
            Vec::new()
        };
        for entry in removed.iter() {
            if entry.charges_vram() {
                self.vram_used -= entry.size;
            } else {
                self.gart_used -= entry.size;
            }
        }
        self.relocs.truncate(srel);
        removed
    }

    /// Empty the batch, handing back its references.
    pub fn reset(&mut self) -> Vec<KrecEntry<O>> {
        self.relocs.clear();
        self.pushes.clear();
        self.vram_used = 0;
        self.gart_used = 0;
        std::mem::take(&mut self.entries)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.pushes.is_empty()
    }
}

impl<O> Default for Krec<O> {
    fn default() -> Self {
        Self::new()
    }
}
