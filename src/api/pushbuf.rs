//! Command buffers.
//!
//! A [`PushBuf`] accumulates command words in a rotating pool of GART
//! regions and records the buffer objects, relocations and word ranges
//! ("pushes") the commands need in its current batch. Flushing hands the
//! batch to the submission queue (channel-bound buffers) or retires it until
//! the buffer is kicked on a channel (deferred buffers).
//!
//! Command buffers of one client share a reference cache. When a buffer
//! object is referenced by a sibling's unsubmitted batch, the sibling is
//! flushed first so commands reach the GPU in the order they were built.
//!
//! ## Cursor
//!
//! Positions are in 32-bit words relative to the current region:
//! `begin <= submitted <= current <= end`, where everything before
//! `submitted` already belongs to a push descriptor and `end` leaves room
//! for the suffix and the kick hook's reserved words.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::api::bo::BufferObject;
use crate::api::client::{Client, CoreRef};
use crate::api::config::SubmitMode;
use crate::api::device::Device;
use crate::api::error::{Exhaustion, PushbufError, Result};
use crate::api::flags::{BoFlags, Domain, RelocFlags};
use crate::core::krec::{BatchLimits, Krec, RefOutcome};
use crate::core::refcache::{PushBufId, RefEntry};
use crate::gpu::{ChannelId, Fence, FenceWait, KernelRef, PushDescriptor, PushSpan, Reloc, SubmitBatch};
use crate::pb_emit;
use crate::sync::mutex::Mutex;
use crate::util::size::words_in;

/// Words at the end of every region kept for the suffix.
const SUFFIX_WORDS: usize = 2;

/// One entry of a [`PushBuf::refn`] request.
#[derive(Debug, Clone, Copy)]
pub struct PushRef<'a> {
    /// Object to reference
    pub bo: &'a BufferObject,
    /// Access (`RD`/`WR`) and placement (`VRAM`/`GART`) flags
    pub flags: BoFlags,
}

impl<'a> PushRef<'a> {
    /// Reference `bo` with `flags`.
    pub fn new(bo: &'a BufferObject, flags: BoFlags) -> Self {
        Self { bo, flags }
    }
}

/// Cursor positions in words, relative to the current region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cursor {
    /// Start of the region
    pub begin: usize,
    /// Everything before this belongs to a push descriptor
    pub submitted: usize,
    /// Next word to write
    pub current: usize,
    /// Last writable position (exclusive)
    pub end: usize,
}

/// Pre-submission hook. Runs at every flush that has something to submit
/// and may write up to the reserved number of words.
pub type KickHook = Box<dyn FnMut(&mut KickWriter<'_>) + Send>;

/// Writer handed to a [`KickHook`].
pub struct KickWriter<'a> {
    core: &'a mut PushBufCore,
    limit: usize,
}

impl<'a> KickWriter<'a> {
    /// Append words in the space reserved for the hook.
    pub fn emit(&mut self, words: &[u32]) -> Result<()> {
        if self.core.cur + words.len() > self.limit {
            return Err(PushbufError::InsufficientSpace);
        }
        self.core.write_at_cursor(words)
    }

    /// Words still available to the hook.
    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.core.cur)
    }

    /// Channel of the command buffer being flushed.
    pub fn channel(&self) -> Option<ChannelId> {
        self.core.channel
    }
}

/// A submitted batch whose objects stay referenced until its fence signals.
struct InFlight {
    fence: Fence,
    bos: Vec<BufferObject>,
}

enum KrefStep {
    Done(RefOutcome),
    Foreign(PushBufId, CoreRef),
}

pub(crate) struct PushBufCore {
    id: PushBufId,
    self_ref: CoreRef,
    client: Client,
    channel: Option<ChannelId>,
    region_flags: BoFlags,
    krec: Krec<BufferObject>,
    retired: Vec<Krec<BufferObject>>,
    inflight: VecDeque<InFlight>,
    pool: Vec<BufferObject>,
    next_region: usize,
    region_size: u64,
    region: Option<BufferObject>,
    span_start: usize,
    cur: usize,
    end: usize,
    reserved: usize,
    hook: Option<KickHook>,
    rsvd_kick: usize,
    suffix: Option<[u32; 2]>,
    dumped: bool,
}

/// A command buffer.
pub struct PushBuf {
    core: Arc<Mutex<PushBufCore>>,
}

impl PushBuf {
    /// Create a command buffer.
    ///
    /// `region_count` regions of `region_size` bytes are allocated up front;
    /// with 0 they are allocated as needed. With `immediate` the buffer is
    /// bound to `channel` and every flush submits; otherwise batches are
    /// kept until [`kick`](Self::kick) names a channel.
    pub fn new(
        client: &Client,
        channel: Option<ChannelId>,
        region_count: usize,
        region_size: u64,
        immediate: bool,
    ) -> Result<Self> {
        if words_in(region_size) <= SUFFIX_WORDS {
            pb_emit!(PB102, "region of {} bytes", region_size);
            return Err(Exhaustion::RegionTooSmall.into());
        }
        let device = client.device();
        let pool = (0..region_count)
            .map(|_| new_region(device, region_size))
            .collect::<Result<Vec<_>>>()?;

        let channel = if immediate { channel } else { None };
        let id = client.next_pushbuf_id();
        log::debug!(
            "pushbuf {}:{} created, {} x {} byte regions, channel {:?}",
            client.id(),
            id.0,
            region_count,
            region_size,
            channel
        );

        let core = Arc::new_cyclic(|weak| {
            Mutex::new(PushBufCore {
                id,
                self_ref: weak.clone(),
                client: client.clone(),
                channel,
                region_flags: BoFlags::RD | BoFlags::GART,
                krec: Krec::new(),
                retired: Vec::new(),
                inflight: VecDeque::new(),
                pool,
                next_region: 0,
                region_size,
                region: None,
                span_start: 0,
                cur: 0,
                end: 0,
                reserved: 0,
                hook: None,
                rsvd_kick: 0,
                suffix: None,
                dumped: false,
            })
        });
        Ok(Self { core })
    }

    pub(crate) fn from_core(core: Arc<Mutex<PushBufCore>>) -> Self {
        Self { core }
    }

    /// Identity within the client.
    pub fn id(&self) -> PushBufId {
        self.core.lock().id
    }

    /// Bound channel, `None` for deferred buffers.
    pub fn channel(&self) -> Option<ChannelId> {
        self.core.lock().channel
    }

    /// Owning client.
    pub fn client(&self) -> Client {
        self.core.lock().client.clone()
    }

    /// Current cursor.
    pub fn cursor(&self) -> Cursor {
        let core = self.core.lock();
        Cursor {
            begin: 0,
            submitted: core.span_start,
            current: core.cur,
            end: core.end,
        }
    }

    /// Batches retired by flushes and waiting for a kick.
    pub fn pending_batches(&self) -> usize {
        self.core.lock().retired.len()
    }

    /// Submitted batches whose fence has not been seen to signal.
    pub fn in_flight(&self) -> usize {
        self.core.lock().inflight.len()
    }

    /// Buffer references in the current batch.
    pub fn referenced(&self) -> usize {
        self.core.lock().krec.entries.len()
    }

    /// Reserve room for `dwords` words, `relocs` relocations and `pushes`
    /// push descriptors, switching regions and flushing as needed.
    pub fn space(&self, dwords: usize, relocs: usize, pushes: usize) -> Result<()> {
        self.core.lock().space(dwords, relocs, pushes)
    }

    /// Write words at the cursor. Needs a prior [`space`](Self::space).
    pub fn emit(&self, words: &[u32]) -> Result<()> {
        let mut core = self.core.lock();
        core.check_reserved(words.len())?;
        core.write_at_cursor(words)
    }

    /// Reference `bo` in the current batch, single attempt.
    ///
    /// A sibling command buffer holding `bo` is flushed first. Conflicts and
    /// exhaustion are reported, not resolved.
    pub fn try_ref(&self, bo: &BufferObject, flags: BoFlags) -> Result<RefOutcome> {
        loop {
            let step = self.core.lock().kref_step(bo, flags);
            match step {
                KrefStep::Done(outcome) => return Ok(outcome),
                KrefStep::Foreign(owner, backref) => self.flush_foreign(bo.handle(), owner, backref)?,
            }
        }
    }

    /// Reference a set of objects. On failure the new references are rolled
    /// back and the whole set is retried once after a flush.
    pub fn refn(&self, refs: &[PushRef<'_>]) -> Result<()> {
        let first = self.refn_once(refs)?;
        if first.is_ok() {
            return Ok(());
        }
        {
            let mut core = self.core.lock();
            let keep = core.reserved.saturating_sub(core.cur);
            core.flush()?;
            core.space(keep, 0, 0)?;
        }
        match self.refn_once(refs)? {
            Ok(()) => Ok(()),
            Err(e) => {
                pb_emit!(PB101, "{} references: {}", refs.len(), e);
                Err(e)
            }
        }
    }

    fn refn_once(&self, refs: &[PushRef<'_>]) -> Result<std::result::Result<(), PushbufError>> {
        let (sref, srel) = {
            let core = self.core.lock();
            (core.krec.entries.len(), core.krec.relocs.len())
        };
        for r in refs {
            let outcome = match self.try_ref(r.bo, r.flags) {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.core.lock().rollback(sref, srel);
                    return Err(e);
                }
            };
            let refused = match outcome {
                RefOutcome::Inserted(_) => continue,
                RefOutcome::Conflict => PushbufError::DomainConflict,
                RefOutcome::Exhausted(why) => PushbufError::ResourceExhausted(why),
            };
            log::trace!("refn: bo {} refused ({}), rolling back", r.bo.handle(), refused);
            self.core.lock().rollback(sref, srel);
            return Ok(Err(refused));
        }
        Ok(Ok(()))
    }

    /// Record a relocation of `bo` at the cursor and write its presumed value.
    ///
    /// `flags` selects `LOW` or `HIGH` half of `bo`'s address plus `data`;
    /// with `OR`, `vor` or `tor` is OR'd in depending on the presumed domain.
    pub fn reloc(&self, bo: &BufferObject, data: u32, flags: BoFlags, vor: u32, tor: u32) -> Result<u32> {
        self.core.lock().reloc(bo, data, flags, vor, tor)
    }

    /// Close the current span; with `bo`, also push `length` bytes of `bo`
    /// at `offset` as a command range.
    pub fn data(&self, bo: Option<&BufferObject>, offset: u64, length: u64) -> Result<()> {
        self.core.lock().data(bo, offset, length)
    }

    /// Access this buffer's current batch holds on `bo` (`RD`, `WR` or empty).
    pub fn refd(&self, bo: &BufferObject) -> BoFlags {
        let core = self.core.lock();
        let Some(slot) = core.own_slot(bo.handle()) else {
            return BoFlags::empty();
        };
        core.krec
            .entries
            .get(slot)
            .map_or(BoFlags::empty(), |e| access_of(&e.kref))
    }

    /// Submit pending work.
    ///
    /// Channel-bound buffers flush on their own channel and re-reference the
    /// current region. Deferred buffers submit every retired batch and the
    /// current one to `channel`.
    pub fn kick(&self, channel: ChannelId) -> Result<()> {
        self.core.lock().kick(channel)
    }

    /// Re-reference the current region, flushing once if it does not fit.
    pub fn validate(&self) -> Result<()> {
        self.core.lock().reference_region()
    }

    /// Install a hook run before each submission, with `reserved_words`
    /// words kept free for it at the end of every region.
    pub fn on_kick<F>(&self, reserved_words: usize, hook: F) -> Result<()>
    where
        F: FnMut(&mut KickWriter<'_>) + Send + 'static,
    {
        let mut core = self.core.lock();
        if reserved_words + SUFFIX_WORDS >= words_in(core.region_size) {
            return Err(Exhaustion::RegionTooSmall.into());
        }
        if core.region.is_some() {
            let end = core.region_words() - SUFFIX_WORDS - reserved_words;
            // Words already written may not overlap the reserved tail.
            if core.cur > end {
                return Err(Exhaustion::RegionTooSmall.into());
            }
            core.end = end;
        }
        core.rsvd_kick = reserved_words;
        core.hook = Some(Box::new(hook));
        Ok(())
    }

    /// Set or clear the two words appended to every closed span.
    pub fn set_suffix(&self, words: Option<[u32; 2]>) {
        self.core.lock().suffix = words;
    }

    /// Wait for every in-flight batch of this buffer.
    pub fn wait_idle(&self) -> Result<()> {
        self.core.lock().reap_inflight(true)
    }

    fn flush_foreign(&self, handle: u32, owner: PushBufId, backref: CoreRef) -> Result<()> {
        match backref.upgrade() {
            Some(other) => {
                log::debug!("bo {} held by pushbuf {}, flushing it first", handle, owner.0);
                other.lock().flush().map_err(|e| {
                    log::warn!("flush of pushbuf {} failed: {}", owner.0, e);
                    e
                })
            }
            None => {
                let core = self.core.lock();
                core.client.shared.refs.lock().remove(handle, owner);
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for PushBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Some(core) = self.core.try_lock() else {
            return f.write_str("PushBuf { <locked> }");
        };
        f.debug_struct("PushBuf")
            .field("id", &core.id)
            .field("channel", &core.channel)
            .field("cursor", &(core.span_start, core.cur, core.end))
            .field("referenced", &core.krec.entries.len())
            .field("retired", &core.retired.len())
            .finish()
    }
}

fn new_region(device: &Device, size: u64) -> Result<BufferObject> {
    BufferObject::new(device, BoFlags::GART | BoFlags::MAP, 0, size, None)
}

fn access_of(kref: &KernelRef) -> BoFlags {
    let mut access = BoFlags::empty();
    if !kref.read_domains.is_empty() {
        access |= BoFlags::RD;
    }
    if !kref.write_domains.is_empty() {
        access |= BoFlags::WR;
    }
    access
}

impl PushBufCore {
    fn device(&self) -> &Device {
        self.client.device()
    }

    fn limits(&self) -> BatchLimits {
        self.device().shared.limits
    }

    fn region_words(&self) -> usize {
        words_in(self.region_size)
    }

    /// Words a closed span needs for its suffix.
    fn suffix_words(&self) -> usize {
        if self.suffix.is_some() {
            SUFFIX_WORDS
        } else {
            0
        }
    }

    /// Slot of `handle` in the current batch, if this buffer references it.
    fn own_slot(&self, handle: u32) -> Option<usize> {
        let refs = self.client.shared.refs.lock();
        refs.lookup(handle)
            .filter(|e| e.owner == self.id)
            .map(|e| e.slot)
    }

    fn check_reserved(&self, words: usize) -> Result<()> {
        if self.region.is_none() || self.cur + words > self.reserved.min(self.end) {
            return Err(PushbufError::InsufficientSpace);
        }
        Ok(())
    }

    fn write_at_cursor(&mut self, words: &[u32]) -> Result<()> {
        let region = self.region.as_ref().ok_or(PushbufError::InsufficientSpace)?;
        region.write_words(self.cur, words)?;
        self.cur += words.len();
        Ok(())
    }

    fn space(&mut self, dwords: usize, relocs: usize, pushes: usize) -> Result<()> {
        let region_words = self.region_words();
        let requested = dwords;
        let dwords = dwords + self.suffix_words();
        if dwords + SUFFIX_WORDS + self.rsvd_kick > region_words {
            pb_emit!(PB102, "{} words requested, region holds {}", dwords, region_words);
            return Err(Exhaustion::RegionTooSmall.into());
        }
        let limits = self.limits();
        let pushes = pushes + 1;
        if relocs > limits.max_relocs {
            return Err(Exhaustion::RelocLimit.into());
        }
        if pushes > limits.max_push {
            return Err(Exhaustion::PushLimit.into());
        }

        let mut next = None;
        if self.region.is_none() || self.cur + dwords > self.end {
            if self.next_region < self.pool.len() {
                next = Some(self.pool[self.next_region].clone());
                self.next_region += 1;
                if self.next_region == self.pool.len() && self.channel.is_some() {
                    self.next_region = 0;
                }
            } else {
                next = Some(new_region(self.device(), self.region_size)?);
            }
        }

        let region_refused = next.as_ref().map_or(false, |bo| {
            self.channel.is_some() || !self.krec.would_fit(bo.size(), Domain::GART, &limits)
        });
        let mut flushed = false;
        if region_refused
            || self.krec.relocs.len() + relocs >= limits.max_relocs
            || self.krec.pushes.len() + pushes >= limits.max_push
        {
            if self.region.is_some() && !self.krec.is_empty() {
                self.flush()?;
            }
            flushed = true;
        }

        if let Some(bo) = next {
            bo.wait_access(BoFlags::WR)?;
            self.close_span()?;
            log::debug!(
                "pushbuf {}: switching to region bo {} (flushed: {})",
                self.id.0,
                bo.handle(),
                flushed
            );
            self.region = Some(bo);
            self.span_start = 0;
            self.cur = 0;
            self.end = region_words - SUFFIX_WORDS - self.rsvd_kick;
        }

        self.reference_region()?;
        self.reserved = self.cur + requested;
        Ok(())
    }

    /// Reference the current region in the batch, flushing once on refusal.
    fn reference_region(&mut self) -> Result<()> {
        let Some(region) = self.region.clone() else {
            return Ok(());
        };
        let flags = self.region_flags;
        if self.kref_local(&region, flags).slot().is_some() {
            return Ok(());
        }
        self.flush()?;
        match self.kref_local(&region, flags) {
            RefOutcome::Inserted(_) => Ok(()),
            RefOutcome::Conflict => Err(PushbufError::DomainConflict),
            RefOutcome::Exhausted(why) => {
                pb_emit!(PB101, "command region of {} bytes", region.size());
                Err(why.into())
            }
        }
    }

    /// Look up, record and publish a reference under one hold of the client
    /// cache, so no sibling can claim `bo` in between.
    fn kref_step(&mut self, bo: &BufferObject, flags: BoFlags) -> KrefStep {
        let client = self.client.clone();
        let mut refs = client.shared.refs.lock();
        let mut domains = flags.placement();
        if domains.is_empty() {
            domains = bo.flags().placement();
        }
        if domains.is_empty() {
            domains = Domain::GART;
        }
        let read = if flags.contains(BoFlags::RD) { domains } else { Domain::empty() };
        let write = if flags.contains(BoFlags::WR) { domains } else { Domain::empty() };
        let limits = self.limits();

        if let Some(entry) = refs.lookup(bo.handle()) {
            if entry.owner != self.id {
                return KrefStep::Foreign(entry.owner, entry.backref.clone());
            }
            let slot = entry.slot;
            return KrefStep::Done(self.krec.merge(slot, domains, read, write, &limits));
        }

        let kref = KernelRef {
            handle: bo.handle(),
            valid_domains: domains,
            read_domains: read,
            write_domains: write,
            presumed_offset: bo.offset(),
            presumed_domain: if bo.flags().contains(BoFlags::VRAM) {
                Domain::VRAM
            } else {
                Domain::GART
            },
        };
        let (outcome, _) = self.krec.insert(kref, bo.size(), bo.clone(), &limits);
        if let RefOutcome::Inserted(slot) = outcome {
            let published = refs.set(RefEntry {
                handle: bo.handle(),
                slot,
                owner: self.id,
                backref: self.self_ref.clone(),
            });
            if let Err(owner) = published {
                log::warn!("bo {} claimed by pushbuf {} during insert", bo.handle(), owner.0);
                let relocs = self.krec.relocs.len();
                drop(self.krec.rollback(slot, relocs));
                return KrefStep::Done(RefOutcome::Conflict);
            }
            log::trace!("pushbuf {}: bo {} -> slot {} ({:?})", self.id.0, bo.handle(), slot, domains);
        }
        KrefStep::Done(outcome)
    }

    /// Record a reference to a buffer this one owns, such as its region.
    /// A sibling's claim on `bo` reads as a conflict.
    fn kref_local(&mut self, bo: &BufferObject, flags: BoFlags) -> RefOutcome {
        match self.kref_step(bo, flags) {
            KrefStep::Done(outcome) => outcome,
            KrefStep::Foreign(owner, _) => {
                log::debug!("bo {} is held by pushbuf {}", bo.handle(), owner.0);
                RefOutcome::Conflict
            }
        }
    }

    fn rollback(&mut self, sref: usize, srel: usize) {
        let removed = self.krec.rollback(sref, srel);
        {
            let mut refs = self.client.shared.refs.lock();
            for entry in removed.iter() {
                refs.remove(entry.kref.handle, self.id);
            }
        }
        drop(removed);
    }

    fn reloc(&mut self, bo: &BufferObject, data: u32, flags: BoFlags, vor: u32, tor: u32) -> Result<u32> {
        self.check_reserved(1)?;
        let region = self.region.as_ref().map(|r| r.handle()).ok_or(PushbufError::InsufficientSpace)?;
        let pslot = self.own_slot(region).ok_or(PushbufError::NotReferenced)?;
        let bslot = self.own_slot(bo.handle()).ok_or(PushbufError::NotReferenced)?;
        if self.krec.relocs.len() >= self.limits().max_relocs {
            return Err(Exhaustion::RelocLimit.into());
        }

        let target = self.krec.entries[bslot].kref;
        let address = target.presumed_offset + data as u64;
        let mut value = data;
        let mut rflags = RelocFlags::empty();
        if flags.contains(BoFlags::LOW) {
            value = address as u32;
            rflags |= RelocFlags::LOW;
        } else if flags.contains(BoFlags::HIGH) {
            value = (address >> 32) as u32;
            rflags |= RelocFlags::HIGH;
        }
        if flags.contains(BoFlags::OR) {
            value |= if target.presumed_domain.contains(Domain::VRAM) { vor } else { tor };
            rflags |= RelocFlags::OR;
        }

        self.krec.relocs.push(Reloc {
            reloc_bo_index: pslot as u32,
            reloc_bo_offset: (self.cur * 4) as u32,
            bo_index: bslot as u32,
            flags: rflags,
            data,
            vor,
            tor,
        });
        self.write_at_cursor(&[value])?;
        Ok(value)
    }

    fn data(&mut self, bo: Option<&BufferObject>, offset: u64, length: u64) -> Result<()> {
        self.close_span()?;
        if let Some(bo) = bo {
            let slot = self.own_slot(bo.handle()).ok_or(PushbufError::NotReferenced)?;
            if self.krec.pushes.len() >= self.limits().max_push {
                return Err(Exhaustion::PushLimit.into());
            }
            self.krec.pushes.push(PushDescriptor {
                bo_index: slot as u32,
                offset,
                length,
            });
        }
        Ok(())
    }

    /// Turn the words written since the last close into a push descriptor.
    fn close_span(&mut self) -> Result<()> {
        let Some(region) = self.region.clone() else {
            return Ok(());
        };
        if self.cur == self.span_start {
            return Ok(());
        }
        if let Some(suffix) = self.suffix {
            region.write_words(self.cur, &suffix)?;
            self.cur += SUFFIX_WORDS;
        }

        let start = self.span_start;
        self.span_start = self.cur;
        let slot = match self.own_slot(region.handle()) {
            Some(slot) => Some(slot),
            None => self.kref_local(&region, self.region_flags).slot(),
        };
        let Some(slot) = slot else {
            pb_emit!(PB901, "pushbuf {}: span {}..{} dropped", self.id.0, start, self.cur);
            return Err(PushbufError::NotReferenced);
        };
        if self.krec.pushes.len() >= self.limits().max_push {
            return Err(Exhaustion::PushLimit.into());
        }
        self.krec.pushes.push(PushDescriptor {
            bo_index: slot as u32,
            offset: (start * 4) as u64,
            length: ((self.cur - start) * 4) as u64,
        });
        Ok(())
    }

    fn run_hook(&mut self) {
        if self.region.is_none() || (self.cur == self.span_start && self.krec.pushes.is_empty()) {
            return;
        }
        let Some(mut hook) = self.hook.take() else {
            return;
        };
        let limit = self.end + self.rsvd_kick;
        hook(&mut KickWriter { core: &mut *self, limit });
        self.hook = Some(hook);
    }

    /// Remove this buffer's cache entries for the objects of `krec`.
    fn release_cache(&self, krec: &Krec<BufferObject>) {
        let mut refs = self.client.shared.refs.lock();
        for entry in krec.entries.iter() {
            refs.remove(entry.kref.handle, self.id);
        }
    }

    /// Close the current batch: submit it, or retire it on deferred buffers.
    /// The batch is always reset and its cache entries removed.
    fn flush(&mut self) -> Result<()> {
        self.device().shared.stats.flushes.increment();
        self.run_hook();
        let span = self.close_span();
        if let Err(e) = self.reap_inflight(false) {
            log::debug!("pushbuf {}: reaping in-flight batches failed: {}", self.id.0, e);
        }

        let krec = std::mem::take(&mut self.krec);
        self.release_cache(&krec);
        let result = match self.channel {
            Some(channel) => self.submit(channel, krec),
            None => {
                if !krec.pushes.is_empty() {
                    log::debug!("pushbuf {}: retiring batch of {} pushes", self.id.0, krec.pushes.len());
                    self.retired.push(krec);
                }
                Ok(())
            }
        };
        result.and(span)
    }

    /// Hand `krec` to the queue. Its references are released when this
    /// returns, or once its fence signals in asynchronous mode.
    fn submit(&mut self, channel: ChannelId, krec: Krec<BufferObject>) -> Result<()> {
        if krec.pushes.is_empty() {
            return Ok(());
        }
        let device = self.device().clone();
        let shared = &device.shared;

        let submitted = {
            let buffers: Vec<KernelRef> = krec.entries.iter().map(|e| e.kref).collect();
            let spans: Vec<PushSpan<'_>> = krec
                .pushes
                .iter()
                .map(|p| PushSpan {
                    desc: *p,
                    words: krec
                        .entries
                        .get(p.bo_index as usize)
                        .and_then(|e| e.obj.words(p.offset, p.length)),
                })
                .collect();
            let batch = SubmitBatch {
                buffers: &buffers,
                relocs: &krec.relocs,
                pushes: &spans,
            };
            log::debug!(
                "pushbuf {}: submitting {} buffers, {} relocs, {} pushes on {}",
                self.id.0,
                buffers.len(),
                krec.relocs.len(),
                spans.len(),
                channel
            );
            shared.queue.submit(channel, &batch)
        };

        let fence = match submitted {
            Ok(fence) => fence,
            Err(e) => {
                shared.stats.rejections.increment();
                if !self.dumped {
                    self.dumped = true;
                    dump(self.id, &krec);
                }
                pb_emit!(PB001, "pushbuf {} on {}: {}", self.id.0, channel, e);
                return Err(e.into());
            }
        };
        shared.stats.submissions.increment();

        let bos: Vec<BufferObject> = krec
            .entries
            .into_iter()
            .map(|e| {
                e.obj.attach_fence(fence, access_of(&e.kref));
                e.obj
            })
            .collect();

        match shared.config.submit_mode {
            SubmitMode::Asynchronous => {
                self.inflight.push_back(InFlight { fence, bos });
                Ok(())
            }
            SubmitMode::Synchronous => {
                shared.stats.fence_waits.increment();
                match shared.queue.wait_fence(fence, shared.config.fence_timeout) {
                    Ok(FenceWait::Signaled) => {
                        for bo in bos.iter() {
                            bo.clear_fence_if(fence);
                        }
                        Ok(())
                    }
                    Ok(FenceWait::TimedOut) => {
                        pb_emit!(PB003, "fence {}:{}", fence.id, fence.value);
                        self.inflight.push_back(InFlight { fence, bos });
                        Ok(())
                    }
                    Err(e) => {
                        log::warn!("pushbuf {}: waiting for fence failed: {}", self.id.0, e);
                        self.inflight.push_back(InFlight { fence, bos });
                        Err(PushbufError::TryAgain)
                    }
                }
            }
        }
    }

    fn kick(&mut self, channel: ChannelId) -> Result<()> {
        let result = self.flush();
        if self.channel.is_none() {
            let mut retired = std::mem::take(&mut self.retired).into_iter();
            let mut result = result;
            while let Some(krec) = retired.next() {
                if let Err(e) = self.submit(channel, krec) {
                    self.retired.extend(retired);
                    result = result.and(Err(e));
                    break;
                }
            }
            return result.and(self.reference_region());
        }
        if Some(channel) != self.channel {
            log::trace!("pushbuf {}: kick on {} ignored, bound to {:?}", self.id.0, channel, self.channel);
        }
        result.and(self.reference_region())
    }

    /// Drop in-flight batches whose fence has signaled; with `block`, wait
    /// for all of them.
    fn reap_inflight(&mut self, block: bool) -> Result<()> {
        let shared = self.client.device().shared.clone();
        let timeout = if block {
            shared.config.fence_timeout
        } else {
            Some(Duration::ZERO)
        };
        while let Some(front) = self.inflight.front() {
            shared.stats.fence_waits.increment();
            match shared.queue.wait_fence(front.fence, timeout) {
                Ok(FenceWait::Signaled) => {
                    if let Some(done) = self.inflight.pop_front() {
                        for bo in done.bos.iter() {
                            bo.clear_fence_if(done.fence);
                        }
                    }
                }
                Ok(FenceWait::TimedOut) if block => return Err(PushbufError::TryAgain),
                Ok(FenceWait::TimedOut) => break,
                Err(e) => {
                    log::warn!("pushbuf {}: in-flight fence wait failed: {}", self.id.0, e);
                    return Err(PushbufError::TryAgain);
                }
            }
        }
        Ok(())
    }
}

impl Drop for PushBufCore {
    fn drop(&mut self) {
        if self.channel.is_some() {
            if let Err(e) = self.flush() {
                log::warn!("pushbuf {}: final flush failed: {}", self.id.0, e);
            }
        }
        if let Err(e) = self.reap_inflight(true) {
            log::warn!("pushbuf {}: {} batches still in flight at teardown: {}", self.id.0, self.inflight.len(), e);
        }
        self.inflight.clear();

        let mut discarded = self.retired.len();
        if !self.krec.pushes.is_empty() || self.cur != self.span_start {
            discarded += 1;
        }
        if self.channel.is_none() && discarded > 0 {
            pb_emit!(PB002, "pushbuf {}: {} batches", self.id.0, discarded);
        }
        self.retired.clear();

        self.client.shared.refs.lock().remove_owner(self.id);
        drop(self.krec.reset());
        self.region = None;
        self.pool.clear();
        log::debug!("pushbuf {} destroyed", self.id.0);
    }
}

fn dump(id: PushBufId, krec: &Krec<BufferObject>) {
    if !log::log_enabled!(log::Level::Debug) {
        return;
    }
    log::debug!("pushbuf {}: rejected batch", id.0);
    for (i, entry) in krec.entries.iter().enumerate() {
        let k = &entry.kref;
        log::debug!(
            "  buffer {}: handle {} valid {:?} read {:?} write {:?} presumed {:#x}",
            i,
            k.handle,
            k.valid_domains,
            k.read_domains,
            k.write_domains,
            k.presumed_offset
        );
    }
    for (i, r) in krec.relocs.iter().enumerate() {
        log::debug!(
            "  reloc {}: buffer {} offset {:#x} -> buffer {} {:?} data {:#x}",
            i,
            r.reloc_bo_index,
            r.reloc_bo_offset,
            r.bo_index,
            r.flags,
            r.data
        );
    }
    for (i, p) in krec.pushes.iter().enumerate() {
        log::debug!("  push {}: buffer {} offset {:#x} length {}", i, p.bo_index, p.offset, p.length);
        let words = krec
            .entries
            .get(p.bo_index as usize)
            .and_then(|e| e.obj.words(p.offset, p.length));
        if let Some(words) = words {
            for row in words.chunks(8) {
                let line: Vec<String> = row.iter().map(|w| format!("{:08x}", w)).collect();
                log::debug!("    {}", line.join(" "));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::config::DeviceConfig;
    use crate::gpu::{DummyAllocator, DummyQueue};

    struct Rig {
        device: Device,
        queue: Arc<DummyQueue>,
        client: Client,
        channel: ChannelId,
    }

    fn rig(config: DeviceConfig) -> Rig {
        let queue = Arc::new(DummyQueue::new());
        let channel = queue.open_channel();
        let device = Device::new(Arc::new(DummyAllocator::new()), queue.clone(), config);
        let client = device.client().unwrap();
        Rig { device, queue, client, channel }
    }

    fn bound(rig: &Rig, regions: usize, size: u64) -> PushBuf {
        PushBuf::new(&rig.client, Some(rig.channel), regions, size, true).unwrap()
    }

    #[test]
    fn test_emit_requires_space() {
        let rig = rig(DeviceConfig::minimal());
        let push = bound(&rig, 1, 4096);
        assert_eq!(push.emit(&[1]).unwrap_err(), PushbufError::InsufficientSpace);

        push.space(4, 0, 0).unwrap();
        push.emit(&[1, 2, 3, 4]).unwrap();
        assert_eq!(push.emit(&[5]).unwrap_err(), PushbufError::InsufficientSpace);
    }

    #[test]
    fn test_cursor_invariant() {
        let rig = rig(DeviceConfig::minimal());
        let push = bound(&rig, 2, 4096);
        for i in 0..300 {
            push.space(10, 0, 0).unwrap();
            let c = push.cursor();
            assert!(c.begin <= c.submitted && c.submitted <= c.current && c.current <= c.end);
            assert!(c.current + 10 <= c.end, "iteration {}", i);
            push.emit(&[i; 10]).unwrap();
        }
    }

    #[test]
    fn test_region_too_small() {
        let rig = rig(DeviceConfig::minimal());
        assert!(PushBuf::new(&rig.client, Some(rig.channel), 0, 8, true).is_err());
        let push = bound(&rig, 1, 64);
        assert_eq!(
            push.space(15, 0, 0).unwrap_err(),
            PushbufError::ResourceExhausted(Exhaustion::RegionTooSmall)
        );
        push.space(14, 0, 0).unwrap();
    }

    #[test]
    fn test_kick_submits_words() {
        let rig = rig(DeviceConfig::minimal());
        let push = bound(&rig, 1, 4096);
        push.space(3, 0, 0).unwrap();
        push.emit(&[0xa, 0xb, 0xc]).unwrap();
        push.kick(rig.channel).unwrap();

        let subs = rig.queue.submissions();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].words, vec![0xa, 0xb, 0xc]);
        assert_eq!(subs[0].pushes[0].length, 12);
        let c = push.cursor();
        assert_eq!(c.submitted, c.current);
    }

    #[test]
    fn test_empty_kick_submits_nothing() {
        let rig = rig(DeviceConfig::minimal());
        let push = bound(&rig, 1, 4096);
        push.kick(rig.channel).unwrap();
        push.space(0, 0, 0).unwrap();
        push.kick(rig.channel).unwrap();
        assert_eq!(rig.queue.submission_count(), 0);
    }

    #[test]
    fn test_suffix_and_hook() {
        let rig = rig(DeviceConfig::minimal());
        let push = bound(&rig, 1, 4096);
        push.set_suffix(Some([0xfeed, 0xface]));
        push.on_kick(2, |w: &mut KickWriter<'_>| {
            assert!(w.remaining() >= 2);
            w.emit(&[0x77, 0x78]).unwrap();
        })
        .unwrap();

        push.space(1, 0, 0).unwrap();
        assert_eq!(push.cursor().end, 1024 - 2 - 2);
        push.emit(&[0x1]).unwrap();
        push.kick(rig.channel).unwrap();

        let subs = rig.queue.submissions();
        assert_eq!(subs[0].words, vec![0x1, 0x77, 0x78, 0xfeed, 0xface]);
    }

    #[test]
    fn test_hook_reservation_cannot_overlap_written_words() {
        let rig = rig(DeviceConfig::minimal());
        let push = bound(&rig, 1, 4096);
        push.space(1000, 0, 0).unwrap();
        push.emit(&vec![0x5; 1000]).unwrap();

        let err = push.on_kick(100, |w: &mut KickWriter<'_>| {
            w.emit(&[0xdead]).unwrap();
        });
        assert_eq!(err.unwrap_err(), PushbufError::ResourceExhausted(Exhaustion::RegionTooSmall));
        assert_eq!(push.cursor().current, 1000);
        assert_eq!(push.cursor().end, 1024 - 2);

        push.kick(rig.channel).unwrap();
        let subs = rig.queue.submissions();
        assert_eq!(subs[0].words.len(), 1000);
        assert!(!subs[0].words.contains(&0xdead));
    }

    #[test]
    fn test_reloc_values() {
        let rig = rig(DeviceConfig::minimal());
        let push = bound(&rig, 1, 4096);
        let vram = BufferObject::new(&rig.device, BoFlags::VRAM, 0, 4096, None).unwrap();
        push.space(3, 3, 0).unwrap();
        push.refn(&[PushRef::new(&vram, BoFlags::VRAM | BoFlags::RD)]).unwrap();

        let low = push.reloc(&vram, 0x10, BoFlags::LOW, 0, 0).unwrap();
        assert_eq!(low, (vram.offset() + 0x10) as u32);
        let high = push.reloc(&vram, 0, BoFlags::HIGH, 0, 0).unwrap();
        assert_eq!(high, (vram.offset() >> 32) as u32);
        let or = push.reloc(&vram, 0x4, BoFlags::OR, 0x100, 0x200).unwrap();
        assert_eq!(or, 0x104);
        push.kick(rig.channel).unwrap();

        let sub = &rig.queue.submissions()[0];
        assert_eq!(sub.relocs.len(), 3);
        assert_eq!(sub.relocs[1].reloc_bo_offset, 4);
        assert_eq!(sub.relocs[2].flags, RelocFlags::OR);
        assert_eq!(sub.buffers[sub.relocs[0].bo_index as usize].handle, vram.handle());
    }

    #[test]
    fn test_reloc_requires_reference() {
        let rig = rig(DeviceConfig::minimal());
        let push = bound(&rig, 1, 4096);
        let bo = BufferObject::new(&rig.device, BoFlags::GART, 0, 4096, None).unwrap();
        push.space(1, 1, 0).unwrap();
        assert_eq!(
            push.reloc(&bo, 0, BoFlags::LOW, 0, 0).unwrap_err(),
            PushbufError::NotReferenced
        );
        assert_eq!(push.data(Some(&bo), 0, 4).unwrap_err(), PushbufError::NotReferenced);
    }

    #[test]
    fn test_refd_reports_access() {
        let rig = rig(DeviceConfig::minimal());
        let push = bound(&rig, 1, 4096);
        let bo = BufferObject::new(&rig.device, BoFlags::GART, 0, 4096, None).unwrap();
        assert!(push.refd(&bo).is_empty());
        push.try_ref(&bo, BoFlags::RD).unwrap();
        assert_eq!(push.refd(&bo), BoFlags::RD);
        push.try_ref(&bo, BoFlags::WR).unwrap();
        assert_eq!(push.refd(&bo), BoFlags::RDWR);
    }

    #[test]
    fn test_conflict_outcome() {
        let rig = rig(DeviceConfig::minimal());
        let push = bound(&rig, 1, 4096);
        let bo = BufferObject::new(&rig.device, BoFlags::APER, 0, 4096, None).unwrap();
        assert!(push.try_ref(&bo, BoFlags::VRAM | BoFlags::RD).unwrap().slot().is_some());
        assert_eq!(push.try_ref(&bo, BoFlags::GART | BoFlags::RD).unwrap(), RefOutcome::Conflict);
    }

    #[test]
    fn test_data_push_of_user_buffer() {
        let rig = rig(DeviceConfig::minimal());
        let push = bound(&rig, 1, 4096);
        let ib = BufferObject::new(&rig.device, BoFlags::GART | BoFlags::MAP, 0, 4096, None).unwrap();
        ib.write(0, &[1, 0, 0, 0, 2, 0, 0, 0]).unwrap();

        push.space(2, 0, 1).unwrap();
        push.emit(&[0x10, 0x11]).unwrap();
        push.try_ref(&ib, BoFlags::RD | BoFlags::GART).unwrap();
        push.data(Some(&ib), 0, 8).unwrap();
        push.kick(rig.channel).unwrap();

        let sub = &rig.queue.submissions()[0];
        assert_eq!(sub.pushes.len(), 2);
        assert_eq!(sub.words, vec![0x10, 0x11, 1, 2]);
    }

    #[test]
    fn test_rejection_releases_and_reports() {
        let rig = rig(DeviceConfig::minimal());
        let push = bound(&rig, 1, 4096);
        let bo = BufferObject::new(&rig.device, BoFlags::GART, 0, 4096, None).unwrap();
        push.space(1, 0, 0).unwrap();
        push.try_ref(&bo, BoFlags::WR).unwrap();
        push.emit(&[0xbad]).unwrap();
        assert_eq!(bo.ref_count(), 2);

        rig.queue.reject_next(-22);
        let err = push.kick(rig.channel).unwrap_err();
        assert!(matches!(err, PushbufError::SubmissionRejected(_)));
        assert_eq!(bo.ref_count(), 1);
        assert!(bo.syncpoint().is_none());
        assert_eq!(rig.client.referenced_count(), 1);
        assert_eq!(rig.device.stats().rejections, 1);
    }

    #[test]
    fn test_async_inflight_and_wait_idle() {
        let config = DeviceConfig::minimal().with_submit_mode(SubmitMode::Asynchronous);
        let rig = rig(config);
        let push = bound(&rig, 1, 4096);
        let bo = BufferObject::new(&rig.device, BoFlags::GART, 0, 4096, None).unwrap();
        push.space(1, 0, 0).unwrap();
        push.try_ref(&bo, BoFlags::WR).unwrap();
        push.emit(&[1]).unwrap();
        push.kick(rig.channel).unwrap();

        assert_eq!(push.in_flight(), 1);
        assert_eq!(bo.ref_count(), 2);
        assert!(bo.syncpoint().is_some());

        push.wait_idle().unwrap();
        assert_eq!(push.in_flight(), 0);
        assert_eq!(bo.ref_count(), 1);
        assert!(bo.syncpoint().is_none());
    }

    #[test]
    fn test_deferred_buffer_retires_until_kick() {
        let rig = rig(DeviceConfig::minimal());
        let push = PushBuf::new(&rig.client, None, 0, 4096, false).unwrap();
        assert!(push.channel().is_none());
        push.space(2, 0, 0).unwrap();
        push.emit(&[5, 6]).unwrap();
        push.validate().unwrap();
        assert_eq!(rig.queue.submission_count(), 0);

        push.kick(rig.channel).unwrap();
        assert_eq!(rig.queue.submission_count(), 1);
        assert_eq!(rig.queue.submissions()[0].words, vec![5, 6]);
        assert_eq!(push.pending_batches(), 0);
    }
}
