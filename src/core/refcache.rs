//! Per-client buffer reference cache.
//!
//! Maps a buffer object handle to the slot it occupies in the batch of the
//! command buffer that currently references it. A fixed bucket table with
//! chaining; at most one entry per handle.

/// Number of hash buckets.
pub const BUCKETS: usize = 64;

/// Identity of a command buffer within a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PushBufId(pub u64);

/// One cache entry.
#[derive(Debug, Clone)]
pub(crate) struct RefEntry<B> {
    /// Buffer object handle
    pub handle: u32,
    /// Slot in the owner's current batch
    pub slot: usize,
    /// Owning command buffer
    pub owner: PushBufId,
    /// Non-owning back-reference to the owner
    pub backref: B,
}

/// Bucket hash table of [`RefEntry`].
#[derive(Debug)]
pub(crate) struct ClientRefCache<B> {
    buckets: Vec<Vec<RefEntry<B>>>,
    len: usize,
}

impl<B> ClientRefCache<B> {
    pub fn new() -> Self {
        Self {
            buckets: (0..BUCKETS).map(|_| Vec::new()).collect(),
            len: 0,
        }
    }

    #[inline]
    fn bucket(handle: u32) -> usize {
        handle as usize % BUCKETS
    }

    pub fn lookup(&self, handle: u32) -> Option<&RefEntry<B>> {
        self.buckets[Self::bucket(handle)]
            .iter()
            .find(|e| e.handle == handle)
    }

    /// Insert, or update the existing entry for the same handle and owner.
    ///
    /// An entry held by another command buffer is left alone and its owner
    /// returned.
    pub fn set(&mut self, entry: RefEntry<B>) -> Result<(), PushBufId> {
        let bucket = &mut self.buckets[Self::bucket(entry.handle)];
        match bucket.iter_mut().find(|e| e.handle == entry.handle) {
            Some(existing) if existing.owner != entry.owner => Err(existing.owner),
            Some(existing) => {
                *existing = entry;
                Ok(())
            }
            None => {
                bucket.push(entry);
                self.len += 1;
                Ok(())
            }
        }
    }

    /// Remove the entry for `handle` if `owner` holds it.
    pub fn remove(&mut self, handle: u32, owner: PushBufId) -> bool {
        let bucket = &mut self.buckets[Self::bucket(handle)];
        match bucket
            .iter()
            .position(|e| e.handle == handle && e.owner == owner)
        {
            Some(pos) => {
                bucket.swap_remove(pos);
                self.len -= 1;
                true
            }
            None => false,
        }
    }

    /// Remove every entry held by `owner`.
    pub fn remove_owner(&mut self, owner: PushBufId) -> usize {
        let mut removed = 0;
        for bucket in self.buckets.iter_mut() {
            let before = bucket.len();
            bucket.retain(|e| e.owner != owner);
            removed += before - bucket.len();
        }
        self.len -= removed;
        removed
    }

    pub fn clear_all(&mut self) {
        for bucket in self.buckets.iter_mut() {
            bucket.clear();
        }
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<B> Default for ClientRefCache<B> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(handle: u32, slot: usize, owner: u64) -> RefEntry<()> {
        RefEntry { handle, slot, owner: PushBufId(owner), backref: () }
    }

    #[test]
    fn test_set_updates_in_place() {
        let mut cache = ClientRefCache::new();
        cache.set(entry(5, 0, 1)).unwrap();
        cache.set(entry(5, 3, 1)).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup(5).unwrap().slot, 3);
    }

    #[test]
    fn test_set_refuses_other_owner() {
        let mut cache = ClientRefCache::new();
        cache.set(entry(5, 0, 1)).unwrap();
        assert_eq!(cache.set(entry(5, 2, 2)), Err(PushBufId(1)));
        let kept = cache.lookup(5).unwrap();
        assert_eq!((kept.owner, kept.slot), (PushBufId(1), 0));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_colliding_handles_coexist() {
        let mut cache = ClientRefCache::new();
        let a = 7;
        let b = 7 + BUCKETS as u32;
        let c = 7 + 2 * BUCKETS as u32;
        cache.set(entry(a, 0, 1)).unwrap();
        cache.set(entry(b, 1, 1)).unwrap();
        cache.set(entry(c, 2, 2)).unwrap();
        assert_eq!(cache.len(), 3);

        assert!(cache.remove(b, PushBufId(1)));
        assert_eq!(cache.lookup(a).unwrap().slot, 0);
        assert!(cache.lookup(b).is_none());
        assert_eq!(cache.lookup(c).unwrap().slot, 2);
    }

    #[test]
    fn test_remove_checks_owner() {
        let mut cache = ClientRefCache::new();
        cache.set(entry(9, 0, 1)).unwrap();
        assert!(!cache.remove(9, PushBufId(2)));
        assert!(cache.lookup(9).is_some());
        assert!(cache.remove(9, PushBufId(1)));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_remove_owner_and_clear() {
        let mut cache = ClientRefCache::new();
        for h in 0..10 {
            cache.set(entry(h, h as usize, (h % 2) as u64)).unwrap();
        }
        assert_eq!(cache.remove_owner(PushBufId(0)), 5);
        assert_eq!(cache.len(), 5);
        cache.clear_all();
        assert!(cache.is_empty());
        assert!(cache.lookup(1).is_none());
    }
}
