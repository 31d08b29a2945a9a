//! Per-core translation cache
//!
//! Holds recently used translations for one core. Every non-trivial table
//! update bumps the host's translation generation; a cached translation is
//! only used while its generation is still current, so invalidation costs
//! the writer one atomic increment and each core one compare.

extern crate alloc;

use alloc::vec::Vec;

use pod_api::{Entry, Gfn, Result, VmId};

use crate::address_space::AddressSpace;

/// Default number of cache slots
pub const DEFAULT_SLOTS: usize = 64;

#[derive(Debug, Clone, Copy)]
struct CachedTranslation {
    vm: VmId,
    gfn: Gfn,
    entry: Entry,
    generation: u64,
}

/// Hit and miss counts of a translation cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups served from the cache
    pub hits: u64,
    /// Lookups that went to the table
    pub misses: u64,
}

/// Direct-mapped last-translation cache owned by one core
pub struct TranslationCache {
    slots: Vec<Option<CachedTranslation>>,
    stats: CacheStats,
}

impl TranslationCache {
    /// Create a cache with [`DEFAULT_SLOTS`] slots
    pub fn new() -> Self {
        Self::with_slots(DEFAULT_SLOTS)
    }

    /// Create a cache with `slots` slots (at least one)
    pub fn with_slots(slots: usize) -> Self {
        let mut table = Vec::with_capacity(slots.max(1));
        table.resize(slots.max(1), None);
        Self {
            slots: table,
            stats: CacheStats::default(),
        }
    }

    /// Translates `gfn` in `space`, from the cache when still current.
    pub fn translate(&mut self, space: &AddressSpace, gfn: Gfn) -> Result<Entry> {
        // Read the generation before the table so a racing update can only
        // make the cached value look older than it is.
        let generation = space.host().generation();
        let index = (gfn.as_u64() % self.slots.len() as u64) as usize;
        let current = self.slots[index].filter(|cached| {
            cached.vm == space.id() && cached.gfn == gfn && cached.generation == generation
        });
        if let Some(cached) = current {
            self.stats.hits += 1;
            return Ok(cached.entry);
        }

        self.stats.misses += 1;
        let entry = space.get(gfn)?;
        self.slots[index] = Some(CachedTranslation {
            vm: space.id(),
            gfn,
            entry,
            generation,
        });
        Ok(entry)
    }

    /// Drops every cached translation
    pub fn flush(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }

    /// Hit and miss counts
    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}

impl Default for TranslationCache {
    fn default() -> Self {
        Self::new()
    }
}
