//! Dirty page bitmap
//!
//! Reference change-tracking collaborator: one bit per guest frame, set
//! when a frame is materialized and collected by a migration or snapshot
//! consumer.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use pod_api::{DirtyLog, Gfn};

const BITS_PER_WORD: u64 = u64::BITS as u64;

/// Atomic dirty bitmap covering `[0, max_gfn)`
pub struct DirtyBitmap {
    words: Box<[AtomicU64]>,
    max_gfn: Gfn,
}

impl DirtyBitmap {
    /// Create a clean bitmap
    pub fn new(max_gfn: Gfn) -> Self {
        let words = max_gfn.as_u64().div_ceil(BITS_PER_WORD) as usize;
        Self {
            words: (0..words).map(|_| AtomicU64::new(0)).collect(),
            max_gfn,
        }
    }

    fn slot(&self, gfn: Gfn) -> Option<(&AtomicU64, u64)> {
        if gfn >= self.max_gfn {
            return None;
        }
        let word = &self.words[(gfn.as_u64() / BITS_PER_WORD) as usize];
        Some((word, 1 << (gfn.as_u64() % BITS_PER_WORD)))
    }

    /// Returns true if `gfn` was marked since the last collection
    pub fn is_dirty(&self, gfn: Gfn) -> bool {
        self.slot(gfn)
            .is_some_and(|(word, bit)| word.load(Ordering::Acquire) & bit != 0)
    }

    /// Number of frames currently marked
    pub fn dirty_count(&self) -> usize {
        self.words
            .iter()
            .map(|word| word.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    /// Collects and clears the marked frames, in ascending order
    pub fn take_dirty(&self) -> Vec<Gfn> {
        let mut dirty = Vec::new();
        for (index, word) in self.words.iter().enumerate() {
            let mut bits = word.swap(0, Ordering::AcqRel);
            while bits != 0 {
                let bit = bits.trailing_zeros() as u64;
                dirty.push(Gfn::new(index as u64 * BITS_PER_WORD + bit));
                bits &= bits - 1;
            }
        }
        dirty
    }
}

impl DirtyLog for DirtyBitmap {
    fn mark_dirty(&self, gfn: Gfn) {
        match self.slot(gfn) {
            Some((word, bit)) => {
                word.fetch_or(bit, Ordering::AcqRel);
            }
            None => {
                pod_warn!("dirty bitmap: {} beyond tracked range", gfn);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_mark_and_collect() {
        let bitmap = DirtyBitmap::new(Gfn::new(200));
        bitmap.mark_dirty(Gfn::new(3));
        bitmap.mark_dirty(Gfn::new(64));
        bitmap.mark_dirty(Gfn::new(199));
        bitmap.mark_dirty(Gfn::new(3));
        assert!(bitmap.is_dirty(Gfn::new(64)));
        assert!(!bitmap.is_dirty(Gfn::new(65)));
        assert_eq!(bitmap.dirty_count(), 3);

        assert_eq!(
            bitmap.take_dirty(),
            vec![Gfn::new(3), Gfn::new(64), Gfn::new(199)]
        );
        assert_eq!(bitmap.dirty_count(), 0);
    }

    #[test]
    fn test_out_of_range_is_ignored() {
        let bitmap = DirtyBitmap::new(Gfn::new(10));
        bitmap.mark_dirty(Gfn::new(10));
        assert!(!bitmap.is_dirty(Gfn::new(10)));
        assert_eq!(bitmap.dirty_count(), 0);
    }
}
