//! Address-space table
//!
//! Per-VM map from guest frame number to [`Entry`]. The table is a fixed
//! three-level radix tree sized from the VM's guest-physical limit:
//!
//! - L2 nodes cover 1GB and may hold a single order-18 entry,
//! - L1 nodes cover 2MB and may hold a single order-9 entry,
//! - leaves hold 512 order-0 entries.
//!
//! Entries are packed into atomic words so that [`P2mTable::get`] can run
//! without the address space lock and without allocating. Writers must hold
//! the address space lock; the `set` path is only reachable through the lock
//! guard in `address_space`.
//!
//! Publication protocol for readers running concurrently with a writer:
//!
//! - a valid large entry shadows everything below it;
//! - shattering fills the children before clearing the large entry;
//! - installing a valid large entry leaves the children stale but shadowed;
//! - removing a large entry clears the children before clearing the entry.
//!
//! A lock-free reader therefore observes either the old or the new entry for
//! any frame, never a transient hole.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use pod_api::{
    Access, ENTRIES_PER_TABLE, Entry, Error, Gfn, MFN_BITS, Mapping, Mfn, PageOrder, Resolution,
    Result,
};
use spin::Once;
use static_assertions::const_assert;

// ============================================================================
// Packed entry encoding
// ============================================================================

const MFN_SHIFT: u32 = 12;
const ACCESS_SHIFT: u32 = 5;

const_assert!(MFN_SHIFT + MFN_BITS <= 64);
const_assert!(ACCESS_SHIFT + 3 <= MFN_SHIFT);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct RawFlags: u64 {
        const VALID = 1 << 0;
        const LAZY = 1 << 1;
        const MMIO = 1 << 2;
        const ZERO = 1 << 3;
        const SHARED = 1 << 4;
    }
}

const ACCESS_MASK: u64 = 0x7 << ACCESS_SHIFT;
const MFN_MASK: u64 = ((1u64 << MFN_BITS) - 1) << MFN_SHIFT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RawEntry(u64);

impl RawEntry {
    const EMPTY: RawEntry = RawEntry(0);

    /// Packs an entry. Frame numbers are masked; `check_entry` rejects
    /// entries that would not survive the mask.
    fn pack(entry: Entry) -> Self {
        let (flags, mfn) = match entry.mapping {
            Mapping::Invalid => return Self::EMPTY,
            Mapping::Ram(mfn) => (RawFlags::VALID, mfn.as_u64()),
            Mapping::Mmio(mfn) => (RawFlags::VALID | RawFlags::MMIO, mfn.as_u64()),
            Mapping::Lazy(Resolution::Unresolved) => (RawFlags::VALID | RawFlags::LAZY, 0),
            Mapping::Lazy(Resolution::Zero) => {
                (RawFlags::VALID | RawFlags::LAZY | RawFlags::ZERO, 0)
            }
            Mapping::Lazy(Resolution::SharedTemplate(mfn)) => {
                (RawFlags::VALID | RawFlags::LAZY | RawFlags::SHARED, mfn.as_u64())
            }
        };
        let access = (entry.access.bits() as u64) << ACCESS_SHIFT;
        Self(flags.bits() | access | ((mfn << MFN_SHIFT) & MFN_MASK))
    }

    fn unpack(self) -> Entry {
        let flags = RawFlags::from_bits_truncate(self.0);
        if !flags.contains(RawFlags::VALID) {
            return Entry::INVALID;
        }
        let access = Access::from_bits_truncate(((self.0 & ACCESS_MASK) >> ACCESS_SHIFT) as u8);
        let mfn = Mfn::new((self.0 & MFN_MASK) >> MFN_SHIFT);
        let mapping = if flags.contains(RawFlags::LAZY) {
            if flags.contains(RawFlags::ZERO) {
                Mapping::Lazy(Resolution::Zero)
            } else if flags.contains(RawFlags::SHARED) {
                Mapping::Lazy(Resolution::SharedTemplate(mfn))
            } else {
                Mapping::Lazy(Resolution::Unresolved)
            }
        } else if flags.contains(RawFlags::MMIO) {
            Mapping::Mmio(mfn)
        } else {
            Mapping::Ram(mfn)
        };
        Entry { mapping, access }
    }

    fn is_valid(self) -> bool {
        self.0 & RawFlags::VALID.bits() != 0
    }

    fn load(slot: &AtomicU64) -> Self {
        Self(slot.load(Ordering::Acquire))
    }

    fn store(self, slot: &AtomicU64) {
        slot.store(self.0, Ordering::Release);
    }
}

/// Rejects entries whose frame range cannot be represented at `order`.
fn check_entry(entry: Entry, order: PageOrder) -> Result<()> {
    let Some(mfn) = entry.mfn() else {
        return Ok(());
    };
    let room = Mfn::MAX.as_u64().checked_sub(mfn.as_u64());
    if room.is_none_or(|room| room < order.pages() - 1) {
        return Err(Error::InvalidArgument("frame number too large"));
    }
    Ok(())
}

// ============================================================================
// Table nodes
// ============================================================================

const TABLE_ORDER: u32 = PageOrder::Order2M.shift();
const DIR_ORDER: u32 = PageOrder::Order1G.shift();
const INDEX_MASK: u64 = ENTRIES_PER_TABLE as u64 - 1;

fn new_leaf() -> Box<[AtomicU64]> {
    (0..ENTRIES_PER_TABLE).map(|_| AtomicU64::new(0)).collect()
}

struct L1Node {
    superpage: AtomicU64,
    leaf: Once<Box<[AtomicU64]>>,
}

impl L1Node {
    fn new() -> Self {
        Self {
            superpage: AtomicU64::new(0),
            leaf: Once::new(),
        }
    }

    /// Guarantees the leaf exists and no 2MB entry shadows it.
    fn shatter(&self) -> &[AtomicU64] {
        let leaf = self.leaf.call_once(new_leaf);
        let raw = RawEntry::load(&self.superpage);
        if raw.is_valid() {
            let base = raw.unpack();
            for (i, slot) in leaf.iter().enumerate() {
                RawEntry::pack(base.at_offset(i as u64)).store(slot);
            }
            RawEntry::EMPTY.store(&self.superpage);
        }
        leaf
    }

    fn clear(&self) {
        if let Some(leaf) = self.leaf.get() {
            for slot in leaf.iter() {
                RawEntry::EMPTY.store(slot);
            }
        }
        RawEntry::EMPTY.store(&self.superpage);
    }

    fn walk(&self, gfn: Gfn, f: &mut dyn FnMut(Run)) {
        let raw = RawEntry::load(&self.superpage);
        if raw.is_valid() {
            f(Run::new(gfn, raw.unpack(), PageOrder::Order2M));
            return;
        }
        if let Some(leaf) = self.leaf.get() {
            for (i, slot) in leaf.iter().enumerate() {
                let raw = RawEntry::load(slot);
                if raw.is_valid() {
                    f(Run::new(gfn.offset(i as u64), raw.unpack(), PageOrder::Order4K));
                }
            }
        }
    }
}

struct L2Node {
    superpage: AtomicU64,
    tables: Once<Box<[L1Node]>>,
}

impl L2Node {
    fn new() -> Self {
        Self {
            superpage: AtomicU64::new(0),
            tables: Once::new(),
        }
    }

    /// Guarantees the L1 nodes exist and no 1GB entry shadows them.
    fn shatter(&self) -> &[L1Node] {
        let tables = self
            .tables
            .call_once(|| (0..ENTRIES_PER_TABLE).map(|_| L1Node::new()).collect());
        let raw = RawEntry::load(&self.superpage);
        if raw.is_valid() {
            let base = raw.unpack();
            for (i, l1) in tables.iter().enumerate() {
                let packed = RawEntry::pack(base.at_offset((i as u64) << TABLE_ORDER));
                packed.store(&l1.superpage);
            }
            RawEntry::EMPTY.store(&self.superpage);
        }
        tables
    }

    fn walk(&self, gfn: Gfn, f: &mut dyn FnMut(Run)) {
        let raw = RawEntry::load(&self.superpage);
        if raw.is_valid() {
            f(Run::new(gfn, raw.unpack(), PageOrder::Order1G));
            return;
        }
        if let Some(tables) = self.tables.get() {
            for (i, l1) in tables.iter().enumerate() {
                l1.walk(gfn.offset((i as u64) << TABLE_ORDER), f);
            }
        }
    }
}

// ============================================================================
// Public table
// ============================================================================

/// A naturally aligned run of frames sharing one table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    /// First frame of the run
    pub gfn: Gfn,
    /// Entry of the first frame; later frames use [`Entry::at_offset`]
    pub entry: Entry,
    /// Size of the run
    pub order: PageOrder,
}

impl Run {
    /// Creates a run
    pub const fn new(gfn: Gfn, entry: Entry, order: PageOrder) -> Self {
        Self { gfn, entry, order }
    }

    /// Number of frames in the run
    pub const fn pages(&self) -> u64 {
        self.order.pages()
    }

    /// Iterates the frames of the run with their own entries
    pub fn frames(&self) -> impl Iterator<Item = (Gfn, Entry)> + '_ {
        (0..self.pages()).map(move |i| (self.gfn.offset(i), self.entry.at_offset(i)))
    }
}

/// Guest-physical to machine-physical translation table
pub struct P2mTable {
    dirs: Box<[L2Node]>,
    max_gfn: Gfn,
}

impl P2mTable {
    /// Create an empty table covering `[0, max_gfn)`; every frame is invalid.
    pub fn new(max_gfn: Gfn) -> Self {
        let dirs = max_gfn.as_u64().div_ceil(1 << DIR_ORDER) as usize;
        Self {
            dirs: (0..dirs).map(|_| L2Node::new()).collect(),
            max_gfn,
        }
    }

    /// First frame beyond the table
    pub fn max_gfn(&self) -> Gfn {
        self.max_gfn
    }

    /// Looks up the entry for `gfn`.
    ///
    /// Never blocks and never allocates. Without the address space lock the
    /// result is a snapshot that must be rechecked under the lock before it
    /// is acted upon.
    pub fn get(&self, gfn: Gfn) -> Result<Entry> {
        self.lookup(gfn).map(|(entry, _)| entry)
    }

    /// Looks up the entry for `gfn` together with the order of the mapping
    /// that covers it.
    pub fn lookup(&self, gfn: Gfn) -> Result<(Entry, PageOrder)> {
        if gfn >= self.max_gfn {
            return Err(Error::OutOfRange(gfn));
        }
        let l2 = &self.dirs[(gfn.as_u64() >> DIR_ORDER) as usize];
        let raw = RawEntry::load(&l2.superpage);
        if raw.is_valid() {
            let entry = raw.unpack().at_offset(gfn.offset_in(PageOrder::Order1G));
            return Ok((entry, PageOrder::Order1G));
        }
        let Some(tables) = l2.tables.get() else {
            return Ok((Entry::INVALID, PageOrder::Order4K));
        };
        let l1 = &tables[((gfn.as_u64() >> TABLE_ORDER) & INDEX_MASK) as usize];
        let raw = RawEntry::load(&l1.superpage);
        if raw.is_valid() {
            let entry = raw.unpack().at_offset(gfn.offset_in(PageOrder::Order2M));
            return Ok((entry, PageOrder::Order2M));
        }
        let Some(leaf) = l1.leaf.get() else {
            return Ok((Entry::INVALID, PageOrder::Order4K));
        };
        let raw = RawEntry::load(&leaf[(gfn.as_u64() & INDEX_MASK) as usize]);
        Ok((raw.unpack(), PageOrder::Order4K))
    }

    /// Visits every frame of the naturally aligned 512-frame region starting
    /// at `gfn`, clipped to the table limit.
    pub fn for_each_in_l1_region(&self, gfn: Gfn, mut f: impl FnMut(Gfn, Entry)) -> Result<()> {
        if !gfn.is_aligned(PageOrder::Order2M) {
            return Err(Error::Misaligned {
                gfn,
                order: PageOrder::Order2M,
            });
        }
        let (first, order) = self.lookup(gfn)?;
        let end = gfn
            .offset(PageOrder::Order2M.pages())
            .min(self.max_gfn)
            .as_u64();
        let count = end - gfn.as_u64();
        if order >= PageOrder::Order2M {
            for i in 0..count {
                f(gfn.offset(i), first.at_offset(i));
            }
        } else {
            for i in 0..count {
                let frame = gfn.offset(i);
                f(frame, self.get(frame)?);
            }
        }
        Ok(())
    }

    /// Visits every mapped run in the table, in ascending frame order.
    pub fn for_each_run(&self, mut f: impl FnMut(Run)) {
        for (i, l2) in self.dirs.iter().enumerate() {
            l2.walk(Gfn::new((i as u64) << DIR_ORDER), &mut f);
        }
    }

    /// Visits every mapped run inside the aligned block `[gfn, gfn + 2^order)`.
    ///
    /// Runs larger than the block are reported clipped to the block.
    pub fn for_each_run_in(
        &self,
        gfn: Gfn,
        order: PageOrder,
        mut f: impl FnMut(Run),
    ) -> Result<()> {
        self.check_block(gfn, order)?;
        let l2 = &self.dirs[(gfn.as_u64() >> DIR_ORDER) as usize];
        match order {
            PageOrder::Order1G => l2.walk(gfn, &mut f),
            PageOrder::Order2M => {
                let raw = RawEntry::load(&l2.superpage);
                if raw.is_valid() {
                    let entry = raw.unpack().at_offset(gfn.offset_in(PageOrder::Order1G));
                    f(Run::new(gfn, entry, order));
                } else if let Some(tables) = l2.tables.get() {
                    tables[((gfn.as_u64() >> TABLE_ORDER) & INDEX_MASK) as usize].walk(gfn, &mut f);
                }
            }
            PageOrder::Order4K => {
                let entry = self.get(gfn)?;
                if !entry.is_invalid() {
                    f(Run::new(gfn, entry, order));
                }
            }
        }
        Ok(())
    }

    /// Replaces the `2^order` entries starting at `gfn` with `entry`.
    ///
    /// Larger mappings overlapping the block are shattered first; smaller
    /// mappings inside it are replaced wholesale. Every mapped run that was
    /// replaced is appended to `replaced`. Returns false if the block already
    /// held exactly `entry`.
    ///
    /// Caller must hold the address space lock.
    pub(crate) fn set(
        &self,
        gfn: Gfn,
        entry: Entry,
        order: PageOrder,
        replaced: &mut Vec<Run>,
    ) -> Result<bool> {
        self.check_block(gfn, order)?;
        check_entry(entry, order)?;
        let raw = RawEntry::pack(entry);
        let l2 = &self.dirs[(gfn.as_u64() >> DIR_ORDER) as usize];

        if order == PageOrder::Order1G {
            return Ok(Self::replace_large(
                &l2.superpage,
                gfn,
                raw,
                order,
                replaced,
                |f| {
                    if let Some(tables) = l2.tables.get() {
                        for (i, l1) in tables.iter().enumerate() {
                            l1.walk(gfn.offset((i as u64) << TABLE_ORDER), f);
                        }
                    }
                },
                || {
                    if let Some(tables) = l2.tables.get() {
                        tables.iter().for_each(L1Node::clear);
                    }
                },
            ));
        }

        let tables = l2.shatter();
        let l1 = &tables[((gfn.as_u64() >> TABLE_ORDER) & INDEX_MASK) as usize];
        if order == PageOrder::Order2M {
            return Ok(Self::replace_large(
                &l1.superpage,
                gfn,
                raw,
                order,
                replaced,
                |f| {
                    if let Some(leaf) = l1.leaf.get() {
                        for (i, slot) in leaf.iter().enumerate() {
                            let old = RawEntry::load(slot);
                            if old.is_valid() {
                                f(Run::new(gfn.offset(i as u64), old.unpack(), PageOrder::Order4K));
                            }
                        }
                    }
                },
                || {
                    if let Some(leaf) = l1.leaf.get() {
                        leaf.iter().for_each(|slot| RawEntry::EMPTY.store(slot));
                    }
                },
            ));
        }

        let leaf = l1.shatter();
        let slot = &leaf[(gfn.as_u64() & INDEX_MASK) as usize];
        let old = RawEntry::load(slot);
        if old == raw {
            return Ok(false);
        }
        if old.is_valid() {
            replaced.push(Run::new(gfn, old.unpack(), PageOrder::Order4K));
        }
        raw.store(slot);
        Ok(true)
    }

    /// Installs `raw` as a large entry in `slot`, reporting what it covers.
    fn replace_large(
        slot: &AtomicU64,
        gfn: Gfn,
        raw: RawEntry,
        order: PageOrder,
        replaced: &mut Vec<Run>,
        collect_children: impl FnOnce(&mut dyn FnMut(Run)),
        clear_children: impl FnOnce(),
    ) -> bool {
        let old = RawEntry::load(slot);
        let before = replaced.len();
        if old.is_valid() {
            if old == raw {
                return false;
            }
            replaced.push(Run::new(gfn, old.unpack(), order));
        } else {
            collect_children(&mut |run| replaced.push(run));
        }
        let changed = raw.is_valid() || replaced.len() > before;

        if raw.is_valid() {
            raw.store(slot);
        } else {
            // Children of a valid large entry are stale; drop them before
            // the large entry stops shadowing them.
            clear_children();
            RawEntry::EMPTY.store(slot);
        }
        changed
    }

    fn check_block(&self, gfn: Gfn, order: PageOrder) -> Result<()> {
        if !gfn.is_aligned(order) {
            return Err(Error::Misaligned { gfn, order });
        }
        if gfn >= self.max_gfn || order.pages() > self.max_gfn.as_u64() - gfn.as_u64() {
            return Err(Error::OutOfRange(gfn));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::vec;

    fn table() -> P2mTable {
        P2mTable::new(Gfn::new(1 << 20))
    }

    fn set(table: &P2mTable, gfn: u64, entry: Entry, order: PageOrder) -> Vec<Run> {
        let mut replaced = Vec::new();
        table.set(Gfn::new(gfn), entry, order, &mut replaced).unwrap();
        replaced
    }

    #[test]
    fn test_pack_preserves_every_mapping_kind() {
        let entries = [
            Entry::INVALID,
            Entry::ram(Mfn::new(0x12345), Access::RW),
            Entry::mmio(Mfn::new(0xfee00), Access::READ),
            Entry::lazy(Resolution::Unresolved, Access::RWX),
            Entry::lazy(Resolution::Zero, Access::RW),
            Entry::lazy(Resolution::SharedTemplate(Mfn::MAX), Access::READ | Access::EXEC),
        ];
        for entry in entries {
            assert_eq!(RawEntry::pack(entry).unpack(), entry);
        }
    }

    #[test]
    fn test_empty_table() {
        let table = table();
        assert_eq!(table.get(Gfn::new(0)).unwrap(), Entry::INVALID);
        assert_eq!(table.get(Gfn::new((1 << 20) - 1)).unwrap(), Entry::INVALID);
        assert_eq!(
            table.get(Gfn::new(1 << 20)),
            Err(Error::OutOfRange(Gfn::new(1 << 20)))
        );
    }

    #[test]
    fn test_rejects_bad_blocks() {
        let table = table();
        let mut replaced = Vec::new();
        let entry = Entry::ram(Mfn::new(1), Access::RW);
        assert!(matches!(
            table.set(Gfn::new(3), entry, PageOrder::Order2M, &mut replaced),
            Err(Error::Misaligned { .. })
        ));
        assert_eq!(
            table.set(Gfn::new(1 << 20), entry, PageOrder::Order4K, &mut replaced),
            Err(Error::OutOfRange(Gfn::new(1 << 20)))
        );
        let past_end = Entry::ram(Mfn::MAX, Access::RW);
        assert!(
            table
                .set(Gfn::new(0), past_end, PageOrder::Order2M, &mut replaced)
                .is_err()
        );
        assert!(replaced.is_empty());
    }

    #[test]
    fn test_rejects_blocks_at_the_top_of_the_number_space() {
        let table = table();
        let mut replaced = Vec::new();
        let top = Gfn::new(u64::MAX);
        assert_eq!(
            table.set(top, Entry::INVALID, PageOrder::Order4K, &mut replaced),
            Err(Error::OutOfRange(top))
        );
        let top_2m = Gfn::new(u64::MAX - 511);
        assert_eq!(
            table.set(top_2m, Entry::INVALID, PageOrder::Order2M, &mut replaced),
            Err(Error::OutOfRange(top_2m))
        );
        assert_eq!(
            table.for_each_run_in(top_2m, PageOrder::Order2M, |_| {}),
            Err(Error::OutOfRange(top_2m))
        );

        let wild = Entry::mmio(Mfn::new(u64::MAX), Access::RW);
        assert_eq!(
            table.set(Gfn::new(0), wild, PageOrder::Order4K, &mut replaced),
            Err(Error::InvalidArgument("frame number too large"))
        );
        let last = Entry::ram(Mfn::MAX, Access::RW);
        assert!(table.set(Gfn::new(0), last, PageOrder::Order4K, &mut replaced).unwrap());
        assert!(replaced.is_empty());
    }

    #[test]
    fn test_point_set_and_replace() {
        let table = table();
        let first = Entry::ram(Mfn::new(100), Access::RW);
        assert!(set(&table, 7, first, PageOrder::Order4K).is_empty());
        assert_eq!(table.get(Gfn::new(7)).unwrap(), first);
        assert_eq!(table.get(Gfn::new(8)).unwrap(), Entry::INVALID);

        let second = Entry::lazy(Resolution::Zero, Access::RWX);
        let replaced = set(&table, 7, second, PageOrder::Order4K);
        assert_eq!(replaced, vec![Run::new(Gfn::new(7), first, PageOrder::Order4K)]);

        let mut again = Vec::new();
        assert!(!table.set(Gfn::new(7), second, PageOrder::Order4K, &mut again).unwrap());
    }

    #[test]
    fn test_shatter_2m_keeps_neighbours() {
        let table = table();
        let big = Entry::ram(Mfn::new(0x1000), Access::RW);
        set(&table, 0x200, big, PageOrder::Order2M);
        assert_eq!(
            table.lookup(Gfn::new(0x205)).unwrap(),
            (Entry::ram(Mfn::new(0x1005), Access::RW), PageOrder::Order2M)
        );

        let small = Entry::lazy(Resolution::Unresolved, Access::RWX);
        let replaced = set(&table, 0x205, small, PageOrder::Order4K);
        assert_eq!(
            replaced,
            vec![Run::new(
                Gfn::new(0x205),
                Entry::ram(Mfn::new(0x1005), Access::RW),
                PageOrder::Order4K,
            )]
        );
        assert_eq!(table.lookup(Gfn::new(0x205)).unwrap(), (small, PageOrder::Order4K));
        assert_eq!(
            table.lookup(Gfn::new(0x3ff)).unwrap(),
            (Entry::ram(Mfn::new(0x11ff), Access::RW), PageOrder::Order4K)
        );
    }

    #[test]
    fn test_shatter_1g_down_to_4k() {
        let table = table();
        let lazy = Entry::lazy(Resolution::Unresolved, Access::RWX);
        set(&table, 1 << 18, lazy, PageOrder::Order1G);
        assert_eq!(table.lookup(Gfn::new((1 << 18) + 42)).unwrap().1, PageOrder::Order1G);

        let ram = Entry::ram(Mfn::new(9), Access::RW);
        let replaced = set(&table, (1 << 18) + 42, ram, PageOrder::Order4K);
        assert_eq!(replaced, vec![Run::new(Gfn::new((1 << 18) + 42), lazy, PageOrder::Order4K)]);
        assert_eq!(table.lookup(Gfn::new((1 << 18) + 42)).unwrap(), (ram, PageOrder::Order4K));
        assert_eq!(table.lookup(Gfn::new((1 << 18) + 43)).unwrap(), (lazy, PageOrder::Order4K));
        assert_eq!(table.lookup(Gfn::new((1 << 18) + 512)).unwrap(), (lazy, PageOrder::Order2M));

        let mut runs = 0;
        let mut pages = 0;
        table.for_each_run(|run| {
            runs += 1;
            pages += run.pages();
        });
        assert_eq!(pages, 1 << 18);
        assert_eq!(runs, 511 + 512);
    }

    #[test]
    fn test_coalesce_reports_small_entries() {
        let table = table();
        for i in 0..4 {
            set(&table, 0x400 + i, Entry::ram(Mfn::new(50 + i), Access::RW), PageOrder::Order4K);
        }
        let lazy = Entry::lazy(Resolution::Unresolved, Access::RWX);
        let replaced = set(&table, 0x400, lazy, PageOrder::Order2M);
        assert_eq!(replaced.len(), 4);
        assert!(replaced.iter().all(|run| run.order == PageOrder::Order4K));
        assert_eq!(table.lookup(Gfn::new(0x402)).unwrap(), (lazy, PageOrder::Order2M));

        // Shadowed leaf entries must not resurface when the block is split again.
        set(&table, 0x401, Entry::INVALID, PageOrder::Order4K);
        assert_eq!(table.get(Gfn::new(0x400)).unwrap(), lazy);
        assert_eq!(table.get(Gfn::new(0x401)).unwrap(), Entry::INVALID);
        assert_eq!(table.get(Gfn::new(0x402)).unwrap(), lazy);
    }

    #[test]
    fn test_invalidate_large_clears_children() {
        let table = table();
        set(&table, 0x600, Entry::ram(Mfn::new(3), Access::RW), PageOrder::Order4K);
        set(&table, 0x600, Entry::lazy(Resolution::Zero, Access::RW), PageOrder::Order2M);
        let replaced = set(&table, 0x600, Entry::INVALID, PageOrder::Order2M);
        assert_eq!(replaced.len(), 1);
        assert_eq!(replaced[0].order, PageOrder::Order2M);

        set(&table, 0x7ff, Entry::lazy(Resolution::Unresolved, Access::RW), PageOrder::Order4K);
        assert_eq!(table.get(Gfn::new(0x600)).unwrap(), Entry::INVALID);

        let mut seen = Vec::new();
        table.for_each_run(|run| seen.push(run.gfn));
        assert_eq!(seen, vec![Gfn::new(0x7ff)]);
    }

    #[test]
    fn test_l1_region_iteration() {
        let table = table();
        set(&table, 0x800, Entry::ram(Mfn::new(0x100), Access::RW), PageOrder::Order2M);
        let mut count = 0;
        table
            .for_each_in_l1_region(Gfn::new(0x800), |gfn, entry| {
                assert_eq!(entry.mfn(), Some(Mfn::new(0x100 + gfn.as_u64() - 0x800)));
                count += 1;
            })
            .unwrap();
        assert_eq!(count, 512);

        set(&table, 0xa03, Entry::lazy(Resolution::Zero, Access::RW), PageOrder::Order4K);
        let mut lazy = 0;
        table
            .for_each_in_l1_region(Gfn::new(0xa00), |_, entry| {
                if entry.is_lazy() {
                    lazy += 1;
                }
            })
            .unwrap();
        assert_eq!(lazy, 1);
        assert!(table.for_each_in_l1_region(Gfn::new(0xa01), |_, _| {}).is_err());
    }

    #[test]
    fn test_region_clipped_to_limit() {
        let table = P2mTable::new(Gfn::new(700));
        let mut count = 0;
        table
            .for_each_in_l1_region(Gfn::new(512), |_, _| count += 1)
            .unwrap();
        assert_eq!(count, 188);
    }

    #[test]
    fn test_runs_in_block_are_clipped() {
        let table = table();
        let lazy = Entry::lazy(Resolution::Unresolved, Access::RWX);
        set(&table, 0, lazy, PageOrder::Order1G);
        let mut runs = Vec::new();
        table
            .for_each_run_in(Gfn::new(0x400), PageOrder::Order2M, |run| runs.push(run))
            .unwrap();
        assert_eq!(runs, vec![Run::new(Gfn::new(0x400), lazy, PageOrder::Order2M)]);
    }

    #[test]
    fn test_lockless_readers_never_see_holes() {
        let table = Arc::new(table());
        let base = Mfn::new(0x8000);
        let mut replaced = Vec::new();
        table
            .set(Gfn::new(0), Entry::ram(base, Access::RW), PageOrder::Order2M, &mut replaced)
            .unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let readers: Vec<_> = (0..3)
            .map(|_| {
                let table = Arc::clone(&table);
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        for gfn in (0..512).step_by(37) {
                            let entry = table.get(Gfn::new(gfn)).unwrap();
                            assert_eq!(entry, Entry::ram(base.offset(gfn), Access::RW));
                        }
                    }
                })
            })
            .collect();

        for round in 0..200u64 {
            let gfn = (round * 13) % 512;
            let mut replaced = Vec::new();
            let entry = Entry::ram(base.offset(gfn), Access::RW);
            table
                .set(Gfn::new(gfn), entry, PageOrder::Order4K, &mut replaced)
                .unwrap();
            table
                .set(Gfn::new(0), Entry::ram(base, Access::RW), PageOrder::Order2M, &mut replaced)
                .unwrap();
        }
        stop.store(true, Ordering::Relaxed);
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
