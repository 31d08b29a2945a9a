//! Core types used throughout the translation layer

use core::fmt;

use static_assertions::const_assert_eq;

/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: u32 = 12;

/// Page size (4KB)
pub const PAGE_SIZE: usize = 4096;

const_assert_eq!(PAGE_SIZE, 1 << PAGE_SHIFT);

/// Number of entries held by one table page (one L1 region)
pub const ENTRIES_PER_TABLE: usize = 512;

/// Number of significant bits in a machine frame number
pub const MFN_BITS: u32 = 52;

/// Guest frame number - index into a VM's guest-physical address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Gfn(pub u64);

impl Gfn {
    /// Creates a new guest frame number.
    pub const fn new(gfn: u64) -> Self {
        Self(gfn)
    }

    /// Returns the raw frame number.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the frame `count` frames above this one.
    pub const fn offset(self, count: u64) -> Self {
        Self(self.0 + count)
    }

    /// Rounds down to the boundary of a mapping of `order`.
    pub const fn align_down(self, order: PageOrder) -> Self {
        Self(self.0 & !(order.pages() - 1))
    }

    /// Checks whether the frame starts a naturally aligned mapping of `order`.
    pub const fn is_aligned(self, order: PageOrder) -> bool {
        self.0 & (order.pages() - 1) == 0
    }

    /// Offset of this frame within the enclosing mapping of `order`.
    pub const fn offset_in(self, order: PageOrder) -> u64 {
        self.0 & (order.pages() - 1)
    }

    /// Guest-physical address of the first byte of this frame.
    pub const fn to_addr(self) -> u64 {
        self.0 << PAGE_SHIFT
    }

    /// Guest frame containing a guest-physical address.
    pub const fn from_addr(addr: u64) -> Self {
        Self(addr >> PAGE_SHIFT)
    }
}

impl fmt::Display for Gfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gfn {:#x}", self.0)
    }
}

impl From<u64> for Gfn {
    fn from(gfn: u64) -> Self {
        Self(gfn)
    }
}

/// Half-open range of guest frames `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GfnRange {
    start: Gfn,
    end: Gfn,
}

impl GfnRange {
    /// Creates the range of `count` frames starting at `start`.
    pub const fn new(start: Gfn, count: u64) -> Self {
        Self {
            start,
            end: Gfn(start.0.saturating_add(count)),
        }
    }

    /// First frame of the range.
    pub const fn start(&self) -> Gfn {
        self.start
    }

    /// First frame past the range.
    pub const fn end(&self) -> Gfn {
        self.end
    }

    /// Number of frames in the range.
    pub const fn len(&self) -> u64 {
        self.end.0 - self.start.0
    }

    /// Returns true if the range holds no frames.
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if `gfn` lies inside the range.
    pub const fn contains(&self, gfn: Gfn) -> bool {
        gfn.0 >= self.start.0 && gfn.0 < self.end.0
    }

    /// Iterates the frames of the range.
    pub fn iter(&self) -> impl Iterator<Item = Gfn> + use<> {
        (self.start.0..self.end.0).map(Gfn)
    }
}

/// Machine frame number - index into real host physical memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Mfn(pub u64);

impl Mfn {
    /// Largest frame number a translation entry can hold.
    pub const MAX: Mfn = Mfn((1 << MFN_BITS) - 1);

    /// Creates a new machine frame number.
    pub const fn new(mfn: u64) -> Self {
        Self(mfn)
    }

    /// Returns the raw frame number.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the frame `count` frames above this one.
    pub const fn offset(self, count: u64) -> Self {
        Self(self.0 + count)
    }

    /// Checks whether the frame number fits in a translation entry.
    pub const fn is_representable(self) -> bool {
        self.0 <= Self::MAX.0
    }
}

impl fmt::Display for Mfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mfn {:#x}", self.0)
    }
}

impl From<u64> for Mfn {
    fn from(mfn: u64) -> Self {
        Self(mfn)
    }
}

/// Mapping granularity supported by the translation table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PageOrder {
    /// A single 4KB frame
    Order4K = 0,
    /// 512 frames (2MB)
    Order2M = 9,
    /// 512 * 512 frames (1GB)
    Order1G = 18,
}

impl PageOrder {
    /// All supported orders, largest first.
    pub const DESCENDING: [PageOrder; 3] =
        [PageOrder::Order1G, PageOrder::Order2M, PageOrder::Order4K];

    /// Returns log2 of the number of frames covered.
    pub const fn shift(self) -> u32 {
        self as u32
    }

    /// Returns the number of frames covered.
    pub const fn pages(self) -> u64 {
        1 << (self as u32)
    }

    /// The next smaller order, if any.
    pub const fn smaller(self) -> Option<PageOrder> {
        match self {
            PageOrder::Order1G => Some(PageOrder::Order2M),
            PageOrder::Order2M => Some(PageOrder::Order4K),
            PageOrder::Order4K => None,
        }
    }

    /// Converts a raw order value, rejecting unsupported orders.
    pub const fn from_u32(order: u32) -> Option<PageOrder> {
        match order {
            0 => Some(PageOrder::Order4K),
            9 => Some(PageOrder::Order2M),
            18 => Some(PageOrder::Order1G),
            _ => None,
        }
    }
}

/// Identifier of a virtual machine owning an address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VmId(pub u32);

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vm{}", self.0)
    }
}
