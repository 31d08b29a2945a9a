//! Page accounting
//!
//! Every mapped run in an address space falls into exactly one [`PageClass`].
//! The counters hold the page total of each class and are adjusted from the
//! runs a table update replaced and the entry it installed, so they can only
//! drift if the table itself is corrupted; `audit` recomputes them from the
//! table to prove it.
//!
//! Counters are written only under the address space lock and may be read
//! without it as approximate, monitoring-only values.

use core::sync::atomic::{AtomicU64, Ordering};

use pod_api::{Entry, Mapping, PageOrder, Resolution};

use crate::page_table::Run;

/// Accounting class of a mapped entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageClass {
    /// Private frame owned by the address space
    Ram,
    /// Lazy entry never resolved
    LazyUnresolved,
    /// Lazy entry backed by the shared zero frame
    LazyZero,
    /// Lazy entry backed by a template frame
    LazyShared,
    /// Device memory
    Mmio,
}

impl PageClass {
    /// Classifies an entry; invalid entries have no class.
    pub fn of(entry: &Entry) -> Option<PageClass> {
        match entry.mapping {
            Mapping::Invalid => None,
            Mapping::Ram(_) => Some(PageClass::Ram),
            Mapping::Mmio(_) => Some(PageClass::Mmio),
            Mapping::Lazy(Resolution::Unresolved) => Some(PageClass::LazyUnresolved),
            Mapping::Lazy(Resolution::Zero) => Some(PageClass::LazyZero),
            Mapping::Lazy(Resolution::SharedTemplate(_)) => Some(PageClass::LazyShared),
        }
    }

    fn is_lazy(self) -> bool {
        matches!(
            self,
            PageClass::LazyUnresolved | PageClass::LazyZero | PageClass::LazyShared
        )
    }

    fn is_declared(self) -> bool {
        self != PageClass::Mmio
    }
}

/// Page totals per class, as computed by a table walk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    /// RAM and lazy pages
    pub declared: u64,
    /// Lazy pages of any resolution
    pub lazy: u64,
    /// Private RAM pages
    pub ram: u64,
    /// Lazy pages resolved to the zero frame
    pub zero_shared: u64,
    /// Lazy pages resolved to a template frame
    pub template_shared: u64,
    /// Device memory pages
    pub mmio: u64,
}

impl Tally {
    /// Adds a run to the tally
    pub fn add_run(&mut self, run: &Run) {
        let Some(class) = PageClass::of(&run.entry) else {
            return;
        };
        let pages = run.pages();
        if class.is_declared() {
            self.declared += pages;
        }
        if class.is_lazy() {
            self.lazy += pages;
        }
        match class {
            PageClass::Ram => self.ram += pages,
            PageClass::LazyZero => self.zero_shared += pages,
            PageClass::LazyShared => self.template_shared += pages,
            PageClass::Mmio => self.mmio += pages,
            PageClass::LazyUnresolved => {}
        }
    }

    /// Checks `lazy + materialized == declared`
    pub fn identity_holds(&self) -> bool {
        self.lazy + self.ram == self.declared
    }
}

/// Per-VM atomic counters
#[derive(Debug, Default)]
pub struct Counters {
    declared: AtomicU64,
    lazy: AtomicU64,
    ram: AtomicU64,
    zero_shared: AtomicU64,
    template_shared: AtomicU64,
    mmio: AtomicU64,
    populated: AtomicU64,
    zero_reclaims: AtomicU64,
    shatters: AtomicU64,
}

impl Counters {
    /// Creates zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Accounts a table update: `replaced` runs leave, `order` pages of
    /// `installed` arrive.
    pub(crate) fn apply(&self, replaced: &[Run], installed: &Entry, order: PageOrder) {
        for run in replaced {
            if let Some(class) = PageClass::of(&run.entry) {
                self.adjust(class, run.pages(), false);
            }
        }
        if let Some(class) = PageClass::of(installed) {
            self.adjust(class, order.pages(), true);
        }
    }

    fn adjust(&self, class: PageClass, pages: u64, add: bool) {
        let bump = |counter: &AtomicU64| {
            if add {
                counter.fetch_add(pages, Ordering::Relaxed);
            } else {
                counter.fetch_sub(pages, Ordering::Relaxed);
            }
        };
        if class.is_declared() {
            bump(&self.declared);
        }
        if class.is_lazy() {
            bump(&self.lazy);
        }
        match class {
            PageClass::Ram => bump(&self.ram),
            PageClass::LazyZero => bump(&self.zero_shared),
            PageClass::LazyShared => bump(&self.template_shared),
            PageClass::Mmio => bump(&self.mmio),
            PageClass::LazyUnresolved => {}
        }
    }

    pub(crate) fn record_populate(&self) {
        self.populated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_zero_reclaim(&self) {
        self.zero_reclaims.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_shatter(&self) {
        self.shatters.fetch_add(1, Ordering::Relaxed);
    }

    /// Current class totals
    pub fn tally(&self) -> Tally {
        Tally {
            declared: self.declared.load(Ordering::Relaxed),
            lazy: self.lazy.load(Ordering::Relaxed),
            ram: self.ram.load(Ordering::Relaxed),
            zero_shared: self.zero_shared.load(Ordering::Relaxed),
            template_shared: self.template_shared.load(Ordering::Relaxed),
            mmio: self.mmio.load(Ordering::Relaxed),
        }
    }

    /// Pages materialized by demand population
    pub fn populated(&self) -> u64 {
        self.populated.load(Ordering::Relaxed)
    }

    /// Pages reclaimed to the zero frame
    pub fn zero_reclaims(&self) -> u64 {
        self.zero_reclaims.load(Ordering::Relaxed)
    }

    /// Large lazy mappings split by faults
    pub fn shatters(&self) -> u64 {
        self.shatters.load(Ordering::Relaxed)
    }
}

/// Snapshot of an address space's memory accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PodStats {
    /// RAM and lazy pages currently declared
    pub declared_pages: u64,
    /// Lazy pages of any resolution
    pub lazy_pages: u64,
    /// Materialized private pages
    pub ram_pages: u64,
    /// Lazy pages backed by the zero frame
    pub zero_shared_pages: u64,
    /// Lazy pages backed by a template frame
    pub template_shared_pages: u64,
    /// Device memory pages
    pub mmio_pages: u64,
    /// Pages materialized by demand population since creation
    pub populated: u64,
    /// Pages reclaimed to the zero frame since creation
    pub zero_reclaims: u64,
    /// Large lazy mappings split by faults since creation
    pub shatters: u64,
    /// Frames waiting on the deferred free list
    pub deferred_free: usize,
    /// Clones attached to this address space
    pub clones: usize,
}

impl PodStats {
    pub(crate) fn new(counters: &Counters, deferred_free: usize, clones: usize) -> Self {
        let tally = counters.tally();
        Self {
            declared_pages: tally.declared,
            lazy_pages: tally.lazy,
            ram_pages: tally.ram,
            zero_shared_pages: tally.zero_shared,
            template_shared_pages: tally.template_shared,
            mmio_pages: tally.mmio,
            populated: counters.populated(),
            zero_reclaims: counters.zero_reclaims(),
            shatters: counters.shatters(),
            deferred_free,
            clones,
        }
    }

    /// Same as `ram_pages`
    pub fn materialized_pages(&self) -> u64 {
        self.ram_pages
    }
}
