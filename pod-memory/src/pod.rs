//! Populate-on-demand engine
//!
//! Lazy entries are materialized into private frames on first touch,
//! reclaimed back to the shared zero frame when they hold nothing, and bulk
//! declared over guest-physical ranges at VM build time.
//!
//! Every operation here takes the address space lock for its whole duration
//! and rechecks the table under it; lock-free lookups are only used to skip
//! work that obviously does not apply.

use pod_api::{
    Access, Entry, EntryType, Error, FatalReason, FaultKind, Gfn, GfnRange, Mapping, Mfn,
    PageOrder, Resolution, Result,
};

use crate::address_space::{AddressSpace, Release, SpaceGuard};
use crate::template::TemplateSource;

/// Outcome of a zero-share attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroShareOutcome {
    /// The frame was reclaimed and the entry now points at the zero frame
    Shared,
    /// The frame holds non-zero data; nothing changed
    NotZero,
    /// The frame is referenced elsewhere; nothing changed
    Aliased,
    /// The entry is neither private RAM nor template-shared; nothing changed
    NotEligible,
}

/// Where the contents of a newly materialized frame come from
#[derive(Debug, Clone, Copy)]
enum Source {
    Zero,
    Copy(Mfn),
}

impl AddressSpace {
    /// Marks every frame of `range` lazy and unresolved.
    ///
    /// Private frames in the range are returned to the allocator and
    /// template shares are released, so previous contents are lost. Device
    /// memory is left in place. The largest naturally aligned mapping that
    /// avoids device memory is used for each part of the range.
    pub fn declare_lazy(&self, range: GfnRange) -> Result<()> {
        let mut guard = self.lock_mutable()?;
        self.check_range(range)?;
        let lazy = Entry::lazy(Resolution::Unresolved, self.config().default_access);

        let mut gfn = range.start();
        while gfn < range.end() {
            match self.declare_order(gfn, range.end())? {
                Some(order) => {
                    guard.set_or_crash(gfn, lazy, order, Release::Free)?;
                    gfn = gfn.offset(order.pages());
                }
                None => gfn = gfn.offset(1),
            }
        }
        pod_debug!("{}: declared {} lazy frames from {}", self.id(), range.len(), range.start());
        Ok(())
    }

    /// Largest order usable at `gfn` without crossing `end` or covering
    /// device memory; `None` if `gfn` itself is device memory.
    fn declare_order(&self, gfn: Gfn, end: Gfn) -> Result<Option<PageOrder>> {
        for order in PageOrder::DESCENDING {
            if !gfn.is_aligned(order) || gfn.offset(order.pages()) > end {
                continue;
            }
            let mut mmio = false;
            self.table.for_each_run_in(gfn, order, |run| {
                mmio |= run.entry.entry_type() == EntryType::MmioDirect;
            })?;
            if !mmio {
                return Ok(Some(order));
            }
        }
        Ok(None)
    }

    /// Resolves a fault on a lazy frame.
    ///
    /// Racing callers on the same frame are serialized by the lock; the
    /// first materializes the frame and the rest find it resolved and return
    /// success. Running out of frames, or losing frame contents after the
    /// table was touched, crashes the VM.
    pub fn demand_populate(&self, gfn: Gfn, kind: FaultKind) -> Result<()> {
        let mut guard = self.lock_mutable()?;
        self.check_gfn(gfn)?;

        loop {
            let (entry, order) = self.table.lookup(gfn)?;
            let Some(resolution) = entry.resolution() else {
                return Ok(());
            };
            if order > PageOrder::Order4K {
                guard.shatter(gfn, order)?;
                continue;
            }

            if kind == FaultKind::ConfirmZero {
                if resolution != Resolution::Zero {
                    let zero = Entry::lazy(Resolution::Zero, entry.access);
                    guard.set(gfn, zero, order, Release::Free)?;
                }
                return Ok(());
            }

            let source = match resolution {
                Resolution::Zero => Source::Zero,
                Resolution::SharedTemplate(mfn) => Source::Copy(mfn),
                Resolution::Unresolved => match guard.template() {
                    None => Source::Zero,
                    Some(_) if !kind.is_write() && self.config().eager_clone_regions => {
                        guard.clone_region(gfn.align_down(PageOrder::Order2M))?;
                        return Ok(());
                    }
                    Some(template) if !kind.is_write() => {
                        let source = template.resolve(gfn, true).map_err(|e| guard.escalate(e))?;
                        let resolution = match source {
                            TemplateSource::Frame(mfn) => Resolution::SharedTemplate(mfn),
                            TemplateSource::Zero => Resolution::Zero,
                        };
                        let shared = Entry::lazy(resolution, entry.access);
                        guard.set_or_crash(gfn, shared, order, Release::Free)?;
                        pod_trace!("{}: {} shared from template", self.id(), gfn);
                        return Ok(());
                    }
                    Some(template) => {
                        match template.resolve(gfn, false).map_err(|e| guard.escalate(e))? {
                            TemplateSource::Frame(mfn) => Source::Copy(mfn),
                            TemplateSource::Zero => Source::Zero,
                        }
                    }
                },
            };

            let mfn = guard.materialize(source)?;
            guard.set_or_crash(gfn, Entry::ram(mfn, entry.access), order, Release::Free)?;
            self.counters.record_populate();
            guard.mark_dirty(gfn);
            pod_trace!("{}: populated {} with {}", self.id(), gfn, mfn);
            return Ok(());
        }
    }

    /// Reclaims the frame behind `gfn` to the shared zero frame if it holds
    /// only zeroes and nothing else references it.
    ///
    /// A private frame goes to the deferred free list; a template-shared
    /// frame just drops its share. Any failed check leaves the table as it
    /// was.
    pub fn zero_share(&self, gfn: Gfn) -> Result<ZeroShareOutcome> {
        let mut guard = self.lock_mutable()?;
        self.check_gfn(gfn)?;
        let memory = self.host().memory();

        let entry = self.table.get(gfn)?;
        let release = match entry.mapping {
            Mapping::Ram(mfn) => {
                let aliased = guard.state.share_refs.contains_key(&mfn)
                    || guard.state.deferred_free.contains(&mfn);
                if aliased {
                    pod_warn!("{}: {} not reclaimed, {} is aliased", self.id(), gfn, mfn);
                    return Ok(ZeroShareOutcome::Aliased);
                }
                if mfn == self.host().zero_frame() {
                    return Err(guard.crash(FatalReason::InvariantViolation(
                        "private entry maps the zero frame",
                    )));
                }
                Release::Defer
            }
            Mapping::Lazy(Resolution::SharedTemplate(_)) => Release::Free,
            _ => return Ok(ZeroShareOutcome::NotEligible),
        };
        let Some(mfn) = entry.mfn() else {
            return Ok(ZeroShareOutcome::NotEligible);
        };
        if !memory.is_zero(mfn)? {
            return Ok(ZeroShareOutcome::NotZero);
        }

        guard.set(
            gfn,
            Entry::lazy(Resolution::Zero, entry.access),
            PageOrder::Order4K,
            release,
        )?;
        self.counters.record_zero_reclaim();
        pod_trace!("{}: {} reclaimed to the zero frame", self.id(), gfn);
        Ok(ZeroShareOutcome::Shared)
    }

    /// Runs `zero_share` over the reclaimable frames of `range`, stopping
    /// after `budget` reclaims. Returns the number reclaimed.
    pub fn sweep_zero_pages(&self, range: GfnRange, budget: usize) -> Result<usize> {
        self.check_range(range)?;
        let mut reclaimed = 0;
        for gfn in range.iter() {
            if reclaimed >= budget {
                break;
            }
            let candidate = matches!(
                self.table.get(gfn)?.mapping,
                Mapping::Ram(_) | Mapping::Lazy(Resolution::SharedTemplate(_))
            );
            if candidate && self.zero_share(gfn)? == ZeroShareOutcome::Shared {
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            pod_debug!("{}: zero sweep reclaimed {} frames", self.id(), reclaimed);
        }
        Ok(reclaimed)
    }

    /// Returns the deferred free list to the allocator.
    pub fn flush_deferred(&self) -> usize {
        self.lock().flush_deferred()
    }

    /// Backs every frame of `range` with a private zero-filled frame.
    ///
    /// Frames that are already private keep their contents. Running out of
    /// memory is an ordinary error here: frames populated before the
    /// failure stay mapped.
    pub fn populate_ram(&self, range: GfnRange) -> Result<()> {
        let mut guard = self.lock_mutable()?;
        self.check_range(range)?;
        for gfn in range.iter() {
            if self.table.get(gfn)?.entry_type() == EntryType::MmioDirect {
                return Err(Error::InvalidArgument("range overlaps device memory"));
            }
        }

        let access = self.config().default_access;
        for gfn in range.iter() {
            if self.table.get(gfn)?.entry_type() == EntryType::RamRW {
                continue;
            }
            let Some(mfn) = guard.take_frame() else {
                pod_warn!("{}: out of frames populating {}", self.id(), gfn);
                return Err(Error::OutOfMemory);
            };
            if self.host().memory().fill_zero(mfn).is_err() {
                self.host().memory().free_frame(mfn);
                let reason = FatalReason::InvariantViolation("frame contents unavailable");
                return Err(guard.crash(reason));
            }
            guard.set_or_crash(gfn, Entry::ram(mfn, access), PageOrder::Order4K, Release::Free)?;
            guard.mark_dirty(gfn);
        }
        Ok(())
    }

    /// Maps device memory at `gfn`. Whatever was mapped there is released.
    pub fn map_mmio(&self, gfn: Gfn, mfn: Mfn, access: Access) -> Result<()> {
        let mut guard = self.lock_mutable()?;
        self.check_gfn(gfn)?;
        if mfn == self.host().zero_frame() {
            return Err(Error::InvalidArgument("zero frame cannot be device memory"));
        }
        guard.set(gfn, Entry::mmio(mfn, access), PageOrder::Order4K, Release::Free)
    }

    /// Unmaps `2^order` frames at `gfn`, releasing their frames.
    pub fn remove(&self, gfn: Gfn, order: PageOrder) -> Result<()> {
        let mut guard = self.lock_mutable()?;
        guard.set(gfn, Entry::INVALID, order, Release::Free)
    }

    /// Changes the access rights of the entry at `gfn`, keeping its mapping.
    pub fn set_access(&self, gfn: Gfn, access: Access) -> Result<()> {
        let mut guard = self.lock_mutable()?;
        let entry = self.table.get(gfn)?;
        if entry.is_invalid() {
            return Err(Error::NotMapped(gfn));
        }
        guard.set(gfn, entry.with_access(access), PageOrder::Order4K, Release::Keep)
    }
}

impl SpaceGuard<'_> {
    /// Splits the large mapping covering `gfn` into the next smaller order.
    fn shatter(&mut self, gfn: Gfn, order: PageOrder) -> Result<()> {
        let Some(smaller) = order.smaller() else {
            return Ok(());
        };
        let base = gfn.align_down(smaller);
        let entry = self.space.table.get(base)?;
        self.set(base, entry, smaller, Release::Keep)?;
        self.space.counters.record_shatter();
        Ok(())
    }

    /// Obtains a private frame filled from `source`.
    fn materialize(&mut self, source: Source) -> Result<Mfn> {
        let Some(mfn) = self.take_frame() else {
            return Err(self.crash(FatalReason::OutOfMemory));
        };
        let memory = self.space.host().memory();
        let filled = match source {
            Source::Zero => memory.fill_zero(mfn),
            Source::Copy(src) => memory.copy_frame(mfn, src),
        };
        if filled.is_err() {
            memory.free_frame(mfn);
            return Err(self.crash(FatalReason::InvariantViolation("frame contents unavailable")));
        }
        Ok(mfn)
    }
}
