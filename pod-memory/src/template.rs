//! Templates and the clone resolver
//!
//! A clone resolves its never-touched lazy frames against a read-only
//! template. The template is reached only through [`TemplateRef`], whose
//! methods take the template's lock for one short read or update and release
//! it before returning. No guard ever escapes, so the template lock is always
//! the innermost address space lock held and a template can never wait on a
//! clone.
//!
//! Attaching a clone freezes the template for the rest of its life: every
//! mutating entry point on a frozen address space fails with
//! `TemplateReadOnly`, so template frames referenced by clones never change
//! and never go away while a clone is attached.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use pod_api::{Entry, Error, FatalReason, Gfn, Mapping, Mfn, PageOrder, Resolution, Result};

use crate::accounting::Tally;
use crate::address_space::{AddressSpace, Release, SpaceGuard};
use crate::page_table::Run;

/// Where a clone frame gets its contents from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TemplateSource {
    /// A private frame of the template
    Frame(Mfn),
    /// Nothing the template knows about; zero contents
    Zero,
}

/// Handle on a clone's template
#[derive(Clone)]
pub struct TemplateRef {
    space: Arc<AddressSpace>,
}

impl TemplateRef {
    /// Freezes `space` and registers one more clone against it.
    ///
    /// Returns the template's declared runs for the clone to inherit.
    pub(crate) fn adopt(space: Arc<AddressSpace>) -> Result<(Self, Vec<Run>)> {
        let runs = {
            let state = space.state.lock();
            if state.lifecycle.is_dying() {
                return Err(Error::Dying);
            }
            if state.template.is_some() {
                return Err(Error::InvalidArgument("template chains are not supported"));
            }
            space.frozen.store(true, Ordering::Release);
            space.clones.fetch_add(1, Ordering::AcqRel);

            let mut runs = Vec::new();
            space.table.for_each_run(|run| {
                if matches!(run.entry.mapping, Mapping::Ram(_) | Mapping::Lazy(_)) {
                    runs.push(run);
                }
            });
            runs
        };
        Ok((Self { space }, runs))
    }

    /// Unregisters a clone.
    pub(crate) fn detach(&self) {
        let _state = self.space.state.lock();
        self.space.clones.fetch_sub(1, Ordering::AcqRel);
    }

    /// The template address space
    pub fn space(&self) -> &Arc<AddressSpace> {
        &self.space
    }

    /// Looks up `gfn` in the template.
    ///
    /// With `share`, a frame source is recorded as referenced by the caller
    /// until it calls `release_share`.
    pub(crate) fn resolve(&self, gfn: Gfn, share: bool) -> Result<TemplateSource> {
        let mut state = self.space.state.lock();
        let source = self.source_of(gfn)?;
        if let (true, TemplateSource::Frame(mfn)) = (share, source) {
            *state.share_refs.entry(mfn).or_insert(0) += 1;
        }
        Ok(source)
    }

    /// Resolves and shares a batch of frames in one locked pass.
    pub(crate) fn share_region(&self, gfns: &[Gfn]) -> Result<Vec<TemplateSource>> {
        let mut state = self.space.state.lock();
        let mut sources = Vec::with_capacity(gfns.len());
        for &gfn in gfns {
            sources.push(self.source_of(gfn)?);
        }
        for source in &sources {
            if let TemplateSource::Frame(mfn) = source {
                *state.share_refs.entry(*mfn).or_insert(0) += 1;
            }
        }
        Ok(sources)
    }

    /// Drops one clone reference on a shared frame.
    pub(crate) fn release_share(&self, mfn: Mfn) {
        let mut state = self.space.state.lock();
        let remaining = match state.share_refs.get_mut(&mfn) {
            Some(count) => {
                *count -= 1;
                *count
            }
            None => {
                pod_warn!("{}: release of unshared {}", self.space.id(), mfn);
                return;
            }
        };
        if remaining == 0 {
            state.share_refs.remove(&mfn);
        }
    }

    /// Clone references currently held on `mfn`
    pub fn share_count(&self, mfn: Mfn) -> u32 {
        self.space.state.lock().share_refs.get(&mfn).copied().unwrap_or(0)
    }

    // Caller holds the template lock.
    fn source_of(&self, gfn: Gfn) -> Result<TemplateSource> {
        let entry = match self.space.table.get(gfn) {
            Ok(entry) => entry,
            Err(Error::OutOfRange(_)) => return Ok(TemplateSource::Zero),
            Err(e) => return Err(e),
        };
        match entry.mapping {
            Mapping::Ram(mfn) => Ok(TemplateSource::Frame(mfn)),
            Mapping::Lazy(Resolution::SharedTemplate(_)) => Err(Error::Fatal(
                FatalReason::InvariantViolation("template entry shared from another template"),
            )),
            // Unresolved and zero lazy frames, device memory and holes all
            // read as zero in a clone.
            _ => Ok(TemplateSource::Zero),
        }
    }
}

impl AddressSpace {
    /// Makes this address space a clone of `template`.
    ///
    /// The clone must be empty. It inherits the template's declared layout
    /// as unresolved lazy entries, which fault in from the template on first
    /// touch. The template is frozen from here on.
    pub fn attach_template(&self, template: &Arc<AddressSpace>) -> Result<()> {
        if core::ptr::eq(self, Arc::as_ptr(template)) {
            return Err(Error::InvalidArgument("address space cannot be its own template"));
        }
        if template.max_gfn() > self.max_gfn() {
            return Err(Error::InvalidArgument("template is larger than the clone"));
        }
        if self.is_frozen() {
            return Err(Error::TemplateReadOnly);
        }

        // The template lock is taken and released before the clone lock so
        // two spaces attaching to each other cannot deadlock.
        let (template_ref, runs) = TemplateRef::adopt(Arc::clone(template))?;

        let mut guard = match self.lock_mutable() {
            Ok(guard) => guard,
            Err(e) => {
                template_ref.detach();
                return Err(e);
            }
        };
        if guard.state.template.is_some() || self.counters.tally() != Tally::default() {
            drop(guard);
            template_ref.detach();
            return Err(Error::Busy("clone must be empty and unattached"));
        }

        for run in &runs {
            let entry = Entry::lazy(Resolution::Unresolved, run.entry.access);
            if let Err(e) = guard.set_or_crash(run.gfn, entry, run.order, Release::Free) {
                drop(guard);
                template_ref.detach();
                return Err(e);
            }
        }
        guard.state.template = Some(template_ref);
        pod_info!(
            "{}: attached to template {}, {} runs inherited",
            self.id(),
            template.id(),
            runs.len()
        );
        Ok(())
    }

    /// The template this address space was cloned from
    pub fn template(&self) -> Option<TemplateRef> {
        self.state.lock().template.clone()
    }

    /// Resolves every unresolved lazy frame of the 512-frame region at `gfn`
    /// against the template in one locked pass.
    ///
    /// Template frames are shared, not copied; everything else becomes a
    /// zero-shared entry. Returns the number of frames resolved.
    pub fn clone_region(&self, gfn: Gfn) -> Result<usize> {
        let mut guard = self.lock_mutable()?;
        guard.clone_region(gfn)
    }
}

impl SpaceGuard<'_> {
    pub(crate) fn clone_region(&mut self, gfn: Gfn) -> Result<usize> {
        let Some(template) = self.template() else {
            return Err(Error::InvalidArgument("address space has no template"));
        };

        let mut pending = Vec::new();
        self.space.table.for_each_in_l1_region(gfn, |gfn, entry| {
            if entry.resolution() == Some(Resolution::Unresolved) {
                pending.push((gfn, entry.access));
            }
        })?;
        let gfns: Vec<Gfn> = pending.iter().map(|&(gfn, _)| gfn).collect();
        let sources = template.share_region(&gfns).map_err(|e| self.escalate(e))?;

        for (&(gfn, access), source) in pending.iter().zip(sources) {
            let resolution = match source {
                TemplateSource::Frame(mfn) => Resolution::SharedTemplate(mfn),
                TemplateSource::Zero => Resolution::Zero,
            };
            let shared = Entry::lazy(resolution, access);
            self.set_or_crash(gfn, shared, PageOrder::Order4K, Release::Free)?;
        }
        pod_debug!(
            "{}: cloned {} frames of region at {}",
            self.space.id(),
            pending.len(),
            gfn
        );
        Ok(pending.len())
    }
}
