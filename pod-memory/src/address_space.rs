//! Per-VM address space
//!
//! An [`AddressSpace`] owns the translation table of one VM, its accounting
//! counters and the populate-on-demand state kept under the address space
//! lock: the lifecycle, the deferred free list, the template handle and, for
//! templates, the table of frames shared with clones.
//!
//! Every mutation goes through [`SpaceGuard`], which can only be obtained by
//! taking the lock. Lock order is static: a clone's lock, then its template's
//! lock (always a leaf, see `template`), then the frame allocator's lock.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use hashbrown::{HashMap, HashSet};
use pod_api::{
    DirtyLog, Entry, Error, FatalReason, Gfn, GfnRange, Mapping, Mfn, PageOrder, Resolution,
    Result, VmId,
};
use spin::{Mutex, MutexGuard};

use crate::accounting::{Counters, PodStats, Tally};
use crate::config::PodConfig;
use crate::host::HostContext;
use crate::page_table::{P2mTable, Run};
use crate::template::TemplateRef;

/// Lifecycle of an address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Accepting faults and mutations
    Running,
    /// Crashed by a fatal condition; only teardown is accepted
    Crashed(FatalReason),
    /// Torn down
    Dead,
}

impl Lifecycle {
    /// Returns true once the VM is crashed or torn down
    pub fn is_dying(&self) -> bool {
        !matches!(self, Lifecycle::Running)
    }
}

/// State protected by the address space lock
pub(crate) struct PodState {
    pub(crate) lifecycle: Lifecycle,
    /// Frames reclaimed by zero sharing, not yet returned to the allocator
    pub(crate) deferred_free: Vec<Mfn>,
    pub(crate) template: Option<TemplateRef>,
    /// For templates: clone references held on each shared frame
    pub(crate) share_refs: HashMap<Mfn, u32>,
}

/// What happens to the frames of entries replaced by an update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Release {
    /// Private frames go back to the allocator
    Free,
    /// Private frames go to the deferred free list
    Defer,
    /// The installed entry keeps the same frames
    Keep,
}

/// Guest-physical address space of one VM
pub struct AddressSpace {
    id: VmId,
    host: Arc<HostContext>,
    config: PodConfig,
    pub(crate) table: P2mTable,
    pub(crate) counters: Counters,
    pub(crate) state: Mutex<PodState>,
    pub(crate) frozen: AtomicBool,
    pub(crate) clones: AtomicUsize,
    dirty_log: Option<Arc<dyn DirtyLog>>,
}

impl AddressSpace {
    /// Create an empty address space; every frame is implicitly invalid.
    pub fn new(host: &Arc<HostContext>, config: PodConfig) -> Result<Arc<Self>> {
        Self::build(host, config, None)
    }

    /// Create an empty address space reporting materialized frames to
    /// `dirty_log`.
    pub fn with_dirty_log(
        host: &Arc<HostContext>,
        config: PodConfig,
        dirty_log: Arc<dyn DirtyLog>,
    ) -> Result<Arc<Self>> {
        Self::build(host, config, Some(dirty_log))
    }

    fn build(
        host: &Arc<HostContext>,
        config: PodConfig,
        dirty_log: Option<Arc<dyn DirtyLog>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let id = host.alloc_vm_id();
        pod_info!("{}: address space created, {} frames", id, config.max_gfn.as_u64());
        Ok(Arc::new(Self {
            id,
            host: Arc::clone(host),
            table: P2mTable::new(config.max_gfn),
            config,
            counters: Counters::new(),
            state: Mutex::new(PodState {
                lifecycle: Lifecycle::Running,
                deferred_free: Vec::new(),
                template: None,
                share_refs: HashMap::new(),
            }),
            frozen: AtomicBool::new(false),
            clones: AtomicUsize::new(0),
            dirty_log,
        }))
    }

    /// VM identifier
    pub fn id(&self) -> VmId {
        self.id
    }

    /// Host context the address space allocates from
    pub fn host(&self) -> &Arc<HostContext> {
        &self.host
    }

    /// Configuration
    pub fn config(&self) -> &PodConfig {
        &self.config
    }

    /// First frame beyond the guest-physical limit
    pub fn max_gfn(&self) -> Gfn {
        self.table.max_gfn()
    }

    /// Current entry for `gfn`, without taking the lock
    ///
    /// The result is a snapshot; anything acting on it must recheck under
    /// the lock.
    pub fn get(&self, gfn: Gfn) -> Result<Entry> {
        self.table.get(gfn)
    }

    /// Current entry for `gfn` and the order of the mapping covering it
    pub fn lookup(&self, gfn: Gfn) -> Result<(Entry, PageOrder)> {
        self.table.lookup(gfn)
    }

    /// Current lifecycle
    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lock().lifecycle
    }

    /// Returns true once the VM is crashed or torn down
    pub fn is_dying(&self) -> bool {
        self.lifecycle().is_dying()
    }

    /// Returns true if the address space serves as a template
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Returns true if the address space is a clone
    pub fn has_template(&self) -> bool {
        self.state.lock().template.is_some()
    }

    /// Number of clones attached to this address space
    pub fn clone_count(&self) -> usize {
        self.clones.load(Ordering::Acquire)
    }

    /// Live counters, readable without the lock
    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Accounting snapshot
    pub fn stats(&self) -> PodStats {
        let deferred = self.state.lock().deferred_free.len();
        PodStats::new(&self.counters, deferred, self.clone_count())
    }

    /// Walks the whole table and checks it against the counters.
    ///
    /// Verifies that the counters match the table, that lazy plus
    /// materialized pages equal declared pages, and that no private frame is
    /// mapped twice, is the zero frame or sits on the deferred free list.
    /// Any failure crashes the VM.
    pub fn audit(&self) -> Result<()> {
        let mut guard = self.lock();
        let zero = self.host.zero_frame();
        let mut tally = Tally::default();
        let mut frames = HashSet::new();
        let mut broken: Option<&'static str> = None;

        self.table.for_each_run(|run| {
            tally.add_run(&run);
            if let Mapping::Ram(base) = run.entry.mapping {
                for mfn in (0..run.pages()).map(|i| base.offset(i)) {
                    if broken.is_some() {
                        break;
                    }
                    if mfn == zero {
                        broken = Some("private entry maps the zero frame");
                    } else if !frames.insert(mfn) {
                        broken = Some("private frame mapped twice");
                    }
                }
            }
        });

        if broken.is_none() {
            broken = if guard.state.deferred_free.iter().any(|mfn| frames.contains(mfn)) {
                Some("deferred frame still mapped")
            } else if tally != self.counters.tally() {
                Some("counters disagree with table")
            } else if !tally.identity_holds() {
                Some("lazy plus materialized pages differ from declared pages")
            } else {
                None
            };
        }

        match broken {
            Some(what) => Err(guard.crash(FatalReason::InvariantViolation(what))),
            None => Ok(()),
        }
    }

    /// Returns every frame to the allocator and marks the VM dead.
    ///
    /// The caller guarantees that no VCPU of this VM can still fault. A
    /// template cannot be torn down while clones are attached.
    pub fn teardown(&self) -> Result<()> {
        let mut guard = self.lock();
        if guard.state.lifecycle == Lifecycle::Dead {
            return Err(Error::Dying);
        }
        if self.clone_count() > 0 {
            pod_warn!("{}: teardown refused, {} clones attached", self.id, self.clone_count());
            return Err(Error::Busy("template has attached clones"));
        }
        guard.state.lifecycle = Lifecycle::Dead;

        let mut runs = Vec::new();
        self.table.for_each_run(|run| runs.push(run));
        for run in &runs {
            if let Err(e) = guard.set(run.gfn, Entry::INVALID, run.order, Release::Free) {
                pod_error!("{}: teardown failed to clear {}: {}", self.id, run.gfn, e);
            }
        }
        let flushed = guard.flush_deferred();
        if let Some(template) = guard.state.template.take() {
            template.detach();
        }
        pod_info!(
            "{}: torn down, {} runs cleared, {} deferred frames flushed",
            self.id,
            runs.len(),
            flushed
        );
        Ok(())
    }

    pub(crate) fn lock(&self) -> SpaceGuard<'_> {
        SpaceGuard {
            space: self,
            state: self.state.lock(),
        }
    }

    /// Takes the lock, refusing crashed and dead VMs.
    pub(crate) fn lock_running(&self) -> Result<SpaceGuard<'_>> {
        let guard = self.lock();
        if guard.state.lifecycle.is_dying() {
            return Err(Error::Dying);
        }
        Ok(guard)
    }

    /// Takes the lock, additionally refusing templates.
    pub(crate) fn lock_mutable(&self) -> Result<SpaceGuard<'_>> {
        let guard = self.lock_running()?;
        if self.is_frozen() {
            return Err(Error::TemplateReadOnly);
        }
        Ok(guard)
    }

    pub(crate) fn check_gfn(&self, gfn: Gfn) -> Result<()> {
        if gfn >= self.max_gfn() {
            return Err(Error::OutOfRange(gfn));
        }
        Ok(())
    }

    pub(crate) fn check_range(&self, range: GfnRange) -> Result<()> {
        if range.end() > self.max_gfn() {
            return Err(Error::OutOfRange(range.start().max(self.max_gfn())));
        }
        Ok(())
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        if self.state.get_mut().lifecycle != Lifecycle::Dead {
            let _ = self.teardown();
        }
    }
}

/// Exclusive access to an address space's mutable state
pub(crate) struct SpaceGuard<'a> {
    pub(crate) space: &'a AddressSpace,
    pub(crate) state: MutexGuard<'a, PodState>,
}

impl SpaceGuard<'_> {
    /// Installs `entry` over `2^order` frames at `gfn`.
    ///
    /// Accounts the replaced runs, invalidates cached translations and
    /// disposes of the replaced frames as `release` says.
    pub(crate) fn set(
        &mut self,
        gfn: Gfn,
        entry: Entry,
        order: PageOrder,
        release: Release,
    ) -> Result<()> {
        let mut replaced = Vec::new();
        if !self.space.table.set(gfn, entry, order, &mut replaced)? {
            return Ok(());
        }
        self.space.counters.apply(&replaced, &entry, order);
        self.space.host.bump_generation();
        if release != Release::Keep {
            self.release_runs(&replaced, release);
        }
        Ok(())
    }

    /// Like `set`, for updates made after the operation already changed
    /// the table: a failure crashes the VM instead of leaving it half done.
    pub(crate) fn set_or_crash(
        &mut self,
        gfn: Gfn,
        entry: Entry,
        order: PageOrder,
        release: Release,
    ) -> Result<()> {
        match self.set(gfn, entry, order, release) {
            Ok(()) => Ok(()),
            Err(_) => {
                let reason = FatalReason::InvariantViolation("table update failed mid-operation");
                Err(self.crash(reason))
            }
        }
    }

    fn release_runs(&mut self, runs: &[Run], release: Release) {
        let mut freed = Vec::new();
        for run in runs {
            let frames = |base: Mfn| (0..run.pages()).map(move |i| base.offset(i));
            match run.entry.mapping {
                Mapping::Ram(base) if release == Release::Defer => {
                    self.state.deferred_free.extend(frames(base));
                }
                Mapping::Ram(base) => freed.extend(frames(base)),
                Mapping::Lazy(Resolution::SharedTemplate(base)) => {
                    match self.state.template.as_ref() {
                        Some(template) => frames(base).for_each(|mfn| template.release_share(mfn)),
                        None => {
                            let _ = self.crash(FatalReason::InvariantViolation(
                                "shared entry without a template",
                            ));
                        }
                    }
                }
                _ => {}
            }
        }
        if !freed.is_empty() {
            self.space.host.memory().free_frames(&freed);
        }
        if self.state.deferred_free.len() > self.space.config.deferred_free_limit {
            self.flush_deferred();
        }
    }

    /// Takes a frame, preferring the deferred free list.
    ///
    /// Frames from either source hold stale contents.
    pub(crate) fn take_frame(&mut self) -> Option<Mfn> {
        self.state
            .deferred_free
            .pop()
            .or_else(|| self.space.host.memory().alloc_frame())
    }

    /// Returns the deferred free list to the allocator
    pub(crate) fn flush_deferred(&mut self) -> usize {
        let frames = core::mem::take(&mut self.state.deferred_free);
        if !frames.is_empty() {
            self.space.host.memory().free_frames(&frames);
            pod_debug!("{}: flushed {} deferred frames", self.space.id, frames.len());
        }
        frames.len()
    }

    /// Crashes the VM and returns the error to surface.
    pub(crate) fn crash(&mut self, reason: FatalReason) -> Error {
        if self.state.lifecycle == Lifecycle::Running {
            self.state.lifecycle = Lifecycle::Crashed(reason);
            pod_error!("{}: crashed: {}", self.space.id, reason);
        }
        Error::Fatal(reason)
    }

    /// Crashes the VM if `error` is fatal, passing the error through.
    pub(crate) fn escalate(&mut self, error: Error) -> Error {
        match error {
            Error::Fatal(reason) => self.crash(reason),
            other => other,
        }
    }

    pub(crate) fn template(&self) -> Option<TemplateRef> {
        self.state.template.clone()
    }

    pub(crate) fn mark_dirty(&self, gfn: Gfn) {
        if let Some(log) = &self.space.dirty_log {
            log.mark_dirty(gfn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::FramePool;
    use alloc::vec;
    use pod_api::{Access, FrameAllocator};

    fn setup(frames: usize) -> (Arc<FramePool>, Arc<AddressSpace>) {
        let pool = Arc::new(FramePool::new(Mfn::new(0x1000), frames));
        let host = HostContext::new(pool.clone());
        let config = PodConfig::default().with_max_gfn(Gfn::new(4096));
        let space = AddressSpace::new(&host, config).unwrap();
        (pool, space)
    }

    #[test]
    fn test_guard_set_accounts_and_bumps_generation() {
        let (_pool, space) = setup(4);
        let before = space.host().generation();
        {
            let mut guard = space.lock();
            let lazy = Entry::lazy(Resolution::Unresolved, Access::RWX);
            guard.set(Gfn::new(0), lazy, PageOrder::Order2M, Release::Free).unwrap();
            guard.set(Gfn::new(0), lazy, PageOrder::Order2M, Release::Free).unwrap();
        }
        assert_eq!(space.host().generation(), before + 1);
        assert_eq!(space.stats().lazy_pages, 512);
        space.audit().unwrap();
    }

    #[test]
    fn test_replaced_frames_are_released() {
        let (pool, space) = setup(4);
        let mut guard = space.lock();
        let a = guard.take_frame().unwrap();
        let b = guard.take_frame().unwrap();
        guard
            .set(Gfn::new(1), Entry::ram(a, Access::RW), PageOrder::Order4K, Release::Free)
            .unwrap();
        guard
            .set(Gfn::new(2), Entry::ram(b, Access::RW), PageOrder::Order4K, Release::Free)
            .unwrap();
        assert_eq!(pool.free_frames_count(), 2);

        guard.set(Gfn::new(1), Entry::INVALID, PageOrder::Order4K, Release::Free).unwrap();
        assert!(!pool.is_allocated(a));
        let zero = Entry::lazy(Resolution::Zero, Access::RW);
        guard
            .set(Gfn::new(2), zero, PageOrder::Order4K, Release::Defer)
            .unwrap();
        assert_eq!(guard.state.deferred_free, vec![b]);
        assert!(pool.is_allocated(b));
        assert_eq!(guard.take_frame(), Some(b));
    }

    #[test]
    fn test_crash_is_sticky() {
        let (_pool, space) = setup(1);
        let err = space.lock().crash(FatalReason::OutOfMemory);
        assert_eq!(err, Error::Fatal(FatalReason::OutOfMemory));
        space.lock().crash(FatalReason::InvariantViolation("later"));
        assert_eq!(space.lifecycle(), Lifecycle::Crashed(FatalReason::OutOfMemory));
        assert!(matches!(space.lock_running(), Err(Error::Dying)));
    }

    #[test]
    fn test_teardown_frees_everything() {
        let (pool, space) = setup(8);
        {
            let mut guard = space.lock();
            for i in 0..3 {
                let ram = Entry::ram(guard.take_frame().unwrap(), Access::RW);
                guard
                    .set(Gfn::new(i), ram, PageOrder::Order4K, Release::Free)
                    .unwrap();
            }
            let mmio = Entry::mmio(Mfn::new(0xfee00), Access::RW);
            guard
                .set(Gfn::new(8), mmio, PageOrder::Order4K, Release::Free)
                .unwrap();
        }
        space.teardown().unwrap();
        assert_eq!(pool.free_frames_count(), 8);
        assert_eq!(pool.stats().invalid_frees, 0);
        assert_eq!(space.lifecycle(), Lifecycle::Dead);
        assert_eq!(space.get(Gfn::new(0)).unwrap(), Entry::INVALID);
        assert_eq!(space.teardown(), Err(Error::Dying));
    }

    #[test]
    fn test_audit_detects_zero_frame_mapping() {
        let (_pool, space) = setup(2);
        let zero = space.host().zero_frame();
        space
            .lock()
            .set(Gfn::new(3), Entry::ram(zero, Access::RW), PageOrder::Order4K, Release::Free)
            .unwrap();
        assert!(matches!(space.audit(), Err(Error::Fatal(_))));
        assert!(space.is_dying());
        // Clear the bogus entry so teardown does not free the zero frame.
        space
            .lock()
            .set(Gfn::new(3), Entry::INVALID, PageOrder::Order4K, Release::Keep)
            .unwrap();
    }

    #[test]
    fn test_range_checks() {
        let (_pool, space) = setup(1);
        assert!(space.check_gfn(Gfn::new(4095)).is_ok());
        assert_eq!(space.check_gfn(Gfn::new(4096)), Err(Error::OutOfRange(Gfn::new(4096))));
        assert_eq!(
            space.check_range(GfnRange::new(Gfn::new(4000), 200)),
            Err(Error::OutOfRange(Gfn::new(4096)))
        );
    }
}
