//! Process-wide host context
//!
//! State shared by every address space on the host: the physical memory
//! collaborator, the translation generation counter consulted by per-core
//! translation caches, and the VM id allocator.

extern crate alloc;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use pod_api::{Mfn, PhysicalMemory, VmId};

/// Host-wide context shared by all address spaces
pub struct HostContext {
    memory: Arc<dyn PhysicalMemory>,
    generation: AtomicU64,
    next_vm_id: AtomicU32,
}

impl HostContext {
    /// Create a host context around a physical memory collaborator
    pub fn new(memory: Arc<dyn PhysicalMemory>) -> Arc<Self> {
        pod_info!("host context: zero frame at {}", memory.zero_frame());
        Arc::new(Self {
            memory,
            generation: AtomicU64::new(0),
            next_vm_id: AtomicU32::new(1),
        })
    }

    /// Physical memory collaborator
    pub fn memory(&self) -> &dyn PhysicalMemory {
        &*self.memory
    }

    /// The canonical zero frame
    pub fn zero_frame(&self) -> Mfn {
        self.memory.zero_frame()
    }

    /// Current translation generation
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Invalidates every cached translation on every core
    pub(crate) fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn alloc_vm_id(&self) -> VmId {
        VmId(self.next_vm_id.fetch_add(1, Ordering::Relaxed))
    }
}
