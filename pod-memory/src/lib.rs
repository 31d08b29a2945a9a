//! PoD Memory
//!
//! Guest-physical to machine-physical translation for hypervisor guests,
//! with a populate-on-demand engine on top.
//!
//! Each VM owns an [`AddressSpace`]: a three-level translation table plus the
//! accounting and state needed to back guest memory lazily. Guest memory is
//! declared lazy at build time, materialized into private frames on first
//! touch, reclaimed back to a shared zero frame when it holds nothing, and,
//! for clones, shared read-only from a frozen template until written.
//!
//! # Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use pod_memory::{
//!     AddressSpace, FaultKind, FramePool, Gfn, GfnRange, HostContext, Mfn, PodConfig,
//! };
//!
//! let pool = Arc::new(FramePool::new(Mfn::new(0x1000), 16));
//! let host = HostContext::new(pool);
//! let config = PodConfig::default().with_max_gfn(Gfn::new(1024));
//! let space = AddressSpace::new(&host, config).unwrap();
//!
//! space.declare_lazy(GfnRange::new(Gfn::new(0), 1024)).unwrap();
//! pod_memory::on_nested_fault(&space, Gfn::new(5), FaultKind::Write).unwrap();
//! assert_eq!(space.stats().ram_pages, 1);
//! assert_eq!(space.stats().lazy_pages, 1023);
//! ```

#![no_std]
#![warn(missing_docs)]
#![warn(clippy::all)]

#[macro_use]
mod logging;

// Re-export API types
pub use pod_api::*;

// Translation and populate-on-demand modules
pub mod accounting;
pub mod address_space;
pub mod allocator;
pub mod config;
pub mod dirty;
pub mod fault;
pub mod host;
pub mod page_table;
pub mod physical;
pub mod pod;
pub mod template;
pub mod tlb;

// Re-export commonly used types and functions
pub use accounting::{Counters, PageClass, PodStats, Tally};
pub use address_space::{AddressSpace, Lifecycle};
pub use allocator::{FramePool, PoolStats};
pub use config::{MAX_SUPPORTED_GFN, PodConfig};
pub use dirty::DirtyBitmap;
pub use fault::{
    address_space_attach_template, address_space_create, address_space_declare_lazy,
    address_space_teardown, on_nested_fault, zero_share,
};
pub use host::HostContext;
pub use page_table::{P2mTable, Run};
pub use physical::{FrameBuf, is_zero_page};
pub use pod::ZeroShareOutcome;
pub use template::TemplateRef;
pub use tlb::{CacheStats, TranslationCache};
