//! Frame allocator module
//!
//! The host's physical page allocator is an external collaborator reached
//! through [`pod_api::FrameAllocator`]. This module carries the in-memory
//! pool used by tests, benchmarks and embedders without a real allocator.

pub mod pool;

pub use pool::{FramePool, PoolStats};
