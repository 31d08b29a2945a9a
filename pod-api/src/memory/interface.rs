//! Collaborator interfaces
//!
//! The translation layer does not own physical memory. Frames come from an
//! external allocator, their contents are reached through a physical-memory
//! accessor, and materialized pages are reported to an optional dirty log.

use crate::core::types::{Gfn, Mfn};
use crate::error::Result;

/// Trait for the physical frame allocator
///
/// Implementations protect their free list with their own lock. Callers
/// always take that lock after any address space lock, never before.
pub trait FrameAllocator: Send + Sync {
    /// Allocates a single frame, or `None` when memory is exhausted
    fn alloc_frame(&self) -> Option<Mfn>;

    /// Returns a single frame
    fn free_frame(&self, mfn: Mfn);

    /// Returns a batch of frames
    fn free_frames(&self, frames: &[Mfn]) {
        for &mfn in frames {
            self.free_frame(mfn);
        }
    }

    /// Returns number of free frames
    fn free_frames_count(&self) -> usize;
}

/// Trait for access to frame contents
pub trait FrameAccess: Send + Sync {
    /// The canonical, always-zero frame
    fn zero_frame(&self) -> Mfn;

    /// Fills a frame with zeroes
    fn fill_zero(&self, mfn: Mfn) -> Result<()>;

    /// Copies the full contents of `src` into `dst`
    fn copy_frame(&self, dst: Mfn, src: Mfn) -> Result<()>;

    /// Returns true if every byte of the frame is zero
    fn is_zero(&self, mfn: Mfn) -> Result<bool>;
}

/// Physical memory as seen by the translation layer
pub trait PhysicalMemory: FrameAllocator + FrameAccess {}

impl<T: FrameAllocator + FrameAccess + ?Sized> PhysicalMemory for T {}

/// Trait for an external change-tracking collaborator
pub trait DirtyLog: Send + Sync {
    /// Records that the frame backing `gfn` changed
    fn mark_dirty(&self, gfn: Gfn);
}
