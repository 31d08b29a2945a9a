//! Reference frame pool
//!
//! An in-memory stand-in for the host's physical page allocator. Frames are
//! numbered from a base MFN, backed by heap buffers that are created on first
//! allocation, and handed out from a LIFO free list. Freed frames keep their
//! old contents, so callers that skip zeroing would leak stale data.
//!
//! The first frame of the pool is reserved as the canonical zero frame. It is
//! never on the free list and every write path refuses it.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use pod_api::{Error, FrameAccess, FrameAllocator, Mfn, Result};
use spin::Mutex;

use crate::physical::{FrameBuf, PAGE_SIZE, is_zero_page};

/// Frame pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Frames managed by the pool, zero frame excluded.
    pub total_frames: usize,
    /// Frames currently on the free list.
    pub free_frames: usize,
    /// Successful allocations since creation.
    pub alloc_count: u64,
    /// Frees since creation.
    pub free_count: u64,
    /// Allocations refused because the pool was empty.
    pub failed_allocs: u64,
    /// Frees of frames the pool did not consider allocated.
    pub invalid_frees: u64,
}

struct PoolInner {
    frames: Vec<Option<Box<FrameBuf>>>,
    allocated: Vec<bool>,
    free_list: Vec<Mfn>,
}

impl PoolInner {
    fn index(&self, base: Mfn, mfn: Mfn) -> Option<usize> {
        let index = mfn.as_u64().checked_sub(base.as_u64())? as usize;
        (index < self.frames.len()).then_some(index)
    }
}

/// A pool of physical frames
pub struct FramePool {
    base: Mfn,
    inner: Mutex<PoolInner>,
    alloc_count: AtomicU64,
    free_count: AtomicU64,
    failed_allocs: AtomicU64,
    invalid_frees: AtomicU64,
}

impl FramePool {
    /// Create a pool of `frames` allocatable frames numbered after `base`.
    ///
    /// `base` itself becomes the zero frame.
    pub fn new(base: Mfn, frames: usize) -> Self {
        let total = frames + 1;
        let mut slots = Vec::with_capacity(total);
        slots.push(Some(Box::new([0u8; PAGE_SIZE])));
        slots.resize_with(total, || None);

        let mut allocated = Vec::with_capacity(total);
        allocated.resize(total, false);

        // Reverse so the lowest frame is handed out first.
        let free_list = (1..total as u64).rev().map(|i| base.offset(i)).collect();

        Self {
            base,
            inner: Mutex::new(PoolInner {
                frames: slots,
                allocated,
                free_list,
            }),
            alloc_count: AtomicU64::new(0),
            free_count: AtomicU64::new(0),
            failed_allocs: AtomicU64::new(0),
            invalid_frees: AtomicU64::new(0),
        }
    }

    /// Returns true if `mfn` is currently allocated from this pool
    pub fn is_allocated(&self, mfn: Mfn) -> bool {
        let inner = self.inner.lock();
        inner.index(self.base, mfn).is_some_and(|i| inner.allocated[i])
    }

    /// Copies the contents of a frame into `buf`
    pub fn read_frame(&self, mfn: Mfn, buf: &mut FrameBuf) -> Result<()> {
        let inner = self.inner.lock();
        let index = self.readable(&inner, mfn)?;
        match &inner.frames[index] {
            Some(frame) => buf.copy_from_slice(&frame[..]),
            None => buf.fill(0),
        }
        Ok(())
    }

    /// Writes `data` into a frame at byte `offset`
    ///
    /// Models a guest store through a writable mapping. The zero frame and
    /// unallocated frames are refused.
    pub fn write_frame(&self, mfn: Mfn, offset: usize, data: &[u8]) -> Result<()> {
        if offset.checked_add(data.len()).is_none_or(|end| end > PAGE_SIZE) {
            return Err(Error::InvalidArgument("write beyond end of frame"));
        }
        let mut inner = self.inner.lock();
        let index = self.writable(&inner, mfn)?;
        let frame = inner.frames[index].get_or_insert_with(|| Box::new([0u8; PAGE_SIZE]));
        frame[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Get frame pool statistics
    pub fn stats(&self) -> PoolStats {
        let free_frames = self.inner.lock().free_list.len();
        PoolStats {
            total_frames: self.capacity(),
            free_frames,
            alloc_count: self.alloc_count.load(Ordering::SeqCst),
            free_count: self.free_count.load(Ordering::SeqCst),
            failed_allocs: self.failed_allocs.load(Ordering::SeqCst),
            invalid_frees: self.invalid_frees.load(Ordering::SeqCst),
        }
    }

    /// Number of allocatable frames
    pub fn capacity(&self) -> usize {
        self.inner.lock().frames.len() - 1
    }

    fn readable(&self, inner: &PoolInner, mfn: Mfn) -> Result<usize> {
        match inner.index(self.base, mfn) {
            Some(0) => Ok(0),
            Some(i) if inner.allocated[i] => Ok(i),
            _ => Err(Error::InvalidArgument("frame not allocated")),
        }
    }

    fn writable(&self, inner: &PoolInner, mfn: Mfn) -> Result<usize> {
        match inner.index(self.base, mfn) {
            Some(0) => Err(Error::InvalidArgument("zero frame is read-only")),
            Some(i) if inner.allocated[i] => Ok(i),
            _ => Err(Error::InvalidArgument("frame not allocated")),
        }
    }
}

impl FrameAllocator for FramePool {
    fn alloc_frame(&self) -> Option<Mfn> {
        let mut inner = self.inner.lock();
        let Some(mfn) = inner.free_list.pop() else {
            self.failed_allocs.fetch_add(1, Ordering::SeqCst);
            return None;
        };
        let index = (mfn.as_u64() - self.base.as_u64()) as usize;
        inner.allocated[index] = true;
        if inner.frames[index].is_none() {
            inner.frames[index] = Some(Box::new([0u8; PAGE_SIZE]));
        }
        self.alloc_count.fetch_add(1, Ordering::SeqCst);
        Some(mfn)
    }

    fn free_frame(&self, mfn: Mfn) {
        let mut inner = self.inner.lock();
        match inner.index(self.base, mfn) {
            Some(i) if i != 0 && inner.allocated[i] => {
                inner.allocated[i] = false;
                inner.free_list.push(mfn);
                self.free_count.fetch_add(1, Ordering::SeqCst);
            }
            _ => {
                self.invalid_frees.fetch_add(1, Ordering::SeqCst);
                pod_warn!("frame pool: ignoring free of {}", mfn);
            }
        }
    }

    fn free_frames_count(&self) -> usize {
        self.inner.lock().free_list.len()
    }
}

impl FrameAccess for FramePool {
    fn zero_frame(&self) -> Mfn {
        self.base
    }

    fn fill_zero(&self, mfn: Mfn) -> Result<()> {
        let mut inner = self.inner.lock();
        let index = self.writable(&inner, mfn)?;
        if let Some(frame) = inner.frames[index].as_mut() {
            frame.fill(0);
        }
        Ok(())
    }

    fn copy_frame(&self, dst: Mfn, src: Mfn) -> Result<()> {
        let mut inner = self.inner.lock();
        let dst_index = self.writable(&inner, dst)?;
        let src_index = self.readable(&inner, src)?;
        if dst_index == src_index {
            return Err(Error::InvalidArgument("copy onto itself"));
        }
        let data: FrameBuf = match &inner.frames[src_index] {
            Some(frame) => **frame,
            None => [0u8; PAGE_SIZE],
        };
        let frame = inner.frames[dst_index].get_or_insert_with(|| Box::new([0u8; PAGE_SIZE]));
        frame.copy_from_slice(&data);
        Ok(())
    }

    fn is_zero(&self, mfn: Mfn) -> Result<bool> {
        let inner = self.inner.lock();
        let index = self.readable(&inner, mfn)?;
        Ok(inner.frames[index].as_deref().is_none_or(is_zero_page))
    }
}
