//! Pooled off-heap staging buffers.
//!
//! When staged writes are enabled, every append lands in a borrowed
//! `StagingBuffer` first and reaches the file channel only at commit time.
//! Buffers are page-aligned blocks the size of a whole segment, pre-allocated
//! once and recycled through a bounded free-list, so steady-state appends
//! never touch the allocator.

use crate::config::StoreConfig;
use crate::segment::OS_PAGE_SIZE;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::{info, warn};

struct StagingInner {
    data: NonNull<u8>,
    capacity: usize,
    layout: Layout,
}

// Coordination between the appender (writes) and the committer (reads) is
// done through the segment's committed/wrote positions; the regions they
// touch never overlap.
unsafe impl Send for StagingInner {}
unsafe impl Sync for StagingInner {}

impl Drop for StagingInner {
    fn drop(&mut self) {
        unsafe { dealloc(self.data.as_ptr(), self.layout) };
    }
}

/// A page-aligned writable block loaned by a [`StagingPool`].
///
/// Cheap to clone; clones share the same backing memory.
#[derive(Clone)]
pub struct StagingBuffer {
    inner: Arc<StagingInner>,
}

impl StagingBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        let layout = Layout::from_size_align(capacity, OS_PAGE_SIZE).expect("staging layout");
        let data = unsafe {
            let ptr = alloc_zeroed(layout);
            if ptr.is_null() {
                std::alloc::handle_alloc_error(layout);
            }
            NonNull::new_unchecked(ptr)
        };
        Self {
            inner: Arc::new(StagingInner {
                data,
                capacity,
                layout,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Writable view of `[offset, offset + len)`.
    ///
    /// # Safety
    /// The caller must be the single appender and must not overlap a region
    /// the committer is reading (`offset >= committed_position`).
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        assert!(
            offset + len <= self.inner.capacity,
            "staging slice out of bounds: offset={} len={} capacity={}",
            offset,
            len,
            self.inner.capacity
        );
        std::slice::from_raw_parts_mut(self.inner.data.as_ptr().add(offset), len)
    }

    /// Read-only view of `[offset, offset + len)`; only valid for regions the
    /// appender has finished (`offset + len <= wrote_position`).
    pub(crate) fn slice(&self, offset: usize, len: usize) -> &[u8] {
        assert!(
            offset + len <= self.inner.capacity,
            "staging slice out of bounds: offset={} len={} capacity={}",
            offset,
            len,
            self.inner.capacity
        );
        unsafe { std::slice::from_raw_parts(self.inner.data.as_ptr().add(offset), len) }
    }
}

impl std::fmt::Debug for StagingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagingBuffer")
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

/// Fixed-depth pool of segment-sized staging buffers.
pub struct StagingPool {
    buffer_bytes: usize,
    depth: usize,
    free: (Sender<StagingBuffer>, Receiver<StagingBuffer>),
}

impl StagingPool {
    /// Pre-allocate `depth` buffers of `buffer_bytes` each.
    pub fn new(depth: usize, buffer_bytes: usize) -> Arc<Self> {
        let free = bounded(depth);
        let pool = Arc::new(Self {
            buffer_bytes,
            depth,
            free,
        });
        for _ in 0..depth {
            let _ = pool.free.0.try_send(StagingBuffer::new(buffer_bytes));
        }
        info!(
            depth,
            buffer_bytes, "staging pool initialized"
        );
        pool
    }

    pub fn from_config(config: &StoreConfig) -> Arc<Self> {
        Self::new(config.staging_pool_depth, config.segment_bytes)
    }

    /// Loan a buffer, or `None` when the pool is drained.
    pub fn borrow(&self) -> Option<StagingBuffer> {
        let buf = self.free.1.try_recv().ok();
        if buf.is_none() {
            warn!(depth = self.depth, "staging pool exhausted");
        }
        buf
    }

    /// Return a loaned buffer. Each loan must be returned exactly once.
    pub fn give_back(&self, buf: StagingBuffer) {
        debug_assert_eq!(buf.capacity(), self.buffer_bytes);
        if self.free.0.try_send(buf).is_err() {
            warn!("staging pool free-list full, dropping returned buffer");
        }
    }

    /// Buffers currently available to borrow.
    pub fn available(&self) -> usize {
        self.free.1.len()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn buffer_bytes(&self) -> usize {
        self.buffer_bytes
    }
}
