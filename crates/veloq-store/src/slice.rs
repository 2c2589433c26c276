//! Borrowed, reference-counted views into a mapped segment.

use crate::refcount::ReferenceResource;
use crate::segment::MappedSegment;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::Arc;

/// A read-only window over committed segment bytes.
///
/// Holds one reference against the segment, so teardown waits for every
/// outstanding slice. Dropping the slice releases the reference.
pub struct MappedSlice {
    segment: Arc<MappedSegment>,
    start_offset: u64,
    data: NonNull<u8>,
    len: usize,
}

// The window covers only bytes below the segment's read position, which the
// appender never rewrites, and the held reference keeps the mapping alive.
unsafe impl Send for MappedSlice {}
unsafe impl Sync for MappedSlice {}

impl MappedSlice {
    pub(crate) fn new(
        segment: Arc<MappedSegment>,
        data: NonNull<u8>,
        pos: usize,
        len: usize,
    ) -> Self {
        let start_offset = segment.base_offset() + pos as u64;
        Self {
            segment,
            start_offset,
            data,
            len,
        }
    }

    /// Absolute log offset of the first byte in this view.
    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), self.len) }
    }

    /// The segment this slice borrows from.
    pub fn segment(&self) -> &Arc<MappedSegment> {
        &self.segment
    }
}

impl Deref for MappedSlice {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl AsRef<[u8]> for MappedSlice {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl std::fmt::Debug for MappedSlice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedSlice")
            .field("start_offset", &self.start_offset)
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for MappedSlice {
    fn drop(&mut self) {
        self.segment.release();
    }
}
