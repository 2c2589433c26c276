//! Memory-mapped segment storage core for the Veloq commit log.
//!
//! A [`MappedSegment`] is one fixed-size, pre-sized, append-only file mapped
//! read/write into memory. The queue manager strings many of them into a
//! logical log; this crate owns everything below that seam:
//!
//! - sequential appends through an injected [`RecordEncoder`],
//! - optional staged writes through a pooled off-heap [`StagingBuffer`],
//! - the write/commit/flush position discipline with page-aligned thresholds,
//! - zero-copy reads via refcounted [`MappedSlice`] views,
//! - teardown that waits for in-flight readers ([`ReferenceResource`]),
//! - page warm-up and `mlock`/`madvise` hints.
//!
//! # Example
//!
//! ```no_run
//! use veloq_store::{FrameEncoder, MappedSegment, segment_file_name};
//! use std::time::Duration;
//!
//! # fn main() -> veloq_store::Result<()> {
//! let seg = MappedSegment::open(
//!     format!("/var/lib/veloq/commitlog/{}", segment_file_name(0)),
//!     1024 * 1024 * 1024,
//! )?;
//!
//! let encoder = FrameEncoder::default();
//! let outcome = seg.append_record(&encoder, b"hello".as_ref());
//! assert!(outcome.is_ok());
//!
//! seg.flush(0);
//! if let Some(view) = seg.slice_from(0) {
//!     let _ = FrameEncoder::read_frame(&view)?;
//! }
//! seg.destroy(Duration::from_secs(120));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod encode;
pub mod error;
pub mod os;
pub mod refcount;
pub mod segment;
pub mod slice;
pub mod staging;

pub use config::{FlushMode, StoreConfig};
pub use encode::{
    AppendOutcome, AppendStatus, FrameEncoder, RecordEncoder, EOF_MAGIC, FRAME_HEADER_LEN,
    RECORD_MAGIC,
};
pub use error::{Result, StoreError};
pub use refcount::{RefState, ReferenceResource};
pub use segment::{
    segment_file_name, total_mapped_bytes, total_mapped_segments, MappedSegment, OS_PAGE_SIZE,
};
pub use slice::MappedSlice;
pub use staging::{StagingBuffer, StagingPool};
