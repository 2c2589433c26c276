//! The mapped segment: one fixed-size, append-only commit-log file.
//!
//! # Data Directory Exclusivity
//!
//! The data directory MUST be treated as exclusive to the broker process.
//! External modification of segment files while they are mapped can cause
//! undefined behavior including SIGBUS signals. Stop the broker before
//! running any external tooling against the directory.
//!
//! # Write discipline
//!
//! A segment tracks three monotone positions:
//!
//! - `wrote`: next byte to write,
//! - `committed`: staging bytes already copied to the file channel,
//! - `flushed`: bytes known durable after a force.
//!
//! With staging enabled, appends land in a pooled off-heap buffer and become
//! readable only after `commit` copies them to the channel; without it, the
//! append writes the mapping directly and is readable immediately. Readers
//! borrow [`MappedSlice`] views bound to the segment's refcount, so teardown
//! (`shutdown` → `cleanup` → `destroy`) waits for them.

use crate::config::FlushMode;
use crate::encode::{AppendOutcome, AppendStatus, RecordEncoder};
use crate::error::{Result, StoreError};
use crate::os;
use crate::refcount::{RefState, ReferenceResource};
use crate::slice::MappedSlice;
use crate::staging::{StagingBuffer, StagingPool};
use memmap2::MmapMut;
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

/// OS page granularity used by the commit/flush thresholds.
pub const OS_PAGE_SIZE: usize = 4096;

/// Mapped bytes across every live segment in the process.
static TOTAL_MAPPED_BYTES: AtomicI64 = AtomicI64::new(0);

/// Live mapped segments in the process.
static TOTAL_MAPPED_SEGMENTS: AtomicI64 = AtomicI64::new(0);

pub fn total_mapped_bytes() -> i64 {
    TOTAL_MAPPED_BYTES.load(Ordering::Acquire)
}

pub fn total_mapped_segments() -> i64 {
    TOTAL_MAPPED_SEGMENTS.load(Ordering::Acquire)
}

/// Zero-padded decimal file name for a segment starting at `base_offset`.
pub fn segment_file_name(base_offset: u64) -> String {
    format!("{:020}", base_offset)
}

/// One fixed-size memory-mapped commit-log file.
pub struct MappedSegment {
    path: PathBuf,
    file_size: usize,
    base_offset: u64,
    file: File,
    mmap: UnsafeCell<Option<MmapMut>>,
    wrote: AtomicUsize,
    committed: AtomicUsize,
    flushed: AtomicUsize,
    /// Set once any positional write hits the file channel; `flush` then
    /// forces the channel instead of the mapping.
    channel_dirty: AtomicBool,
    store_timestamp_ms: AtomicI64,
    first_in_queue: AtomicBool,
    staging: Mutex<Option<StagingBuffer>>,
    staging_active: AtomicBool,
    pool: Option<Arc<StagingPool>>,
    refs: RefState,
}

// The mapping sits in an UnsafeCell so the single appender can write through
// a shared reference. Readers only touch bytes below the read position,
// which the appender never revisits, and the refcount defers unmapping.
unsafe impl Send for MappedSegment {}
unsafe impl Sync for MappedSegment {}

impl MappedSegment {
    /// Create (or reopen) a segment file of exactly `file_size` bytes and map
    /// it read/write.
    ///
    /// The file's basename must be the zero-padded decimal base offset of the
    /// segment within the log. Parent directories are created as needed.
    pub fn open(path: impl Into<PathBuf>, file_size: usize) -> Result<Arc<Self>> {
        Self::open_inner(path.into(), file_size, None)
    }

    /// Like [`MappedSegment::open`], but appends go through a staging buffer
    /// borrowed from `pool` until committed.
    pub fn open_with_staging(
        path: impl Into<PathBuf>,
        file_size: usize,
        pool: Arc<StagingPool>,
    ) -> Result<Arc<Self>> {
        let path = path.into();
        let buf = pool.borrow().ok_or(StoreError::StagingExhausted)?;
        if buf.capacity() < file_size {
            pool.give_back(buf);
            return Err(StoreError::StagingTooSmall {
                have: pool.buffer_bytes(),
                need: file_size,
            });
        }
        Self::open_inner(path, file_size, Some((buf, pool)))
    }

    fn open_inner(
        path: PathBuf,
        file_size: usize,
        staging: Option<(StagingBuffer, Arc<StagingPool>)>,
    ) -> Result<Arc<Self>> {
        let base_offset = parse_base_offset(&path)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| {
                error!(path = %path.display(), error = %e, "create segment file failed");
                e
            })?;
        file.set_len(file_size as u64)?;

        // Dropping `file` on the error path below closes the channel before
        // the error reaches the caller.
        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|e| {
            error!(path = %path.display(), error = %e, "map segment file failed");
            e
        })?;

        TOTAL_MAPPED_BYTES.fetch_add(file_size as i64, Ordering::AcqRel);
        TOTAL_MAPPED_SEGMENTS.fetch_add(1, Ordering::AcqRel);

        let (staging_buf, pool) = match staging {
            Some((buf, pool)) => (Some(buf), Some(pool)),
            None => (None, None),
        };

        debug!(
            path = %path.display(),
            file_size,
            base_offset,
            staged = staging_buf.is_some(),
            "segment mapped"
        );

        Ok(Arc::new(Self {
            path,
            file_size,
            base_offset,
            file,
            mmap: UnsafeCell::new(Some(mmap)),
            wrote: AtomicUsize::new(0),
            committed: AtomicUsize::new(0),
            flushed: AtomicUsize::new(0),
            channel_dirty: AtomicBool::new(false),
            store_timestamp_ms: AtomicI64::new(0),
            first_in_queue: AtomicBool::new(false),
            staging_active: AtomicBool::new(staging_buf.is_some()),
            staging: Mutex::new(staging_buf),
            pool,
            refs: RefState::new(),
        }))
    }

    fn mmap_ref(&self) -> Option<&MmapMut> {
        // The Option is only taken by `cleanup`, which the refcount defers
        // until no accessor remains.
        unsafe { (*self.mmap.get()).as_ref() }
    }

    /// # Safety
    /// Caller must be the exclusive writer (the single appender, or warm-up
    /// before the segment is published).
    #[allow(clippy::mut_from_ref)]
    unsafe fn mmap_mut(&self) -> Option<&mut MmapMut> {
        (*self.mmap.get()).as_mut()
    }

    pub(crate) fn mapped_ptr(&self, pos: usize) -> Option<NonNull<u8>> {
        self.mmap_ref()
            .and_then(|m| NonNull::new(m.as_ptr().wrapping_add(pos) as *mut u8))
    }

    /// Encode one record at the write position through `encoder`.
    ///
    /// The encoder sees a window spanning every remaining byte of the active
    /// buffer (staging when attached, the mapping otherwise) and decides the
    /// framing; the segment advances by whatever the outcome reports.
    pub fn append_record<E: RecordEncoder>(&self, encoder: &E, record: &E::Record) -> AppendOutcome {
        let pos = self.wrote.load(Ordering::Acquire);
        if pos >= self.file_size {
            error!(
                path = %self.path.display(),
                wrote = pos,
                file_size = self.file_size,
                "append to full segment"
            );
            return AppendOutcome::error(AppendStatus::UnknownError);
        }

        let remaining = self.file_size - pos;
        let start_offset = self.base_offset + pos as u64;
        let staging = self.staging.lock().clone();

        let outcome = match staging {
            Some(buf) => {
                // Safety: single appender; [pos, file_size) is ahead of the
                // committer's window.
                let window = unsafe { buf.slice_mut(pos, remaining) };
                encoder.encode(start_offset, window, record)
            }
            None => match unsafe { self.mmap_mut() } {
                Some(mmap) => encoder.encode(start_offset, &mut mmap[pos..], record),
                None => return AppendOutcome::error(AppendStatus::UnknownError),
            },
        };

        // Publish the bytes before the position so readers that observe the
        // new position also observe the data.
        self.wrote.fetch_add(outcome.wrote_bytes, Ordering::AcqRel);
        self.store_timestamp_ms
            .store(outcome.store_timestamp_ms, Ordering::Release);
        outcome
    }

    /// Write raw bytes at the write position through the file channel,
    /// bypassing staging and the mapping.
    ///
    /// Returns `false` when the bytes do not fit or the write fails; the
    /// position advances only after a successful write.
    pub fn append_raw(&self, data: &[u8]) -> bool {
        let pos = self.wrote.load(Ordering::Acquire);
        if pos + data.len() > self.file_size {
            return false;
        }
        match write_all_at(&self.file, data, pos as u64) {
            Ok(()) => {
                self.channel_dirty.store(true, Ordering::Release);
                self.wrote.fetch_add(data.len(), Ordering::AcqRel);
                true
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "raw append failed");
                false
            }
        }
    }

    /// Copy staged bytes to the file channel once at least `least_pages`
    /// dirty pages accumulated (`0` commits any dirty byte).
    ///
    /// No-op without staging. On a full commit the staging buffer goes back
    /// to its pool. Returns the committed position.
    pub fn commit(&self, least_pages: usize) -> usize {
        let staging = self.staging.lock().clone();
        let Some(buf) = staging else {
            // Nothing staged: the write position is the commit frontier.
            return self.wrote.load(Ordering::Acquire);
        };

        if self.should_commit(least_pages) {
            if self.hold() {
                self.commit_staged(&buf);
                self.release();
            } else {
                warn!(
                    path = %self.path.display(),
                    committed = self.committed.load(Ordering::Acquire),
                    "commit skipped, segment is shutting down"
                );
            }
        }

        if self.committed.load(Ordering::Acquire) == self.file_size {
            self.return_staging();
        }

        self.committed.load(Ordering::Acquire)
    }

    fn commit_staged(&self, buf: &StagingBuffer) {
        let wrote = self.wrote.load(Ordering::Acquire);
        let committed = self.committed.load(Ordering::Acquire);
        if wrote <= committed {
            return;
        }
        let dirty = buf.slice(committed, wrote - committed);
        match write_all_at(&self.file, dirty, committed as u64) {
            Ok(()) => {
                self.channel_dirty.store(true, Ordering::Release);
                self.committed.store(wrote, Ordering::Release);
            }
            Err(e) => {
                error!(
                    path = %self.path.display(),
                    committed,
                    wrote,
                    error = %e,
                    "commit to file channel failed"
                );
            }
        }
    }

    /// Hand the staging buffer back to its pool, if one is still attached.
    ///
    /// Called automatically on a full commit; the queue manager calls it at
    /// teardown for segments that never filled.
    pub fn return_staging(&self) {
        let taken = self.staging.lock().take();
        if let Some(buf) = taken {
            self.staging_active.store(false, Ordering::Release);
            if let Some(pool) = &self.pool {
                pool.give_back(buf);
                debug!(path = %self.path.display(), "staging buffer returned to pool");
            }
        }
    }

    /// Force readable bytes to disk once at least `least_pages` unflushed
    /// pages accumulated (`0` flushes any unflushed byte).
    ///
    /// Returns the flushed position. When the segment is shutting down and a
    /// reference cannot be acquired, the watermark still advances without
    /// forcing, as a best-effort finalization.
    pub fn flush(&self, least_pages: usize) -> usize {
        if self.should_flush(least_pages) {
            if self.hold() {
                let value = self.read_position();

                let result = if self.staging_active.load(Ordering::Acquire)
                    || self.channel_dirty.load(Ordering::Acquire)
                {
                    self.file.sync_data()
                } else {
                    match self.mmap_ref() {
                        Some(mmap) => mmap.flush(),
                        None => Ok(()),
                    }
                };
                if let Err(e) = result {
                    error!(path = %self.path.display(), error = %e, "force to disk failed");
                }

                self.flushed.store(value, Ordering::Release);
                self.release();
            } else {
                warn!(
                    path = %self.path.display(),
                    flushed = self.flushed.load(Ordering::Acquire),
                    "flush hold failed, advancing watermark only"
                );
                self.flushed.store(self.read_position(), Ordering::Release);
            }
        }
        self.flushed.load(Ordering::Acquire)
    }

    fn should_commit(&self, least_pages: usize) -> bool {
        let committed = self.committed.load(Ordering::Acquire);
        let wrote = self.wrote.load(Ordering::Acquire);
        if self.is_full() {
            return true;
        }
        if least_pages > 0 {
            return wrote / OS_PAGE_SIZE - committed / OS_PAGE_SIZE >= least_pages;
        }
        wrote > committed
    }

    fn should_flush(&self, least_pages: usize) -> bool {
        let flushed = self.flushed.load(Ordering::Acquire);
        let read = self.read_position();
        if self.is_full() {
            return true;
        }
        if least_pages > 0 {
            return read / OS_PAGE_SIZE - flushed / OS_PAGE_SIZE >= least_pages;
        }
        read > flushed
    }

    /// Borrow a view of `[pos, pos + size)`.
    ///
    /// `None` when the range reaches beyond the readable frontier or the
    /// segment is shutting down.
    pub fn slice(self: &Arc<Self>, pos: usize, size: usize) -> Option<MappedSlice> {
        let read = self.read_position();
        if pos + size > read {
            warn!(
                path = %self.path.display(),
                pos,
                size,
                read_position = read,
                "slice request out of range"
            );
            return None;
        }
        self.slice_held(pos, size)
    }

    /// Borrow a view of everything readable from `pos`.
    pub fn slice_from(self: &Arc<Self>, pos: usize) -> Option<MappedSlice> {
        let read = self.read_position();
        if pos >= read {
            return None;
        }
        self.slice_held(pos, read - pos)
    }

    fn slice_held(self: &Arc<Self>, pos: usize, size: usize) -> Option<MappedSlice> {
        if !self.hold() {
            warn!(
                path = %self.path.display(),
                pos,
                "slice refused, segment is shutting down"
            );
            return None;
        }
        match self.mapped_ptr(pos) {
            Some(ptr) => Some(MappedSlice::new(Arc::clone(self), ptr, pos, size)),
            None => {
                self.release();
                None
            }
        }
    }

    /// Fault every page of the mapping in, then pin it with `mlock`.
    ///
    /// Under [`FlushMode::Sync`] the mapping is forced every
    /// `pages_between_forces` pages and once more at the end. Yields to the
    /// scheduler every 1000 pages to keep the loop preemptible.
    pub fn warm_up(&self, mode: FlushMode, pages_between_forces: usize) {
        let begin = Instant::now();
        let Some(mmap) = (unsafe { self.mmap_mut() }) else {
            return;
        };

        let mut last_forced = 0usize;
        let mut touched = 0usize;
        let mut i = 0usize;
        while i < self.file_size {
            mmap[i] = 0;

            if mode == FlushMode::Sync
                && (i / OS_PAGE_SIZE) - (last_forced / OS_PAGE_SIZE) >= pages_between_forces
            {
                last_forced = i;
                if let Err(e) = mmap.flush() {
                    warn!(path = %self.path.display(), error = %e, "warm-up force failed");
                }
            }

            touched += 1;
            if touched % 1000 == 0 {
                debug!(pages = touched, "warm-up progress");
                std::thread::yield_now();
            }

            i += OS_PAGE_SIZE;
        }

        if mode == FlushMode::Sync {
            if let Err(e) = mmap.flush() {
                warn!(path = %self.path.display(), error = %e, "warm-up final force failed");
            }
        }
        info!(
            path = %self.path.display(),
            pages = touched,
            elapsed_ms = begin.elapsed().as_millis() as u64,
            "segment warm-up complete"
        );

        self.mlock();
    }

    /// Pin the mapping into memory and prompt read-ahead. Failures are
    /// tolerated; the segment keeps working unpinned.
    pub fn mlock(&self) {
        let Some(mmap) = self.mmap_ref() else {
            return;
        };
        let begin = Instant::now();
        let ptr = mmap.as_ptr();
        match os::lock_memory(ptr, self.file_size) {
            Ok(()) => info!(
                path = %self.path.display(),
                file_size = self.file_size,
                elapsed_ms = begin.elapsed().as_millis() as u64,
                "mlock ok"
            ),
            Err(e) => warn!(path = %self.path.display(), error = %e, "mlock failed"),
        }
        if let Err(e) = os::advise_willneed(ptr, self.file_size) {
            warn!(path = %self.path.display(), error = %e, "madvise(WILLNEED) failed");
        }
    }

    /// Release a previous [`MappedSegment::mlock`] pin.
    pub fn munlock(&self) {
        let Some(mmap) = self.mmap_ref() else {
            return;
        };
        if let Err(e) = os::unlock_memory(mmap.as_ptr(), self.file_size) {
            warn!(path = %self.path.display(), error = %e, "munlock failed");
        }
    }

    /// Shut the segment down and, once no reader remains (or the grace
    /// period forces the issue), delete the backing file.
    ///
    /// Returns `false` while cleanup is still deferred; callers retry.
    pub fn destroy(&self, interval_forcibly: Duration) -> bool {
        self.shutdown(interval_forcibly);

        if self.is_cleanup_over() {
            match fs::remove_file(&self.path) {
                Ok(()) => info!(
                    path = %self.path.display(),
                    wrote = self.wrote.load(Ordering::Acquire),
                    flushed = self.flushed.load(Ordering::Acquire),
                    "segment file deleted"
                ),
                Err(e) => warn!(path = %self.path.display(), error = %e, "delete segment file failed"),
            }
            true
        } else {
            warn!(
                path = %self.path.display(),
                refs = self.ref_count(),
                "destroy deferred, segment still referenced"
            );
            false
        }
    }

    /// Largest offset safely visible to readers.
    pub fn read_position(&self) -> usize {
        if self.staging_active.load(Ordering::Acquire) {
            self.committed.load(Ordering::Acquire)
        } else {
            self.wrote.load(Ordering::Acquire)
        }
    }

    pub fn is_full(&self) -> bool {
        self.wrote.load(Ordering::Acquire) == self.file_size
    }

    pub fn file_size(&self) -> usize {
        self.file_size
    }

    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn wrote_position(&self) -> usize {
        self.wrote.load(Ordering::Acquire)
    }

    pub fn committed_position(&self) -> usize {
        self.committed.load(Ordering::Acquire)
    }

    pub fn flushed_position(&self) -> usize {
        self.flushed.load(Ordering::Acquire)
    }

    /// Recovery entry point: reposition the write frontier after a restart scan.
    pub fn set_wrote_position(&self, pos: usize) {
        self.wrote.store(pos, Ordering::Release);
    }

    pub fn set_committed_position(&self, pos: usize) {
        self.committed.store(pos, Ordering::Release);
    }

    pub fn set_flushed_position(&self, pos: usize) {
        self.flushed.store(pos, Ordering::Release);
    }

    /// Wall-clock stamp of the last successful encoded append.
    pub fn store_timestamp_ms(&self) -> i64 {
        self.store_timestamp_ms.load(Ordering::Acquire)
    }

    /// Modification time of the backing file, in epoch milliseconds.
    pub fn last_modified_ms(&self) -> i64 {
        self.file
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    /// Tag maintained by the queue manager for the first segment of a queue.
    pub fn is_first_in_queue(&self) -> bool {
        self.first_in_queue.load(Ordering::Acquire)
    }

    pub fn set_first_in_queue(&self, first: bool) {
        self.first_in_queue.store(first, Ordering::Release);
    }
}

impl ReferenceResource for MappedSegment {
    fn ref_state(&self) -> &RefState {
        &self.refs
    }

    fn cleanup(&self, current_refs: i64) -> bool {
        if self.is_available() {
            error!(
                path = %self.path.display(),
                refs = current_refs,
                "segment still available, refusing to unmap"
            );
            return false;
        }
        if self.refs.cleanup_done() {
            return true;
        }

        // Safety: the refcount has drained (or teardown turned forcible);
        // no accessor remains by contract.
        unsafe {
            (*self.mmap.get()).take();
        }
        TOTAL_MAPPED_BYTES.fetch_sub(self.file_size as i64, Ordering::AcqRel);
        TOTAL_MAPPED_SEGMENTS.fetch_sub(1, Ordering::AcqRel);
        info!(
            path = %self.path.display(),
            refs = current_refs,
            "segment unmapped"
        );
        true
    }
}

impl std::fmt::Debug for MappedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedSegment")
            .field("path", &self.path)
            .field("file_size", &self.file_size)
            .field("base_offset", &self.base_offset)
            .field("wrote", &self.wrote.load(Ordering::Relaxed))
            .field("committed", &self.committed.load(Ordering::Relaxed))
            .field("flushed", &self.flushed.load(Ordering::Relaxed))
            .finish()
    }
}

fn parse_base_offset(path: &Path) -> Result<u64> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| StoreError::SegmentName(path.display().to_string()))?;
    name.parse::<u64>()
        .map_err(|_| StoreError::SegmentName(name.to_string()))
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(not(unix))]
fn write_all_at(mut file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::io::{Seek, SeekFrom, Write};
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::{FrameEncoder, FRAME_HEADER_LEN};
    use chrono::Utc;
    use tempfile::tempdir;

    // The mapped counters are process-global; serialize every test that
    // creates segments so baseline assertions stay exact.
    static DISK_TESTS: Mutex<()> = Mutex::new(());

    const SEG_NAME: &str = "00000000000000000000";

    /// Test encoder that copies the payload verbatim, no framing.
    struct RawEncoder;

    impl RecordEncoder for RawEncoder {
        type Record = [u8];

        fn encode(&self, start_offset: u64, buf: &mut [u8], record: &[u8]) -> AppendOutcome {
            if record.len() > buf.len() {
                return AppendOutcome::error(AppendStatus::EndOfFile);
            }
            buf[..record.len()].copy_from_slice(record);
            AppendOutcome {
                status: AppendStatus::Ok,
                wrote_bytes: record.len(),
                log_offset: start_offset,
                store_timestamp_ms: Utc::now().timestamp_millis(),
            }
        }
    }

    #[test]
    fn parses_base_offset_from_file_name() {
        let _guard = DISK_TESTS.lock();
        let dir = tempdir().unwrap();
        let path = dir.path().join("00000000001073741824");

        let seg = MappedSegment::open(&path, 4096).unwrap();
        assert_eq!(seg.base_offset(), 1_073_741_824);
        assert_eq!(seg.file_size(), 4096);
        assert!(seg.destroy(Duration::from_secs(1)));
    }

    #[test]
    fn rejects_non_numeric_file_name() {
        let _guard = DISK_TESTS.lock();
        let dir = tempdir().unwrap();
        let before = total_mapped_segments();

        let result = MappedSegment::open(dir.path().join("not-a-number"), 4096);
        assert!(matches!(result, Err(StoreError::SegmentName(_))));
        assert_eq!(total_mapped_segments(), before);
    }

    #[test]
    fn segment_file_name_is_zero_padded() {
        assert_eq!(segment_file_name(0), "00000000000000000000");
        assert_eq!(segment_file_name(1_073_741_824), "00000000001073741824");
    }

    #[test]
    fn append_then_flush_without_staging() {
        let _guard = DISK_TESTS.lock();
        let dir = tempdir().unwrap();
        let path = dir.path().join(SEG_NAME);
        let seg = MappedSegment::open(&path, 4096).unwrap();

        assert!(seg.append_raw(&[0x41; 100]));
        assert_eq!(seg.wrote_position(), 100);
        assert_eq!(seg.read_position(), 100);
        assert_eq!(seg.flushed_position(), 0);

        assert_eq!(seg.flush(0), 100);

        let bytes = fs::read(&path).unwrap();
        assert!(bytes[..100].iter().all(|&b| b == 0x41));
        assert!(seg.destroy(Duration::from_secs(1)));
    }

    #[test]
    fn flush_respects_page_threshold() {
        let _guard = DISK_TESTS.lock();
        let dir = tempdir().unwrap();
        let seg = MappedSegment::open(dir.path().join(SEG_NAME), 16384).unwrap();

        assert!(seg.append_raw(&vec![0x42; 4095]));
        assert_eq!(seg.flush(1), 0);

        assert!(seg.append_raw(&[0x42]));
        assert_eq!(seg.flush(1), 4096);
        assert!(seg.destroy(Duration::from_secs(1)));
    }

    #[test]
    fn staged_append_is_invisible_until_commit() {
        let _guard = DISK_TESTS.lock();
        let dir = tempdir().unwrap();
        let pool = StagingPool::new(1, 4096);
        let seg =
            MappedSegment::open_with_staging(dir.path().join(SEG_NAME), 4096, Arc::clone(&pool))
                .unwrap();

        let outcome = seg.append_record(&RawEncoder, &[0x5A; 200][..]);
        assert_eq!(outcome.status, AppendStatus::Ok);
        assert_eq!(seg.wrote_position(), 200);
        assert_eq!(seg.committed_position(), 0);
        assert_eq!(seg.read_position(), 0);
        assert!(seg.slice(0, 200).is_none());

        assert_eq!(seg.commit(0), 200);
        assert_eq!(seg.read_position(), 200);

        // Committed staging bytes are readable through the mapping: the
        // channel write and the shared mapping are backed by the same pages.
        let slice = seg.slice(0, 200).unwrap();
        assert!(slice.iter().all(|&b| b == 0x5A));
        drop(slice);

        seg.return_staging();
        assert!(seg.destroy(Duration::from_secs(1)));
    }

    #[test]
    fn full_commit_returns_staging_buffer() {
        let _guard = DISK_TESTS.lock();
        let dir = tempdir().unwrap();
        let pool = StagingPool::new(1, 4096);
        let path = dir.path().join(SEG_NAME);
        let seg = MappedSegment::open_with_staging(&path, 4096, Arc::clone(&pool)).unwrap();
        assert_eq!(pool.available(), 0);

        let outcome = seg.append_record(&RawEncoder, &[0x33; 4096][..]);
        assert_eq!(outcome.status, AppendStatus::Ok);
        assert!(seg.is_full());

        assert_eq!(seg.commit(0), 4096);
        assert_eq!(pool.available(), 1);
        // With staging gone the write position is the readable frontier.
        assert_eq!(seg.read_position(), 4096);

        assert_eq!(seg.flush(0), 4096);
        let bytes = fs::read(&path).unwrap();
        assert!(bytes.iter().all(|&b| b == 0x33));
        assert!(seg.destroy(Duration::from_secs(1)));
    }

    #[test]
    fn commit_waits_for_page_threshold() {
        let _guard = DISK_TESTS.lock();
        let dir = tempdir().unwrap();
        let pool = StagingPool::new(1, 16384);
        let seg =
            MappedSegment::open_with_staging(dir.path().join(SEG_NAME), 16384, Arc::clone(&pool))
                .unwrap();

        seg.append_record(&RawEncoder, &vec![1u8; 4095][..]);
        assert_eq!(seg.commit(1), 0);

        seg.append_record(&RawEncoder, &[1u8][..]);
        assert_eq!(seg.commit(1), 4096);

        seg.return_staging();
        assert!(seg.destroy(Duration::from_secs(1)));
    }

    #[test]
    fn destroy_deferred_while_slice_is_live() {
        let _guard = DISK_TESTS.lock();
        let dir = tempdir().unwrap();
        let path = dir.path().join(SEG_NAME);
        let seg = MappedSegment::open(&path, 4096).unwrap();

        assert!(seg.append_raw(&[7u8; 64]));
        let slice = seg.slice(0, 10).unwrap();
        assert_eq!(slice.start_offset(), 0);

        assert!(!seg.destroy(Duration::from_secs(1)));
        assert!(path.exists());

        drop(slice);
        assert!(seg.destroy(Duration::from_secs(1)));
        assert!(!path.exists());
    }

    #[test]
    fn forcible_destroy_overrides_live_slice() {
        let _guard = DISK_TESTS.lock();
        let dir = tempdir().unwrap();
        let path = dir.path().join(SEG_NAME);
        let seg = MappedSegment::open(&path, 4096).unwrap();

        assert!(seg.append_raw(&[7u8; 64]));
        let slice = seg.slice(0, 10).unwrap();

        assert!(!seg.destroy(Duration::from_millis(0)));
        std::thread::sleep(Duration::from_millis(2));
        assert!(seg.destroy(Duration::from_millis(0)));
        assert!(!path.exists());

        drop(slice);
    }

    #[test]
    fn mapped_counters_return_to_baseline() {
        let _guard = DISK_TESTS.lock();
        let dir = tempdir().unwrap();
        let bytes_before = total_mapped_bytes();
        let segs_before = total_mapped_segments();

        let pool = StagingPool::new(1, 8192);
        let plain = MappedSegment::open(dir.path().join(SEG_NAME), 4096).unwrap();
        let staged = MappedSegment::open_with_staging(
            dir.path().join("00000000000000004096"),
            8192,
            Arc::clone(&pool),
        )
        .unwrap();

        assert_eq!(total_mapped_bytes(), bytes_before + 4096 + 8192);
        assert_eq!(total_mapped_segments(), segs_before + 2);

        staged.return_staging();
        assert!(plain.destroy(Duration::from_secs(1)));
        assert!(staged.destroy(Duration::from_secs(1)));

        assert_eq!(total_mapped_bytes(), bytes_before);
        assert_eq!(total_mapped_segments(), segs_before);
    }

    #[test]
    fn append_to_full_segment_is_refused() {
        let _guard = DISK_TESTS.lock();
        let dir = tempdir().unwrap();
        let seg = MappedSegment::open(dir.path().join(SEG_NAME), 4096).unwrap();

        seg.append_record(&RawEncoder, &[9u8; 4096][..]);
        assert!(seg.is_full());

        let flushed = seg.flushed_position();
        let outcome = seg.append_record(&RawEncoder, &[1u8][..]);
        assert_eq!(outcome.status, AppendStatus::UnknownError);
        assert_eq!(outcome.wrote_bytes, 0);
        assert_eq!(seg.wrote_position(), 4096);
        assert_eq!(seg.flushed_position(), flushed);
        assert!(seg.destroy(Duration::from_secs(1)));
    }

    #[test]
    fn slice_bounds_are_enforced() {
        let _guard = DISK_TESTS.lock();
        let dir = tempdir().unwrap();
        let seg = MappedSegment::open(dir.path().join(SEG_NAME), 4096).unwrap();

        assert!(seg.append_raw(&[1u8; 100]));

        assert!(seg.slice(0, 200).is_none());
        assert!(seg.slice_from(100).is_none());

        let tail = seg.slice_from(50).unwrap();
        assert_eq!(tail.len(), 50);
        assert_eq!(tail.start_offset(), 50);
        drop(tail);

        assert!(seg.destroy(Duration::from_secs(1)));
    }

    #[test]
    fn frames_survive_the_segment_roundtrip() {
        let _guard = DISK_TESTS.lock();
        let dir = tempdir().unwrap();
        let seg = MappedSegment::open(dir.path().join("00000000000000008192"), 8192).unwrap();
        let encoder = FrameEncoder::default();

        let first = seg.append_record(&encoder, b"first record".as_ref());
        assert_eq!(first.status, AppendStatus::Ok);
        assert_eq!(first.log_offset, 8192);

        let second = seg.append_record(&encoder, b"second".as_ref());
        assert_eq!(second.log_offset, 8192 + first.wrote_bytes as u64);
        assert!(seg.store_timestamp_ms() >= first.store_timestamp_ms);

        seg.flush(0);

        let view = seg.slice_from(0).unwrap();
        let (len, payload) = FrameEncoder::read_frame(&view).unwrap().unwrap();
        assert_eq!(&payload[..], b"first record");
        let (_, payload) = FrameEncoder::read_frame(&view[len..]).unwrap().unwrap();
        assert_eq!(&payload[..], b"second");
        drop(view);

        assert!(seg.destroy(Duration::from_secs(1)));
    }

    #[test]
    fn eof_frame_fills_the_segment() {
        let _guard = DISK_TESTS.lock();
        let dir = tempdir().unwrap();
        let seg = MappedSegment::open(dir.path().join(SEG_NAME), 64).unwrap();
        let encoder = FrameEncoder::default();

        let first = seg.append_record(&encoder, &[4u8; 20][..]);
        assert_eq!(first.status, AppendStatus::Ok);
        assert_eq!(first.wrote_bytes, FRAME_HEADER_LEN + 20);

        // 32 bytes left; a 21-byte payload needs 33 with the filler reserve.
        let second = seg.append_record(&encoder, &[4u8; 21][..]);
        assert_eq!(second.status, AppendStatus::EndOfFile);
        assert!(seg.is_full());
        assert!(seg.destroy(Duration::from_secs(1)));
    }

    #[test]
    fn warm_up_faults_pages_without_advancing_positions() {
        let _guard = DISK_TESTS.lock();
        let dir = tempdir().unwrap();
        let seg = MappedSegment::open(dir.path().join(SEG_NAME), 16384).unwrap();

        seg.warm_up(FlushMode::Sync, 1);
        assert_eq!(seg.wrote_position(), 0);
        assert_eq!(seg.flushed_position(), 0);

        assert!(seg.append_raw(&[0xEE; 32]));
        seg.munlock();
        assert!(seg.destroy(Duration::from_secs(1)));
    }

    #[test]
    fn raw_append_beyond_capacity_is_refused() {
        let _guard = DISK_TESTS.lock();
        let dir = tempdir().unwrap();
        let seg = MappedSegment::open(dir.path().join(SEG_NAME), 128).unwrap();

        assert!(seg.append_raw(&[1u8; 100]));
        assert!(!seg.append_raw(&[1u8; 29]));
        assert_eq!(seg.wrote_position(), 100);
        assert!(seg.destroy(Duration::from_secs(1)));
    }

    #[test]
    fn concurrent_appender_and_flusher_keep_invariants() {
        let _guard = DISK_TESTS.lock();
        let dir = tempdir().unwrap();
        let seg = MappedSegment::open(dir.path().join(SEG_NAME), 256 * 1024).unwrap();

        let appender = {
            let seg = Arc::clone(&seg);
            std::thread::spawn(move || {
                for i in 0..500u32 {
                    assert!(seg.append_raw(&[(i % 251) as u8; 128]));
                }
            })
        };
        let flusher = {
            let seg = Arc::clone(&seg);
            std::thread::spawn(move || {
                for _ in 0..50 {
                    let flushed = seg.flush(0);
                    let read = seg.read_position();
                    let wrote = seg.wrote_position();
                    assert!(flushed <= read);
                    assert!(read <= wrote);
                    assert!(wrote <= seg.file_size());
                }
            })
        };

        appender.join().unwrap();
        flusher.join().unwrap();

        assert_eq!(seg.wrote_position(), 500 * 128);
        assert_eq!(seg.flush(0), 500 * 128);
        assert!(seg.destroy(Duration::from_secs(1)));
    }
}
