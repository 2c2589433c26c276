//! Shared lifetime with deferred cleanup.
//!
//! A segment's OS resources (the mapping, the file descriptor) must outlive
//! every concurrent reader. `RefState` carries the atomic lifecycle bits and
//! `ReferenceResource` layers the hold/release/shutdown protocol on top, so
//! teardown is deferred until the last borrowed view is gone — or until the
//! forcible grace period expires.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

/// Offset applied when a shutdown turns forcible: the refcount is driven far
/// below zero so stragglers releasing afterwards can never resurrect it.
const FORCIBLE_REF_FLOOR: i64 = -1000;

/// Atomic lifecycle state embedded in a reference-counted resource.
#[derive(Debug)]
pub struct RefState {
    available: AtomicBool,
    refs: AtomicI64,
    cleanup_done: AtomicBool,
    cleanup_started: AtomicBool,
    first_shutdown_ms: AtomicI64,
}

impl RefState {
    /// Fresh state: available, one owner reference outstanding.
    pub fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            refs: AtomicI64::new(1),
            cleanup_done: AtomicBool::new(false),
            cleanup_started: AtomicBool::new(false),
            first_shutdown_ms: AtomicI64::new(0),
        }
    }

    pub fn cleanup_done(&self) -> bool {
        self.cleanup_done.load(Ordering::Acquire)
    }
}

impl Default for RefState {
    fn default() -> Self {
        Self::new()
    }
}

/// Hold/release protocol for resources shared with in-flight readers.
///
/// Implementors supply the state and the single-shot `cleanup`; the default
/// methods provide the protocol. All transitions are lock-free.
pub trait ReferenceResource {
    fn ref_state(&self) -> &RefState;

    /// Release the backing resources. Called at most once with the refcount
    /// observed at the triggering release. Must refuse (return `false`) while
    /// the resource is still available.
    fn cleanup(&self, current_refs: i64) -> bool;

    /// Acquire a reference if the resource is still available.
    fn hold(&self) -> bool {
        let state = self.ref_state();
        // Availability must be observed before the increment so a reader can
        // never pin a resource whose shutdown already started.
        if state.available.load(Ordering::Acquire) {
            if state.refs.fetch_add(1, Ordering::AcqRel) > 0 {
                return true;
            }
            state.refs.fetch_sub(1, Ordering::AcqRel);
        }
        false
    }

    /// Drop a reference; runs `cleanup` when the last one goes after shutdown.
    fn release(&self) {
        let state = self.ref_state();
        let value = state.refs.fetch_sub(1, Ordering::AcqRel) - 1;
        if value > 0 || state.available.load(Ordering::Acquire) {
            return;
        }
        // Single-shot: concurrent final releases race to this flag.
        if state
            .cleanup_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if self.cleanup(value) {
                state.cleanup_done.store(true, Ordering::Release);
            } else {
                state.cleanup_started.store(false, Ordering::Release);
            }
        }
    }

    /// Request shutdown. The first call flips availability and drops the
    /// owner reference; repeated calls escalate to a forcible refcount reset
    /// once `interval_forcibly` has elapsed since the first request.
    fn shutdown(&self, interval_forcibly: Duration) {
        let state = self.ref_state();
        if state
            .available
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            state
                .first_shutdown_ms
                .store(Utc::now().timestamp_millis(), Ordering::Release);
            self.release();
        } else if self.ref_count() > 0 {
            let since_first = Utc::now().timestamp_millis()
                - state.first_shutdown_ms.load(Ordering::Acquire);
            if since_first >= interval_forcibly.as_millis() as i64 {
                state
                    .refs
                    .store(FORCIBLE_REF_FLOOR - self.ref_count(), Ordering::Release);
                self.release();
            }
        }
    }

    fn is_available(&self) -> bool {
        self.ref_state().available.load(Ordering::Acquire)
    }

    fn ref_count(&self) -> i64 {
        self.ref_state().refs.load(Ordering::Acquire)
    }

    /// True once cleanup ran and no references remain.
    fn is_cleanup_over(&self) -> bool {
        let state = self.ref_state();
        state.cleanup_done.load(Ordering::Acquire) && state.refs.load(Ordering::Acquire) <= 0
    }
}
