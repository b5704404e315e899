//! # Runtime FFI Barrier
//!
//! The runtime half of the FFI boundary guard. The compiler rejects
//! programs where a capture could provably span a foreign frame; this
//! module enforces the same rule dynamically for anything the static
//! analysis had to approximate, and provides the callback-conversion
//! machinery the compiler's `Barrier(CallbackConvert)` lowering targets.
//!
//! ## Foreign frames
//!
//! Entering a foreign call pushes a thread-local depth through
//! [`ForeignFrameGuard`]. While the depth is non-zero, continuation
//! capture on this thread fails with
//! [`ContextError::CaptureAcrossForeignFrame`] — the foreign stack frame
//! cannot be restored by a resume, so the capture must be refused rather
//! than corrupt the stack later.
//!
//! ## Callback conversion
//!
//! A converted call does not capture. The suspension is deferred to a
//! [`ResultSlot`]: the foreign side receives a completion callback that
//! resolves the slot, and the managed side polls or blocks on it from
//! its own frame.
//!
//! [`ContextError::CaptureAcrossForeignFrame`]: crate::context::ContextError::CaptureAcrossForeignFrame

use std::cell::Cell;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

thread_local! {
    static FOREIGN_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Current foreign-frame depth on this thread.
pub fn foreign_depth() -> usize {
    FOREIGN_DEPTH.with(|depth| depth.get())
}

/// RAII marker for a foreign call frame.
///
/// Generated code constructs one immediately before a foreign call and
/// drops it when the call returns; captures in between are refused.
#[derive(Debug)]
pub struct ForeignFrameGuard {
    _private: (),
}

impl ForeignFrameGuard {
    /// Enter a foreign frame.
    pub fn enter() -> Self {
        FOREIGN_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self { _private: () }
    }
}

impl Drop for ForeignFrameGuard {
    fn drop(&mut self) {
        FOREIGN_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

struct SlotInner<T> {
    value: Mutex<Option<T>>,
    ready: Condvar,
}

/// The explicit result slot of a callback-converted foreign call.
///
/// The foreign completion callback calls [`ResultSlot::resolve`]; the
/// managed side takes the value with [`ResultSlot::try_take`] (polling)
/// or [`ResultSlot::take_timeout`] (blocking). Exactly one resolution is
/// kept; later resolutions are dropped.
pub struct ResultSlot<T> {
    inner: Arc<SlotInner<T>>,
}

impl<T> ResultSlot<T> {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SlotInner {
                value: Mutex::new(None),
                ready: Condvar::new(),
            }),
        }
    }

    /// Resolve the slot. Returns whether this resolution was the first
    /// and was kept.
    pub fn resolve(&self, value: T) -> bool {
        let mut guard = self.inner.value.lock();
        if guard.is_some() {
            return false;
        }
        *guard = Some(value);
        self.inner.ready.notify_all();
        true
    }

    /// Whether a value is waiting.
    pub fn is_resolved(&self) -> bool {
        self.inner.value.lock().is_some()
    }

    /// Take the value if resolved, without blocking.
    pub fn try_take(&self) -> Option<T> {
        self.inner.value.lock().take()
    }

    /// Block until resolved or the timeout elapses, then take.
    pub fn take_timeout(&self, timeout: Duration) -> Option<T> {
        let mut guard = self.inner.value.lock();
        if guard.is_none() {
            self.inner.ready.wait_for(&mut guard, timeout);
        }
        guard.take()
    }
}

impl<T> Default for ResultSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for ResultSlot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for ResultSlot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSlot")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}
