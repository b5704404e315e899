//! # Continuations
//!
//! An owned, resumable snapshot of a suspended computation, created only
//! for operations the compiler classified `General` — tail-resumptive
//! operations never reach this module.
//!
//! ## Ownership
//!
//! A continuation is owned exclusively by the code path that captured it
//! until it is passed to [`Continuation::resume`], at which point
//! ownership transfers to the runtime until the computation suspends
//! again or completes. Continuations are **one-shot**: resumption
//! consumes them, and the single-shot path reuses the captured execution
//! context's memory rather than copying it. Multi-shot resumption is an
//! explicit [`Continuation::clone_shot`] before each additional resume;
//! each clone deep-copies the context so clones progress independently.
//!
//! Dropping an unresumed continuation discards its execution context
//! deterministically — teardown hooks fire, counters drop — rather than
//! at some later collection point.
//!
//! ## Registry
//!
//! Generated code and foreign callbacks hold a flat
//! [`ContinuationRef`] handle instead of the owned value. The registry
//! enforces one-shot semantics across that indirection: taking a
//! continuation twice yields `None`, which surfaces as the
//! resume-after-completion error rather than silently duplicating state.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use thiserror::Error;

use crate::context::{ContextError, ContextPool, ContextState, ExecutionContext};
use crate::ffi::foreign_depth;

/// Unique identifier for a continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContinuationId(pub u64);

impl fmt::Display for ContinuationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "k{}", self.0)
    }
}

static NEXT_CONTINUATION_ID: AtomicU64 = AtomicU64::new(1);

fn next_continuation_id() -> ContinuationId {
    ContinuationId(NEXT_CONTINUATION_ID.fetch_add(1, Ordering::Relaxed))
}

/// Errors from resuming a continuation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResumeError {
    /// The continuation already ran to completion (or was already
    /// consumed through the registry). Resuming a finished computation
    /// is a catchable error, never undefined behavior.
    #[error("{id} already completed; clone before resuming more than once")]
    AlreadyCompleted {
        /// The offending continuation.
        id: ContinuationId,
    },

    /// The resume value's type does not match what the computation
    /// expects.
    #[error("{id} resumed with a value of the wrong type")]
    TypeMismatch {
        /// The offending continuation.
        id: ContinuationId,
    },
}

/// The type-erased computation. `Err` means the resume value had the
/// wrong type for the captured closure.
type ErasedEntry =
    Arc<dyn Fn(Box<dyn Any + Send>) -> Result<Box<dyn Any + Send>, ()> + Send + Sync>;

/// A captured continuation: the rest of a suspended computation.
pub struct Continuation {
    id: ContinuationId,
    /// The computation, type-erased. Shared (`Arc`) so multi-shot clones
    /// re-run the same entry against their own contexts.
    entry: ErasedEntry,
    /// The captured execution context. Taken on resume; absent means
    /// consumed.
    context: Option<ExecutionContext>,
}

impl Continuation {
    /// Capture a continuation, allocating its execution context from the
    /// pool (the lazy "first suspension" allocation).
    ///
    /// Fails if the context budget is exhausted, or if a foreign call
    /// frame is active on this thread — a capture spanning a foreign
    /// frame could never be restored.
    pub fn capture<F, T, R>(pool: &ContextPool, f: F) -> Result<Self, ContextError>
    where
        F: Fn(T) -> R + Send + Sync + 'static,
        T: Any + Send + 'static,
        R: Any + Send + 'static,
    {
        if foreign_depth() > 0 {
            return Err(ContextError::CaptureAcrossForeignFrame);
        }
        let mut context = pool.create()?;
        context.suspend()?;
        Ok(Self {
            id: next_continuation_id(),
            entry: Arc::new(move |value: Box<dyn Any + Send>| match value.downcast::<T>() {
                Ok(value) => Ok(Box::new(f(*value)) as Box<dyn Any + Send>),
                Err(_) => Err(()),
            }),
            context: Some(context),
        })
    }

    /// The continuation's id.
    pub fn id(&self) -> ContinuationId {
        self.id
    }

    /// Whether this continuation can still be resumed.
    pub fn is_live(&self) -> bool {
        self.context
            .as_ref()
            .map(|c| c.state() == ContextState::Suspended)
            .unwrap_or(false)
    }

    /// The captured context's state, if still owned.
    pub fn context_state(&self) -> Option<ContextState> {
        self.context.as_ref().map(|c| c.state())
    }

    /// Resume with a value, consuming the continuation.
    ///
    /// Re-enters exactly the dynamic extent that was active at capture
    /// time and runs the computation to its next completion. The
    /// execution context is reused, not copied, and is released when the
    /// computation finishes.
    pub fn resume<T, R>(mut self, value: T) -> Result<R, ResumeError>
    where
        T: Any + Send + 'static,
        R: Any + Send + 'static,
    {
        let mut context = self
            .context
            .take()
            .ok_or(ResumeError::AlreadyCompleted { id: self.id })?;

        context
            .reenter()
            .map_err(|_| ResumeError::AlreadyCompleted { id: self.id })?;
        // A wrong-typed resume still consumes the continuation, matching
        // the one-shot contract; the check turns what would be undefined
        // behavior into a catchable error.
        let result =
            (self.entry)(Box::new(value)).map_err(|()| ResumeError::TypeMismatch { id: self.id })?;
        let _ = context.complete();
        drop(context);

        result
            .downcast::<R>()
            .map(|r| *r)
            .map_err(|_| ResumeError::TypeMismatch { id: self.id })
    }

    /// Explicitly clone for multi-shot resumption.
    ///
    /// The clone owns an independent deep copy of the execution context
    /// (stack and handler-frame chain), charged against the same pool
    /// budget; resuming the clone and the original cannot interfere.
    pub fn clone_shot(&self) -> Result<Continuation, ContextError> {
        let context = self
            .context
            .as_ref()
            .ok_or(ContextError::InvalidTransition {
                from: ContextState::Completed,
                to: ContextState::Suspended,
            })?;
        Ok(Continuation {
            id: next_continuation_id(),
            entry: Arc::clone(&self.entry),
            context: Some(context.deep_clone()?),
        })
    }
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("id", &self.id)
            .field("state", &self.context_state())
            .finish()
    }
}

// Dropping an unresumed continuation drops its context, whose Drop impl
// discards resources and fires teardown hooks.

// ============================================================================
// Continuation Registry
// ============================================================================

/// A flat continuation handle for generated code and FFI callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ContinuationRef {
    /// The continuation id, 0 for null.
    pub id: u64,
}

impl ContinuationRef {
    /// The null reference.
    pub const fn null() -> Self {
        Self { id: 0 }
    }

    /// Whether this is the null reference.
    pub fn is_null(&self) -> bool {
        self.id == 0
    }
}

static REGISTRY: OnceLock<Mutex<HashMap<u64, Continuation>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<u64, Continuation>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Park a continuation in the registry, returning its handle.
pub fn register_continuation(k: Continuation) -> ContinuationRef {
    let id = k.id().0;
    registry().lock().insert(id, k);
    ContinuationRef { id }
}

/// Take a continuation out of the registry. One-shot: the second take of
/// the same handle returns `None`.
pub fn take_continuation(r: ContinuationRef) -> Option<Continuation> {
    registry().lock().remove(&r.id)
}

/// Whether a handle still refers to a parked continuation.
pub fn has_continuation(r: ContinuationRef) -> bool {
    registry().lock().contains_key(&r.id)
}

/// Resume through a handle. A dangling handle (already resumed, already
/// taken, or dropped) is the resume-after-completion error.
pub fn resume_ref<T, R>(r: ContinuationRef, value: T) -> Result<R, ResumeError>
where
    T: Any + Send + 'static,
    R: Any + Send + 'static,
{
    let k = take_continuation(r).ok_or(ResumeError::AlreadyCompleted {
        id: ContinuationId(r.id),
    })?;
    k.resume(value)
}
