//! # Suspended Execution Contexts
//!
//! The runtime backing for a suspended computation: a lazily-allocated
//! stack segment plus a chain of active handler frames. Contexts are
//! created on first suspension, owned by exactly one continuation at a
//! time, and destroyed when the owning computation completes or is
//! discarded.
//!
//! ## Frame chain
//!
//! Handler frames live in an append-only arena with parent links by
//! index — a singly-linked stack, never a mutable graph. That keeps
//! capture and multi-shot cloning straightforward: cloning duplicates the
//! arena wholesale and every clone progresses independently.
//!
//! ## Resource discipline
//!
//! Contexts are created through a [`ContextPool`], which enforces the
//! configured budget and tracks live contexts and frames. Exceeding the
//! budget is an ordinary recoverable error
//! ([`ContextError::BudgetExceeded`]); it never corrupts other contexts.
//! Discarding an unresumed context releases its resources deterministically
//! and notifies each handler frame's teardown hook, innermost first, so a
//! resource-owning handler (say, one holding a lock) can clean up.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::config::{ContextConfig, RuntimeConfig};
use crate::evidence::{EffectTag, HandlerRef};

// ============================================================================
// Identifiers and State
// ============================================================================

/// Unique identifier for an execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx{}", self.0)
    }
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_context_id() -> ContextId {
    ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
}

/// Execution-context state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Executing on some stack.
    Running,
    /// Captured and waiting for a resume.
    Suspended,
    /// Ran to completion; terminal.
    Completed,
    /// Dropped without resuming; resources released. Terminal.
    Discarded,
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContextState::Running => "running",
            ContextState::Suspended => "suspended",
            ContextState::Completed => "completed",
            ContextState::Discarded => "discarded",
        };
        f.write_str(s)
    }
}

/// Errors from context management.
#[derive(Debug, Clone, Error)]
pub enum ContextError {
    /// The configured context budget is exhausted. Recoverable; other
    /// suspended contexts are unaffected.
    #[error("execution-context budget exceeded (limit {limit})")]
    BudgetExceeded {
        /// The configured limit.
        limit: usize,
    },

    /// A continuation capture was attempted while a foreign frame is on
    /// the stack.
    #[error("cannot capture a continuation across a foreign call frame")]
    CaptureAcrossForeignFrame,

    /// An illegal state transition was requested.
    #[error("invalid context transition: {from} -> {to}")]
    InvalidTransition {
        /// Current state.
        from: ContextState,
        /// Requested state.
        to: ContextState,
    },
}

// ============================================================================
// Handler Frames
// ============================================================================

/// Index of a frame within its context's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameIndex(pub u32);

/// Saved register/stack state for resuming a frame.
///
/// A minimal model: the cooperative design suspends only at known safe
/// points, so an instruction and stack pointer are enough for the
/// backend's resume shim.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameSnapshot {
    /// Saved instruction pointer.
    pub ip: usize,
    /// Saved stack pointer.
    pub sp: usize,
}

/// Notification target for context teardown.
///
/// Called exactly once per live frame when a suspended context is
/// discarded without resuming, innermost frame first. Hooks must not
/// capture continuations; they run during resource release.
pub trait TeardownHook: Send + Sync {
    /// The frame's handler is being retired without a resume.
    fn on_discard(&self);
}

/// One active handler frame.
#[derive(Clone)]
pub struct HandlerFrame {
    /// The effect the handler services.
    pub effect: EffectTag,
    /// The handler's operation table.
    pub handler: HandlerRef,
    /// The enclosing frame, outward link in the chain.
    pub parent: Option<FrameIndex>,
    /// Saved state for resumption.
    pub snapshot: FrameSnapshot,
    /// Teardown notification, if the handler registered one.
    teardown: Option<Arc<dyn TeardownHook>>,
    /// Whether the frame is still on the active chain.
    live: bool,
}

impl fmt::Debug for HandlerFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerFrame")
            .field("effect", &self.effect)
            .field("handler", &self.handler)
            .field("parent", &self.parent)
            .field("live", &self.live)
            .finish()
    }
}

/// Append-only arena of handler frames with parent links by index.
#[derive(Debug, Clone, Default)]
pub struct FrameArena {
    frames: Vec<HandlerFrame>,
    top: Option<FrameIndex>,
}

impl FrameArena {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a frame onto the chain.
    pub fn push(
        &mut self,
        effect: EffectTag,
        handler: HandlerRef,
        teardown: Option<Arc<dyn TeardownHook>>,
    ) -> FrameIndex {
        let index = FrameIndex(self.frames.len() as u32);
        self.frames.push(HandlerFrame {
            effect,
            handler,
            parent: self.top,
            snapshot: FrameSnapshot::default(),
            teardown,
            live: true,
        });
        self.top = Some(index);
        index
    }

    /// Pop the innermost frame, returning its teardown hook.
    pub fn pop(&mut self) -> Option<(EffectTag, Option<Arc<dyn TeardownHook>>)> {
        let top = self.top?;
        let frame = &mut self.frames[top.0 as usize];
        frame.live = false;
        let teardown = frame.teardown.take();
        let effect = frame.effect;
        self.top = frame.parent;
        Some((effect, teardown))
    }

    /// The innermost frame index, if any.
    pub fn top(&self) -> Option<FrameIndex> {
        self.top
    }

    /// Access a frame by index.
    pub fn get(&self, index: FrameIndex) -> Option<&HandlerFrame> {
        self.frames.get(index.0 as usize)
    }

    /// Number of frames on the active chain.
    pub fn live_count(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.top;
        while let Some(index) = cursor {
            count += 1;
            cursor = self.frames[index.0 as usize].parent;
        }
        count
    }

    /// Iterate the active chain innermost-first.
    pub fn chain(&self) -> FrameChain<'_> {
        FrameChain {
            arena: self,
            cursor: self.top,
        }
    }
}

/// Iterator over the active frame chain, innermost first.
pub struct FrameChain<'a> {
    arena: &'a FrameArena,
    cursor: Option<FrameIndex>,
}

impl<'a> Iterator for FrameChain<'a> {
    type Item = &'a HandlerFrame;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let frame = &self.arena.frames[index.0 as usize];
        self.cursor = frame.parent;
        Some(frame)
    }
}

// ============================================================================
// Stack Segments
// ============================================================================

/// Growable stack memory for one context.
#[derive(Clone)]
pub struct StackSegment {
    memory: Vec<u8>,
    max_size: usize,
}

impl StackSegment {
    /// Allocate a segment.
    pub fn new(initial_size: usize, max_size: usize) -> Self {
        Self {
            memory: vec![0u8; initial_size],
            max_size,
        }
    }

    /// Current size in bytes.
    pub fn size(&self) -> usize {
        self.memory.len()
    }

    /// Double the segment, up to the maximum. Returns whether it grew.
    pub fn grow(&mut self) -> bool {
        let new_size = self.memory.len() * 2;
        if new_size > self.max_size {
            return false;
        }
        self.memory.resize(new_size, 0);
        true
    }
}

impl fmt::Debug for StackSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackSegment")
            .field("size", &self.memory.len())
            .field("max_size", &self.max_size)
            .finish()
    }
}

// ============================================================================
// Context Pool
// ============================================================================

struct PoolInner {
    config: ContextConfig,
    live_contexts: AtomicUsize,
    live_frames: AtomicUsize,
}

/// Creates execution contexts and enforces the configured budget.
///
/// Cheap to clone; clones share the same budget and counters.
#[derive(Clone)]
pub struct ContextPool {
    inner: Arc<PoolInner>,
}

impl ContextPool {
    /// Create a pool with the given limits.
    pub fn new(config: ContextConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                live_contexts: AtomicUsize::new(0),
                live_frames: AtomicUsize::new(0),
            }),
        }
    }

    /// Create a context, charging it against the budget.
    pub fn create(&self) -> Result<ExecutionContext, ContextError> {
        let limit = self.inner.config.max_contexts;
        // Optimistic reserve; back out on overshoot so concurrent
        // creators cannot blow past the budget.
        let previous = self.inner.live_contexts.fetch_add(1, Ordering::SeqCst);
        if previous >= limit {
            self.inner.live_contexts.fetch_sub(1, Ordering::SeqCst);
            return Err(ContextError::BudgetExceeded { limit });
        }
        Ok(ExecutionContext {
            id: next_context_id(),
            state: ContextState::Running,
            stack: None,
            frames: FrameArena::new(),
            pool: Arc::clone(&self.inner),
        })
    }

    /// Number of live contexts charged to this pool.
    pub fn live_contexts(&self) -> usize {
        self.inner.live_contexts.load(Ordering::SeqCst)
    }

    /// Number of live handler frames across this pool's contexts.
    pub fn live_frames(&self) -> usize {
        self.inner.live_frames.load(Ordering::SeqCst)
    }

    /// The pool's context configuration.
    pub fn config(&self) -> &ContextConfig {
        &self.inner.config
    }
}

impl Default for ContextPool {
    fn default() -> Self {
        Self::new(ContextConfig::default())
    }
}

impl fmt::Debug for ContextPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextPool")
            .field("live_contexts", &self.live_contexts())
            .field("live_frames", &self.live_frames())
            .finish()
    }
}

/// The process-wide default pool, configured from the global runtime
/// configuration when one was installed.
pub fn global_pool() -> &'static ContextPool {
    static GLOBAL: std::sync::OnceLock<ContextPool> = std::sync::OnceLock::new();
    GLOBAL.get_or_init(|| {
        let config = crate::runtime_config()
            .cloned()
            .unwrap_or_else(RuntimeConfig::default);
        ContextPool::new(config.context)
    })
}

// ============================================================================
// Execution Context
// ============================================================================

/// A suspended computation's runtime backing.
pub struct ExecutionContext {
    id: ContextId,
    state: ContextState,
    /// Allocated on first suspension, not at creation.
    stack: Option<StackSegment>,
    frames: FrameArena,
    pool: Arc<PoolInner>,
}

impl ExecutionContext {
    /// The context's id.
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> ContextState {
        self.state
    }

    /// The handler frame chain.
    pub fn frames(&self) -> &FrameArena {
        &self.frames
    }

    /// Push a handler frame.
    pub fn push_frame(
        &mut self,
        effect: EffectTag,
        handler: HandlerRef,
        teardown: Option<Arc<dyn TeardownHook>>,
    ) -> FrameIndex {
        self.pool.live_frames.fetch_add(1, Ordering::SeqCst);
        self.frames.push(effect, handler, teardown)
    }

    /// Pop the innermost handler frame without teardown (normal scope
    /// exit).
    pub fn pop_frame(&mut self) -> bool {
        if self.frames.pop().is_some() {
            self.pool.live_frames.fetch_sub(1, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    /// Transition Running -> Suspended, allocating the stack segment on
    /// first suspension.
    pub fn suspend(&mut self) -> Result<(), ContextError> {
        if self.state != ContextState::Running {
            return Err(ContextError::InvalidTransition {
                from: self.state,
                to: ContextState::Suspended,
            });
        }
        if self.stack.is_none() {
            self.stack = Some(StackSegment::new(
                self.pool.config.initial_stack_size,
                self.pool.config.max_stack_size,
            ));
        }
        self.state = ContextState::Suspended;
        Ok(())
    }

    /// Transition Suspended -> Running on resume.
    pub fn reenter(&mut self) -> Result<(), ContextError> {
        if self.state != ContextState::Suspended {
            return Err(ContextError::InvalidTransition {
                from: self.state,
                to: ContextState::Running,
            });
        }
        self.state = ContextState::Running;
        Ok(())
    }

    /// Transition Running -> Completed.
    pub fn complete(&mut self) -> Result<(), ContextError> {
        if self.state != ContextState::Running {
            return Err(ContextError::InvalidTransition {
                from: self.state,
                to: ContextState::Completed,
            });
        }
        self.state = ContextState::Completed;
        Ok(())
    }

    /// The context's stack segment, if one has been allocated.
    pub fn stack(&self) -> Option<&StackSegment> {
        self.stack.as_ref()
    }

    /// Discard the context: release resources deterministically and
    /// notify each live frame's teardown hook, innermost first.
    ///
    /// A panicking hook is contained to its own frame; remaining frames
    /// are still torn down.
    pub fn discard(&mut self) {
        if matches!(
            self.state,
            ContextState::Completed | ContextState::Discarded
        ) {
            self.release_frames(false);
            return;
        }
        self.release_frames(true);
        self.stack = None;
        self.state = ContextState::Discarded;
    }

    /// Deep-copy this context for multi-shot resumption.
    ///
    /// The clone is charged against the pool budget like any other
    /// context; its frame chain and stack are independent copies so the
    /// clones cannot interfere.
    pub fn deep_clone(&self) -> Result<ExecutionContext, ContextError> {
        let limit = self.pool.config.max_contexts;
        let previous = self.pool.live_contexts.fetch_add(1, Ordering::SeqCst);
        if previous >= limit {
            self.pool.live_contexts.fetch_sub(1, Ordering::SeqCst);
            return Err(ContextError::BudgetExceeded { limit });
        }
        self.pool
            .live_frames
            .fetch_add(self.frames.live_count(), Ordering::SeqCst);
        Ok(ExecutionContext {
            id: next_context_id(),
            state: self.state,
            stack: self.stack.clone(),
            frames: self.frames.clone(),
            pool: Arc::clone(&self.pool),
        })
    }

    fn release_frames(&mut self, notify: bool) {
        while let Some((_, teardown)) = self.frames.pop() {
            self.pool.live_frames.fetch_sub(1, Ordering::SeqCst);
            if notify {
                if let Some(hook) = teardown {
                    let result = catch_unwind(AssertUnwindSafe(|| hook.on_discard()));
                    if result.is_err() {
                        crate::log::error("teardown hook panicked; frame skipped");
                    }
                }
            }
        }
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("frames", &self.frames.live_count())
            .field("stack", &self.stack.as_ref().map(|s| s.size()))
            .finish()
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        // An unresumed context released here is the cancellation path:
        // resources go away now, not at some later collection point.
        match self.state {
            ContextState::Suspended | ContextState::Running => self.discard(),
            ContextState::Completed | ContextState::Discarded => self.release_frames(false),
        }
        self.pool.live_contexts.fetch_sub(1, Ordering::SeqCst);
    }
}
