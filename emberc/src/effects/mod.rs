//! # Effects System
//!
//! The compile-time half of Ember's algebraic effects: declarations,
//! evidence slots, operation classification, and the FFI boundary guard.
//!
//! ## Compilation Strategy
//!
//! Effects are compiled using **evidence passing**: instead of searching
//! for handlers at runtime, every effectful function receives an evidence
//! vector mapping each effect to the handler currently in force, giving
//! O(1) handler lookup.
//!
//! ```text
//! // Source (with effects)
//! fn increment() / {State<Int>} {
//!     let x = get()
//!     set(x + 1)
//! }
//!
//! // After evidence translation
//! fn increment(ev: Evidence) {
//!     let x = ev[state].get()
//!     ev[state].set(x + 1)
//! }
//! ```
//!
//! Whether `ev[state].get()` is a plain call or a suspension point is
//! decided per operation site by the [`classify`] module; the
//! [`crate::opt`] pipeline then removes indirection wherever the
//! classification allows it.
//!
//! ## Module Structure
//!
//! - [`decl`] - Effect, operation, and handler declarations
//! - [`evidence`] - Evidence slots and per-function layouts
//! - [`classify`] - Tail-resumptive / general / FFI-boundary classification
//! - [`ffi`] - The boundary guard keeping captures out of foreign frames

pub mod classify;
pub mod decl;
pub mod evidence;
pub mod ffi;

pub use classify::{classify_function_sites, classify_handler_op, resume_shape, OperationClass};
pub use decl::{
    EffectDecl, EffectId, EffectRegistry, HandlerDecl, HandlerId, HandlerOp, OperationPurity,
    OperationSig, RegistryError, ResumeStrategy,
};
pub use evidence::{
    analyze_evidence_stacks, AbstractHandler, EvidenceLayout, EvidenceSlot, EvidenceStacks,
    SlotAssignment,
};
pub use ffi::check_foreign_boundaries;
