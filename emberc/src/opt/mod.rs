//! # Optimization Pipeline
//!
//! The ordered set of passes that progressively eliminates effect
//! indirection, consuming and refining the classification attached to
//! each operation site:
//!
//! 1. **classify** — attach/refresh per-site classifications.
//! 2. **inline-handlers** — splice small, statically-known,
//!    tail-resumptive handler bodies over their call sites.
//! 3. **propagate-evidence** — call-graph dataflow promoting dynamic
//!    evidence slots to static ones.
//! 4. **tail-convert** — rewrite tail-resumptive operations into plain
//!    calls through their evidence slot.
//! 5. **effect-dce** — drop unobservable operations and dead evidence
//!    threading.
//! 6. **fuse-evidence** — merge and hoist handler installations.
//! 7. **async-specialize** — compile statically-enumerable suspension
//!    patterns to state machines.
//!
//! Every pass is idempotent given unchanged input: running the pipeline a
//! second time must report no change, which is what makes incremental
//! re-optimization safe. A pass that observes inconsistent state (a
//! stale classification, invalid IR from a previous pass) fails with
//! [`PipelineError`] — always fatal, always a pipeline bug, never
//! silently recovered.

pub mod async_spec;
pub mod dce;
pub mod fusion;
pub mod inline;
pub mod propagate;
pub mod tail_convert;

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::effects::classify::classify_function_sites;
use crate::effects::decl::EffectRegistry;
use crate::ir::types::FuncId;
use crate::ir::{validate_body, BodyKind, Module};

pub use async_spec::{AsyncSpecialize, FrameLayout, StateMachine, SuspendState};
pub use dce::EffectDce;
pub use fusion::FuseEvidence;
pub use inline::InlineHandlers;
pub use propagate::PropagateEvidence;
pub use tail_convert::TailConvert;

// ============================================================================
// Configuration
// ============================================================================

/// Compile-time knobs for the pipeline.
#[derive(Debug, Clone)]
pub struct OptConfig {
    /// Handler bodies at or below this many instructions (statements plus
    /// terminators) are eligible for inlining.
    pub inline_threshold: usize,
    /// Maximum flat local-state record, in bytes, for async
    /// specialization.
    pub async_state_budget: usize,
}

impl Default for OptConfig {
    fn default() -> Self {
        Self {
            inline_threshold: 24,
            async_state_budget: 256,
        }
    }
}

// ============================================================================
// Pass Infrastructure
// ============================================================================

/// Fatal pipeline failure: an internal invariant was violated.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// A pass observed state a previous pass should have made impossible.
    #[error("pass '{pass}' invariant violation in `{function}`: {detail}")]
    InvariantViolation {
        /// The pass that noticed.
        pass: &'static str,
        /// The function being transformed.
        function: String,
        /// What was wrong.
        detail: String,
    },

    /// A pass produced structurally invalid IR.
    #[error("pass '{pass}' produced invalid IR in `{function}`: {detail}")]
    InvalidIr {
        /// The offending pass.
        pass: &'static str,
        /// The function that no longer validates.
        function: String,
        /// First validation failure.
        detail: String,
    },
}

/// Whether a pass changed anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// The pass rewrote IR, layouts, or artifacts.
    Changed,
    /// Nothing to do; input was already in this pass's fixpoint.
    Unchanged,
}

impl PassOutcome {
    /// Build from a change flag.
    pub fn from_changed(changed: bool) -> Self {
        if changed {
            PassOutcome::Changed
        } else {
            PassOutcome::Unchanged
        }
    }

    /// Whether this outcome represents a change.
    pub fn is_changed(self) -> bool {
        self == PassOutcome::Changed
    }
}

/// Shared state threaded through the pipeline.
pub struct PipelineCtx<'a> {
    /// Effect and handler declarations.
    pub registry: &'a EffectRegistry,
    /// Pipeline configuration.
    pub config: OptConfig,
    /// State machines produced by async specialization, per function.
    pub state_machines: FxHashMap<FuncId, StateMachine>,
}

impl<'a> PipelineCtx<'a> {
    /// Create a context over a registry with the given configuration.
    pub fn new(registry: &'a EffectRegistry, config: OptConfig) -> Self {
        Self {
            registry,
            config,
            state_machines: FxHashMap::default(),
        }
    }
}

/// One pipeline pass.
pub trait Pass {
    /// Stable pass name, used in reports and errors.
    fn name(&self) -> &'static str;

    /// Run over the whole module.
    fn run(
        &mut self,
        module: &mut Module,
        ctx: &mut PipelineCtx<'_>,
    ) -> Result<PassOutcome, PipelineError>;
}

/// Refresh per-site classifications (pass 1).
///
/// Thin wrapper over [`classify_function_sites`]; classification itself is
/// total, so this pass can only ever report change, never fail.
pub struct Classify;

impl Pass for Classify {
    fn name(&self) -> &'static str {
        "classify"
    }

    fn run(
        &mut self,
        module: &mut Module,
        ctx: &mut PipelineCtx<'_>,
    ) -> Result<PassOutcome, PipelineError> {
        let mut changed = 0;
        for func in &mut module.functions {
            changed += classify_function_sites(func, ctx.registry);
        }
        Ok(PassOutcome::from_changed(changed > 0))
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Outcome of one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    /// `(pass name, changed)` in execution order.
    pub outcomes: Vec<(&'static str, bool)>,
}

impl PipelineReport {
    /// Whether any pass changed anything.
    pub fn changed(&self) -> bool {
        self.outcomes.iter().any(|(_, changed)| *changed)
    }
}

/// The ordered pipeline.
pub struct Pipeline {
    passes: Vec<Box<dyn Pass>>,
}

impl Pipeline {
    /// The standard pass order from the list above.
    pub fn standard() -> Self {
        Self {
            passes: vec![
                Box::new(Classify),
                Box::new(InlineHandlers),
                Box::new(PropagateEvidence),
                Box::new(TailConvert),
                Box::new(EffectDce),
                Box::new(FuseEvidence),
                Box::new(AsyncSpecialize),
            ],
        }
    }

    /// A pipeline with an explicit pass list (used by tests).
    pub fn with_passes(passes: Vec<Box<dyn Pass>>) -> Self {
        Self { passes }
    }

    /// Run every pass once, in order, validating the IR after each.
    ///
    /// Validation failure after a pass is that pass's bug and is fatal;
    /// upstream input is validated by the driver before the pipeline
    /// ever runs.
    pub fn run(
        &mut self,
        module: &mut Module,
        ctx: &mut PipelineCtx<'_>,
    ) -> Result<PipelineReport, PipelineError> {
        let mut outcomes = Vec::with_capacity(self.passes.len());
        for pass in &mut self.passes {
            let outcome = pass.run(module, ctx)?;
            for func in &module.functions {
                if let Err(errors) = validate_body(func, BodyKind::Function) {
                    return Err(PipelineError::InvalidIr {
                        pass: pass.name(),
                        function: func.name.clone(),
                        detail: errors[0].to_string(),
                    });
                }
            }
            outcomes.push((pass.name(), outcome.is_changed()));
        }
        Ok(PipelineReport { outcomes })
    }
}
