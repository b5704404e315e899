//! # Backend Lowering Contract
//!
//! The hand-off to a native backend. After optimization, every remaining
//! operation site maps to exactly one [`LoweringRequest`]:
//!
//! - `DirectCall` for tail-resumptive sites (already rewritten into calls
//!   through their evidence slot, or still `Perform`s the classifier
//!   proved tail-resumptive);
//! - `SuspendCapableCall` for general sites, carrying fresh backend label
//!   handles for the resume and capture entry points;
//! - `Barrier` for FFI boundary crossings, naming the strategy.
//!
//! The backend owns instruction selection and register/stack conventions;
//! this contract only guarantees that the evidence-vector handle is live
//! at every lowered site, which holds by construction — the handle is an
//! ordinary parameter threaded by the front end. The plan is plain data
//! (serde), so a backend in another process can consume it as JSON.

use serde::Serialize;
use thiserror::Error;

use crate::effects::classify::OperationClass;
use crate::effects::evidence::EvidenceSlot;
use crate::ir::types::{BasicBlockId, Callee, ForeignConvention, TerminatorKind};
use crate::ir::FunctionBody;
use crate::opt::StateMachine;
use crate::span::Span;

/// A fresh backend label handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LabelId(pub u32);

/// Strategy for an FFI barrier site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BarrierStrategy {
    /// Suspension around this site is prohibited; the guard verified no
    /// general handler is in force.
    Prohibit,
    /// Suspensions resolve a result slot through a callback.
    CallbackConvert,
}

/// One lowering request for one operation site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum LoweringRequest {
    /// Tail-resumptive: a plain call through the evidence slot.
    DirectCall {
        /// Slot carrying the handler.
        slot: EvidenceSlot,
        /// Operation index within the effect.
        op_index: u32,
    },
    /// General: the backend emits capture scaffolding around the call.
    SuspendCapableCall {
        /// Slot carrying the handler.
        slot: EvidenceSlot,
        /// Operation index within the effect.
        op_index: u32,
        /// Label the computation re-enters at on resume.
        resume_entry: LabelId,
        /// Label of the capture shim.
        capture_entry: LabelId,
    },
    /// FFI boundary crossing.
    Barrier {
        /// How suspension around the site is handled.
        strategy: BarrierStrategy,
    },
}

/// A request anchored to its site.
#[derive(Debug, Clone, Serialize)]
pub struct SiteLowering {
    /// Block whose terminator is the site.
    pub block: BasicBlockId,
    /// Source location, for backend debug info.
    pub span: Span,
    /// The request.
    pub request: LoweringRequest,
}

/// How the whole function executes.
#[derive(Debug, Clone, Serialize)]
pub enum FunctionStrategy {
    /// General: suspension allocates an execution context.
    Stackful,
    /// Async-specialized: state-machine dispatch on the caller's stack.
    StateMachine(StateMachine),
}

/// The complete lowering plan for one function.
#[derive(Debug, Clone, Serialize)]
pub struct LoweringPlan {
    /// The function the plan covers.
    pub function: String,
    /// Whole-function execution strategy.
    pub strategy: FunctionStrategy,
    /// One entry per operation site, in block order.
    pub sites: Vec<SiteLowering>,
}

/// A site that cannot be lowered; always a pipeline bug, since the
/// driver validates and optimizes before building the plan.
#[derive(Debug, Clone, Error)]
pub enum LoweringError {
    /// A reachable site has no evidence slot. The validator would have
    /// rejected this, so a pass must have damaged the layout.
    #[error("in `{function}`: {block} has no evidence slot for its operation")]
    MissingSlot {
        /// The function being lowered.
        function: String,
        /// The offending block.
        block: BasicBlockId,
    },
}

impl LoweringPlan {
    /// Build the plan for an optimized function.
    pub fn build(
        func: &FunctionBody,
        state_machine: Option<&StateMachine>,
    ) -> Result<LoweringPlan, LoweringError> {
        let mut sites = Vec::new();
        let mut next_label = 0u32;
        let mut fresh = || {
            let label = LabelId(next_label);
            next_label += 1;
            label
        };

        for block in func.block_ids() {
            let Some(terminator) = func.block(block).terminator.as_ref() else {
                continue;
            };
            match &terminator.kind {
                TerminatorKind::Perform {
                    effect,
                    op_index,
                    class,
                    ..
                } => {
                    let slot =
                        func.evidence
                            .slot_for(*effect)
                            .ok_or_else(|| LoweringError::MissingSlot {
                                function: func.name.clone(),
                                block,
                            })?;
                    let request = match class {
                        OperationClass::TailResumptive => LoweringRequest::DirectCall {
                            slot,
                            op_index: *op_index,
                        },
                        OperationClass::General => LoweringRequest::SuspendCapableCall {
                            slot,
                            op_index: *op_index,
                            resume_entry: fresh(),
                            capture_entry: fresh(),
                        },
                        OperationClass::FfiBoundary => LoweringRequest::Barrier {
                            strategy: BarrierStrategy::CallbackConvert,
                        },
                    };
                    sites.push(SiteLowering {
                        block,
                        span: terminator.span,
                        request,
                    });
                }
                TerminatorKind::Call {
                    callee: Callee::Evidence { slot, op_index },
                    ..
                } => {
                    sites.push(SiteLowering {
                        block,
                        span: terminator.span,
                        request: LoweringRequest::DirectCall {
                            slot: *slot,
                            op_index: *op_index,
                        },
                    });
                }
                TerminatorKind::ForeignCall { convention, .. } => {
                    let strategy = match convention {
                        ForeignConvention::Direct => BarrierStrategy::Prohibit,
                        ForeignConvention::CallbackConvert => BarrierStrategy::CallbackConvert,
                    };
                    sites.push(SiteLowering {
                        block,
                        span: terminator.span,
                        request: LoweringRequest::Barrier { strategy },
                    });
                }
                _ => {}
            }
        }

        Ok(LoweringPlan {
            function: func.name.clone(),
            strategy: match state_machine {
                Some(machine) => FunctionStrategy::StateMachine(machine.clone()),
                None => FunctionStrategy::Stackful,
            },
            sites,
        })
    }

    /// Whether any site may suspend through the general runtime.
    pub fn has_suspend_sites(&self) -> bool {
        self.sites
            .iter()
            .any(|s| matches!(s.request, LoweringRequest::SuspendCapableCall { .. }))
    }

    /// Render the plan as JSON for an out-of-process backend.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }
}
