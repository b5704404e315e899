//! # Tail-Resumptive Conversion
//!
//! Rewrites every operation site classified `TailResumptive` into a plain
//! call through its evidence slot: a direct call when the slot is static,
//! one indirection through the operation table when dynamic. Either way
//! the continuation-capture scaffolding for the site is gone — a
//! tail-resumptive handler runs in place and hands its value straight
//! back to the performer.
//!
//! This pass is where the classifier's work pays off; semantics are
//! preserved because a tail resume is, observably, exactly a return.

use crate::effects::classify::OperationClass;
use crate::ir::types::{Callee, TerminatorKind};
use crate::ir::Module;
use crate::opt::{Pass, PassOutcome, PipelineCtx, PipelineError};

/// The tail-resumptive conversion pass (pass 4).
pub struct TailConvert;

impl Pass for TailConvert {
    fn name(&self) -> &'static str {
        "tail-convert"
    }

    fn run(
        &mut self,
        module: &mut Module,
        _ctx: &mut PipelineCtx<'_>,
    ) -> Result<PassOutcome, PipelineError> {
        let mut changed = false;
        for func in &mut module.functions {
            for block_idx in 0..func.blocks.len() {
                let Some(terminator) = func.blocks[block_idx].terminator.as_ref() else {
                    continue;
                };
                let TerminatorKind::Perform {
                    effect,
                    op_index,
                    args,
                    destination,
                    target,
                    class: OperationClass::TailResumptive,
                } = &terminator.kind
                else {
                    continue;
                };

                let slot = func.evidence.slot_for(*effect).ok_or_else(|| {
                    // The validator guarantees a slot per reachable site;
                    // a missing one here means a previous pass broke the
                    // layout.
                    PipelineError::InvariantViolation {
                        pass: "tail-convert",
                        function: func.name.clone(),
                        detail: format!("no evidence slot for {effect} at converted site"),
                    }
                })?;

                let new_kind = TerminatorKind::Call {
                    callee: Callee::Evidence {
                        slot,
                        op_index: *op_index,
                    },
                    args: args.clone(),
                    destination: *destination,
                    target: *target,
                };
                func.blocks[block_idx].terminator.as_mut().unwrap().kind = new_kind;
                changed = true;
            }
        }
        Ok(PassOutcome::from_changed(changed))
    }
}
