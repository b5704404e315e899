//! # Async Specialization
//!
//! A restricted case of the continuation runtime: when a function's
//! suspension points are statically enumerable, the function compiles to
//! an explicit state index plus a flat local-state record, with one
//! dispatch block per suspension point. Re-entry polls the pending
//! sub-computation and either produces the final value or reports "not
//! yet ready" — the execution context stays on the caller's own stack and
//! no separate stack is ever allocated.
//!
//! Applicability (all must hold):
//!
//! - every suspension point sits outside any cycle (a suspension in a
//!   loop of unknown bound is not enumerable);
//! - the function neither participates in call-graph recursion nor calls
//!   another effectful function (its callee could suspend on its own);
//! - no suspension point can be served by a multi-shot handler (a state
//!   machine has exactly one live position);
//! - the accumulated local state fits the configured budget.
//!
//! When the test fails the function simply keeps the general continuation
//! runtime, which is always correct but costs a separate execution
//! context.

use rustc_hash::FxHashSet;
use serde::Serialize;

use crate::effects::classify::OperationClass;
use crate::effects::decl::{EffectId, ResumeStrategy};
use crate::effects::evidence::{analyze_evidence_stacks, AbstractHandler, EvidenceStacks};
use crate::ir::types::{BasicBlockId, Callee, FuncId, LocalId, TerminatorKind};
use crate::ir::{FunctionBody, Module};
use crate::opt::{Pass, PassOutcome, PipelineCtx, PipelineError};

/// One suspension point of a specialized function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SuspendState {
    /// Dispatch index (0-based, in reverse postorder of the suspend
    /// blocks).
    pub index: u32,
    /// The block whose terminator suspends.
    pub block: BasicBlockId,
    /// The effect performed at this point.
    pub effect: EffectId,
    /// The operation index within the effect.
    pub op_index: u32,
    /// The local that receives the resume value on re-entry.
    pub resume_local: LocalId,
}

/// One slot of the flat local-state record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrameSlot {
    /// The local stored in this slot.
    pub local: LocalId,
    /// Byte offset within the record.
    pub offset: u32,
    /// Slot size in bytes.
    pub size: u32,
}

/// Layout of the flat local-state record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrameLayout {
    /// Slots in layout order.
    pub slots: Vec<FrameSlot>,
    /// Total record size in bytes.
    pub size: u32,
}

/// The state-machine compilation artifact for one function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateMachine {
    /// The specialized function's name.
    pub function: String,
    /// Dispatch states, one per suspension point.
    pub states: Vec<SuspendState>,
    /// The flat local-state record.
    pub frame: FrameLayout,
}

/// The async-specialization pass (pass 7).
pub struct AsyncSpecialize;

impl Pass for AsyncSpecialize {
    fn name(&self) -> &'static str {
        "async-specialize"
    }

    fn run(
        &mut self,
        module: &mut Module,
        ctx: &mut PipelineCtx<'_>,
    ) -> Result<PassOutcome, PipelineError> {
        let mut changed = false;
        for func_id in module.func_ids() {
            let machine = specialize(module, func_id, ctx);
            match machine {
                Some(machine) => {
                    let previous = ctx.state_machines.insert(func_id, machine);
                    if previous.as_ref() != ctx.state_machines.get(&func_id) {
                        changed = true;
                    }
                }
                None => {
                    if ctx.state_machines.remove(&func_id).is_some() {
                        changed = true;
                    }
                }
            }
        }
        Ok(PassOutcome::from_changed(changed))
    }
}

/// Run the applicability test and build the state machine, or `None` when
/// the function must keep the general runtime.
pub fn specialize(
    module: &Module,
    func_id: FuncId,
    ctx: &PipelineCtx<'_>,
) -> Option<StateMachine> {
    let func = module.func(func_id);

    // Enumerate suspension points: remaining general operation sites.
    let reachable = func.reachable_blocks();
    let rpo = func.reverse_postorder();
    let mut suspend_blocks: Vec<BasicBlockId> = Vec::new();
    for &block in &rpo {
        if let Some(terminator) = func.block(block).terminator.as_ref() {
            if let TerminatorKind::Perform {
                class: OperationClass::General,
                ..
            } = terminator.kind
            {
                suspend_blocks.push(block);
            }
        }
    }
    if suspend_blocks.is_empty() {
        return None;
    }

    // No suspension inside a loop.
    let cyclic = func.blocks_in_cycles();
    if suspend_blocks.iter().any(|b| cyclic.contains(b)) {
        return None;
    }

    // No recursive suspension, and no call that could suspend on its own.
    if in_call_cycle(module, func_id) {
        return None;
    }
    for &block in &reachable {
        if let Some(terminator) = func.block(block).terminator.as_ref() {
            if let TerminatorKind::Call {
                callee: Callee::Fn(callee),
                ..
            } = &terminator.kind
            {
                match module.functions.get(callee.0 as usize) {
                    Some(callee) if callee.effect_set.is_empty() => {}
                    // Effectful or unknown callee: it may suspend on its
                    // own, so the points are not enumerable.
                    _ => return None,
                }
            }
        }
    }

    // No multi-shot requirement at any suspension point.
    let stacks = analyze_evidence_stacks(func, &[]).ok()?;
    for &block in &suspend_blocks {
        let TerminatorKind::Perform { effect, .. } = &func.block(block).terminator().kind else {
            continue;
        };
        let in_force = stacks.at_terminator(func, block);
        let handler = match EvidenceStacks::handler_in_force(&in_force, *effect) {
            Some(AbstractHandler::Constant(h)) => Some(h),
            Some(AbstractHandler::Partial) => None,
            None => func.evidence.binding_for(*effect),
        };
        match handler.and_then(|h| ctx.registry.handler(h)) {
            Some(decl) if decl.resume_strategy != ResumeStrategy::MultiShot => {}
            // Unknown handler or declared multi-shot: not enumerable.
            _ => return None,
        }
    }

    // Local state must fit the budget.
    let frame = layout_frame(func);
    if frame.size as usize > ctx.config.async_state_budget {
        return None;
    }

    let states = suspend_blocks
        .iter()
        .enumerate()
        .map(|(index, &block)| {
            let TerminatorKind::Perform {
                effect,
                op_index,
                destination,
                ..
            } = &func.block(block).terminator().kind
            else {
                unreachable!("suspend blocks hold Perform terminators");
            };
            SuspendState {
                index: index as u32,
                block,
                effect: *effect,
                op_index: *op_index,
                resume_local: destination.local,
            }
        })
        .collect();

    Some(StateMachine {
        function: func.name.clone(),
        states,
        frame,
    })
}

/// Pack every local into the flat record, 8-byte aligned.
fn layout_frame(func: &FunctionBody) -> FrameLayout {
    let mut slots = Vec::with_capacity(func.locals.len());
    let mut offset = 0u32;
    for (i, local) in func.locals.iter().enumerate() {
        let size = local.ty.size_hint() as u32;
        if size == 0 {
            continue;
        }
        let aligned = size.next_multiple_of(8);
        slots.push(FrameSlot {
            local: LocalId(i as u32),
            offset,
            size,
        });
        offset += aligned;
    }
    FrameLayout {
        slots,
        size: offset,
    }
}

/// Whether a function participates in a call-graph cycle.
fn in_call_cycle(module: &Module, func_id: FuncId) -> bool {
    let mut visited: FxHashSet<FuncId> = FxHashSet::default();
    let mut stack: Vec<FuncId> = callees(module, func_id);
    while let Some(current) = stack.pop() {
        if current == func_id {
            return true;
        }
        if !visited.insert(current) {
            continue;
        }
        stack.extend(callees(module, current));
    }
    false
}

fn callees(module: &Module, func_id: FuncId) -> Vec<FuncId> {
    let mut out = Vec::new();
    let Some(func) = module.functions.get(func_id.0 as usize) else {
        return out;
    };
    for block in &func.blocks {
        if let Some(terminator) = &block.terminator {
            if let TerminatorKind::Call {
                callee: Callee::Fn(callee),
                ..
            } = &terminator.kind
            {
                out.push(*callee);
            }
        }
    }
    out
}
