//! # Handler Inlining
//!
//! Replaces an operation call with the callee handler body when the
//! handler is statically known at the slot, the operation is
//! tail-resumptive, and the body is below the configured instruction
//! budget. Each inlined site loses one indirect dispatch.
//!
//! Restrictions beyond the classification:
//!
//! - recursive handlers are never inlined (the splice would not
//!   terminate);
//! - only bodies whose every reachable path ends in a tail resume are
//!   spliced. An aborting path (`Return` from the operation body) exits
//!   to the handler's install site, not to the performer, which a plain
//!   splice cannot express;
//! - bodies that perform effects or call out themselves are left to the
//!   general mechanism.

use crate::effects::classify::OperationClass;
use crate::effects::decl::HandlerId;
use crate::effects::evidence::{analyze_evidence_stacks, AbstractHandler, EvidenceStacks};
use crate::ir::types::{
    BasicBlockData, BasicBlockId, LocalId, Operand, Place, Rvalue, Statement, StatementKind,
    SwitchTargets, Terminator, TerminatorKind,
};
use crate::ir::{FunctionBody, Module};
use crate::opt::{Pass, PassOutcome, PipelineCtx, PipelineError};

/// The handler-inlining pass (pass 2).
pub struct InlineHandlers;

impl Pass for InlineHandlers {
    fn name(&self) -> &'static str {
        "inline-handlers"
    }

    fn run(
        &mut self,
        module: &mut Module,
        ctx: &mut PipelineCtx<'_>,
    ) -> Result<PassOutcome, PipelineError> {
        let mut changed = false;
        for func in &mut module.functions {
            changed |= inline_in_function(func, ctx);
        }
        Ok(PassOutcome::from_changed(changed))
    }
}

fn inline_in_function(func: &mut FunctionBody, ctx: &PipelineCtx<'_>) -> bool {
    let Ok(stacks) = analyze_evidence_stacks(func, &[]) else {
        return false;
    };

    // Collect candidate sites first; splicing invalidates the analysis.
    let mut candidates: Vec<(BasicBlockId, HandlerId, u32)> = Vec::new();
    for block in func.block_ids() {
        let Some(terminator) = func.block(block).terminator.as_ref() else {
            continue;
        };
        let TerminatorKind::Perform {
            effect,
            op_index,
            class: OperationClass::TailResumptive,
            ..
        } = &terminator.kind
        else {
            continue;
        };

        let in_force = stacks.at_terminator(func, block);
        let handler = match EvidenceStacks::handler_in_force(&in_force, *effect) {
            Some(AbstractHandler::Constant(h)) => h,
            _ => match func.evidence.binding_for(*effect) {
                Some(h) => h,
                None => continue,
            },
        };
        if ctx.registry.handler_is_recursive(handler) {
            continue;
        }
        let Some(op) = ctx.registry.handler_op(handler, *op_index) else {
            continue;
        };
        if !is_spliceable(&op.body) || body_size(&op.body) > ctx.config.inline_threshold {
            continue;
        }
        candidates.push((block, handler, *op_index));
    }

    let mut changed = false;
    for (block, handler, op_index) in candidates {
        // Re-read the site; earlier splices in this function do not touch
        // existing Perform terminators, but be defensive about shape.
        let Some(terminator) = func.block(block).terminator.as_ref() else {
            continue;
        };
        let TerminatorKind::Perform {
            args,
            destination,
            target,
            ..
        } = &terminator.kind
        else {
            continue;
        };
        let (args, destination, target) = (args.clone(), *destination, *target);
        let Some(op) = ctx.registry.handler_op(handler, op_index) else {
            continue;
        };
        let body = op.body.clone();
        splice(func, block, &body, &args, destination, target);
        changed = true;
    }
    changed
}

/// Whether a body is simple enough to splice: every reachable terminator
/// is a `Goto`, `SwitchInt`, or tail `Resume`.
fn is_spliceable(body: &FunctionBody) -> bool {
    let reachable = body.reachable_blocks();
    let mut saw_resume = false;
    for block in body.block_ids() {
        if !reachable.contains(&block) {
            continue;
        }
        match body.block(block).terminator.as_ref().map(|t| &t.kind) {
            Some(TerminatorKind::Goto { .. }) | Some(TerminatorKind::SwitchInt { .. }) => {}
            Some(TerminatorKind::Resume { .. }) => saw_resume = true,
            _ => return false,
        }
    }
    saw_resume
}

/// Instruction count of a body: statements plus terminators.
fn body_size(body: &FunctionBody) -> usize {
    body.blocks
        .iter()
        .map(|b| b.statements.len() + usize::from(b.terminator.is_some()))
        .sum()
}

/// Splice `body` over the `Perform` terminator of `site`.
///
/// The operation body's blocks are appended with renumbered ids, its
/// locals appended with renumbered ids, parameters bound by prologue
/// assignments, and every tail `Resume { value }` rewritten to store
/// `value` into the performer's destination and jump to its target.
fn splice(
    func: &mut FunctionBody,
    site: BasicBlockId,
    body: &FunctionBody,
    args: &[Operand],
    destination: Place,
    target: BasicBlockId,
) {
    let local_offset = func.locals.len() as u32;
    let block_offset = func.blocks.len() as u32;

    for local in &body.locals {
        func.locals.push(local.clone());
    }

    for block in &body.blocks {
        let mut new_block = BasicBlockData::new();
        for stmt in &block.statements {
            new_block
                .statements
                .push(remap_statement(stmt, local_offset));
        }
        if let Some(terminator) = &block.terminator {
            match &terminator.kind {
                TerminatorKind::Resume { value } => {
                    if let Some(value) = value {
                        new_block.statements.push(Statement::new(
                            StatementKind::Assign(
                                destination,
                                Rvalue::Use(remap_operand(*value, local_offset)),
                            ),
                            terminator.span,
                        ));
                    }
                    new_block.terminator =
                        Some(Terminator::new(TerminatorKind::Goto { target }, terminator.span));
                }
                other => {
                    new_block.terminator = Some(Terminator::new(
                        remap_terminator(other, local_offset, block_offset),
                        terminator.span,
                    ));
                }
            }
        }
        func.blocks.push(new_block);
    }

    // Rewrite the performing block: bind parameters, jump into the splice.
    let span = func.block(site).terminator().span;
    let prologue: Vec<Statement> = args
        .iter()
        .enumerate()
        .map(|(i, arg)| {
            Statement::new(
                StatementKind::Assign(
                    Place::new(LocalId(local_offset + 1 + i as u32)),
                    Rvalue::Use(*arg),
                ),
                span,
            )
        })
        .collect();
    let site_block = func.block_mut(site);
    site_block.statements.extend(prologue);
    site_block.terminator = Some(Terminator::new(
        TerminatorKind::Goto {
            target: BasicBlockId(block_offset),
        },
        span,
    ));
}

fn remap_operand(op: Operand, local_offset: u32) -> Operand {
    match op {
        Operand::Copy(l) => Operand::Copy(LocalId(l.0 + local_offset)),
        Operand::Move(l) => Operand::Move(LocalId(l.0 + local_offset)),
        Operand::Const(c) => Operand::Const(c),
    }
}

fn remap_rvalue(rvalue: &Rvalue, local_offset: u32) -> Rvalue {
    match rvalue {
        Rvalue::Use(op) => Rvalue::Use(remap_operand(*op, local_offset)),
        Rvalue::BinaryOp { op, lhs, rhs } => Rvalue::BinaryOp {
            op: *op,
            lhs: remap_operand(*lhs, local_offset),
            rhs: remap_operand(*rhs, local_offset),
        },
    }
}

fn remap_statement(stmt: &Statement, local_offset: u32) -> Statement {
    let kind = match &stmt.kind {
        StatementKind::Assign(place, rvalue) => StatementKind::Assign(
            Place::new(LocalId(place.local.0 + local_offset)),
            remap_rvalue(rvalue, local_offset),
        ),
        other => other.clone(),
    };
    Statement::new(kind, stmt.span)
}

fn remap_terminator(
    kind: &TerminatorKind,
    local_offset: u32,
    block_offset: u32,
) -> TerminatorKind {
    match kind {
        TerminatorKind::Goto { target } => TerminatorKind::Goto {
            target: BasicBlockId(target.0 + block_offset),
        },
        TerminatorKind::SwitchInt { discr, targets } => TerminatorKind::SwitchInt {
            discr: remap_operand(*discr, local_offset),
            targets: SwitchTargets {
                values: targets
                    .values
                    .iter()
                    .map(|(v, t)| (*v, BasicBlockId(t.0 + block_offset)))
                    .collect(),
                otherwise: BasicBlockId(targets.otherwise.0 + block_offset),
            },
        },
        // is_spliceable admits only Goto, SwitchInt, and Resume; Resume is
        // handled at the call site.
        other => other.clone(),
    }
}
