//! # Evidence Fusion and Floating
//!
//! Reduces the number of evidence-vector mutations per call path:
//!
//! - **Fusion**: a run of adjacent install statements becomes one
//!   multi-install, so the runtime touches the vector once per scope
//!   rather than once per handler.
//! - **Floating**: when every arm of a branch begins by installing the
//!   same handler, the install hoists to the branch point — the earliest
//!   dominating point where it remains correct. Hoisting is restricted to
//!   branch terminators that cannot perform effects, and to static slots;
//!   floating across a dynamic-slot boundary is unsafe until a
//!   boundary-respecting analysis exists, so those installs stay put.

use crate::ir::types::{HandlerInstall, Statement, StatementKind, TerminatorKind};
use crate::ir::{FunctionBody, Module};
use crate::opt::{Pass, PassOutcome, PipelineCtx, PipelineError};

/// The evidence fusion/float pass (pass 6).
pub struct FuseEvidence;

impl Pass for FuseEvidence {
    fn name(&self) -> &'static str {
        "fuse-evidence"
    }

    fn run(
        &mut self,
        module: &mut Module,
        _ctx: &mut PipelineCtx<'_>,
    ) -> Result<PassOutcome, PipelineError> {
        let mut changed = false;
        for func in &mut module.functions {
            // Float first so hoisted installs can fuse with their new
            // neighbors in the same run.
            while float_common_installs(func) {
                changed = true;
            }
            changed |= fuse_adjacent_installs(func);
        }
        Ok(PassOutcome::from_changed(changed))
    }
}

/// Merge maximal runs of two or more adjacent install statements into a
/// single multi-install. A run of one statement is kept verbatim, so the
/// pass reaches a fixpoint after one application.
fn fuse_adjacent_installs(func: &mut FunctionBody) -> bool {
    let mut changed = false;
    for block in &mut func.blocks {
        let mut fused: Vec<Statement> = Vec::with_capacity(block.statements.len());
        let mut run: Vec<Statement> = Vec::new();

        for stmt in block.statements.drain(..) {
            if matches!(
                stmt.kind,
                StatementKind::InstallHandler(_) | StatementKind::InstallHandlerGroup(_)
            ) {
                run.push(stmt);
            } else {
                flush_run(&mut fused, &mut run, &mut changed);
                fused.push(stmt);
            }
        }
        flush_run(&mut fused, &mut run, &mut changed);
        block.statements = fused;
    }
    changed
}

fn flush_run(fused: &mut Vec<Statement>, run: &mut Vec<Statement>, changed: &mut bool) {
    match run.len() {
        0 => {}
        1 => fused.push(run.pop().expect("run has one statement")),
        _ => {
            let span = run[0].span;
            let mut installs: Vec<HandlerInstall> = Vec::new();
            for stmt in run.drain(..) {
                match stmt.kind {
                    StatementKind::InstallHandler(install) => installs.push(install),
                    StatementKind::InstallHandlerGroup(group) => installs.extend(group),
                    _ => unreachable!("run holds only install statements"),
                }
            }
            fused.push(Statement::new(
                StatementKind::InstallHandlerGroup(installs),
                span,
            ));
            *changed = true;
        }
    }
}

/// Hoist an install that begins every arm of a branch up to the branch
/// point. Returns whether anything moved.
fn float_common_installs(func: &mut FunctionBody) -> bool {
    let preds = func.predecessors();
    let mut changed = false;

    for block in func.block_ids() {
        let Some(terminator) = func.block(block).terminator.as_ref() else {
            continue;
        };
        // Only branch terminators that cannot perform effects are safe
        // hoist points: the install must not change what is in force at
        // the hoisting block's own terminator.
        if !matches!(terminator.kind, TerminatorKind::SwitchInt { .. }) {
            continue;
        }
        let successors: Vec<_> = func.block(block).successors();
        if successors.len() < 2 {
            continue;
        }

        // Every successor must be exclusively ours and begin with the
        // same static-slot install.
        let mut common: Option<HandlerInstall> = None;
        let mut hoistable = true;
        for &succ in &successors {
            if succ == block || preds.get(&succ).map(|p| p.as_slice()) != Some(&[block][..]) {
                hoistable = false;
                break;
            }
            match func.block(succ).statements.first().map(|s| &s.kind) {
                Some(StatementKind::InstallHandler(install)) if install.slot.is_static() => {
                    match common {
                        None => common = Some(*install),
                        Some(existing) if existing == *install => {}
                        Some(_) => {
                            hoistable = false;
                            break;
                        }
                    }
                }
                _ => {
                    hoistable = false;
                    break;
                }
            }
        }
        let Some(install) = common else {
            continue;
        };
        if !hoistable {
            continue;
        }

        let span = func.block(successors[0]).statements[0].span;
        for &succ in &successors {
            func.block_mut(succ).statements.remove(0);
        }
        func.block_mut(block)
            .statements
            .push(Statement::new(StatementKind::InstallHandler(install), span));
        changed = true;
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::decl::{EffectId, EffectRegistry, HandlerId};
    use crate::effects::evidence::EvidenceSlot;
    use crate::ir::types::{
        ConstValue, Operand, SwitchTargets, Terminator, Ty,
    };
    use crate::opt::OptConfig;
    use crate::span::Span;

    fn term(kind: TerminatorKind) -> Terminator {
        Terminator::new(kind, Span::dummy())
    }

    fn install(effect: u32, handler: u32, offset: u32) -> Statement {
        Statement::new(
            StatementKind::InstallHandler(HandlerInstall {
                effect: EffectId(effect),
                handler: HandlerId(handler),
                slot: EvidenceSlot::Static { offset },
            }),
            Span::dummy(),
        )
    }

    fn dynamic_install(effect: u32, handler: u32) -> Statement {
        Statement::new(
            StatementKind::InstallHandler(HandlerInstall {
                effect: EffectId(effect),
                handler: HandlerId(handler),
                slot: EvidenceSlot::Dynamic {
                    key: EffectId(effect),
                },
            }),
            Span::dummy(),
        )
    }

    fn uninstall(count: u32) -> Statement {
        Statement::new(StatementKind::UninstallHandler { count }, Span::dummy())
    }

    #[test]
    fn test_adjacent_installs_fuse() {
        let registry = EffectRegistry::new();
        let mut ctx = PipelineCtx::new(&registry, OptConfig::default());
        let mut func = FunctionBody::new("f", Ty::Unit);
        let bb0 = func.new_block();
        func.push_statement(bb0, install(0, 0, 0));
        func.push_statement(bb0, install(1, 1, 1));
        func.push_statement(bb0, uninstall(2));
        func.terminate(bb0, term(TerminatorKind::Return));
        let mut module = Module::new();
        module.add_function(func);

        let outcome = FuseEvidence.run(&mut module, &mut ctx).unwrap();
        assert!(outcome.is_changed());

        let stmts = &module.functions[0].blocks[0].statements;
        assert_eq!(stmts.len(), 2);
        match &stmts[0].kind {
            StatementKind::InstallHandlerGroup(installs) => {
                assert_eq!(installs.len(), 2);
                assert_eq!(installs[0].effect, EffectId(0));
                assert_eq!(installs[1].effect, EffectId(1));
            }
            other => panic!("expected group, got {other:?}"),
        }

        // Idempotent: the single group does not re-fuse.
        let outcome = FuseEvidence.run(&mut module, &mut ctx).unwrap();
        assert!(!outcome.is_changed());
    }

    #[test]
    fn test_single_install_not_wrapped() {
        let registry = EffectRegistry::new();
        let mut ctx = PipelineCtx::new(&registry, OptConfig::default());
        let mut func = FunctionBody::new("f", Ty::Unit);
        let bb0 = func.new_block();
        func.push_statement(bb0, install(0, 0, 0));
        func.push_statement(bb0, uninstall(1));
        func.terminate(bb0, term(TerminatorKind::Return));
        let mut module = Module::new();
        module.add_function(func);

        let outcome = FuseEvidence.run(&mut module, &mut ctx).unwrap();
        assert!(!outcome.is_changed());
        assert!(matches!(
            module.functions[0].blocks[0].statements[0].kind,
            StatementKind::InstallHandler(_)
        ));
    }

    fn branchy(arm_installs: [Statement; 2]) -> FunctionBody {
        let mut func = FunctionBody::new("f", Ty::Unit);
        let bb0 = func.new_block();
        let bb1 = func.new_block();
        let bb2 = func.new_block();
        let bb3 = func.new_block();
        func.terminate(
            bb0,
            term(TerminatorKind::SwitchInt {
                discr: Operand::Const(ConstValue::Int(0)),
                targets: SwitchTargets {
                    values: vec![(0, bb1)],
                    otherwise: bb2,
                },
            }),
        );
        let [first, second] = arm_installs;
        func.push_statement(bb1, first);
        func.terminate(bb1, term(TerminatorKind::Goto { target: bb3 }));
        func.push_statement(bb2, second);
        func.terminate(bb2, term(TerminatorKind::Goto { target: bb3 }));
        func.push_statement(bb3, uninstall(1));
        func.terminate(bb3, term(TerminatorKind::Return));
        func
    }

    #[test]
    fn test_common_install_floats_to_branch_point() {
        let registry = EffectRegistry::new();
        let mut ctx = PipelineCtx::new(&registry, OptConfig::default());
        let mut module = Module::new();
        module.add_function(branchy([install(0, 0, 0), install(0, 0, 0)]));

        let outcome = FuseEvidence.run(&mut module, &mut ctx).unwrap();
        assert!(outcome.is_changed());

        let func = &module.functions[0];
        assert_eq!(func.blocks[0].statements.len(), 1);
        assert!(matches!(
            func.blocks[0].statements[0].kind,
            StatementKind::InstallHandler(_)
        ));
        assert!(func.blocks[1].statements.is_empty());
        assert!(func.blocks[2].statements.is_empty());

        // Idempotent.
        let outcome = FuseEvidence.run(&mut module, &mut ctx).unwrap();
        assert!(!outcome.is_changed());
    }

    #[test]
    fn test_differing_installs_do_not_float() {
        let registry = EffectRegistry::new();
        let mut ctx = PipelineCtx::new(&registry, OptConfig::default());
        let mut module = Module::new();
        module.add_function(branchy([install(0, 0, 0), install(0, 1, 0)]));

        let outcome = FuseEvidence.run(&mut module, &mut ctx).unwrap();
        assert!(!outcome.is_changed());
        assert_eq!(module.functions[0].blocks[1].statements.len(), 1);
    }

    #[test]
    fn test_dynamic_slot_never_floats() {
        let registry = EffectRegistry::new();
        let mut ctx = PipelineCtx::new(&registry, OptConfig::default());
        let mut module = Module::new();
        module.add_function(branchy([dynamic_install(0, 0), dynamic_install(0, 0)]));

        let outcome = FuseEvidence.run(&mut module, &mut ctx).unwrap();
        assert!(!outcome.is_changed());
        assert!(module.functions[0].blocks[0].statements.is_empty());
    }
}
