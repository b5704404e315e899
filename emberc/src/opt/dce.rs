//! # Effect-Aware Dead Code Elimination
//!
//! Removes effect operations and evidence threading in regions proven
//! effect-free:
//!
//! - a `Perform` of an *informational* operation (a pure read) whose
//!   result is never used is dropped; *observable* operations (I/O,
//!   mutation, raising) are never removed, used result or not;
//! - an install/uninstall pair confined to a single block with no
//!   terminator executed in between cannot service any operation and is
//!   dropped.
//!
//! The pass iterates to its own fixpoint so a removal that makes another
//! site dead is handled in the same run.

use rustc_hash::FxHashSet;

use crate::effects::decl::OperationPurity;
use crate::ir::types::{LocalId, StatementKind, TerminatorKind};
use crate::ir::{FunctionBody, Module};
use crate::opt::{Pass, PassOutcome, PipelineCtx, PipelineError};

/// The effect-aware DCE pass (pass 5).
pub struct EffectDce;

impl Pass for EffectDce {
    fn name(&self) -> &'static str {
        "effect-dce"
    }

    fn run(
        &mut self,
        module: &mut Module,
        ctx: &mut PipelineCtx<'_>,
    ) -> Result<PassOutcome, PipelineError> {
        let mut changed = false;
        for func in &mut module.functions {
            loop {
                let mut iter_changed = remove_unused_informational(func, ctx);
                iter_changed |= remove_dead_scopes(func);
                if !iter_changed {
                    break;
                }
                changed = true;
            }
        }
        Ok(PassOutcome::from_changed(changed))
    }
}

/// Locals read anywhere in the function. Local 0 (the return slot) is
/// always considered read.
fn read_locals(func: &FunctionBody) -> FxHashSet<LocalId> {
    let mut used: FxHashSet<LocalId> = FxHashSet::default();
    used.insert(LocalId(0));
    for block in &func.blocks {
        for stmt in &block.statements {
            if let StatementKind::Assign(_, rvalue) = &stmt.kind {
                used.extend(rvalue.read_locals());
            }
        }
        if let Some(terminator) = &block.terminator {
            used.extend(terminator.kind.read_locals());
        }
    }
    used
}

fn remove_unused_informational(func: &mut FunctionBody, ctx: &PipelineCtx<'_>) -> bool {
    let used = read_locals(func);
    let mut changed = false;
    for block in &mut func.blocks {
        let Some(terminator) = block.terminator.as_ref() else {
            continue;
        };
        let TerminatorKind::Perform {
            effect,
            op_index,
            destination,
            target,
            ..
        } = &terminator.kind
        else {
            continue;
        };
        let Some(sig) = ctx.registry.operation(*effect, *op_index) else {
            continue;
        };
        if sig.purity != OperationPurity::Informational {
            continue;
        }
        if used.contains(&destination.local) {
            continue;
        }
        let target = *target;
        let span = terminator.span;
        block.terminator = Some(crate::ir::types::Terminator::new(
            TerminatorKind::Goto { target },
            span,
        ));
        changed = true;
    }
    changed
}

fn remove_dead_scopes(func: &mut FunctionBody) -> bool {
    let mut changed = false;
    for block in &mut func.blocks {
        // Simulate the evidence stack over the block's statements. Stack
        // entries pushed by a plain install in this same block can be
        // cancelled against a pop in this block: no terminator runs in
        // between, so nothing could have performed through the handler.
        let mut stack: Vec<Option<usize>> = Vec::new();
        let mut remove: FxHashSet<usize> = FxHashSet::default();
        let mut new_counts: Vec<(usize, u32)> = Vec::new();

        for (idx, stmt) in block.statements.iter().enumerate() {
            match &stmt.kind {
                StatementKind::InstallHandler(_) => stack.push(Some(idx)),
                StatementKind::InstallHandlerGroup(installs) => {
                    // Groups are kept whole; their entries cannot be
                    // individually cancelled.
                    for _ in installs {
                        stack.push(None);
                    }
                }
                StatementKind::UninstallHandler { count } => {
                    let mut kept = *count;
                    for _ in 0..*count {
                        match stack.pop() {
                            Some(Some(install_idx)) => {
                                remove.insert(install_idx);
                                kept -= 1;
                            }
                            // Group entry or an install from an outer
                            // block: the pop must survive.
                            Some(None) | None => {}
                        }
                    }
                    if kept != *count {
                        new_counts.push((idx, kept));
                    }
                }
                StatementKind::Assign(..) | StatementKind::Nop => {}
            }
        }

        if remove.is_empty() && new_counts.is_empty() {
            continue;
        }
        changed = true;

        for (idx, kept) in new_counts {
            if kept == 0 {
                remove.insert(idx);
            } else if let StatementKind::UninstallHandler { count } =
                &mut block.statements[idx].kind
            {
                *count = kept;
            }
        }
        let mut idx = 0;
        block.statements.retain(|_| {
            let keep = !remove.contains(&idx);
            idx += 1;
            keep
        });
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::classify::OperationClass;
    use crate::effects::decl::{
        EffectDecl, EffectId, EffectRegistry, HandlerId, OperationSig,
    };
    use crate::effects::evidence::EvidenceSlot;
    use crate::ir::types::{
        HandlerInstall, Local, Operand, Place, Rvalue, Statement, Terminator, Ty,
    };
    use crate::opt::OptConfig;
    use crate::span::Span;

    fn term(kind: TerminatorKind) -> Terminator {
        Terminator::new(kind, Span::dummy())
    }

    fn registry() -> EffectRegistry {
        let mut registry = EffectRegistry::new();
        registry
            .register_effect(EffectDecl::new(
                EffectId(0),
                "State",
                vec![
                    OperationSig::informational("get", vec![], Ty::Int),
                    OperationSig::observable("set", vec![Ty::Int], Ty::Unit),
                ],
            ))
            .unwrap();
        registry
    }

    fn perform_func(op_index: u32, use_result: bool) -> FunctionBody {
        let mut func = FunctionBody::new("f", Ty::Int);
        func.evidence.assign_dynamic(EffectId(0));
        let dest = func.new_local(Local::new(Ty::Int));
        let bb0 = func.new_block();
        let bb1 = func.new_block();
        func.terminate(
            bb0,
            term(TerminatorKind::Perform {
                effect: EffectId(0),
                op_index,
                args: vec![],
                destination: Place::new(dest),
                target: bb1,
                class: OperationClass::General,
            }),
        );
        if use_result {
            func.push_statement(
                bb1,
                Statement::new(
                    StatementKind::Assign(
                        Place::new(crate::ir::types::LocalId(0)),
                        Rvalue::Use(Operand::Copy(dest)),
                    ),
                    Span::dummy(),
                ),
            );
        }
        func.terminate(bb1, term(TerminatorKind::Return));
        func
    }

    #[test]
    fn test_unused_informational_perform_removed() {
        let registry = registry();
        let mut ctx = PipelineCtx::new(&registry, OptConfig::default());
        let mut module = Module::new();
        module.add_function(perform_func(0, false));

        let outcome = EffectDce.run(&mut module, &mut ctx).unwrap();
        assert!(outcome.is_changed());
        assert!(matches!(
            module.functions[0].blocks[0].terminator().kind,
            TerminatorKind::Goto { .. }
        ));

        // Idempotent.
        let outcome = EffectDce.run(&mut module, &mut ctx).unwrap();
        assert!(!outcome.is_changed());
    }

    #[test]
    fn test_used_informational_perform_kept() {
        let registry = registry();
        let mut ctx = PipelineCtx::new(&registry, OptConfig::default());
        let mut module = Module::new();
        module.add_function(perform_func(0, true));

        let outcome = EffectDce.run(&mut module, &mut ctx).unwrap();
        assert!(!outcome.is_changed());
        assert!(matches!(
            module.functions[0].blocks[0].terminator().kind,
            TerminatorKind::Perform { .. }
        ));
    }

    #[test]
    fn test_observable_perform_never_removed() {
        let registry = registry();
        let mut ctx = PipelineCtx::new(&registry, OptConfig::default());
        let mut module = Module::new();
        // `set` result unused, but the operation is observable.
        module.add_function(perform_func(1, false));

        let outcome = EffectDce.run(&mut module, &mut ctx).unwrap();
        assert!(!outcome.is_changed());
        assert!(matches!(
            module.functions[0].blocks[0].terminator().kind,
            TerminatorKind::Perform { .. }
        ));
    }

    #[test]
    fn test_dead_scope_in_single_block_removed() {
        let registry = registry();
        let mut ctx = PipelineCtx::new(&registry, OptConfig::default());
        let mut func = FunctionBody::new("f", Ty::Unit);
        let bb0 = func.new_block();
        func.push_statement(
            bb0,
            Statement::new(
                StatementKind::InstallHandler(HandlerInstall {
                    effect: EffectId(0),
                    handler: HandlerId(0),
                    slot: EvidenceSlot::Static { offset: 0 },
                }),
                Span::dummy(),
            ),
        );
        func.push_statement(
            bb0,
            Statement::new(StatementKind::UninstallHandler { count: 1 }, Span::dummy()),
        );
        func.terminate(bb0, term(TerminatorKind::Return));
        let mut module = Module::new();
        module.add_function(func);

        let outcome = EffectDce.run(&mut module, &mut ctx).unwrap();
        assert!(outcome.is_changed());
        assert!(module.functions[0].blocks[0].statements.is_empty());
    }

    #[test]
    fn test_scope_spanning_blocks_kept() {
        let registry = registry();
        let mut ctx = PipelineCtx::new(&registry, OptConfig::default());
        let mut func = FunctionBody::new("f", Ty::Unit);
        let bb0 = func.new_block();
        let bb1 = func.new_block();
        func.push_statement(
            bb0,
            Statement::new(
                StatementKind::InstallHandler(HandlerInstall {
                    effect: EffectId(0),
                    handler: HandlerId(0),
                    slot: EvidenceSlot::Static { offset: 0 },
                }),
                Span::dummy(),
            ),
        );
        func.terminate(bb0, term(TerminatorKind::Goto { target: bb1 }));
        func.push_statement(
            bb1,
            Statement::new(StatementKind::UninstallHandler { count: 1 }, Span::dummy()),
        );
        func.terminate(bb1, term(TerminatorKind::Return));
        let mut module = Module::new();
        module.add_function(func);

        // The scope spans a terminator; a call or perform could hide in a
        // later rewrite, so the pair survives.
        let outcome = EffectDce.run(&mut module, &mut ctx).unwrap();
        assert!(!outcome.is_changed());
        assert_eq!(module.functions[0].blocks[0].statements.len(), 1);
    }

    #[test]
    fn test_partial_uninstall_count_adjusted() {
        let registry = registry();
        let mut ctx = PipelineCtx::new(&registry, OptConfig::default());
        let mut func = FunctionBody::new("f", Ty::Unit);
        let bb0 = func.new_block();
        let bb1 = func.new_block();
        // Outer install spans blocks; inner install is block-local. The
        // pop of 2 keeps one count for the outer install.
        func.push_statement(
            bb0,
            Statement::new(
                StatementKind::InstallHandler(HandlerInstall {
                    effect: EffectId(0),
                    handler: HandlerId(0),
                    slot: EvidenceSlot::Static { offset: 0 },
                }),
                Span::dummy(),
            ),
        );
        func.terminate(bb0, term(TerminatorKind::Goto { target: bb1 }));
        func.push_statement(
            bb1,
            Statement::new(
                StatementKind::InstallHandler(HandlerInstall {
                    effect: EffectId(0),
                    handler: HandlerId(1),
                    slot: EvidenceSlot::Static { offset: 1 },
                }),
                Span::dummy(),
            ),
        );
        func.push_statement(
            bb1,
            Statement::new(StatementKind::UninstallHandler { count: 2 }, Span::dummy()),
        );
        func.terminate(bb1, term(TerminatorKind::Return));
        let mut module = Module::new();
        module.add_function(func);

        let outcome = EffectDce.run(&mut module, &mut ctx).unwrap();
        assert!(outcome.is_changed());
        let stmts = &module.functions[0].blocks[1].statements;
        assert_eq!(stmts.len(), 1);
        assert!(matches!(
            stmts[0].kind,
            StatementKind::UninstallHandler { count: 1 }
        ));
    }
}
