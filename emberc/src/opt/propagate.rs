//! # Evidence Propagation
//!
//! Forward dataflow over the call graph. Where the evidence reaching a
//! program point is provably a single constant handler set, dynamic
//! evidence slots convert to static ones and the proven handler binding
//! is recorded for downstream passes.
//!
//! Lattice per (function, effect): `Unknown ⊑ Partial ⊑ Constant(h)`.
//! The merge at joins — here, across all call sites of a function — takes
//! the greatest lower bound, so conflicting constants collapse to
//! `Partial` and any uninformed path drags the result to `Unknown`.
//! Exported functions are callable from outside the module; their
//! incoming evidence is pinned at `Unknown` and their slots never
//! promote.
//!
//! Promotion re-validates classification: a site whose handler binding
//! was just proven is re-classified from that handler's actual operation
//! bodies, never assumed.

use rustc_hash::FxHashMap;

use crate::effects::classify::classify_function_sites;
use crate::effects::decl::{EffectId, HandlerId};
use crate::effects::evidence::{analyze_evidence_stacks, AbstractHandler, EvidenceStacks};
use crate::ir::types::{Callee, FuncId, TerminatorKind};
use crate::ir::Module;
use crate::opt::{Pass, PassOutcome, PipelineCtx, PipelineError};

/// The evidence-propagation pass (pass 3).
pub struct PropagateEvidence;

/// Dataflow value for the handler reaching a function for one effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    /// No information on at least one path.
    Unknown,
    /// Conflicting handlers across paths.
    Partial,
    /// The same single handler on every path.
    Constant(HandlerId),
}

impl Flow {
    fn meet(self, other: Flow) -> Flow {
        match (self, other) {
            (Flow::Unknown, _) | (_, Flow::Unknown) => Flow::Unknown,
            (Flow::Partial, _) | (_, Flow::Partial) => Flow::Partial,
            (Flow::Constant(a), Flow::Constant(b)) if a == b => self,
            _ => Flow::Partial,
        }
    }
}

type IncomingMap = FxHashMap<FuncId, FxHashMap<EffectId, Flow>>;

impl Pass for PropagateEvidence {
    fn name(&self) -> &'static str {
        "propagate-evidence"
    }

    fn run(
        &mut self,
        module: &mut Module,
        ctx: &mut PipelineCtx<'_>,
    ) -> Result<PassOutcome, PipelineError> {
        let incoming = solve(module);

        // Apply: promote dynamic slots with a constant incoming handler,
        // then re-validate the classification of affected functions.
        let mut changed = false;
        let func_ids: Vec<FuncId> = module.func_ids().collect();
        for func_id in func_ids {
            if module.is_exported(func_id) {
                continue;
            }
            let effects: Vec<EffectId> = module.func(func_id).effect_set.clone();
            let mut touched = false;
            for effect in effects {
                let flow = incoming
                    .get(&func_id)
                    .and_then(|env| env.get(&effect))
                    .copied()
                    .unwrap_or(Flow::Unknown);
                let Flow::Constant(handler) = flow else {
                    continue;
                };
                let func = module.func_mut(func_id);
                match func.evidence.slot_for(effect) {
                    Some(slot) if slot.is_static() => {
                        if func.evidence.binding_for(effect).is_none() {
                            func.evidence.set_binding(effect, handler);
                            touched = true;
                        }
                    }
                    Some(_) => {
                        if func.evidence.promote(effect, handler).is_some() {
                            touched = true;
                        }
                    }
                    None => {}
                }
            }
            if touched {
                changed = true;
                classify_function_sites(module.func_mut(func_id), ctx.registry);
            }
        }

        Ok(PassOutcome::from_changed(changed))
    }
}

/// Iterate the call-graph dataflow to a fixpoint.
fn solve(module: &Module) -> IncomingMap {
    let mut incoming: IncomingMap = FxHashMap::default();

    // Exported functions are pinned at Unknown for every effect they
    // declare.
    for func_id in module.func_ids() {
        if module.is_exported(func_id) {
            let env = incoming.entry(func_id).or_default();
            for &effect in &module.func(func_id).effect_set {
                env.insert(effect, Flow::Unknown);
            }
        }
    }

    loop {
        let mut next: IncomingMap = incoming.clone();
        // Recompute callee environments from scratch each round; the
        // meet over call sites is order-independent, keeping the result
        // deterministic.
        let mut accumulated: IncomingMap = FxHashMap::default();

        for caller_id in module.func_ids() {
            let caller = module.func(caller_id);
            let Ok(stacks) = analyze_evidence_stacks(caller, &[]) else {
                continue;
            };
            for block in caller.block_ids() {
                let Some(terminator) = caller.block(block).terminator.as_ref() else {
                    continue;
                };
                let TerminatorKind::Call {
                    callee: Callee::Fn(callee_id),
                    ..
                } = &terminator.kind
                else {
                    continue;
                };
                let Some(callee) = module.functions.get(callee_id.0 as usize) else {
                    continue;
                };
                let in_force = stacks.at_terminator(caller, block);
                let callee_env = accumulated.entry(*callee_id).or_default();
                for &effect in &callee.effect_set {
                    let local = EvidenceStacks::handler_in_force(&in_force, effect);
                    let value = match local {
                        Some(AbstractHandler::Constant(h)) => Flow::Constant(h),
                        Some(AbstractHandler::Partial) => Flow::Partial,
                        None => incoming
                            .get(&caller_id)
                            .and_then(|env| env.get(&effect))
                            .copied()
                            .unwrap_or(Flow::Unknown),
                    };
                    callee_env
                        .entry(effect)
                        .and_modify(|existing| *existing = existing.meet(value))
                        .or_insert(value);
                }
            }
        }

        // Merge accumulated call-site facts, keeping exported pins.
        for (callee_id, env) in accumulated {
            if module.is_exported(callee_id) {
                continue;
            }
            let slot = next.entry(callee_id).or_default();
            for (effect, value) in env {
                slot.insert(effect, value);
            }
        }

        if next == incoming {
            return incoming;
        }
        incoming = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::classify::OperationClass;
    use crate::effects::decl::{
        EffectDecl, EffectRegistry, HandlerDecl, HandlerOp, OperationSig, ResumeStrategy,
    };
    use crate::effects::evidence::EvidenceSlot;
    use crate::ir::types::{
        ConstValue, HandlerInstall, Local, Operand, Place, Statement, StatementKind,
        SwitchTargets, Terminator, Ty,
    };
    use crate::ir::FunctionBody;
    use crate::opt::OptConfig;
    use crate::span::Span;

    fn term(kind: TerminatorKind) -> Terminator {
        Terminator::new(kind, Span::dummy())
    }

    fn tail_op() -> FunctionBody {
        let mut body = FunctionBody::new("op", Ty::Int);
        let bb0 = body.new_block();
        body.terminate(bb0, term(TerminatorKind::Resume { value: None }));
        body
    }

    fn registry_with_handlers(n: u32) -> EffectRegistry {
        let mut registry = EffectRegistry::new();
        registry
            .register_effect(EffectDecl::new(
                EffectId(0),
                "Ask",
                vec![OperationSig::informational("ask", vec![], Ty::Int)],
            ))
            .unwrap();
        for id in 0..n {
            registry
                .register_handler(HandlerDecl {
                    id: HandlerId(id),
                    name: format!("h{id}"),
                    effect: EffectId(0),
                    resume_strategy: ResumeStrategy::Single,
                    ops: vec![HandlerOp {
                        op_index: 0,
                        body: tail_op(),
                    }],
                })
                .unwrap();
        }
        registry
    }

    /// A leaf function performing the effect through a dynamic slot.
    fn leaf() -> FunctionBody {
        let mut func = FunctionBody::new("leaf", Ty::Int);
        func.effect_set = vec![EffectId(0)];
        func.evidence.assign_dynamic(EffectId(0));
        let dest = func.new_local(Local::new(Ty::Int));
        let bb0 = func.new_block();
        let bb1 = func.new_block();
        func.terminate(
            bb0,
            term(TerminatorKind::Perform {
                effect: EffectId(0),
                op_index: 0,
                args: vec![],
                destination: Place::new(dest),
                target: bb1,
                class: OperationClass::General,
            }),
        );
        func.terminate(bb1, term(TerminatorKind::Return));
        func
    }

    /// A caller installing `handler` around a call to `callee`.
    fn caller_installing(handler: u32, callee: FuncId) -> FunctionBody {
        let mut func = FunctionBody::new(format!("caller{handler}"), Ty::Int);
        let dest = func.new_local(Local::new(Ty::Int));
        let bb0 = func.new_block();
        let bb1 = func.new_block();
        func.push_statement(
            bb0,
            Statement::new(
                StatementKind::InstallHandler(HandlerInstall {
                    effect: EffectId(0),
                    handler: HandlerId(handler),
                    slot: EvidenceSlot::Static { offset: 0 },
                }),
                Span::dummy(),
            ),
        );
        func.terminate(
            bb0,
            term(TerminatorKind::Call {
                callee: Callee::Fn(callee),
                args: vec![],
                destination: Place::new(dest),
                target: bb1,
            }),
        );
        func.push_statement(
            bb1,
            Statement::new(StatementKind::UninstallHandler { count: 1 }, Span::dummy()),
        );
        func.terminate(bb1, term(TerminatorKind::Return));
        func
    }

    #[test]
    fn test_single_handler_promotes_to_static() {
        let registry = registry_with_handlers(1);
        let mut ctx = PipelineCtx::new(&registry, OptConfig::default());
        let mut module = Module::new();
        let leaf_id = module.add_function(leaf());
        module.add_function(caller_installing(0, leaf_id));

        let outcome = PropagateEvidence.run(&mut module, &mut ctx).unwrap();
        assert!(outcome.is_changed());

        let leaf_fn = module.func(leaf_id);
        assert!(leaf_fn.evidence.slot_for(EffectId(0)).unwrap().is_static());
        assert_eq!(leaf_fn.evidence.binding_for(EffectId(0)), Some(HandlerId(0)));

        // Re-classified against the proven handler: tail-resumptive now.
        match &leaf_fn.blocks[0].terminator().kind {
            TerminatorKind::Perform { class, .. } => {
                assert_eq!(*class, OperationClass::TailResumptive);
            }
            other => panic!("expected Perform, got {other:?}"),
        }

        // Idempotent.
        let outcome = PropagateEvidence.run(&mut module, &mut ctx).unwrap();
        assert!(!outcome.is_changed());
    }

    #[test]
    fn test_conflicting_handlers_stay_dynamic() {
        let registry = registry_with_handlers(2);
        let mut ctx = PipelineCtx::new(&registry, OptConfig::default());
        let mut module = Module::new();
        let leaf_id = module.add_function(leaf());
        module.add_function(caller_installing(0, leaf_id));
        module.add_function(caller_installing(1, leaf_id));

        let outcome = PropagateEvidence.run(&mut module, &mut ctx).unwrap();
        assert!(!outcome.is_changed());
        assert!(!module
            .func(leaf_id)
            .evidence
            .slot_for(EffectId(0))
            .unwrap()
            .is_static());
    }

    #[test]
    fn test_exported_function_never_promotes() {
        let registry = registry_with_handlers(1);
        let mut ctx = PipelineCtx::new(&registry, OptConfig::default());
        let mut module = Module::new();
        let leaf_id = module.add_function(leaf());
        module.add_function(caller_installing(0, leaf_id));
        module.exported.push(leaf_id);

        let outcome = PropagateEvidence.run(&mut module, &mut ctx).unwrap();
        assert!(!outcome.is_changed());
        assert!(!module
            .func(leaf_id)
            .evidence
            .slot_for(EffectId(0))
            .unwrap()
            .is_static());
    }

    #[test]
    fn test_transitive_propagation() {
        // caller -> middle -> leaf; the handler installed at the top
        // reaches the leaf two hops down.
        let registry = registry_with_handlers(1);
        let mut ctx = PipelineCtx::new(&registry, OptConfig::default());
        let mut module = Module::new();
        let leaf_id = module.add_function(leaf());

        let mut middle = FunctionBody::new("middle", Ty::Int);
        middle.effect_set = vec![EffectId(0)];
        middle.evidence.assign_dynamic(EffectId(0));
        let dest = middle.new_local(Local::new(Ty::Int));
        let bb0 = middle.new_block();
        let bb1 = middle.new_block();
        middle.terminate(
            bb0,
            term(TerminatorKind::Call {
                callee: Callee::Fn(leaf_id),
                args: vec![],
                destination: Place::new(dest),
                target: bb1,
            }),
        );
        middle.terminate(bb1, term(TerminatorKind::Return));
        let middle_id = module.add_function(middle);
        module.add_function(caller_installing(0, middle_id));

        let outcome = PropagateEvidence.run(&mut module, &mut ctx).unwrap();
        assert!(outcome.is_changed());
        assert!(module
            .func(leaf_id)
            .evidence
            .slot_for(EffectId(0))
            .unwrap()
            .is_static());
        assert!(module
            .func(middle_id)
            .evidence
            .slot_for(EffectId(0))
            .unwrap()
            .is_static());
    }

    #[test]
    fn test_branch_dependent_install_collapses_to_partial() {
        // One function installs h0 or h1 depending on a branch, then
        // calls the leaf at the join: Partial, no promotion.
        let registry = registry_with_handlers(2);
        let mut ctx = PipelineCtx::new(&registry, OptConfig::default());
        let mut module = Module::new();
        let leaf_id = module.add_function(leaf());

        let mut func = FunctionBody::new("branchy", Ty::Int);
        let dest = func.new_local(Local::new(Ty::Int));
        let bb0 = func.new_block();
        let bb1 = func.new_block();
        let bb2 = func.new_block();
        let bb3 = func.new_block();
        let bb4 = func.new_block();
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
        for (bb, handler) in [(bb1, 0u32), (bb2, 1u32)] {
            func.push_statement(
                bb,
                Statement::new(
                    StatementKind::InstallHandler(HandlerInstall {
                        effect: EffectId(0),
                        handler: HandlerId(handler),
                        slot: EvidenceSlot::Static { offset: 0 },
                    }),
                    Span::dummy(),
                ),
            );
            func.terminate(bb, term(TerminatorKind::Goto { target: bb3 }));
        }
        func.terminate(
            bb3,
            term(TerminatorKind::Call {
                callee: Callee::Fn(leaf_id),
                args: vec![],
                destination: Place::new(dest),
                target: bb4,
            }),
        );
        func.push_statement(
            bb4,
            Statement::new(StatementKind::UninstallHandler { count: 1 }, Span::dummy()),
        );
        func.terminate(bb4, term(TerminatorKind::Return));
        module.add_function(func);

        let outcome = PropagateEvidence.run(&mut module, &mut ctx).unwrap();
        assert!(!outcome.is_changed());
        assert!(!module
            .func(leaf_id)
            .evidence
            .slot_for(EffectId(0))
            .unwrap()
            .is_static());
    }
}
