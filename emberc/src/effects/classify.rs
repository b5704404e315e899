//! # Operation Classification
//!
//! Statically determines, per handler operation, whether it is
//! *tail-resumptive* (each execution resumes at most once, in tail
//! position, with nothing running afterwards in the handler) or *general*
//! (may resume non-tail, or repeatedly). Operations crossing a declared
//! FFI barrier are `FfiBoundary` regardless of shape.
//!
//! Classification is **total and deterministic**: there is no error path.
//! Anything that cannot be proven tail-resumptive is conservatively
//! `General`, which is always safe to execute through the continuation
//! runtime.
//!
//! ## Tail position in CFG form
//!
//! Handler-operation bodies encode a tail resume as the terminal
//! [`TerminatorKind::Resume`] and a non-tail resume as
//! [`TerminatorKind::ResumeCall`]. A `Resume` terminator never returns to
//! the handler, so every execution path resumes at most once as long as no
//! `ResumeCall` is reachable; several `Resume` blocks on mutually
//! exclusive paths (both arms of a branch) still classify as
//! tail-resumptive. A body with no reachable resume at all (an
//! exception-like abort) trivially satisfies "at most one, in tail
//! position" and is tail-resumptive too.
//!
//! [`TerminatorKind::Resume`]: crate::ir::types::TerminatorKind::Resume
//! [`TerminatorKind::ResumeCall`]: crate::ir::types::TerminatorKind::ResumeCall

use rustc_hash::FxHashSet;
use serde::Serialize;

use crate::diagnostics::{ClassificationReport, SiteReport};
use crate::effects::decl::{EffectRegistry, HandlerId, OperationSig};
use crate::effects::evidence::{analyze_evidence_stacks, AbstractHandler, EvidenceStacks};
use crate::ir::types::{BasicBlockId, Callee, TerminatorKind};
use crate::ir::FunctionBody;

/// Classification attached to each effect-operation call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OperationClass {
    /// Resumes at most once, in tail position: lowers to a direct call.
    TailResumptive,
    /// May resume zero, multiple, or non-tail times: needs the
    /// continuation runtime.
    General,
    /// Crosses a declared FFI barrier: lowers to a barrier request.
    FfiBoundary,
}

impl OperationClass {
    /// Stable string form used in structured reports.
    pub fn as_str(self) -> &'static str {
        match self {
            OperationClass::TailResumptive => "tail-resumptive",
            OperationClass::General => "general",
            OperationClass::FfiBoundary => "ffi-boundary",
        }
    }

    /// Whether sites of this class may suspend the caller.
    pub fn may_suspend(self) -> bool {
        matches!(self, OperationClass::General)
    }
}

/// The resume shape of one handler-operation body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeShape {
    /// Reachable tail (`Resume`) terminators.
    pub tail_resumes: usize,
    /// Reachable non-tail (`ResumeCall`) terminators.
    pub nontail_resumes: usize,
    /// Whether some execution can resume more than once: a resume is
    /// reachable from a `ResumeCall`'s continuation.
    pub repeated: bool,
}

impl ResumeShape {
    /// Whether this shape qualifies as tail-resumptive.
    pub fn is_tail_resumptive(&self) -> bool {
        self.nontail_resumes == 0
    }
}

/// Compute the resume shape of a handler-operation body.
pub fn resume_shape(body: &FunctionBody) -> ResumeShape {
    let reachable = body.reachable_blocks();
    let mut tail_resumes = 0;
    let mut nontail_resumes = 0;
    let mut resume_call_targets: Vec<BasicBlockId> = Vec::new();

    for &block in &reachable {
        match body.block(block).terminator.as_ref().map(|t| &t.kind) {
            Some(TerminatorKind::Resume { .. }) => tail_resumes += 1,
            Some(TerminatorKind::ResumeCall { target, .. }) => {
                nontail_resumes += 1;
                resume_call_targets.push(*target);
            }
            _ => {}
        }
    }

    // A repeated resume exists if any resume terminator is reachable from
    // the continuation of a ResumeCall.
    let mut repeated = false;
    'outer: for target in resume_call_targets {
        let mut seen: FxHashSet<BasicBlockId> = FxHashSet::default();
        let mut stack = vec![target];
        while let Some(block) = stack.pop() {
            if !seen.insert(block) {
                continue;
            }
            match body.block(block).terminator.as_ref().map(|t| &t.kind) {
                Some(TerminatorKind::Resume { .. })
                | Some(TerminatorKind::ResumeCall { .. }) => {
                    repeated = true;
                    break 'outer;
                }
                _ => {}
            }
            stack.extend(body.block(block).successors());
        }
    }

    ResumeShape {
        tail_resumes,
        nontail_resumes,
        repeated,
    }
}

/// Classify one handler operation given its signature and body.
pub fn classify_handler_op(sig: &OperationSig, body: &FunctionBody) -> OperationClass {
    if sig.ffi_barrier {
        return OperationClass::FfiBoundary;
    }
    if resume_shape(body).is_tail_resumptive() {
        OperationClass::TailResumptive
    } else {
        OperationClass::General
    }
}

/// Whether a handler may capture a continuation: true if any of its
/// operations classifies `General`. Unknown handlers are assumed capable.
pub fn handler_may_capture(registry: &EffectRegistry, handler: HandlerId) -> bool {
    let Some(decl) = registry.handler(handler) else {
        return true;
    };
    decl.ops.iter().any(|op| {
        match registry.operation(decl.effect, op.op_index) {
            Some(sig) => classify_handler_op(sig, &op.body) == OperationClass::General,
            None => true,
        }
    })
}

/// Refine the classification of every `Perform` site in a function.
///
/// The handler proven to be in force at each site (innermost local
/// install, else the layout's cross-function binding) is re-classified
/// from its actual operation body, so a handler substituted by evidence
/// propagation is always re-validated. Returns the number of sites whose
/// classification changed.
pub fn classify_function_sites(func: &mut FunctionBody, registry: &EffectRegistry) -> usize {
    let stacks = match analyze_evidence_stacks(func, &[]) {
        Ok(stacks) => stacks,
        // Unbalanced scopes are a validation error reported elsewhere;
        // classification stays total by leaving sites conservative.
        Err(_) => return 0,
    };

    let mut updates: Vec<(BasicBlockId, OperationClass)> = Vec::new();
    for block in func.block_ids() {
        let Some(terminator) = func.block(block).terminator.as_ref() else {
            continue;
        };
        let TerminatorKind::Perform {
            effect,
            op_index,
            class,
            ..
        } = &terminator.kind
        else {
            continue;
        };

        let new_class = match registry.operation(*effect, *op_index) {
            Some(sig) if sig.ffi_barrier => OperationClass::FfiBoundary,
            Some(sig) => {
                let in_force = stacks.at_terminator(func, block);
                let handler = match EvidenceStacks::handler_in_force(&in_force, *effect) {
                    Some(AbstractHandler::Constant(h)) => Some(h),
                    Some(AbstractHandler::Partial) => None,
                    None => func.evidence.binding_for(*effect),
                };
                match handler.and_then(|h| registry.handler_op(h, *op_index)) {
                    Some(op) => classify_handler_op(sig, &op.body),
                    None => OperationClass::General,
                }
            }
            // Unknown operation: conservative, the validator reports it.
            None => OperationClass::General,
        };

        if new_class != *class {
            updates.push((block, new_class));
        }
    }

    let changed = updates.len();
    for (block, new_class) in updates {
        if let Some(terminator) = func.block_mut(block).terminator.as_mut() {
            if let TerminatorKind::Perform { class, .. } = &mut terminator.kind {
                *class = new_class;
            }
        }
    }
    changed
}

/// Build the structured classification report for a function.
///
/// Covers every remaining operation site: live `Perform`s, converted
/// tail-resumptive sites (now `Call`s through evidence), and foreign
/// barrier crossings.
pub fn build_report(func: &FunctionBody) -> ClassificationReport {
    let mut sites = Vec::new();
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
            } => sites.push(SiteReport {
                span: terminator.span,
                effect: effect.0,
                op_index: *op_index,
                class: class.as_str(),
            }),
            TerminatorKind::Call {
                callee: Callee::Evidence { slot, op_index },
                ..
            } => {
                let effect = func.evidence.effect_for_slot(*slot).map(|e| e.0).unwrap_or(0);
                sites.push(SiteReport {
                    span: terminator.span,
                    effect,
                    op_index: *op_index,
                    class: OperationClass::TailResumptive.as_str(),
                });
            }
            TerminatorKind::ForeignCall { .. } => sites.push(SiteReport {
                span: terminator.span,
                effect: u32::MAX,
                op_index: 0,
                class: OperationClass::FfiBoundary.as_str(),
            }),
            _ => {}
        }
    }
    ClassificationReport {
        function: func.name.clone(),
        sites,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::decl::{
        EffectDecl, EffectId, HandlerDecl, HandlerOp, OperationSig, ResumeStrategy,
    };
    use crate::ir::types::{
        ConstValue, LocalId, Operand, Place, SwitchTargets, Terminator, Ty,
    };
    use crate::span::Span;

    fn term(kind: TerminatorKind) -> Terminator {
        Terminator::new(kind, Span::dummy())
    }

    fn single_tail_resume() -> FunctionBody {
        let mut body = FunctionBody::new("op", Ty::Int);
        let bb0 = body.new_block();
        body.terminate(bb0, term(TerminatorKind::Resume { value: None }));
        body
    }

    fn branching_tail_resume() -> FunctionBody {
        // Both arms of a branch tail-resume: still at most one dynamic resume.
        let mut body = FunctionBody::new("op", Ty::Int);
        let bb0 = body.new_block();
        let bb1 = body.new_block();
        let bb2 = body.new_block();
        body.terminate(
            bb0,
            term(TerminatorKind::SwitchInt {
                discr: Operand::Const(ConstValue::Int(0)),
                targets: SwitchTargets {
                    values: vec![(0, bb1)],
                    otherwise: bb2,
                },
            }),
        );
        body.terminate(
            bb1,
            term(TerminatorKind::Resume {
                value: Some(Operand::Const(ConstValue::Int(1))),
            }),
        );
        body.terminate(
            bb2,
            term(TerminatorKind::Resume {
                value: Some(Operand::Const(ConstValue::Int(2))),
            }),
        );
        body
    }

    fn nontail_resume() -> FunctionBody {
        let mut body = FunctionBody::new("op", Ty::Int);
        let bb0 = body.new_block();
        let bb1 = body.new_block();
        body.terminate(
            bb0,
            term(TerminatorKind::ResumeCall {
                value: None,
                destination: Place::new(LocalId(0)),
                target: bb1,
            }),
        );
        body.terminate(bb1, term(TerminatorKind::Return));
        body
    }

    fn abort_op() -> FunctionBody {
        let mut body = FunctionBody::new("op", Ty::Int);
        let bb0 = body.new_block();
        body.terminate(bb0, term(TerminatorKind::Return));
        body
    }

    #[test]
    fn test_single_tail_resume_shape() {
        let shape = resume_shape(&single_tail_resume());
        assert_eq!(shape.tail_resumes, 1);
        assert_eq!(shape.nontail_resumes, 0);
        assert!(!shape.repeated);
        assert!(shape.is_tail_resumptive());
    }

    #[test]
    fn test_branching_tail_resume_is_tail_resumptive() {
        let shape = resume_shape(&branching_tail_resume());
        assert_eq!(shape.tail_resumes, 2);
        assert!(shape.is_tail_resumptive());
    }

    #[test]
    fn test_zero_resume_is_tail_resumptive() {
        let shape = resume_shape(&abort_op());
        assert_eq!(shape.tail_resumes, 0);
        assert!(shape.is_tail_resumptive());
    }

    #[test]
    fn test_nontail_resume_is_general() {
        let shape = resume_shape(&nontail_resume());
        assert_eq!(shape.nontail_resumes, 1);
        assert!(!shape.is_tail_resumptive());
        assert!(!shape.repeated);
    }

    #[test]
    fn test_repeated_resume_detected() {
        // ResumeCall whose continuation tail-resumes: two dynamic resumes.
        let mut body = FunctionBody::new("op", Ty::Int);
        let bb0 = body.new_block();
        let bb1 = body.new_block();
        body.terminate(
            bb0,
            term(TerminatorKind::ResumeCall {
                value: None,
                destination: Place::new(LocalId(0)),
                target: bb1,
            }),
        );
        body.terminate(bb1, term(TerminatorKind::Resume { value: None }));

        let shape = resume_shape(&body);
        assert!(shape.repeated);
        assert!(!shape.is_tail_resumptive());
    }

    #[test]
    fn test_unreachable_resume_ignored() {
        let mut body = FunctionBody::new("op", Ty::Int);
        let bb0 = body.new_block();
        let orphan = body.new_block();
        body.terminate(bb0, term(TerminatorKind::Resume { value: None }));
        body.terminate(
            orphan,
            term(TerminatorKind::ResumeCall {
                value: None,
                destination: Place::new(LocalId(0)),
                target: bb0,
            }),
        );
        let shape = resume_shape(&body);
        assert_eq!(shape.nontail_resumes, 0);
        assert!(shape.is_tail_resumptive());
    }

    #[test]
    fn test_ffi_barrier_overrides_shape() {
        let sig = OperationSig::observable("read", vec![], Ty::Int).with_ffi_barrier();
        assert_eq!(
            classify_handler_op(&sig, &single_tail_resume()),
            OperationClass::FfiBoundary
        );
    }

    #[test]
    fn test_classify_sites_through_local_install() {
        use crate::ir::types::{HandlerInstall, Statement, StatementKind};
        use crate::effects::evidence::EvidenceSlot;

        let mut registry = EffectRegistry::new();
        registry
            .register_effect(EffectDecl::new(
                EffectId(0),
                "State",
                vec![OperationSig::informational("get", vec![], Ty::Int)],
            ))
            .unwrap();
        registry
            .register_handler(HandlerDecl {
                id: crate::effects::decl::HandlerId(0),
                name: "cell".to_string(),
                effect: EffectId(0),
                resume_strategy: ResumeStrategy::Single,
                ops: vec![HandlerOp {
                    op_index: 0,
                    body: single_tail_resume(),
                }],
            })
            .unwrap();

        let mut func = FunctionBody::new("user", Ty::Int);
        func.evidence.assign_static(EffectId(0), None);
        let dest = func.new_local(crate::ir::types::Local::new(Ty::Int));
        let bb0 = func.new_block();
        let bb1 = func.new_block();
        func.push_statement(
            bb0,
            Statement::new(
                StatementKind::InstallHandler(HandlerInstall {
                    effect: EffectId(0),
                    handler: crate::effects::decl::HandlerId(0),
                    slot: EvidenceSlot::Static { offset: 0 },
                }),
                Span::dummy(),
            ),
        );
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

        let changed = classify_function_sites(&mut func, &registry);
        assert_eq!(changed, 1);
        match &func.block(bb0).terminator().kind {
            TerminatorKind::Perform { class, .. } => {
                assert_eq!(*class, OperationClass::TailResumptive);
            }
            other => panic!("expected Perform, got {other:?}"),
        }

        // Second run: no further change.
        assert_eq!(classify_function_sites(&mut func, &registry), 0);
    }

    #[test]
    fn test_classify_sites_without_binding_stays_general() {
        let mut registry = EffectRegistry::new();
        registry
            .register_effect(EffectDecl::new(
                EffectId(0),
                "State",
                vec![OperationSig::informational("get", vec![], Ty::Int)],
            ))
            .unwrap();

        let mut func = FunctionBody::new("user", Ty::Int);
        func.evidence.assign_dynamic(EffectId(0));
        let dest = func.new_local(crate::ir::types::Local::new(Ty::Int));
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

        assert_eq!(classify_function_sites(&mut func, &registry), 0);
        match &func.block(bb0).terminator().kind {
            TerminatorKind::Perform { class, .. } => {
                assert_eq!(*class, OperationClass::General);
            }
            other => panic!("expected Perform, got {other:?}"),
        }
    }

    #[test]
    fn test_report_covers_sites() {
        let mut func = FunctionBody::new("user", Ty::Int);
        let bb0 = func.new_block();
        let bb1 = func.new_block();
        func.terminate(
            bb0,
            term(TerminatorKind::Perform {
                effect: EffectId(3),
                op_index: 1,
                args: vec![],
                destination: Place::new(LocalId(0)),
                target: bb1,
                class: OperationClass::General,
            }),
        );
        func.terminate(bb1, term(TerminatorKind::Return));

        let report = build_report(&func);
        assert_eq!(report.function, "user");
        assert_eq!(report.sites.len(), 1);
        assert_eq!(report.sites[0].class, "general");
        assert_eq!(report.sites[0].effect, 3);
    }
}
