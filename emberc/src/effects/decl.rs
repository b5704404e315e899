//! # Effect and Handler Declarations
//!
//! The declaration side of the effects system: named effects with their
//! operation signatures, handlers supplying an implementation per
//! operation, and the registry both are looked up through.
//!
//! Handler operation bodies are ordinary [`FunctionBody`] IR. That keeps
//! the classifier a plain CFG analysis and lets handler inlining splice
//! operation bodies without a translation step.

use std::fmt;

use indexmap::IndexMap;
use rustc_hash::FxHashSet;
use serde::Serialize;
use thiserror::Error;

use crate::effects::classify::{resume_shape, ResumeShape};
use crate::ir::types::{Callee, TerminatorKind, Ty};
use crate::ir::FunctionBody;

// ============================================================================
// Identifiers
// ============================================================================

/// A unique identifier for an effect declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EffectId(pub u32);

impl fmt::Display for EffectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "effect{}", self.0)
    }
}

/// A unique identifier for a handler declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct HandlerId(pub u32);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler{}", self.0)
    }
}

// ============================================================================
// Effects
// ============================================================================

/// Whether removing an unused operation changes observable behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OperationPurity {
    /// I/O, mutation, raising: never removed even if the result is unused.
    Observable,
    /// A pure read (state get, reader ask): removable when unused.
    Informational,
}

/// Signature of one effect operation.
#[derive(Debug, Clone, Serialize)]
pub struct OperationSig {
    /// Operation name.
    pub name: String,
    /// Parameter types.
    pub params: Vec<Ty>,
    /// Result type.
    pub result: Ty,
    /// Dead-code-elimination classification.
    pub purity: OperationPurity,
    /// Whether invoking this operation crosses a declared FFI barrier.
    /// Such operations classify as `FfiBoundary` regardless of resume
    /// shape.
    pub ffi_barrier: bool,
}

impl OperationSig {
    /// An observable operation with the given signature.
    pub fn observable(name: impl Into<String>, params: Vec<Ty>, result: Ty) -> Self {
        Self {
            name: name.into(),
            params,
            result,
            purity: OperationPurity::Observable,
            ffi_barrier: false,
        }
    }

    /// An informational (pure read) operation.
    pub fn informational(name: impl Into<String>, params: Vec<Ty>, result: Ty) -> Self {
        Self {
            name: name.into(),
            params,
            result,
            purity: OperationPurity::Informational,
            ffi_barrier: false,
        }
    }

    /// Mark the operation as crossing an FFI barrier.
    pub fn with_ffi_barrier(mut self) -> Self {
        self.ffi_barrier = true;
        self
    }
}

/// An effect: a named capability with zero or more operations.
#[derive(Debug, Clone, Serialize)]
pub struct EffectDecl {
    /// The effect's identifier.
    pub id: EffectId,
    /// Effect name.
    pub name: String,
    /// Operations, indexed by position.
    pub operations: Vec<OperationSig>,
}

impl EffectDecl {
    /// Create an effect declaration.
    pub fn new(id: EffectId, name: impl Into<String>, operations: Vec<OperationSig>) -> Self {
        Self {
            id,
            name: name.into(),
            operations,
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Declared resume strategy of a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ResumeStrategy {
    /// Never resumes (exception-like).
    None,
    /// Resumes at most once. The default, and the cheap case: the runtime
    /// may reuse the suspended context's memory instead of copying it.
    #[default]
    Single,
    /// May resume the same continuation more than once; each extra resume
    /// requires an explicit clone at runtime.
    MultiShot,
}

/// A handler's implementation of one operation.
#[derive(Debug, Clone, Serialize)]
pub struct HandlerOp {
    /// Index of the operation within the handled effect.
    pub op_index: u32,
    /// The implementation, as ordinary IR. `Resume` / `ResumeCall`
    /// terminators are permitted here and nowhere else.
    pub body: FunctionBody,
}

/// A handler: an implementation for each operation of one effect,
/// installed at a lexical scope.
#[derive(Debug, Clone, Serialize)]
pub struct HandlerDecl {
    /// The handler's identifier.
    pub id: HandlerId,
    /// Handler name.
    pub name: String,
    /// The effect being handled.
    pub effect: EffectId,
    /// Declared resume strategy, validated against the operation bodies.
    pub resume_strategy: ResumeStrategy,
    /// One implementation per operation of the effect.
    pub ops: Vec<HandlerOp>,
}

// ============================================================================
// Registry
// ============================================================================

/// Errors from registering declarations.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// A handler referenced an effect that was never registered.
    #[error("handler '{handler}' references unknown {effect}")]
    UnknownEffect {
        /// The offending handler's name.
        handler: String,
        /// The missing effect.
        effect: EffectId,
    },

    /// A handler implements the wrong number of operations.
    #[error("handler '{handler}' implements {found} operations, effect declares {expected}")]
    OperationCountMismatch {
        /// The offending handler's name.
        handler: String,
        /// Operations the effect declares.
        expected: usize,
        /// Operations the handler implements.
        found: usize,
    },

    /// An operation body contradicts the declared resume strategy.
    #[error(
        "handler '{handler}' operation {op_index} resumes in a way its \
         declared strategy ({strategy:?}) does not allow"
    )]
    StrategyMismatch {
        /// The offending handler's name.
        handler: String,
        /// The contradicting operation.
        op_index: u32,
        /// The declared strategy.
        strategy: ResumeStrategy,
    },

    /// An id was registered twice.
    #[error("duplicate registration of {what}")]
    DuplicateId {
        /// Rendered id.
        what: String,
    },
}

/// Registry of effects and handlers for one compilation.
#[derive(Debug, Clone, Default)]
pub struct EffectRegistry {
    effects: IndexMap<EffectId, EffectDecl>,
    handlers: IndexMap<HandlerId, HandlerDecl>,
}

impl EffectRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an effect declaration.
    pub fn register_effect(&mut self, effect: EffectDecl) -> Result<(), RegistryError> {
        if self.effects.contains_key(&effect.id) {
            return Err(RegistryError::DuplicateId {
                what: effect.id.to_string(),
            });
        }
        self.effects.insert(effect.id, effect);
        Ok(())
    }

    /// Register a handler, validating it against its effect declaration
    /// and its declared resume strategy.
    pub fn register_handler(&mut self, handler: HandlerDecl) -> Result<(), RegistryError> {
        if self.handlers.contains_key(&handler.id) {
            return Err(RegistryError::DuplicateId {
                what: handler.id.to_string(),
            });
        }
        let effect = self.effects.get(&handler.effect).ok_or_else(|| {
            RegistryError::UnknownEffect {
                handler: handler.name.clone(),
                effect: handler.effect,
            }
        })?;
        if handler.ops.len() != effect.operations.len() {
            return Err(RegistryError::OperationCountMismatch {
                handler: handler.name.clone(),
                expected: effect.operations.len(),
                found: handler.ops.len(),
            });
        }
        for op in &handler.ops {
            let shape = resume_shape(&op.body);
            if !strategy_allows(handler.resume_strategy, &shape) {
                return Err(RegistryError::StrategyMismatch {
                    handler: handler.name.clone(),
                    op_index: op.op_index,
                    strategy: handler.resume_strategy,
                });
            }
        }
        self.handlers.insert(handler.id, handler);
        Ok(())
    }

    /// Look up an effect.
    pub fn effect(&self, id: EffectId) -> Option<&EffectDecl> {
        self.effects.get(&id)
    }

    /// Look up a handler.
    pub fn handler(&self, id: HandlerId) -> Option<&HandlerDecl> {
        self.handlers.get(&id)
    }

    /// Look up an operation signature.
    pub fn operation(&self, effect: EffectId, op_index: u32) -> Option<&OperationSig> {
        self.effects
            .get(&effect)
            .and_then(|e| e.operations.get(op_index as usize))
    }

    /// Look up a handler's implementation of an operation.
    pub fn handler_op(&self, handler: HandlerId, op_index: u32) -> Option<&HandlerOp> {
        self.handlers
            .get(&handler)
            .and_then(|h| h.ops.iter().find(|op| op.op_index == op_index))
    }

    /// All handlers registered for an effect.
    pub fn handlers_for(&self, effect: EffectId) -> Vec<&HandlerDecl> {
        self.handlers
            .values()
            .filter(|h| h.effect == effect)
            .collect()
    }

    /// Iterate all registered effects in registration order.
    pub fn all_effects(&self) -> impl Iterator<Item = &EffectDecl> {
        self.effects.values()
    }

    /// Iterate all registered handlers in registration order.
    pub fn all_handlers(&self) -> impl Iterator<Item = &HandlerDecl> {
        self.handlers.values()
    }

    /// Whether a handler can reach itself through its operation bodies.
    ///
    /// Recursive handlers are never inlined; the splice would not
    /// terminate.
    pub fn handler_is_recursive(&self, id: HandlerId) -> bool {
        let mut visited: FxHashSet<HandlerId> = FxHashSet::default();
        let mut stack = vec![id];
        let mut first = true;
        while let Some(current) = stack.pop() {
            if !first && current == id {
                return true;
            }
            first = false;
            if !visited.insert(current) {
                continue;
            }
            let Some(handler) = self.handlers.get(&current) else {
                continue;
            };
            for op in &handler.ops {
                for block in &op.body.blocks {
                    if let Some(term) = &block.terminator {
                        if let TerminatorKind::Call {
                            callee: Callee::HandlerOp { handler, .. },
                            ..
                        } = &term.kind
                        {
                            if *handler == id {
                                return true;
                            }
                            stack.push(*handler);
                        }
                    }
                }
            }
        }
        false
    }
}

fn strategy_allows(strategy: ResumeStrategy, shape: &ResumeShape) -> bool {
    match strategy {
        ResumeStrategy::None => shape.tail_resumes == 0 && shape.nontail_resumes == 0,
        ResumeStrategy::Single => !shape.repeated,
        ResumeStrategy::MultiShot => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::types::{Operand, Place, Terminator};
    use crate::span::Span;

    pub(crate) fn tail_resume_body(name: &str) -> FunctionBody {
        let mut body = FunctionBody::new(name, Ty::Int);
        let bb0 = body.new_block();
        body.terminate(
            bb0,
            Terminator::new(
                TerminatorKind::Resume {
                    value: Some(Operand::Copy(crate::ir::types::LocalId(0))),
                },
                Span::dummy(),
            ),
        );
        body
    }

    fn abort_body(name: &str) -> FunctionBody {
        let mut body = FunctionBody::new(name, Ty::Int);
        let bb0 = body.new_block();
        body.terminate(bb0, Terminator::new(TerminatorKind::Return, Span::dummy()));
        body
    }

    fn multi_resume_body(name: &str) -> FunctionBody {
        // bb0: resume-call -> bb1; bb1: resume (tail). Resumes twice.
        let mut body = FunctionBody::new(name, Ty::Int);
        let bb0 = body.new_block();
        let bb1 = body.new_block();
        body.terminate(
            bb0,
            Terminator::new(
                TerminatorKind::ResumeCall {
                    value: None,
                    destination: Place::new(crate::ir::types::LocalId(0)),
                    target: bb1,
                },
                Span::dummy(),
            ),
        );
        body.terminate(
            bb1,
            Terminator::new(TerminatorKind::Resume { value: None }, Span::dummy()),
        );
        body
    }

    fn state_effect() -> EffectDecl {
        EffectDecl::new(
            EffectId(0),
            "State",
            vec![
                OperationSig::informational("get", vec![], Ty::Int),
                OperationSig::observable("set", vec![Ty::Int], Ty::Unit),
            ],
        )
    }

    fn state_handler(id: u32, strategy: ResumeStrategy) -> HandlerDecl {
        HandlerDecl {
            id: HandlerId(id),
            name: format!("state{id}"),
            effect: EffectId(0),
            resume_strategy: strategy,
            ops: vec![
                HandlerOp {
                    op_index: 0,
                    body: tail_resume_body("get"),
                },
                HandlerOp {
                    op_index: 1,
                    body: tail_resume_body("set"),
                },
            ],
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = EffectRegistry::new();
        registry.register_effect(state_effect()).unwrap();
        registry
            .register_handler(state_handler(0, ResumeStrategy::Single))
            .unwrap();

        assert!(registry.effect(EffectId(0)).is_some());
        assert!(registry.handler(HandlerId(0)).is_some());
        assert_eq!(registry.operation(EffectId(0), 0).unwrap().name, "get");
        assert_eq!(registry.handlers_for(EffectId(0)).len(), 1);
        assert!(registry.handler_op(HandlerId(0), 1).is_some());
    }

    #[test]
    fn test_register_handler_unknown_effect() {
        let mut registry = EffectRegistry::new();
        let err = registry
            .register_handler(state_handler(0, ResumeStrategy::Single))
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownEffect { .. }));
    }

    #[test]
    fn test_register_handler_op_count_mismatch() {
        let mut registry = EffectRegistry::new();
        registry.register_effect(state_effect()).unwrap();
        let mut handler = state_handler(0, ResumeStrategy::Single);
        handler.ops.pop();
        let err = registry.register_handler(handler).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::OperationCountMismatch {
                expected: 2,
                found: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_strategy_none_rejects_resuming_body() {
        let mut registry = EffectRegistry::new();
        registry.register_effect(state_effect()).unwrap();
        let err = registry
            .register_handler(state_handler(0, ResumeStrategy::None))
            .unwrap_err();
        assert!(matches!(err, RegistryError::StrategyMismatch { .. }));
    }

    #[test]
    fn test_strategy_none_accepts_aborting_body() {
        let mut registry = EffectRegistry::new();
        registry
            .register_effect(EffectDecl::new(
                EffectId(0),
                "Fail",
                vec![OperationSig::observable("fail", vec![], Ty::Unit)],
            ))
            .unwrap();
        registry
            .register_handler(HandlerDecl {
                id: HandlerId(0),
                name: "abort".to_string(),
                effect: EffectId(0),
                resume_strategy: ResumeStrategy::None,
                ops: vec![HandlerOp {
                    op_index: 0,
                    body: abort_body("fail"),
                }],
            })
            .unwrap();
    }

    #[test]
    fn test_strategy_single_rejects_repeated_resume() {
        let mut registry = EffectRegistry::new();
        registry
            .register_effect(EffectDecl::new(
                EffectId(0),
                "Amb",
                vec![OperationSig::observable("flip", vec![], Ty::Bool)],
            ))
            .unwrap();
        let handler = HandlerDecl {
            id: HandlerId(0),
            name: "both".to_string(),
            effect: EffectId(0),
            resume_strategy: ResumeStrategy::Single,
            ops: vec![HandlerOp {
                op_index: 0,
                body: multi_resume_body("flip"),
            }],
        };
        let err = registry.register_handler(handler).unwrap_err();
        assert!(matches!(err, RegistryError::StrategyMismatch { .. }));
    }

    #[test]
    fn test_strategy_multishot_accepts_repeated_resume() {
        let mut registry = EffectRegistry::new();
        registry
            .register_effect(EffectDecl::new(
                EffectId(0),
                "Amb",
                vec![OperationSig::observable("flip", vec![], Ty::Bool)],
            ))
            .unwrap();
        registry
            .register_handler(HandlerDecl {
                id: HandlerId(0),
                name: "both".to_string(),
                effect: EffectId(0),
                resume_strategy: ResumeStrategy::MultiShot,
                ops: vec![HandlerOp {
                    op_index: 0,
                    body: multi_resume_body("flip"),
                }],
            })
            .unwrap();
    }

    #[test]
    fn test_recursion_detection() {
        let mut registry = EffectRegistry::new();
        registry
            .register_effect(EffectDecl::new(
                EffectId(0),
                "Log",
                vec![OperationSig::observable("log", vec![Ty::Int], Ty::Unit)],
            ))
            .unwrap();

        // Handler whose op body calls back into itself.
        let mut body = FunctionBody::new("log", Ty::Unit);
        let bb0 = body.new_block();
        let bb1 = body.new_block();
        body.terminate(
            bb0,
            Terminator::new(
                TerminatorKind::Call {
                    callee: Callee::HandlerOp {
                        handler: HandlerId(0),
                        op_index: 0,
                    },
                    args: vec![],
                    destination: Place::new(crate::ir::types::LocalId(0)),
                    target: bb1,
                },
                Span::dummy(),
            ),
        );
        body.terminate(
            bb1,
            Terminator::new(TerminatorKind::Resume { value: None }, Span::dummy()),
        );

        registry
            .register_handler(HandlerDecl {
                id: HandlerId(0),
                name: "rec".to_string(),
                effect: EffectId(0),
                resume_strategy: ResumeStrategy::Single,
                ops: vec![HandlerOp { op_index: 0, body }],
            })
            .unwrap();

        assert!(registry.handler_is_recursive(HandlerId(0)));

        let mut registry2 = EffectRegistry::new();
        registry2.register_effect(state_effect()).unwrap();
        registry2
            .register_handler(state_handler(0, ResumeStrategy::Single))
            .unwrap();
        assert!(!registry2.handler_is_recursive(HandlerId(0)));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = EffectRegistry::new();
        registry.register_effect(state_effect()).unwrap();
        let err = registry.register_effect(state_effect()).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateId { .. }));
    }
}
