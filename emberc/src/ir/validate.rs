//! # IR Validation
//!
//! Structural checks on function bodies, run before the pipeline (to
//! reject malformed upstream input) and available after every pass (a
//! pass that produces invalid IR is a pipeline bug, not a user error).

use thiserror::Error;

use crate::diagnostics::{Diagnostic, ErrorCode};
use crate::effects::decl::EffectId;
use crate::effects::evidence::{analyze_evidence_stacks, StackAnalysisError};
use crate::ir::types::{BasicBlockId, LocalId, StatementKind, TerminatorKind};
use crate::ir::FunctionBody;

/// What kind of body is being validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    /// An ordinary module function. Resume terminators are forbidden.
    Function,
    /// A handler-operation body. Resume terminators are permitted.
    HandlerOp,
}

/// A structural defect in a function body.
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    /// A block has no terminator.
    #[error("{block} has no terminator")]
    MissingTerminator {
        /// The unterminated block.
        block: BasicBlockId,
    },

    /// A terminator targets a block that does not exist.
    #[error("{block} targets out-of-range {target}")]
    TargetOutOfRange {
        /// The block with the bad terminator.
        block: BasicBlockId,
        /// The missing target.
        target: BasicBlockId,
    },

    /// An operand references a local that does not exist.
    #[error("{block} references out-of-range local {local}")]
    LocalOutOfRange {
        /// The block with the bad operand.
        block: BasicBlockId,
        /// The missing local.
        local: LocalId,
    },

    /// A resume terminator appears outside a handler-operation body.
    #[error("{block} resumes outside a handler-operation body")]
    ResumeOutsideHandler {
        /// The offending block.
        block: BasicBlockId,
    },

    /// A reachable operation site has no evidence slot for its effect.
    #[error("{block} performs {effect} with no evidence slot assigned")]
    MissingEvidenceSlot {
        /// The offending block.
        block: BasicBlockId,
        /// The effect lacking a slot.
        effect: EffectId,
    },

    /// Handler install/uninstall scopes do not balance.
    #[error("handler scopes unbalance at {block}")]
    UnbalancedScopes {
        /// The block where the imbalance shows.
        block: BasicBlockId,
    },

    /// Handler scopes are still open at a return.
    #[error("{block} returns with handler scopes still open")]
    ScopesLeakAtReturn {
        /// The returning block.
        block: BasicBlockId,
    },
}

impl ValidationError {
    /// The block the defect was observed in.
    pub fn block(&self) -> BasicBlockId {
        match self {
            ValidationError::MissingTerminator { block }
            | ValidationError::TargetOutOfRange { block, .. }
            | ValidationError::LocalOutOfRange { block, .. }
            | ValidationError::ResumeOutsideHandler { block }
            | ValidationError::MissingEvidenceSlot { block, .. }
            | ValidationError::UnbalancedScopes { block }
            | ValidationError::ScopesLeakAtReturn { block } => *block,
        }
    }

    /// Render as a diagnostic against the function's spans.
    pub fn into_diagnostic(self, func: &FunctionBody) -> Diagnostic {
        let span = func
            .blocks
            .get(self.block().index())
            .and_then(|b| b.terminator.as_ref().map(|t| t.span))
            .unwrap_or(func.span);
        let diag = Diagnostic::error(format!("in `{}`: {self}", func.name), span);
        match self {
            ValidationError::MissingEvidenceSlot { .. } => {
                diag.with_error_code(ErrorCode::MissingEvidenceSlot)
            }
            ValidationError::UnbalancedScopes { .. }
            | ValidationError::ScopesLeakAtReturn { .. } => {
                diag.with_error_code(ErrorCode::UnbalancedHandlerScopes)
            }
            _ => diag,
        }
    }
}

/// Validate a function body. Collects all defects rather than stopping at
/// the first.
pub fn validate_body(func: &FunctionBody, kind: BodyKind) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let block_count = func.blocks.len() as u32;
    let local_count = func.locals.len() as u32;

    let check_local = |errors: &mut Vec<ValidationError>, block: BasicBlockId, local: LocalId| {
        if local.0 >= local_count {
            errors.push(ValidationError::LocalOutOfRange { block, local });
        }
    };

    for block in func.block_ids() {
        let data = func.block(block);

        for stmt in &data.statements {
            if let StatementKind::Assign(place, rvalue) = &stmt.kind {
                check_local(&mut errors, block, place.local);
                for local in rvalue.read_locals() {
                    check_local(&mut errors, block, local);
                }
            }
        }

        let Some(terminator) = data.terminator.as_ref() else {
            errors.push(ValidationError::MissingTerminator { block });
            continue;
        };

        for target in terminator.successors() {
            if target.0 >= block_count {
                errors.push(ValidationError::TargetOutOfRange { block, target });
            }
        }
        for local in terminator.kind.read_locals() {
            check_local(&mut errors, block, local);
        }
        match &terminator.kind {
            TerminatorKind::Call { destination, .. }
            | TerminatorKind::Perform { destination, .. }
            | TerminatorKind::ResumeCall { destination, .. }
            | TerminatorKind::ForeignCall { destination, .. } => {
                check_local(&mut errors, block, destination.local);
            }
            _ => {}
        }

        if kind == BodyKind::Function {
            if matches!(
                terminator.kind,
                TerminatorKind::Resume { .. } | TerminatorKind::ResumeCall { .. }
            ) {
                errors.push(ValidationError::ResumeOutsideHandler { block });
            }
        }
    }

    // Evidence checks only make sense on a structurally sound graph.
    if errors.is_empty() {
        let reachable = func.reachable_blocks();
        for block in func.block_ids() {
            if !reachable.contains(&block) {
                continue;
            }
            if let Some(terminator) = func.block(block).terminator.as_ref() {
                if let TerminatorKind::Perform { effect, .. } = &terminator.kind {
                    if func.evidence.slot_for(*effect).is_none() {
                        errors.push(ValidationError::MissingEvidenceSlot {
                            block,
                            effect: *effect,
                        });
                    }
                }
            }
        }

        match analyze_evidence_stacks(func, &[]) {
            Ok(stacks) => {
                if kind == BodyKind::Function {
                    for block in func.block_ids() {
                        if !reachable.contains(&block) {
                            continue;
                        }
                        let data = func.block(block);
                        if matches!(
                            data.terminator.as_ref().map(|t| &t.kind),
                            Some(TerminatorKind::Return)
                        ) && !stacks.at_terminator(func, block).is_empty()
                        {
                            errors.push(ValidationError::ScopesLeakAtReturn { block });
                        }
                    }
                }
            }
            Err(StackAnalysisError::Underflow { block })
            | Err(StackAnalysisError::HeightMismatch { block }) => {
                errors.push(ValidationError::UnbalancedScopes { block });
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
