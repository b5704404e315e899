//! # FFI Boundary Guard
//!
//! Static analysis preventing continuation capture from escaping into
//! foreign call frames. A foreign frame is opaque to the continuation
//! runtime: a capture spanning it could never be restored, so the
//! compiler rejects the program instead.
//!
//! For every foreign call, the guard walks the handlers lexically in
//! force at the call. If any of them is classified `General` (it may
//! capture) and the call is a raw `Direct` crossing, compilation of the
//! function fails with E0450. Calls declared `CallbackConvert` are exempt
//! from that check: their suspensions resolve an explicit result slot
//! through a callback, so no continuation ever spans the foreign frame.
//!
//! Passing a continuation *value* across a barrier is rejected
//! unconditionally (E0451) — continuations do not leave the managed
//! world under any convention.

use crate::diagnostics::{Diagnostic, ErrorCode};
use crate::effects::classify::handler_may_capture;
use crate::effects::decl::{EffectRegistry, HandlerId};
use crate::effects::evidence::{analyze_evidence_stacks, AbstractHandler, AbstractInstall};
use crate::ir::types::{ForeignConvention, StatementKind, TerminatorKind, Ty};
use crate::ir::FunctionBody;
use crate::span::Span;

/// Check every foreign call in a function against the handlers in force.
///
/// Returns the diagnostics found; an empty vector means the function is
/// clean. Errors here abort compilation of this function only.
pub fn check_foreign_boundaries(func: &FunctionBody, registry: &EffectRegistry) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    let stacks = match analyze_evidence_stacks(func, &[]) {
        Ok(stacks) => stacks,
        // Unbalanced scopes are reported by the validator; nothing
        // meaningful to check here.
        Err(_) => return diagnostics,
    };

    let reachable = func.reachable_blocks();
    for block in func.block_ids() {
        if !reachable.contains(&block) {
            continue;
        }
        let Some(terminator) = func.block(block).terminator.as_ref() else {
            continue;
        };
        let TerminatorKind::ForeignCall {
            symbol,
            args,
            convention,
            ..
        } = &terminator.kind
        else {
            continue;
        };

        // Continuation values never cross a barrier, regardless of
        // convention.
        for arg in args {
            if let Some(local) = arg.local() {
                if func.locals[local.index()].ty == Ty::Continuation {
                    diagnostics.push(
                        Diagnostic::from_error_code(ErrorCode::ContinuationCrossesBarrier, terminator.span)
                            .with_primary_label(
                                terminator.span,
                                format!("continuation passed to foreign function `{symbol}`"),
                            ),
                    );
                }
            }
        }

        if *convention == ForeignConvention::CallbackConvert {
            continue;
        }

        let in_force = stacks.at_terminator(func, block);
        for entry in in_force.iter().rev() {
            if let Some(conflict) = entry_conflict(entry, registry) {
                let mut diag = Diagnostic::from_error_code(
                    ErrorCode::GeneralHandlerAcrossForeignCall,
                    terminator.span,
                )
                .with_primary_label(
                    terminator.span,
                    format!(
                        "foreign call to `{symbol}` while {} is in force",
                        conflict.describe(registry)
                    ),
                );
                if let Some(handler) = conflict.handler {
                    if let Some(span) = install_span(func, handler) {
                        diag = diag.with_note(span, "general handler installed here");
                    }
                }
                diagnostics.push(diag);
                // One report per call is enough to stop compilation;
                // further entries add noise, not information.
                break;
            }
        }
    }

    diagnostics
}

/// A handler entry conflicting with a foreign call.
struct Conflict {
    handler: Option<HandlerId>,
}

impl Conflict {
    fn describe(&self, registry: &EffectRegistry) -> String {
        match self.handler {
            Some(id) => match registry.handler(id) {
                Some(decl) => format!("general handler `{}`", decl.name),
                None => format!("general handler {id}"),
            },
            None => "a handler that cannot be proven tail-resumptive".to_string(),
        }
    }
}

fn entry_conflict(entry: &AbstractInstall, registry: &EffectRegistry) -> Option<Conflict> {
    match entry.handler {
        AbstractHandler::Constant(handler) => {
            if handler_may_capture(registry, handler) {
                Some(Conflict {
                    handler: Some(handler),
                })
            } else {
                None
            }
        }
        // The handler varies by path; it cannot be proven incapable of
        // capturing.
        AbstractHandler::Partial => Some(Conflict { handler: None }),
    }
}

fn install_span(func: &FunctionBody, handler: HandlerId) -> Option<Span> {
    for block in &func.blocks {
        for stmt in &block.statements {
            match &stmt.kind {
                StatementKind::InstallHandler(install) if install.handler == handler => {
                    return Some(stmt.span);
                }
                StatementKind::InstallHandlerGroup(installs)
                    if installs.iter().any(|i| i.handler == handler) =>
                {
                    return Some(stmt.span);
                }
                _ => {}
            }
        }
    }
    None
}
