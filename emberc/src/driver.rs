//! # Compilation Driver
//!
//! Orchestrates the effect core for one module:
//!
//! 1. validate every function body against the upstream contract;
//! 2. run the optimization pipeline over the module;
//! 3. per function: run the FFI boundary guard, freeze the evidence
//!    layout, and build the lowering plan and classification report.
//!
//! Compile-time errors abort only the enclosing function's compilation —
//! siblings proceed. Pipeline errors are different: they signal a bug in
//! a pass and fail the whole run rather than being silently recovered.

use thiserror::Error;

use crate::diagnostics::{ClassificationReport, Diagnostic};
use crate::effects::classify::build_report;
use crate::effects::decl::EffectRegistry;
use crate::effects::ffi::check_foreign_boundaries;
use crate::ir::{validate_body, BodyKind, FunctionBody, Module};
use crate::lower::{LoweringError, LoweringPlan};
use crate::opt::{OptConfig, Pipeline, PipelineCtx, PipelineError};

/// Why one function failed to compile.
#[derive(Debug, Error)]
pub enum CompileError {
    /// The upstream IR broke the input contract.
    #[error("function failed validation with {} diagnostic(s)", .0.len())]
    Validation(Vec<Diagnostic>),

    /// The FFI boundary guard rejected the function.
    #[error("function failed the FFI boundary guard with {} diagnostic(s)", .0.len())]
    Boundary(Vec<Diagnostic>),

    /// The plan builder hit damaged state.
    #[error(transparent)]
    Lowering(#[from] LoweringError),
}

impl CompileError {
    /// The diagnostics carried by this error, if any.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        match self {
            CompileError::Validation(diags) | CompileError::Boundary(diags) => diags,
            CompileError::Lowering(_) => &[],
        }
    }
}

/// A successfully compiled function.
#[derive(Debug)]
pub struct CompiledFunction {
    /// The function name.
    pub name: String,
    /// The optimized body (evidence layout frozen).
    pub body: FunctionBody,
    /// The backend lowering plan.
    pub plan: LoweringPlan,
    /// The structured classification report.
    pub report: ClassificationReport,
}

/// A function that did not compile.
#[derive(Debug)]
pub struct FunctionFailure {
    /// The function name.
    pub name: String,
    /// Why it failed.
    pub error: CompileError,
}

/// The result of compiling a module.
#[derive(Debug)]
pub struct ModuleOutput {
    /// Functions that compiled, in module order.
    pub compiled: Vec<CompiledFunction>,
    /// Functions that failed, in module order.
    pub failures: Vec<FunctionFailure>,
}

impl ModuleOutput {
    /// Whether every function compiled.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Compile a module through the effect core.
///
/// Returns `Err` only on a pipeline bug; per-function problems land in
/// [`ModuleOutput::failures`].
pub fn compile_module(
    mut module: Module,
    registry: &EffectRegistry,
    config: OptConfig,
) -> Result<ModuleOutput, PipelineError> {
    let mut failed: Vec<Option<CompileError>> = Vec::with_capacity(module.functions.len());

    // Upstream contract validation, per function.
    for func in &module.functions {
        match validate_body(func, BodyKind::Function) {
            Ok(()) => failed.push(None),
            Err(errors) => {
                let diags = errors
                    .into_iter()
                    .map(|e| e.into_diagnostic(func))
                    .collect();
                failed.push(Some(CompileError::Validation(diags)));
            }
        }
    }

    // The pipeline runs over the whole module; functions that failed
    // validation are left untouched by excluding them below, and the
    // passes themselves only ever see validated bodies because invalid
    // ones were swapped for empty shells.
    let mut shelved: Vec<(usize, FunctionBody)> = Vec::new();
    for (idx, slot) in failed.iter().enumerate() {
        if slot.is_some() {
            let mut shell = FunctionBody::new(module.functions[idx].name.clone(), crate::ir::Ty::Unit);
            let bb0 = shell.new_block();
            shell.terminate(
                bb0,
                crate::ir::Terminator::new(crate::ir::TerminatorKind::Return, shell.span),
            );
            shelved.push((idx, std::mem::replace(&mut module.functions[idx], shell)));
        }
    }

    let mut ctx = PipelineCtx::new(registry, config);
    Pipeline::standard().run(&mut module, &mut ctx)?;

    // Restore shelved bodies so failures report against the real code.
    for (idx, body) in shelved {
        module.functions[idx] = body;
    }

    let mut compiled = Vec::new();
    let mut failures = Vec::new();
    for (idx, mut func) in module.functions.into_iter().enumerate() {
        if let Some(error) = failed[idx].take() {
            failures.push(FunctionFailure {
                name: func.name.clone(),
                error,
            });
            continue;
        }

        let boundary = check_foreign_boundaries(&func, registry);
        if boundary.iter().any(|d| d.is_error()) {
            failures.push(FunctionFailure {
                name: func.name.clone(),
                error: CompileError::Boundary(boundary),
            });
            continue;
        }

        // The assignment never changes after the pipeline completes.
        func.evidence.freeze();

        let machine = ctx.state_machines.get(&crate::ir::FuncId(idx as u32));
        match LoweringPlan::build(&func, machine) {
            Ok(plan) => {
                let report = build_report(&func);
                compiled.push(CompiledFunction {
                    name: func.name.clone(),
                    body: func,
                    plan,
                    report,
                });
            }
            Err(error) => failures.push(FunctionFailure {
                name: func.name.clone(),
                error: error.into(),
            }),
        }
    }

    Ok(ModuleOutput { compiled, failures })
}
