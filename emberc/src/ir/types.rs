//! # Core IR Types
//!
//! Basic blocks, statements, and terminators for the effect-annotated IR.
//!
//! The general control-flow skeleton (goto, switch, call, return) is kept
//! deliberately small: it exists so the effect instructions have a real
//! graph to live in, not to model a full surface language. Effect
//! instructions are first-class:
//!
//! - [`StatementKind::InstallHandler`] / [`StatementKind::UninstallHandler`]
//!   maintain the evidence stack for a lexical handler scope.
//! - [`TerminatorKind::Perform`] invokes an effect operation through an
//!   evidence slot.
//! - [`TerminatorKind::Resume`] (tail) and [`TerminatorKind::ResumeCall`]
//!   (non-tail) appear only inside handler-operation bodies; keeping the
//!   tail case a dedicated terminator makes tail position syntactically
//!   checkable.
//! - [`TerminatorKind::ForeignCall`] is a declared FFI barrier crossing.

use std::fmt;

use serde::Serialize;

use crate::effects::classify::OperationClass;
use crate::effects::decl::{EffectId, HandlerId};
use crate::effects::evidence::EvidenceSlot;
use crate::span::Span;

// ============================================================================
// Identifiers
// ============================================================================

/// A unique identifier for a basic block within a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BasicBlockId(pub u32);

impl BasicBlockId {
    /// The entry block ID (always 0).
    pub const ENTRY: BasicBlockId = BasicBlockId(0);

    /// Create a new BasicBlockId.
    pub const fn new(id: u32) -> Self {
        BasicBlockId(id)
    }

    /// Get the index value.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BasicBlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// A local variable slot within a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct LocalId(pub u32);

impl LocalId {
    /// Create a new LocalId.
    pub const fn new(id: u32) -> Self {
        LocalId(id)
    }

    /// Get the index value.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "_{}", self.0)
    }
}

/// A function identifier within the module under compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FuncId(pub u32);

impl FuncId {
    /// Create a new FuncId.
    pub const fn new(id: u32) -> Self {
        FuncId(id)
    }
}

impl fmt::Display for FuncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn{}", self.0)
    }
}

// ============================================================================
// Types and Values
// ============================================================================

/// The type of a local or operand.
///
/// Upstream types are opaque to the effect core; only the handful of
/// shapes the core must distinguish (continuations for the barrier check,
/// word sizes for the async frame budget) are structural.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Ty {
    /// The unit type.
    Unit,
    /// A boolean.
    Bool,
    /// A machine integer.
    Int,
    /// A first-class continuation value.
    Continuation,
    /// Any other front-end type, identified but not inspected.
    Opaque(u32),
}

impl Ty {
    /// A conservative byte-size estimate, used for the async frame budget.
    ///
    /// Opaque types are assumed pointer-sized; the front end can always
    /// box what it cannot flatten.
    pub fn size_hint(self) -> usize {
        match self {
            Ty::Unit => 0,
            Ty::Bool => 1,
            Ty::Int | Ty::Continuation | Ty::Opaque(_) => 8,
        }
    }
}

/// A declared local variable.
#[derive(Debug, Clone, Serialize)]
pub struct Local {
    /// The local's type.
    pub ty: Ty,
    /// Optional name for debugging and pretty-printing.
    pub name: Option<String>,
}

impl Local {
    /// Create an unnamed local.
    pub fn new(ty: Ty) -> Self {
        Self { ty, name: None }
    }

    /// Create a named local.
    pub fn named(ty: Ty, name: impl Into<String>) -> Self {
        Self {
            ty,
            name: Some(name.into()),
        }
    }
}

/// A compile-time constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConstValue {
    /// The unit value.
    Unit,
    /// A boolean constant.
    Bool(bool),
    /// An integer constant.
    Int(i64),
}

/// An operand: the argument position of statements and terminators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Operand {
    /// Read a local, leaving it live.
    Copy(LocalId),
    /// Read a local, consuming it.
    Move(LocalId),
    /// A constant.
    Const(ConstValue),
}

impl Operand {
    /// The local this operand reads, if any.
    pub fn local(&self) -> Option<LocalId> {
        match self {
            Operand::Copy(l) | Operand::Move(l) => Some(*l),
            Operand::Const(_) => None,
        }
    }
}

/// An assignable location. The effect core only needs whole locals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Place {
    /// The destination local.
    pub local: LocalId,
}

impl Place {
    /// Create a place for a local.
    pub const fn new(local: LocalId) -> Self {
        Self { local }
    }
}

/// A binary operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Eq,
    Lt,
}

/// The right-hand side of an assignment.
#[derive(Debug, Clone, Serialize)]
pub enum Rvalue {
    /// Copy/move a value.
    Use(Operand),
    /// Apply a binary operation.
    BinaryOp {
        op: BinOp,
        lhs: Operand,
        rhs: Operand,
    },
}

impl Rvalue {
    /// Locals read by this rvalue.
    pub fn read_locals(&self) -> Vec<LocalId> {
        match self {
            Rvalue::Use(op) => op.local().into_iter().collect(),
            Rvalue::BinaryOp { lhs, rhs, .. } => {
                lhs.local().into_iter().chain(rhs.local()).collect()
            }
        }
    }
}

// ============================================================================
// Statements
// ============================================================================

/// A statement in a basic block. Statements have exactly one successor.
#[derive(Debug, Clone, Serialize)]
pub struct Statement {
    /// The kind of statement.
    pub kind: StatementKind,
    /// Source location for error reporting.
    pub span: Span,
}

impl Statement {
    /// Create a new statement.
    pub fn new(kind: StatementKind, span: Span) -> Self {
        Self { kind, span }
    }

    /// Create a nop, used to blank removed statements in place.
    pub fn nop(span: Span) -> Self {
        Self {
            kind: StatementKind::Nop,
            span,
        }
    }
}

/// A single handler installation, as carried by install statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HandlerInstall {
    /// The effect being handled.
    pub effect: EffectId,
    /// The handler implementation.
    pub handler: HandlerId,
    /// The evidence slot the handler occupies.
    pub slot: EvidenceSlot,
}

/// The kind of a statement.
#[derive(Debug, Clone, Serialize)]
pub enum StatementKind {
    /// Assignment: `place = rvalue`.
    Assign(Place, Rvalue),

    /// Push one handler onto the evidence stack for a lexical scope.
    ///
    /// The matching [`StatementKind::UninstallHandler`] retires it when
    /// the scope exits; install/uninstall pairs obey a strict stack
    /// discipline along every path (checked by the validator).
    InstallHandler(HandlerInstall),

    /// Push several handlers in one evidence mutation.
    ///
    /// Produced only by the fusion pass; a front end never emits this.
    InstallHandlerGroup(Vec<HandlerInstall>),

    /// Pop the `count` most recently installed handlers.
    UninstallHandler {
        /// Number of installs to retire.
        count: u32,
    },

    /// No-op (placeholder for removed statements).
    Nop,
}

impl StatementKind {
    /// Net change this statement applies to the evidence-stack height.
    pub fn stack_delta(&self) -> i64 {
        match self {
            StatementKind::InstallHandler(_) => 1,
            StatementKind::InstallHandlerGroup(installs) => installs.len() as i64,
            StatementKind::UninstallHandler { count } => -(*count as i64),
            StatementKind::Assign(..) | StatementKind::Nop => 0,
        }
    }
}

// ============================================================================
// Terminators
// ============================================================================

/// A terminator ends a basic block and may have multiple successors.
#[derive(Debug, Clone, Serialize)]
pub struct Terminator {
    /// The kind of terminator.
    pub kind: TerminatorKind,
    /// Source location for error reporting.
    pub span: Span,
}

impl Terminator {
    /// Create a new terminator.
    pub fn new(kind: TerminatorKind, span: Span) -> Self {
        Self { kind, span }
    }

    /// Get all successor blocks.
    pub fn successors(&self) -> Vec<BasicBlockId> {
        self.kind.successors()
    }
}

/// Branch targets of a `SwitchInt`.
#[derive(Debug, Clone, Serialize)]
pub struct SwitchTargets {
    /// `(value, target)` pairs tried in order.
    pub values: Vec<(i64, BasicBlockId)>,
    /// Target when no value matches.
    pub otherwise: BasicBlockId,
}

impl SwitchTargets {
    /// All distinct targets, otherwise last.
    pub fn all_targets(&self) -> Vec<BasicBlockId> {
        let mut targets: Vec<BasicBlockId> = self.values.iter().map(|(_, t)| *t).collect();
        targets.push(self.otherwise);
        targets
    }
}

/// What a [`TerminatorKind::Call`] invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Callee {
    /// An ordinary function in the module.
    Fn(FuncId),
    /// A specific handler's operation body, statically known.
    HandlerOp {
        /// The handler owning the operation.
        handler: HandlerId,
        /// Index of the operation within the handled effect.
        op_index: u32,
    },
    /// An operation dispatched through an evidence slot.
    ///
    /// This is what tail-resumptive conversion rewrites a `Perform` into:
    /// a direct call when the slot is static, one indirection through the
    /// operation table when dynamic. Either way, no capture scaffolding.
    Evidence {
        /// The slot carrying the handler.
        slot: EvidenceSlot,
        /// Index of the operation within the effect.
        op_index: u32,
    },
}

/// Calling convention declared on a foreign call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ForeignConvention {
    /// Raw call into the foreign frame. General handlers in force around
    /// it are a compile error.
    Direct,
    /// Recognized conversion pattern: suspensions inside resolve a result
    /// slot through a callback instead of capturing across the frame.
    CallbackConvert,
}

/// The kind of a terminator.
#[derive(Debug, Clone, Serialize)]
pub enum TerminatorKind {
    /// Unconditional jump.
    Goto {
        /// Destination block.
        target: BasicBlockId,
    },

    /// Conditional branch on an integer discriminant.
    SwitchInt {
        /// The value being switched on.
        discr: Operand,
        /// Switch targets.
        targets: SwitchTargets,
    },

    /// Return from the function. The return value lives in local 0.
    Return,

    /// Unreachable code (e.g., after a diverging call).
    Unreachable,

    /// Plain call.
    Call {
        /// What is being invoked.
        callee: Callee,
        /// Arguments to the callee.
        args: Vec<Operand>,
        /// Where the result is stored.
        destination: Place,
        /// Block to continue in after the call returns.
        target: BasicBlockId,
    },

    /// Effect operation invocation.
    ///
    /// The classification starts at the conservative value supplied by
    /// the front end and is refined in place by the pipeline. Once the
    /// pipeline completes, `TailResumptive` sites have been rewritten to
    /// `Call` terminators, so any `Perform` remaining at lowering is
    /// `General` or `FfiBoundary`.
    Perform {
        /// The effect whose operation is performed.
        effect: EffectId,
        /// Operation index within the effect.
        op_index: u32,
        /// Operation arguments.
        args: Vec<Operand>,
        /// Where the resume value is stored.
        destination: Place,
        /// Block to continue in once the operation resumes.
        target: BasicBlockId,
        /// Current classification of this site.
        class: OperationClass,
    },

    /// Tail resume inside a handler-operation body: give `value` to the
    /// suspended computation and never come back. Terminal, like `Return`.
    Resume {
        /// The value handed to the performer.
        value: Option<Operand>,
    },

    /// Non-tail resume: run the suspended computation to its next
    /// suspension or completion, then continue in `target` with the
    /// outcome in `destination`. Presence of this terminator is what
    /// makes an operation body `General`.
    ResumeCall {
        /// The value handed to the performer.
        value: Option<Operand>,
        /// Where the computation's outcome is stored.
        destination: Place,
        /// Block the handler continues in.
        target: BasicBlockId,
    },

    /// Declared FFI barrier crossing.
    ForeignCall {
        /// Foreign symbol name.
        symbol: String,
        /// Arguments marshaled to the foreign callee.
        args: Vec<Operand>,
        /// Where the foreign result is stored.
        destination: Place,
        /// Block to continue in after the foreign call returns.
        target: BasicBlockId,
        /// Declared convention for suspensions around this call.
        convention: ForeignConvention,
    },
}

impl TerminatorKind {
    /// Get all successor blocks.
    pub fn successors(&self) -> Vec<BasicBlockId> {
        match self {
            TerminatorKind::Goto { target } => vec![*target],
            TerminatorKind::SwitchInt { targets, .. } => targets.all_targets(),
            TerminatorKind::Return
            | TerminatorKind::Unreachable
            | TerminatorKind::Resume { .. } => vec![],
            TerminatorKind::Call { target, .. }
            | TerminatorKind::Perform { target, .. }
            | TerminatorKind::ResumeCall { target, .. }
            | TerminatorKind::ForeignCall { target, .. } => vec![*target],
        }
    }

    /// Locals read by this terminator.
    pub fn read_locals(&self) -> Vec<LocalId> {
        let operands: Vec<&Operand> = match self {
            TerminatorKind::SwitchInt { discr, .. } => vec![discr],
            TerminatorKind::Call { args, .. }
            | TerminatorKind::Perform { args, .. }
            | TerminatorKind::ForeignCall { args, .. } => args.iter().collect(),
            TerminatorKind::Resume { value } | TerminatorKind::ResumeCall { value, .. } => {
                value.iter().collect()
            }
            TerminatorKind::Goto { .. }
            | TerminatorKind::Return
            | TerminatorKind::Unreachable => vec![],
        };
        operands.iter().filter_map(|op| op.local()).collect()
    }
}

// ============================================================================
// Basic Blocks
// ============================================================================

/// A basic block: a sequence of statements followed by a single terminator.
#[derive(Debug, Clone, Serialize)]
pub struct BasicBlockData {
    /// Statements executed sequentially.
    pub statements: Vec<Statement>,
    /// The terminator that ends this block.
    pub terminator: Option<Terminator>,
}

impl BasicBlockData {
    /// Create a new empty basic block.
    pub fn new() -> Self {
        Self {
            statements: Vec::new(),
            terminator: None,
        }
    }

    /// Check if this block has a terminator.
    pub fn is_terminated(&self) -> bool {
        self.terminator.is_some()
    }

    /// Get successor blocks.
    pub fn successors(&self) -> Vec<BasicBlockId> {
        match &self.terminator {
            Some(term) => term.successors(),
            None => vec![],
        }
    }

    /// The terminator, which the validator guarantees is present.
    pub fn terminator(&self) -> &Terminator {
        self.terminator
            .as_ref()
            .expect("block has no terminator; validate_body should have rejected this")
    }
}

impl Default for BasicBlockData {
    fn default() -> Self {
        Self::new()
    }
}
