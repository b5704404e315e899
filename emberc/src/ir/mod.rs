//! # Effect-Annotated Control-Flow IR
//!
//! The IR the effect core operates on. A front end hands over function
//! bodies already lowered to basic blocks, with the effect-specific
//! statements and terminators defined here layered on top:
//!
//! ```text
//! FunctionBody
//! └── BasicBlockData
//!     ├── Vec<Statement>
//!     │   └── StatementKind
//!     │       ├── Assign(Place, Rvalue)
//!     │       ├── InstallHandler { .. }
//!     │       ├── UninstallHandler { .. }
//!     │       └── ...
//!     └── Terminator
//!         └── TerminatorKind
//!             ├── Goto / SwitchInt / Return / Unreachable
//!             ├── Call { callee, .. }
//!             ├── Perform { effect, op_index, .. }
//!             ├── Resume / ResumeCall
//!             └── ForeignCall { convention, .. }
//! ```
//!
//! The core never builds this IR from source; see [`crate::driver`] for
//! the upstream contract.

pub mod body;
pub mod types;
pub mod validate;

pub use body::{Dominators, FunctionBody, Module};
pub use types::{
    BasicBlockData, BasicBlockId, BinOp, Callee, ConstValue, ForeignConvention, FuncId,
    HandlerInstall, Local, LocalId, Operand, Place, Rvalue, Statement, StatementKind, SwitchTargets,
    Terminator, TerminatorKind, Ty,
};
pub use validate::{validate_body, BodyKind, ValidationError};
