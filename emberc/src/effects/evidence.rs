//! # Evidence Slots and Layouts
//!
//! Evidence is the mapping from an effect to the handler currently in
//! force. Two slot representations coexist:
//!
//! - **Static**: a compile-time-constant offset, valid when the handler
//!   for the effect is the same at every call site reaching an operation.
//!   The whole function shares one evidence-vector layout, so a static
//!   slot lowers to a constant index.
//! - **Dynamic**: a runtime lookup key, required only for
//!   effect-polymorphic code where the handler may vary.
//!
//! A function's [`EvidenceLayout`] records one slot per effect in its
//! effect set. The layout is mutable while the optimization pipeline runs
//! (evidence propagation promotes dynamic slots to static ones) and is
//! frozen afterwards; mutation after freezing is an internal compiler
//! error.
//!
//! This module also hosts the evidence-stack dataflow shared by
//! classification, dead-code elimination, and the FFI boundary guard: an
//! abstract interpretation of `InstallHandler`/`UninstallHandler`
//! statements that answers "which handlers are in force at this point".

use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::effects::decl::{EffectId, HandlerId};
use crate::ir::types::{BasicBlockId, StatementKind};

// ============================================================================
// Slots
// ============================================================================

/// The locator for a handler within an evidence vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EvidenceSlot {
    /// Compile-time-constant offset into the function's evidence vector.
    Static {
        /// Offset of the entry.
        offset: u32,
    },
    /// Runtime lookup by effect identity.
    Dynamic {
        /// The effect used as lookup key.
        key: EffectId,
    },
}

impl EvidenceSlot {
    /// Whether this slot resolves without a runtime lookup.
    pub fn is_static(&self) -> bool {
        matches!(self, EvidenceSlot::Static { .. })
    }
}

/// A slot assignment for one effect within a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotAssignment {
    /// Where the handler lives.
    pub slot: EvidenceSlot,
    /// The single handler known to occupy the slot, when proven.
    ///
    /// Set by the front end when obvious, refined by evidence
    /// propagation. A static slot without a binding still lowers to a
    /// direct indexed call; the binding additionally enables
    /// classification and inlining of the concrete handler body.
    pub binding: Option<HandlerId>,
}

/// Per-function evidence slot assignment.
///
/// Invariant: every effect operation reachable from the function body has
/// exactly one slot assigned here before lowering, and the assignment
/// never changes once [`EvidenceLayout::freeze`] has been called.
#[derive(Debug, Clone, Serialize)]
pub struct EvidenceLayout {
    /// Ordered effect → assignment map. Order fixes static offsets.
    entries: IndexMap<EffectId, SlotAssignment>,
    /// Next unclaimed static offset.
    next_offset: u32,
    /// Whether the layout is sealed against further mutation.
    frozen: bool,
}

impl EvidenceLayout {
    /// Create an empty layout.
    pub fn new() -> Self {
        Self {
            entries: IndexMap::new(),
            next_offset: 0,
            frozen: false,
        }
    }

    /// Assign a dynamic slot for an effect (the front end's best-effort
    /// default for effect-polymorphic code).
    pub fn assign_dynamic(&mut self, effect: EffectId) {
        debug_assert!(!self.frozen, "evidence layout mutated after freeze");
        self.entries.entry(effect).or_insert(SlotAssignment {
            slot: EvidenceSlot::Dynamic { key: effect },
            binding: None,
        });
    }

    /// Assign a static slot for an effect with a known handler binding.
    /// Returns the offset claimed.
    pub fn assign_static(&mut self, effect: EffectId, binding: Option<HandlerId>) -> u32 {
        debug_assert!(!self.frozen, "evidence layout mutated after freeze");
        let offset = self.next_offset;
        self.next_offset += 1;
        self.entries.insert(
            effect,
            SlotAssignment {
                slot: EvidenceSlot::Static { offset },
                binding,
            },
        );
        offset
    }

    /// Promote a dynamic slot to a static one with a proven binding.
    ///
    /// Returns the claimed offset, or `None` if the slot was already
    /// static (promotion is idempotent). Must not be called after
    /// freezing.
    pub fn promote(&mut self, effect: EffectId, binding: HandlerId) -> Option<u32> {
        if self.frozen {
            crate::ice!("evidence layout promoted after freeze"; "effect" => effect);
            return None;
        }
        match self.entries.get(&effect) {
            Some(assignment) if assignment.slot.is_static() => None,
            Some(_) => {
                let offset = self.next_offset;
                self.next_offset += 1;
                self.entries.insert(
                    effect,
                    SlotAssignment {
                        slot: EvidenceSlot::Static { offset },
                        binding: Some(binding),
                    },
                );
                Some(offset)
            }
            None => None,
        }
    }

    /// Record a proven handler binding without changing the slot kind.
    pub fn set_binding(&mut self, effect: EffectId, binding: HandlerId) {
        debug_assert!(!self.frozen, "evidence layout mutated after freeze");
        if let Some(assignment) = self.entries.get_mut(&effect) {
            assignment.binding = Some(binding);
        }
    }

    /// Look up the slot for an effect.
    pub fn slot_for(&self, effect: EffectId) -> Option<EvidenceSlot> {
        self.entries.get(&effect).map(|a| a.slot)
    }

    /// Look up the proven handler binding for an effect.
    pub fn binding_for(&self, effect: EffectId) -> Option<HandlerId> {
        self.entries.get(&effect).and_then(|a| a.binding)
    }

    /// Find the effect assigned to a given slot, for reporting.
    pub fn effect_for_slot(&self, slot: EvidenceSlot) -> Option<EffectId> {
        self.entries
            .iter()
            .find(|(_, a)| a.slot == slot)
            .map(|(e, _)| *e)
    }

    /// Iterate assignments in layout order.
    pub fn iter(&self) -> impl Iterator<Item = (EffectId, SlotAssignment)> + '_ {
        self.entries.iter().map(|(e, a)| (*e, *a))
    }

    /// Number of assigned effects.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the layout has no assignments.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Seal the layout. The pipeline driver calls this once optimization
    /// completes; slot assignments are immutable from here on.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Whether the layout has been sealed.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }
}

impl Default for EvidenceLayout {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Evidence-Stack Dataflow
// ============================================================================

/// Abstract value for the handler occupying a stack entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbstractHandler {
    /// A single known handler on every path.
    Constant(HandlerId),
    /// Different handlers reach this entry on different paths.
    Partial,
}

impl AbstractHandler {
    /// Lattice meet: conflicting constants collapse.
    pub fn meet(self, other: AbstractHandler) -> AbstractHandler {
        match (self, other) {
            (AbstractHandler::Constant(a), AbstractHandler::Constant(b)) if a == b => self,
            _ => AbstractHandler::Partial,
        }
    }
}

/// One abstract entry of the evidence stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbstractInstall {
    /// The installed effect, when the same on every path.
    pub effect: Option<EffectId>,
    /// The installed handler.
    pub handler: AbstractHandler,
}

impl AbstractInstall {
    fn meet(self, other: AbstractInstall) -> AbstractInstall {
        AbstractInstall {
            effect: if self.effect == other.effect {
                self.effect
            } else {
                None
            },
            handler: self.handler.meet(other.handler),
        }
    }
}

/// Abstract evidence stack: innermost install last.
pub type AbstractStack = Vec<AbstractInstall>;

/// Result of the evidence-stack dataflow for one function.
#[derive(Debug, Clone)]
pub struct EvidenceStacks {
    /// Stack on entry to each reachable block.
    entry: FxHashMap<BasicBlockId, AbstractStack>,
}

/// Install/uninstall scopes failed to balance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackAnalysisError {
    /// A block popped more handlers than were installed.
    Underflow {
        /// The offending block.
        block: BasicBlockId,
    },
    /// Two paths reach a join with different stack heights.
    HeightMismatch {
        /// The join block.
        block: BasicBlockId,
    },
}

impl EvidenceStacks {
    /// Stack on entry to a block, empty for unreachable blocks.
    pub fn on_entry(&self, block: BasicBlockId) -> &[AbstractInstall] {
        self.entry.get(&block).map(|s| s.as_slice()).unwrap_or(&[])
    }

    /// Stack in force at a block's terminator: entry stack with the
    /// block's own statements applied.
    pub fn at_terminator(
        &self,
        func: &crate::ir::FunctionBody,
        block: BasicBlockId,
    ) -> AbstractStack {
        let mut stack = self.entry.get(&block).cloned().unwrap_or_default();
        for stmt in &func.block(block).statements {
            apply_statement(&mut stack, &stmt.kind);
        }
        stack
    }

    /// The innermost handler in force for an effect, if provable.
    ///
    /// Returns `None` when no entry matches, or when an entry of unknown
    /// effect sits above the match (it could shadow the one we found).
    pub fn handler_in_force(stack: &[AbstractInstall], effect: EffectId) -> Option<AbstractHandler> {
        for (depth, entry) in stack.iter().rev().enumerate() {
            match entry.effect {
                Some(e) if e == effect => {
                    // Entries of unknown effect above this one could
                    // shadow it on some path.
                    let above = &stack[stack.len() - depth..];
                    if above.iter().any(|a| a.effect.is_none()) {
                        return Some(AbstractHandler::Partial);
                    }
                    return Some(entry.handler);
                }
                Some(_) => continue,
                None => return Some(AbstractHandler::Partial),
            }
        }
        None
    }
}

fn apply_statement(stack: &mut AbstractStack, kind: &StatementKind) -> bool {
    match kind {
        StatementKind::InstallHandler(install) => {
            stack.push(AbstractInstall {
                effect: Some(install.effect),
                handler: AbstractHandler::Constant(install.handler),
            });
            true
        }
        StatementKind::InstallHandlerGroup(installs) => {
            for install in installs {
                stack.push(AbstractInstall {
                    effect: Some(install.effect),
                    handler: AbstractHandler::Constant(install.handler),
                });
            }
            true
        }
        StatementKind::UninstallHandler { count } => {
            for _ in 0..*count {
                if stack.pop().is_none() {
                    return false;
                }
            }
            true
        }
        StatementKind::Assign(..) | StatementKind::Nop => true,
    }
}

/// Run the evidence-stack dataflow over a function.
///
/// `incoming` seeds the entry block's stack; pass an empty slice for a
/// function analyzed in isolation. Fails if scopes unbalance, which the
/// validator reports as E0403.
pub fn analyze_evidence_stacks(
    func: &crate::ir::FunctionBody,
    incoming: &[AbstractInstall],
) -> Result<EvidenceStacks, StackAnalysisError> {
    let mut entry: FxHashMap<BasicBlockId, AbstractStack> = FxHashMap::default();
    if func.blocks.is_empty() {
        return Ok(EvidenceStacks { entry });
    }

    entry.insert(BasicBlockId::ENTRY, incoming.to_vec());
    let mut worklist = vec![BasicBlockId::ENTRY];

    while let Some(block) = worklist.pop() {
        let mut stack = entry[&block].clone();
        for stmt in &func.block(block).statements {
            if !apply_statement(&mut stack, &stmt.kind) {
                return Err(StackAnalysisError::Underflow { block });
            }
        }
        for succ in func.block(block).successors() {
            match entry.get_mut(&succ) {
                None => {
                    entry.insert(succ, stack.clone());
                    worklist.push(succ);
                }
                Some(existing) => {
                    if existing.len() != stack.len() {
                        return Err(StackAnalysisError::HeightMismatch { block: succ });
                    }
                    let mut changed = false;
                    for (old, new) in existing.iter_mut().zip(stack.iter()) {
                        let met = old.meet(*new);
                        if met != *old {
                            *old = met;
                            changed = true;
                        }
                    }
                    if changed {
                        worklist.push(succ);
                    }
                }
            }
        }
    }

    Ok(EvidenceStacks { entry })
}
