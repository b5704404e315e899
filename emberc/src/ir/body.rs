//! # Function Bodies
//!
//! [`FunctionBody`] is the unit the pipeline operates on: the block graph,
//! the locals, the declared effect set, and the function's evidence
//! layout. Graph utilities (predecessors, reverse postorder, dominators)
//! live here because every pass needs them.

use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;

use crate::effects::decl::EffectId;
use crate::effects::evidence::EvidenceLayout;
use crate::ir::types::{
    BasicBlockData, BasicBlockId, Local, LocalId, Statement, Terminator, Ty,
};
use crate::span::Span;

/// A function body in the effect-annotated IR.
///
/// Local 0 is the return slot; locals `1..=param_count` are parameters,
/// in order. The evidence-vector handle is threaded as an ordinary
/// parameter by the front end, never as ambient state, so the layout
/// records only slot assignments, not a global.
#[derive(Debug, Clone, Serialize)]
pub struct FunctionBody {
    /// Function name, for diagnostics and reports.
    pub name: String,
    /// Number of parameters (locals `1..=param_count`).
    pub param_count: u32,
    /// All locals, including the return slot and parameters.
    pub locals: Vec<Local>,
    /// Basic blocks; `blocks[0]` is the entry.
    pub blocks: Vec<BasicBlockData>,
    /// Effects this function may perform, from the front end.
    pub effect_set: Vec<EffectId>,
    /// Per-function evidence slot assignment.
    pub evidence: EvidenceLayout,
    /// Span of the function definition.
    pub span: Span,
}

impl FunctionBody {
    /// Create an empty function body with a return slot of the given type.
    pub fn new(name: impl Into<String>, return_ty: Ty) -> Self {
        Self {
            name: name.into(),
            param_count: 0,
            locals: vec![Local::named(return_ty, "ret")],
            blocks: Vec::new(),
            effect_set: Vec::new(),
            evidence: EvidenceLayout::new(),
            span: Span::dummy(),
        }
    }

    /// Add a local and return its id.
    pub fn new_local(&mut self, local: Local) -> LocalId {
        let id = LocalId(self.locals.len() as u32);
        self.locals.push(local);
        id
    }

    /// Add an empty block and return its id.
    pub fn new_block(&mut self) -> BasicBlockId {
        let id = BasicBlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlockData::new());
        id
    }

    /// Access a block.
    pub fn block(&self, id: BasicBlockId) -> &BasicBlockData {
        &self.blocks[id.index()]
    }

    /// Access a block mutably.
    pub fn block_mut(&mut self, id: BasicBlockId) -> &mut BasicBlockData {
        &mut self.blocks[id.index()]
    }

    /// Push a statement onto a block.
    pub fn push_statement(&mut self, block: BasicBlockId, stmt: Statement) {
        self.blocks[block.index()].statements.push(stmt);
    }

    /// Set a block's terminator.
    pub fn terminate(&mut self, block: BasicBlockId, terminator: Terminator) {
        self.blocks[block.index()].terminator = Some(terminator);
    }

    /// Iterate block ids in definition order.
    pub fn block_ids(&self) -> impl Iterator<Item = BasicBlockId> {
        (0..self.blocks.len() as u32).map(BasicBlockId)
    }

    /// Blocks reachable from the entry.
    pub fn reachable_blocks(&self) -> FxHashSet<BasicBlockId> {
        let mut seen = FxHashSet::default();
        if self.blocks.is_empty() {
            return seen;
        }
        let mut stack = vec![BasicBlockId::ENTRY];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            for succ in self.block(id).successors() {
                stack.push(succ);
            }
        }
        seen
    }

    /// Predecessor map over all blocks.
    pub fn predecessors(&self) -> FxHashMap<BasicBlockId, Vec<BasicBlockId>> {
        let mut preds: FxHashMap<BasicBlockId, Vec<BasicBlockId>> = FxHashMap::default();
        for id in self.block_ids() {
            for succ in self.block(id).successors() {
                preds.entry(succ).or_default().push(id);
            }
        }
        preds
    }

    /// Reverse postorder over reachable blocks, entry first.
    pub fn reverse_postorder(&self) -> Vec<BasicBlockId> {
        let mut visited = FxHashSet::default();
        let mut postorder = Vec::new();
        if self.blocks.is_empty() {
            return postorder;
        }
        // Iterative DFS with an explicit phase marker to emit postorder.
        let mut stack = vec![(BasicBlockId::ENTRY, false)];
        while let Some((id, processed)) = stack.pop() {
            if processed {
                postorder.push(id);
                continue;
            }
            if !visited.insert(id) {
                continue;
            }
            stack.push((id, true));
            for succ in self.block(id).successors() {
                if !visited.contains(&succ) {
                    stack.push((succ, false));
                }
            }
        }
        postorder.reverse();
        postorder
    }

    /// Compute immediate dominators over reachable blocks.
    pub fn dominators(&self) -> Dominators {
        Dominators::compute(self)
    }

    /// Whether any reachable block lies on a cycle.
    ///
    /// Used by the async specializer: a suspension point inside a cycle is
    /// not statically enumerable.
    pub fn blocks_in_cycles(&self) -> FxHashSet<BasicBlockId> {
        // A block is in a cycle iff it can reach itself. Reachable sets are
        // small here; the quadratic walk is fine at this IR's scale.
        let mut result = FxHashSet::default();
        for start in self.reachable_blocks() {
            let mut seen = FxHashSet::default();
            let mut stack: Vec<BasicBlockId> = self.block(start).successors();
            while let Some(id) = stack.pop() {
                if id == start {
                    result.insert(start);
                    break;
                }
                if seen.insert(id) {
                    stack.extend(self.block(id).successors());
                }
            }
        }
        result
    }

    /// Stable textual rendering, used for debugging and the idempotence
    /// comparison in tests.
    pub fn render(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let _ = writeln!(out, "fn {}({} params) {{", self.name, self.param_count);
        for (i, local) in self.locals.iter().enumerate() {
            let name = local.name.as_deref().unwrap_or("_");
            let _ = writeln!(out, "  let _{i}: {:?} // {name}", local.ty);
        }
        for id in self.block_ids() {
            let block = self.block(id);
            let _ = writeln!(out, "  {id}: {{");
            for stmt in &block.statements {
                let _ = writeln!(out, "    {:?}", stmt.kind);
            }
            match &block.terminator {
                Some(term) => {
                    let _ = writeln!(out, "    {:?}", term.kind);
                }
                None => {
                    let _ = writeln!(out, "    <unterminated>");
                }
            }
            let _ = writeln!(out, "  }}");
        }
        let _ = writeln!(out, "}}");
        out
    }
}

/// A module: the set of function bodies compiled together.
///
/// [`FuncId`]s index into `functions`; sibling functions compile
/// independently, so a failure in one never blocks the others.
///
/// [`FuncId`]: crate::ir::types::FuncId
#[derive(Debug, Clone, Default, Serialize)]
pub struct Module {
    /// All function bodies, indexed by [`crate::ir::types::FuncId`].
    pub functions: Vec<FunctionBody>,
    /// Functions callable from outside the module. Their incoming
    /// evidence is unknowable, so propagation never promotes their slots.
    pub exported: Vec<crate::ir::types::FuncId>,
}

impl Module {
    /// Create an empty module.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a function, returning its id.
    pub fn add_function(&mut self, func: FunctionBody) -> crate::ir::types::FuncId {
        let id = crate::ir::types::FuncId(self.functions.len() as u32);
        self.functions.push(func);
        id
    }

    /// Access a function.
    pub fn func(&self, id: crate::ir::types::FuncId) -> &FunctionBody {
        &self.functions[id.0 as usize]
    }

    /// Access a function mutably.
    pub fn func_mut(&mut self, id: crate::ir::types::FuncId) -> &mut FunctionBody {
        &mut self.functions[id.0 as usize]
    }

    /// Iterate function ids in definition order.
    pub fn func_ids(&self) -> impl Iterator<Item = crate::ir::types::FuncId> {
        (0..self.functions.len() as u32).map(crate::ir::types::FuncId)
    }

    /// Whether a function is externally callable.
    pub fn is_exported(&self, id: crate::ir::types::FuncId) -> bool {
        self.exported.contains(&id)
    }
}

/// Immediate-dominator tree for a function body.
///
/// Cooper–Harvey–Kennedy iterative algorithm over reverse postorder.
#[derive(Debug, Clone)]
pub struct Dominators {
    /// Immediate dominator per block, `None` for the entry and
    /// unreachable blocks.
    idom: FxHashMap<BasicBlockId, BasicBlockId>,
    /// Reverse-postorder number per block, used for intersection.
    rpo_number: FxHashMap<BasicBlockId, usize>,
}

impl Dominators {
    fn compute(body: &FunctionBody) -> Self {
        let rpo = body.reverse_postorder();
        let rpo_number: FxHashMap<BasicBlockId, usize> =
            rpo.iter().enumerate().map(|(i, b)| (*b, i)).collect();
        let preds = body.predecessors();

        let mut idom: FxHashMap<BasicBlockId, BasicBlockId> = FxHashMap::default();
        if rpo.is_empty() {
            return Self { idom, rpo_number };
        }
        idom.insert(BasicBlockId::ENTRY, BasicBlockId::ENTRY);

        let intersect = |idom: &FxHashMap<BasicBlockId, BasicBlockId>,
                         rpo_number: &FxHashMap<BasicBlockId, usize>,
                         mut a: BasicBlockId,
                         mut b: BasicBlockId| {
            while a != b {
                while rpo_number[&a] > rpo_number[&b] {
                    a = idom[&a];
                }
                while rpo_number[&b] > rpo_number[&a] {
                    b = idom[&b];
                }
            }
            a
        };

        let mut changed = true;
        while changed {
            changed = false;
            for &block in rpo.iter().skip(1) {
                let mut new_idom: Option<BasicBlockId> = None;
                for &pred in preds.get(&block).map(|v| v.as_slice()).unwrap_or(&[]) {
                    if !idom.contains_key(&pred) {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => pred,
                        Some(cur) => intersect(&idom, &rpo_number, pred, cur),
                    });
                }
                if let Some(new_idom) = new_idom {
                    if idom.get(&block) != Some(&new_idom) {
                        idom.insert(block, new_idom);
                        changed = true;
                    }
                }
            }
        }

        Self { idom, rpo_number }
    }

    /// Immediate dominator of a block, `None` for the entry and for
    /// unreachable blocks.
    pub fn immediate(&self, block: BasicBlockId) -> Option<BasicBlockId> {
        if block == BasicBlockId::ENTRY {
            return None;
        }
        self.idom.get(&block).copied()
    }

    /// Whether `dom` dominates `block` (reflexive).
    pub fn dominates(&self, dom: BasicBlockId, block: BasicBlockId) -> bool {
        let mut cur = block;
        loop {
            if cur == dom {
                return true;
            }
            match self.immediate(cur) {
                Some(next) => cur = next,
                None => return false,
            }
        }
    }

    /// Whether an edge `from -> to` is a back edge (target dominates source).
    pub fn is_back_edge(&self, from: BasicBlockId, to: BasicBlockId) -> bool {
        self.rpo_number.contains_key(&from) && self.dominates(to, from)
    }
}
