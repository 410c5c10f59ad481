// SPDX-License-Identifier: BSD-3-Clause
//! Reaching-definitions graph construction.
//!
//! The builder walks the module one function at a time, linearizing each
//! basic block into a chain of nodes behind a block-entry PHI dummy, and
//! stitches the chains together along CFG successors. Every function gets
//! a `(root, ret)` NOOP pair; calls enter at the root and leave at the
//! unified return, so interprocedural edges never duplicate the callee.
//! The pair is memoized *before* the body is built, which is what keeps
//! recursive functions from looping the construction.
//!
//! Pointer operands are translated into def-sites through the points-to
//! oracle. Call sites fan out into the full taxonomy: defined callees,
//! function pointers, intrinsics, allocation functions, modeled library
//! routines, thread primitives, and undefined externals.

use std::collections::{HashMap, HashSet};

use tracing::warn;

use crate::ir::{FunctionId, Intrinsic, Module, Opcode, Value, ValueId};
use crate::model::{AllocKind, FunctionModel, ModelOffset, Options};
use crate::offset::Offset;
use crate::pointsto::PointsToOracle;
use crate::rd::{DefSite, NodeId, NodeKind, RdGraph};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("the function '{0}' was not found in the module")]
    MissingEntry(String),
    #[error("no node exists for operand {0:?}")]
    MissingNode(ValueId),
}

/// The `(root, ret)` NOOP pair bracketing a function's subgraph.
#[derive(Clone, Copy, Debug)]
pub struct Subgraph {
    pub root: NodeId,
    pub ret: NodeId,
}

/// Everything construction produces: the graph itself plus the maps the
/// slicer needs to go from instructions to nodes.
#[derive(Debug)]
pub struct BuiltGraph {
    pub graph: RdGraph,
    /// Canonical node per instruction or global.
    pub nodes: HashMap<ValueId, NodeId>,
    /// Last node produced for each instruction; where its reaching
    /// definitions are read off.
    pub mapping: HashMap<ValueId, NodeId>,
    /// Per-function subgraph brackets.
    pub subgraphs: HashMap<FunctionId, Subgraph>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum CallKind {
    Plain,
    CreateThread,
    JoinThread,
}

/// One resolved call target: where control enters and where it comes back.
#[derive(Clone, Copy, Debug)]
struct FunctionCall {
    root: NodeId,
    ret: NodeId,
    kind: CallKind,
}

impl FunctionCall {
    fn plain(node: NodeId) -> Self {
        FunctionCall {
            root: node,
            ret: node,
            kind: CallKind::Plain,
        }
    }
}

pub struct Builder<'a, P> {
    module: &'a Module,
    pta: &'a P,
    options: Options,
    graph: RdGraph,
    /// Canonical node per instruction or global.
    nodes: HashMap<ValueId, NodeId>,
    /// Last node produced for an instruction; where its reaching
    /// definitions are read off.
    mapping: HashMap<ValueId, NodeId>,
    subgraphs: HashMap<FunctionId, Subgraph>,
    fork_calls: Vec<ValueId>,
    join_calls: Vec<ValueId>,
    // Warn-once state; kept per builder so concurrent analyses in one
    // process do not share it.
    warned_inline_asm: bool,
    warned_missing_node: HashSet<ValueId>,
}

impl<'a, P: PointsToOracle> Builder<'a, P> {
    pub fn new(module: &'a Module, pta: &'a P, options: Options) -> Self {
        Builder {
            module,
            pta,
            options,
            graph: RdGraph::new(),
            nodes: HashMap::new(),
            mapping: HashMap::new(),
            subgraphs: HashMap::new(),
            fork_calls: Vec::new(),
            join_calls: Vec::new(),
            warned_inline_asm: false,
            warned_missing_node: HashSet::new(),
        }
    }

    /// Build the whole graph: globals first (nodes may use them as
    /// operands), then the entry function, then fork/join edges.
    pub fn build(mut self) -> Result<BuiltGraph, BuildError> {
        let entry = self
            .module
            .function_by_name(&self.options.entry_function)
            .filter(|f| self.module.function(*f).is_defined())
            .ok_or_else(|| BuildError::MissingEntry(self.options.entry_function.clone()))?;

        let globals = self.build_globals();

        let sub = self.build_function(entry)?;
        let mut root = sub.root;
        if let Some((first, last)) = globals {
            // The globals chain becomes the root of the graph.
            self.graph.add_successor(last, sub.root);
            root = first;
        }
        self.graph.set_root(root);

        self.match_forks_and_joins();

        Ok(BuiltGraph {
            graph: self.graph,
            nodes: self.nodes,
            mapping: self.mapping,
            subgraphs: self.subgraphs,
        })
    }

    /// The node a value stands for, creating it on demand for allocation
    /// sites and calls encountered before their block is built.
    fn get_operand(&mut self, val: ValueId) -> Result<NodeId, BuildError> {
        if let Some(n) = self.nodes.get(&val) {
            return Ok(*n);
        }
        match self.module.value(val) {
            Value::Instruction {
                opcode: Opcode::Alloca { .. },
                ..
            } => Ok(self.create_alloc(val)),
            Value::Instruction {
                opcode: Opcode::Call { .. },
                ..
            } => {
                let calls = self.create_call(val)?;
                Ok(calls[0].ret)
            }
            _ => Err(BuildError::MissingNode(val)),
        }
    }

    // ------------------------------------------------------------------
    // Per-instruction node creation

    fn create_alloc(&mut self, inst: ValueId) -> NodeId {
        let node = self.graph.add_node(NodeKind::Alloc);
        self.nodes.insert(inst, node);
        if let Value::Instruction {
            opcode: Opcode::Alloca { size },
            ..
        } = self.module.value(inst)
        {
            if *size != 0 {
                self.graph.set_size(node, Offset::new(*size));
            }
        }
        node
    }

    fn create_dyn_alloc(&mut self, inst: ValueId, args: &[ValueId], kind: AllocKind) -> NodeId {
        let node = self.graph.add_node(NodeKind::DynAlloc);
        self.nodes.insert(inst, node);

        let module = self.module;
        let size_op = match kind {
            AllocKind::Malloc | AllocKind::Alloca => args.first(),
            AllocKind::Calloc => args.get(1),
            AllocKind::Realloc => unreachable!("realloc has its own construction"),
        };
        let mut size = size_op
            .and_then(|op| module.constant_value(*op))
            .unwrap_or(0);
        if kind == AllocKind::Calloc {
            // calloc's size is the element count times the element size,
            // but only when both are statically known.
            let size2 = args
                .first()
                .and_then(|op| module.constant_value(*op))
                .unwrap_or(0);
            size = if size != 0 && size2 != 0 {
                size.wrapping_mul(size2)
            } else {
                0
            };
        }
        if size != 0 {
            self.graph.set_size(node, Offset::new(size));
        }
        node
    }

    fn create_realloc(&mut self, inst: ValueId, args: &[ValueId]) -> NodeId {
        let node = self.graph.add_node(NodeKind::DynAlloc);
        self.nodes.insert(inst, node);

        let size = match args.get(1).and_then(|op| self.module.constant_value(*op)) {
            Some(s) if s != 0 => {
                self.graph.set_size(node, Offset::new(s));
                Offset::new(s)
            }
            _ => Offset::UNKNOWN,
        };
        // realloc defines itself: it copies the values from the previous
        // memory.
        self.graph
            .add_def(node, DefSite::new(node, Offset::new(0), size), false);
        node
    }

    fn create_store(&mut self, inst: ValueId) -> Result<NodeId, BuildError> {
        let node = self.graph.add_node(NodeKind::Store);
        self.nodes.insert(inst, node);

        let Value::Instruction {
            opcode: Opcode::Store { pointer, size, .. },
            ..
        } = self.module.value(inst)
        else {
            unreachable!("create_store on a non-store");
        };
        let (pointer, size) = (*pointer, *size);
        let size = if size == 0 {
            Offset::UNKNOWN
        } else {
            Offset::new(size)
        };

        let def_sites = self.map_pointers(inst, pointer, size)?;

        // Strong update needs a must-alias: a single def-site with a fully
        // known range. Heap targets are excluded even then, because one
        // dynamic allocation node stands for many run-time cells, and
        // dropping a sibling cell's definitions would be wrong.
        let strong_update = def_sites.len() == 1 && {
            let ds = &def_sites[0];
            ds.offset.is_known()
                && ds.len.is_known()
                && self.graph.node(ds.target).kind() != NodeKind::DynAlloc
        };

        for ds in def_sites {
            self.graph.add_def(node, ds, strong_update);
        }
        Ok(node)
    }

    fn create_load(&mut self, inst: ValueId) -> Result<NodeId, BuildError> {
        let node = self.graph.add_node(NodeKind::Load);
        self.nodes.insert(inst, node);

        let Value::Instruction {
            opcode: Opcode::Load { pointer, size },
            ..
        } = self.module.value(inst)
        else {
            unreachable!("create_load on a non-load");
        };
        let (pointer, size) = (*pointer, *size);
        let size = if size == 0 {
            Offset::UNKNOWN
        } else {
            Offset::new(size)
        };

        for ds in self.map_pointers(inst, pointer, size)? {
            self.graph.add_use(node, ds);
        }
        Ok(node)
    }

    fn create_return(&mut self, f: FunctionId, inst: ValueId) -> Result<NodeId, BuildError> {
        let node = self.graph.add_node(NodeKind::Return);
        self.nodes.insert(inst, node);

        // The return masks definitions of locals whose address never
        // escapes; they must not propagate into callers.
        for alloca in self.module.non_address_taken_allocas(f) {
            let ptr_node = self.get_operand(alloca)?;
            self.graph.add_overwrite(
                node,
                DefSite::new(ptr_node, Offset::new(0), Offset::UNKNOWN),
            );
        }
        Ok(node)
    }

    /// Map the points-to set of `val` to def-sites covering `size` bytes.
    fn map_pointers(
        &mut self,
        where_: ValueId,
        val: ValueId,
        size: Offset,
    ) -> Result<Vec<DefSite>, BuildError> {
        let Some(pts) = self.pta.points_to(val) else {
            warn!(?where_, ?val, "no points-to set for used pointer");
            return Ok(vec![DefSite::unknown_memory()]);
        };
        if pts.is_empty() {
            // Invalid reads and writes end up here, e.g. passing an int
            // where its address was meant. Unknown memory is coarse but
            // sound.
            warn!(?where_, ?val, "empty points-to set for used pointer");
            return Ok(vec![DefSite::unknown_memory()]);
        }

        let mut result = Vec::with_capacity(pts.pointers.len() + 1);
        if pts.unknown {
            result.push(DefSite::unknown_memory());
        }
        for ptr in &pts.pointers {
            if matches!(self.module.value(ptr.value), Value::Function(_)) {
                // Functions are not redefinable.
                continue;
            }
            let target = match self.get_operand(ptr.value) {
                Ok(t) => t,
                Err(BuildError::MissingNode(v)) => {
                    if self.warned_missing_node.insert(v) {
                        warn!(?val, pointee = ?v, "no node created for pointer target");
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };
            // When the offset is unknown, the length is too.
            let len = if ptr.offset.is_unknown() {
                Offset::UNKNOWN
            } else {
                size
            };
            result.push(DefSite::new(target, ptr.offset, len));
        }
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Blocks and functions

    /// Whether a call can affect memory or control flow as far as this
    /// analysis cares: everything except debug intrinsics and intrinsics
    /// without a model.
    fn is_relevant_call(&self, callee: ValueId, is_asm: bool) -> bool {
        if is_asm {
            return true;
        }
        let Value::Function(f) = self.module.value(callee) else {
            // Function-pointer call.
            return true;
        };
        let func = self.module.function(*f);
        if func.is_defined() {
            // Defined functions manipulate pointers and modify the CFG.
            return true;
        }
        if self.options.function_model(&func.name).is_some() {
            return true;
        }
        if self.options.allocation_function(&func.name).is_some() {
            return true;
        }
        if let Some(intrinsic) = func.intrinsic {
            return matches!(
                intrinsic,
                Intrinsic::Memcpy | Intrinsic::Memmove | Intrinsic::Memset | Intrinsic::VaStart
            );
        }
        // Undefined function.
        true
    }

    /// Linearize one block. Returns its entry PHI dummy and last node.
    fn build_block(&mut self, f: FunctionId, block: usize) -> Result<(NodeId, NodeId), BuildError> {
        // The first node is a dummy that acts as a join of the previous
        // blocks, so predecessors have one place to attach.
        let phi = self.graph.add_node(NodeKind::Phi);
        let mut last = phi;

        let instrs = self.module.function(f).blocks[block].instrs.clone();
        for inst in instrs {
            let mut node = self.nodes.get(&inst).copied();
            if node.is_none() {
                match self.module.value(inst) {
                    Value::Instruction { opcode, .. } => match opcode {
                        Opcode::Alloca { .. } => node = Some(self.create_alloc(inst)),
                        Opcode::Store { .. } => node = Some(self.create_store(inst)?),
                        Opcode::Load { .. } => {
                            if self.options.track_uses {
                                node = Some(self.create_load(inst)?);
                            }
                        }
                        Opcode::Ret => node = Some(self.create_return(f, inst)?),
                        Opcode::Call { callee, is_asm, .. } => {
                            if self.is_relevant_call(*callee, *is_asm) {
                                let calls = self.create_call(inst)?;
                                self.connect_calls_to_graph(inst, &calls, &mut last);
                                node = Some(last);
                            }
                        }
                        Opcode::Other => {}
                    },
                    _ => {}
                }
            }

            if let Some(n) = node {
                if last != n {
                    self.graph.add_successor(last, n);
                    last = n;
                }
            }
            // The reaching definitions for this instruction are those of
            // the last node produced so far.
            self.mapping.insert(inst, last);
        }

        Ok((phi, last))
    }

    /// Connect `last` to the built successors of `block`; a successor that
    /// was not built is transparent, so its own successors are connected
    /// instead. Returns the number of edges added.
    fn block_add_successors(
        &mut self,
        built: &[Option<(NodeId, NodeId)>],
        f: FunctionId,
        block: usize,
        last: NodeId,
    ) -> usize {
        let succs = self.module.function(f).blocks[block].succs.clone();
        let mut num = 0;
        for s in succs {
            match built[s] {
                None => num += self.block_add_successors(built, f, s, last),
                Some((first, _)) => {
                    if last != first {
                        self.graph.add_successor(last, first);
                    }
                    num += 1;
                }
            }
        }
        num
    }

    /// Build a function's subgraph. The `(root, ret)` pair is memoized
    /// before any block is built, so recursive calls find it.
    fn build_function(&mut self, f: FunctionId) -> Result<Subgraph, BuildError> {
        let root = self.graph.add_node(NodeKind::Noop);
        let ret = self.graph.add_node(NodeKind::Noop);
        self.subgraphs.insert(f, Subgraph { root, ret });

        let nblocks = self.module.function(f).blocks.len();
        debug_assert!(nblocks > 0, "building an external function");

        let mut built: Vec<Option<(NodeId, NodeId)>> = vec![None; nblocks];
        let mut first = None;
        for b in 0..nblocks {
            let nds = self.build_block(f, b)?;
            built[b] = Some(nds);
            if first.is_none() {
                first = Some(nds.0);
            }
        }

        let first = first.expect("function with no blocks");
        self.graph.add_successor(root, first);

        let mut rets = Vec::new();
        for b in 0..nblocks {
            let Some((_, last)) = built[b] else { continue };
            let succ_num = self.block_add_successors(&built, f, b, last);
            // A block with no successors ends the function; its return
            // node feeds the unified ret.
            if succ_num == 0 && self.graph.node(last).kind() == NodeKind::Return {
                rets.push(last);
            }
        }
        for r in rets {
            self.graph.add_successor(r, ret);
        }

        Ok(Subgraph { root, ret })
    }

    /// Globals form a linear chain of allocation nodes prepended to the
    /// entry function.
    fn build_globals(&mut self) -> Option<(NodeId, NodeId)> {
        let mut first = None;
        let mut prev: Option<NodeId> = None;
        for &g in self.module.globals() {
            let cur = self.graph.add_node(NodeKind::Alloc);
            self.nodes.insert(g, cur);
            match prev {
                Some(p) => self.graph.add_successor(p, cur),
                None => first = Some(cur),
            }
            prev = Some(cur);
        }
        first.map(|f| (f, prev.expect("chain with a first but no last")))
    }

    // ------------------------------------------------------------------
    // Calls

    fn subgraph_for(&mut self, f: FunctionId) -> Result<Subgraph, BuildError> {
        match self.subgraphs.get(&f) {
            Some(sub) => Ok(*sub),
            None => self.build_function(f),
        }
    }

    /// Functions a called operand may point to.
    fn points_to_functions(&self, called: ValueId) -> Vec<FunctionId> {
        let pts = self.pta.points_to(called).unwrap_or_default();
        if pts.pointers.is_empty() {
            warn!(?called, "function pointer with an empty points-to set");
            return Vec::new();
        }
        pts.pointers
            .iter()
            .filter_map(|ptr| match self.module.value(ptr.value) {
                Value::Function(f) => Some(*f),
                _ => None,
            })
            .collect()
    }

    fn call_targets(&self, callee: ValueId) -> Vec<FunctionId> {
        match self.module.value(callee) {
            Value::Function(f) => vec![*f],
            _ => self.points_to_functions(callee),
        }
    }

    fn create_call(&mut self, inst: ValueId) -> Result<Vec<FunctionCall>, BuildError> {
        let Value::Instruction {
            opcode:
                Opcode::Call {
                    callee,
                    args,
                    is_asm,
                },
            ..
        } = self.module.value(inst)
        else {
            unreachable!("create_call on a non-call");
        };
        let (callee, args, is_asm) = (*callee, args.clone(), *is_asm);

        if is_asm {
            if !self.warned_inline_asm {
                warn!("inline assembler found, assuming it may write through every pointer argument");
                self.warned_inline_asm = true;
            }
            let node = self.create_undefined_call(inst, &args)?;
            return Ok(vec![FunctionCall::plain(node)]);
        }

        let functions = self.call_targets(callee);
        self.create_calls_to_functions(&functions, inst, &args)
    }

    fn create_calls_to_functions(
        &mut self,
        functions: &[FunctionId],
        inst: ValueId,
        args: &[ValueId],
    ) -> Result<Vec<FunctionCall>, BuildError> {
        let mut calls = Vec::new();

        for &f in functions {
            let func = self.module.function(f);
            if let Some(model) = self.options.function_model(&func.name).cloned() {
                let node = self.func_from_model(&model, args)?;
                self.nodes.insert(inst, node);
                calls.push(FunctionCall::plain(node));
            } else if !func.is_defined() {
                calls.extend(self.create_calls_to_external(f, inst, args)?);
            } else if !self.module.call_compatible(f, args.len()) {
                // Cannot bind the arguments; treat as undefined.
                let node = self.create_undefined_call(inst, args)?;
                calls.push(FunctionCall::plain(node));
            } else {
                calls.push(self.create_call_to_function(f)?);
            }
        }

        if calls.is_empty() {
            let node = self.create_undefined_call(inst, args)?;
            calls.push(FunctionCall::plain(node));
        }

        Ok(calls)
    }

    /// A call to a defined function enters its memoized subgraph through a
    /// fresh CALL/CALL_RETURN pair.
    fn create_call_to_function(&mut self, f: FunctionId) -> Result<FunctionCall, BuildError> {
        let call = self.graph.add_node(NodeKind::Call);
        let ret = self.graph.add_node(NodeKind::CallReturn);

        let sub = self.subgraph_for(f)?;
        self.graph.add_successor(call, sub.root);
        self.graph.add_successor(sub.ret, ret);

        Ok(FunctionCall {
            root: call,
            ret,
            kind: CallKind::Plain,
        })
    }

    fn create_calls_to_external(
        &mut self,
        f: FunctionId,
        inst: ValueId,
        args: &[ValueId],
    ) -> Result<Vec<FunctionCall>, BuildError> {
        let func = self.module.function(f);
        if let Some(intrinsic) = func.intrinsic {
            let node = self.create_intrinsic_call(inst, args, intrinsic)?;
            return Ok(vec![FunctionCall::plain(node)]);
        }
        if func.name == self.options.thread_create {
            return self.create_thread_create_calls(inst, args);
        }
        if func.name == self.options.thread_join {
            return Ok(vec![self.create_thread_join_call(inst, args)?]);
        }
        let node = match self.options.allocation_function(&func.name) {
            Some(AllocKind::Realloc) => self.create_realloc(inst, args),
            Some(kind) => self.create_dyn_alloc(inst, args, kind),
            None => self.create_undefined_call(inst, args)?,
        };
        Ok(vec![FunctionCall::plain(node)])
    }

    fn create_intrinsic_call(
        &mut self,
        inst: ValueId,
        args: &[ValueId],
        intrinsic: Intrinsic,
    ) -> Result<NodeId, BuildError> {
        let (dest, len_val) = match intrinsic {
            Intrinsic::Memcpy | Intrinsic::Memmove | Intrinsic::Memset => {
                // memcpy/memmove/memset <dest>, <src/val>, <len>
                match (args.first(), args.get(2)) {
                    (Some(d), Some(l)) => (*d, *l),
                    _ => return self.create_undefined_call(inst, args),
                }
            }
            Intrinsic::VaStart => {
                // The va_list site behaves like an allocation that defines
                // itself, so definitions can reach it.
                let node = self.graph.add_node(NodeKind::Call);
                self.graph.add_def(
                    node,
                    DefSite::new(node, Offset::new(0), Offset::UNKNOWN),
                    false,
                );
                self.nodes.insert(inst, node);
                return Ok(node);
            }
            Intrinsic::Dbg | Intrinsic::Other => return self.create_undefined_call(inst, args),
        };

        let node = self.graph.add_node(NodeKind::Call);
        self.nodes.insert(inst, node);

        let Some(pts) = self.pta.points_to(dest) else {
            warn!(?inst, "no points-to information for intrinsic destination");
            return Ok(node);
        };

        let mut len = self
            .module
            .constant_value(len_val)
            .map(Offset::new)
            .unwrap_or(Offset::UNKNOWN);

        if pts.unknown {
            self.graph.add_def(node, DefSite::unknown_memory(), true);
        }
        for ptr in &pts.pointers {
            if matches!(self.module.value(ptr.value), Value::Function(_)) {
                continue;
            }

            let from = if ptr.offset.is_unknown() {
                // Unknown offset, use the whole memory.
                len = Offset::UNKNOWN;
                Offset::UNKNOWN
            } else {
                ptr.offset
            };
            // Do not allow the write to run past the representable range.
            let len = if from.add(len).is_unknown() {
                Offset::UNKNOWN
            } else {
                len
            };

            let target = self.get_operand(ptr.value)?;
            // Intrinsics are one precise operation, so the update is
            // strong for every destination target.
            self.graph
                .add_def(node, DefSite::new(target, from, len), true);
        }

        Ok(node)
    }

    /// A call node whose defs come from the model's per-parameter write
    /// ranges.
    fn func_from_model(
        &mut self,
        model: &FunctionModel,
        args: &[ValueId],
    ) -> Result<NodeId, BuildError> {
        let node = self.graph.add_node(NodeKind::Call);

        for (i, arg) in args.iter().enumerate() {
            let Some(range) = model.defines(i) else {
                continue;
            };
            let Some(pts) = self.pta.points_to(*arg) else {
                warn!(func = %model.name, operand = i, "no points-to set for modeled operand");
                continue;
            };

            let from = self.model_offset(range.from, args);
            let to = self.model_offset(range.to, args);
            let len = to.sub(from);

            for ptr in &pts.pointers {
                if matches!(self.module.value(ptr.value), Value::Function(_)) {
                    continue;
                }
                let target = self.get_operand(ptr.value)?;
                self.graph
                    .add_def(node, DefSite::new(target, from, len), false);
            }
        }

        Ok(node)
    }

    fn model_offset(&self, m: ModelOffset, args: &[ValueId]) -> Offset {
        match m {
            ModelOffset::Offset(o) => Offset::new(o),
            ModelOffset::Operand(i) => args
                .get(i)
                .and_then(|op| self.module.constant_value(*op))
                .map(Offset::new)
                .unwrap_or(Offset::UNKNOWN),
        }
    }

    /// A call about which nothing is known: every non-constant pointer
    /// argument may be written at an unknown offset.
    fn create_undefined_call(
        &mut self,
        inst: ValueId,
        args: &[ValueId],
    ) -> Result<NodeId, BuildError> {
        let node = self.graph.add_node(NodeKind::Call);
        self.nodes.insert(inst, node);

        if self.options.undefined_are_pure {
            return Ok(node);
        }

        for &arg in args {
            match self.module.value(arg) {
                // Constants cannot be redefined, except globals that point
                // to non-constant memory.
                Value::ConstantInt { .. } | Value::Function(_) => continue,
                Value::Global { constant: true, .. } => continue,
                _ => {}
            }
            // No points-to set means the operand is not a pointer; the
            // distinction must come from the analysis, not from types,
            // because of int-to-pointer casts.
            let Some(pts) = self.pta.points_to(arg) else {
                continue;
            };
            for ptr in &pts.pointers {
                if matches!(self.module.value(ptr.value), Value::Function(_)) {
                    // Functions may not be redefined.
                    continue;
                }
                let target = self.get_operand(ptr.value)?;
                self.graph.add_def(
                    node,
                    DefSite::new(target, Offset::UNKNOWN, Offset::UNKNOWN),
                    false,
                );
            }
        }

        Ok(node)
    }

    fn create_thread_create_calls(
        &mut self,
        inst: ValueId,
        args: &[ValueId],
    ) -> Result<Vec<FunctionCall>, BuildError> {
        self.fork_calls.push(inst);

        let Some(&entry_op) = args.get(2) else {
            warn!(?inst, "thread creation without an entry operand");
            return Ok(Vec::new());
        };

        let mut calls = Vec::new();
        for f in self.call_targets(entry_op) {
            if !self.module.function(f).is_defined() {
                warn!(?inst, "thread entry is not a defined function");
                continue;
            }
            let sub = self.subgraph_for(f)?;
            calls.push(FunctionCall {
                root: sub.root,
                ret: sub.ret,
                kind: CallKind::CreateThread,
            });
        }
        Ok(calls)
    }

    fn create_thread_join_call(
        &mut self,
        inst: ValueId,
        args: &[ValueId],
    ) -> Result<FunctionCall, BuildError> {
        self.join_calls.push(inst);
        let node = self.create_undefined_call(inst, args)?;
        Ok(FunctionCall {
            root: node,
            ret: node,
            kind: CallKind::JoinThread,
        })
    }

    /// Stitch resolved call targets into the current block. Thread
    /// creations get an asynchronous edge and do not consume the linear
    /// flow; multiple plain targets are bracketed by a synthetic
    /// CALL/CALL_RETURN pair so the block has a single join.
    fn connect_calls_to_graph(
        &mut self,
        inst: ValueId,
        calls: &[FunctionCall],
        last: &mut NodeId,
    ) {
        let mut plain = Vec::new();
        for call in calls {
            if call.kind == CallKind::CreateThread {
                self.graph.add_successor(*last, call.root);
            } else {
                plain.push(*call);
            }
        }

        if plain.len() > 1 {
            let root = self.graph.add_node(NodeKind::Call);
            let ret = self.graph.add_node(NodeKind::CallReturn);
            self.nodes.insert(inst, root);
            self.graph.add_successor(*last, root);
            for call in &plain {
                self.graph.add_successor(root, call.root);
                self.graph.add_successor(call.ret, ret);
            }
            *last = ret;
        } else if let Some(call) = plain.first() {
            self.graph.add_successor(*last, call.root);
            *last = call.ret;
        }
    }

    // ------------------------------------------------------------------
    // Fork/join edges

    fn call_args(&self, inst: ValueId) -> &'a [ValueId] {
        match self.module.value(inst) {
            Value::Instruction {
                opcode: Opcode::Call { args, .. },
                ..
            } => args,
            _ => &[],
        }
    }

    /// Pair every thread creation with every join whose handle may be the
    /// same memory, and add an edge from the thread entry's return to the
    /// join node.
    fn match_forks_and_joins(&mut self) {
        let forks = self.fork_calls.clone();
        let joins = self.join_calls.clone();

        for &fork in &forks {
            let fork_args = self.call_args(fork);
            let (Some(&fork_handle), Some(&entry_op)) = (fork_args.first(), fork_args.get(2))
            else {
                continue;
            };
            let fork_pt = self.pta.handle_points_to(fork_handle);

            for &join in &joins {
                let Some(&join_handle) = self.call_args(join).first() else {
                    continue;
                };
                let join_pt = self.pta.handle_points_to(join_handle);
                if fork_pt.intersection(&join_pt).next().is_none() {
                    continue;
                }

                let join_node = *self
                    .nodes
                    .get(&join)
                    .expect("join call without a node");
                for f in self.call_targets(entry_op) {
                    let Some(sub) = self.subgraphs.get(&f) else {
                        continue;
                    };
                    self.graph.add_successor(sub.ret, join_node);
                }
            }
        }
    }
}
