// SPDX-License-Identifier: BSD-3-Clause
//! Shape properties and end-to-end scenarios of the reaching-definitions
//! graph builder, driven through a hash-map points-to oracle.

use std::collections::{BTreeSet, HashMap};

use yarg::ir::{Intrinsic, Module, Opcode, ValueId};
use yarg::{
    BuildError, Builder, BuiltGraph, DefSite, NodeId, NodeKind, Offset, Options, Pointer,
    PointsToOracle, PointsToSet, UNKNOWN_MEMORY,
};

// ------------------------------------------------------------------
// Helpers

#[derive(Default)]
struct FakeOracle {
    points_to: HashMap<ValueId, PointsToSet>,
    handles: HashMap<ValueId, BTreeSet<ValueId>>,
}

impl FakeOracle {
    fn point(&mut self, v: ValueId, target: ValueId, offset: Offset) {
        self.points_to
            .entry(v)
            .or_default()
            .pointers
            .push(Pointer {
                value: target,
                offset,
            });
    }

    fn point_invalid(&mut self, v: ValueId) {
        self.points_to.entry(v).or_default();
    }

    fn handle(&mut self, v: ValueId, target: ValueId) {
        self.handles.entry(v).or_default().insert(target);
    }
}

impl PointsToOracle for FakeOracle {
    fn points_to(&self, value: ValueId) -> Option<PointsToSet> {
        self.points_to.get(&value).cloned()
    }

    fn handle_points_to(&self, handle: ValueId) -> BTreeSet<ValueId> {
        self.handles.get(&handle).cloned().unwrap_or_default()
    }
}

fn build(module: &Module, oracle: &FakeOracle) -> BuiltGraph {
    match Builder::new(module, oracle, Options::default()).build() {
        Ok(out) => out,
        Err(e) => panic!("{}", e),
    }
}

fn build_with(module: &Module, oracle: &FakeOracle, options: Options) -> BuiltGraph {
    Builder::new(module, oracle, options).build().unwrap()
}

fn call(callee: ValueId, args: Vec<ValueId>) -> Opcode {
    Opcode::Call {
        callee,
        args,
        is_asm: false,
    }
}

fn nodes_of_kind(out: &BuiltGraph, kind: NodeKind) -> Vec<NodeId> {
    out.graph
        .node_ids()
        .filter(|&n| out.graph.node(n).kind() == kind)
        .collect()
}

// ------------------------------------------------------------------
// Scenario S1: two stores into one stack slot

#[test]
fn stores_to_stack_are_strong_updates() {
    let mut m = Module::new();
    let main = m.add_function("main");
    let b = m.add_block(main);
    let x = m.push(main, b, Opcode::Alloca { size: 4 });
    let c1 = m.constant(32, 1);
    let c2 = m.constant(32, 2);
    let s1 = m.push(
        main,
        b,
        Opcode::Store {
            value: c1,
            pointer: x,
            size: 4,
        },
    );
    let s2 = m.push(
        main,
        b,
        Opcode::Store {
            value: c2,
            pointer: x,
            size: 4,
        },
    );
    let ret = m.push(main, b, Opcode::Ret);

    let mut o = FakeOracle::default();
    o.point(x, x, Offset::new(0));

    let out = build(&m, &o);
    let alloc = out.nodes[&x];
    assert_eq!(out.graph.node(alloc).kind(), NodeKind::Alloc);
    assert_eq!(out.graph.node(alloc).size(), Some(Offset::new(4)));

    for s in [s1, s2] {
        let n = out.graph.node(out.nodes[&s]);
        assert_eq!(n.kind(), NodeKind::Store);
        let expected = DefSite::new(alloc, Offset::new(0), Offset::new(4));
        assert_eq!(n.defs(), &[expected]);
        assert!(n.is_strong_update(&expected));
    }

    // The return masks the local.
    let r = out.graph.node(out.nodes[&ret]);
    assert_eq!(
        r.overwrites(),
        &[DefSite::new(alloc, Offset::new(0), Offset::UNKNOWN)]
    );
}

// ------------------------------------------------------------------
// Scenario S2: stores through malloc stay weak

#[test]
fn stores_to_heap_are_weak() {
    let mut m = Module::new();
    let malloc = m.add_function("malloc");
    let malloc_v = m.function_value(malloc);
    let main = m.add_function("main");
    let b = m.add_block(main);
    let c16 = m.constant(64, 16);
    let p = m.push(main, b, call(malloc_v, vec![c16]));
    let c1 = m.constant(32, 1);
    let s1 = m.push(
        main,
        b,
        Opcode::Store {
            value: c1,
            pointer: p,
            size: 4,
        },
    );
    let s2 = m.push(
        main,
        b,
        Opcode::Store {
            value: c1,
            pointer: p,
            size: 4,
        },
    );
    m.push(main, b, Opcode::Ret);

    let mut o = FakeOracle::default();
    o.point(p, p, Offset::new(0));

    let out = build(&m, &o);
    let heap = out.nodes[&p];
    assert_eq!(out.graph.node(heap).kind(), NodeKind::DynAlloc);
    assert_eq!(out.graph.node(heap).size(), Some(Offset::new(16)));

    for s in [s1, s2] {
        let n = out.graph.node(out.nodes[&s]);
        let expected = DefSite::new(heap, Offset::new(0), Offset::new(4));
        assert_eq!(n.defs(), &[expected]);
        assert!(!n.is_strong_update(&expected));
    }
}

#[test]
fn calloc_size_needs_both_constants() {
    let mut m = Module::new();
    let calloc = m.add_function("calloc");
    let calloc_v = m.function_value(calloc);
    let main = m.add_function("main");
    let b = m.add_block(main);
    let c8 = m.constant(64, 8);
    let c4 = m.constant(64, 4);
    let known = m.push(main, b, call(calloc_v, vec![c4, c8]));
    let count = m.push(main, b, Opcode::Other);
    let unknown = m.push(main, b, call(calloc_v, vec![count, c8]));
    m.push(main, b, Opcode::Ret);

    let o = FakeOracle::default();
    let out = build(&m, &o);
    assert_eq!(
        out.graph.node(out.nodes[&known]).size(),
        Some(Offset::new(32))
    );
    assert_eq!(out.graph.node(out.nodes[&unknown]).size(), None);
}

#[test]
fn realloc_defines_itself() {
    let mut m = Module::new();
    let realloc = m.add_function("realloc");
    let realloc_v = m.function_value(realloc);
    let main = m.add_function("main");
    let b = m.add_block(main);
    let p = m.push(main, b, Opcode::Other);
    let c32 = m.constant(64, 32);
    let q = m.push(main, b, call(realloc_v, vec![p, c32]));
    m.push(main, b, Opcode::Ret);

    let o = FakeOracle::default();
    let out = build(&m, &o);
    let node = out.nodes[&q];
    assert_eq!(out.graph.node(node).kind(), NodeKind::DynAlloc);
    assert_eq!(out.graph.node(node).size(), Some(Offset::new(32)));
    // The self-copy def models value preservation and is weak.
    let expected = DefSite::new(node, Offset::new(0), Offset::new(32));
    assert_eq!(out.graph.node(node).defs(), &[expected]);
    assert!(!out.graph.node(node).is_strong_update(&expected));
}

// ------------------------------------------------------------------
// Scenario S3: direct recursion

#[test]
fn direct_recursion_reuses_the_subgraph() {
    let mut m = Module::new();
    let main = m.add_function("main");
    let main_v = m.function_value(main);
    let b = m.add_block(main);
    let rec = m.push(main, b, call(main_v, vec![]));
    m.push(main, b, Opcode::Ret);

    let o = FakeOracle::default();
    let out = build(&m, &o);

    // Exactly one subgraph exists for the function.
    assert_eq!(out.subgraphs.len(), 1);
    let sub = out.subgraphs.values().next().unwrap();

    // The recursive call enters the cached root.
    let call_node = nodes_of_kind(&out, NodeKind::Call)
        .into_iter()
        .find(|&n| out.graph.node(n).successors().contains(&sub.root))
        .expect("no call node entering the recursive subgraph");
    assert_ne!(call_node, sub.root);
    // And the block continues at the call-return node.
    assert_eq!(
        out.graph.node(out.mapping[&rec]).kind(),
        NodeKind::CallReturn
    );
}

// ------------------------------------------------------------------
// Scenario S4: memcpy with a known length

#[test]
fn memcpy_defines_destination_strongly() {
    let mut m = Module::new();
    let memcpy = m.add_function("llvm.memcpy.p0i8.p0i8.i64");
    m.set_intrinsic(memcpy, Intrinsic::Memcpy);
    let memcpy_v = m.function_value(memcpy);

    let main = m.add_function("main");
    let b = m.add_block(main);
    let a = m.push(main, b, Opcode::Alloca { size: 16 });
    let dst = m.push(main, b, Opcode::Other);
    let src = m.push(main, b, Opcode::Other);
    let c8 = m.constant(64, 8);
    let cp = m.push(main, b, call(memcpy_v, vec![dst, src, c8]));
    m.push(main, b, Opcode::Ret);

    let mut o = FakeOracle::default();
    o.point(dst, a, Offset::new(4));

    let out = build(&m, &o);
    let node = out.graph.node(out.nodes[&cp]);
    let expected = DefSite::new(out.nodes[&a], Offset::new(4), Offset::new(8));
    assert_eq!(node.defs(), &[expected]);
    assert!(node.is_strong_update(&expected));
}

#[test]
fn memcpy_with_unknown_length_defines_unknown_range() {
    let mut m = Module::new();
    let memcpy = m.add_function("llvm.memcpy.p0i8.p0i8.i64");
    m.set_intrinsic(memcpy, Intrinsic::Memcpy);
    let memcpy_v = m.function_value(memcpy);

    let main = m.add_function("main");
    let b = m.add_block(main);
    let a = m.push(main, b, Opcode::Alloca { size: 16 });
    let dst = m.push(main, b, Opcode::Other);
    let src = m.push(main, b, Opcode::Other);
    let n = m.push(main, b, Opcode::Other);
    let cp = m.push(main, b, call(memcpy_v, vec![dst, src, n]));
    m.push(main, b, Opcode::Ret);

    let mut o = FakeOracle::default();
    o.point(dst, a, Offset::new(0));

    let out = build(&m, &o);
    let node = out.graph.node(out.nodes[&cp]);
    assert_eq!(
        node.defs(),
        &[DefSite::new(out.nodes[&a], Offset::new(0), Offset::UNKNOWN)]
    );
}

// ------------------------------------------------------------------
// Strong-update rule (property 6)

#[test]
fn multiple_targets_or_unknown_ranges_stay_weak() {
    let mut m = Module::new();
    let main = m.add_function("main");
    let b = m.add_block(main);
    let x = m.push(main, b, Opcode::Alloca { size: 4 });
    let y = m.push(main, b, Opcode::Alloca { size: 4 });
    let c = m.constant(32, 1);
    let p2 = m.push(main, b, Opcode::Other);
    let s_two = m.push(
        main,
        b,
        Opcode::Store {
            value: c,
            pointer: p2,
            size: 4,
        },
    );
    let p_unk = m.push(main, b, Opcode::Other);
    let s_unk = m.push(
        main,
        b,
        Opcode::Store {
            value: c,
            pointer: p_unk,
            size: 4,
        },
    );
    m.push(main, b, Opcode::Ret);

    let mut o = FakeOracle::default();
    o.point(p2, x, Offset::new(0));
    o.point(p2, y, Offset::new(0));
    o.point(p_unk, x, Offset::UNKNOWN);

    let out = build(&m, &o);

    // Two may-targets: both weak.
    let two = out.graph.node(out.nodes[&s_two]);
    assert_eq!(two.defs().len(), 2);
    assert!(two.overwrites().is_empty());

    // Unknown offset forces an unknown length and stays weak.
    let unk = out.graph.node(out.nodes[&s_unk]);
    assert_eq!(
        unk.defs(),
        &[DefSite::new(
            out.nodes[&x],
            Offset::UNKNOWN,
            Offset::UNKNOWN
        )]
    );
    assert!(unk.overwrites().is_empty());
}

#[test]
fn invalid_access_defines_unknown_memory() {
    let mut m = Module::new();
    let main = m.add_function("main");
    let b = m.add_block(main);
    let p = m.push(main, b, Opcode::Other);
    let c = m.constant(32, 1);
    let s = m.push(
        main,
        b,
        Opcode::Store {
            value: c,
            pointer: p,
            size: 4,
        },
    );
    m.push(main, b, Opcode::Ret);

    let mut o = FakeOracle::default();
    o.point_invalid(p);

    let out = build(&m, &o);
    assert_eq!(
        out.graph.node(out.nodes[&s]).defs(),
        &[DefSite::new(UNKNOWN_MEMORY, Offset::UNKNOWN, Offset::UNKNOWN)]
    );
}

// ------------------------------------------------------------------
// Loads

#[test]
fn loads_attach_uses_when_tracked() {
    let mut m = Module::new();
    let main = m.add_function("main");
    let b = m.add_block(main);
    let x = m.push(main, b, Opcode::Alloca { size: 8 });
    let l = m.push(
        main,
        b,
        Opcode::Load {
            pointer: x,
            size: 8,
        },
    );
    m.push(main, b, Opcode::Ret);

    let mut o = FakeOracle::default();
    o.point(x, x, Offset::new(0));

    let out = build(&m, &o);
    let n = out.graph.node(out.nodes[&l]);
    assert_eq!(n.kind(), NodeKind::Load);
    assert_eq!(
        n.uses(),
        &[DefSite::new(out.nodes[&x], Offset::new(0), Offset::new(8))]
    );

    // With use-tracking off, the load produces no node at all.
    let mut opts = Options::default();
    opts.track_uses = false;
    let out = build_with(&m, &o, opts);
    assert!(!out.nodes.contains_key(&l));
    assert!(nodes_of_kind(&out, NodeKind::Load).is_empty());
}

// ------------------------------------------------------------------
// Undefined and modeled calls

#[test]
fn undefined_call_defines_pointer_arguments() {
    let mut m = Module::new();
    let ext = m.add_function("opaque");
    let ext_v = m.function_value(ext);
    let g_mut = m.add_global("state", false);
    let g_const = m.add_global("table", true);
    let main = m.add_function("main");
    let b = m.add_block(main);
    let x = m.push(main, b, Opcode::Alloca { size: 4 });
    let c = m.constant(32, 7);
    let call_i = m.push(main, b, call(ext_v, vec![x, c, g_mut, g_const]));
    m.push(main, b, Opcode::Ret);

    let mut o = FakeOracle::default();
    o.point(x, x, Offset::new(0));
    o.point(g_mut, g_mut, Offset::new(0));
    o.point(g_const, g_const, Offset::new(0));

    let out = build(&m, &o);
    let n = out.graph.node(out.nodes[&call_i]);
    assert_eq!(n.kind(), NodeKind::Call);
    let targets: Vec<NodeId> = n.defs().iter().map(|d| d.target).collect();
    // The alloca and the mutable global may be defined, at unknown
    // offsets; the constant arguments are untouchable.
    assert_eq!(targets, vec![out.nodes[&x], out.nodes[&g_mut]]);
    for d in n.defs() {
        assert!(d.offset.is_unknown() && d.len.is_unknown());
    }
}

#[test]
fn pure_undefined_calls_have_no_effects() {
    let mut m = Module::new();
    let ext = m.add_function("opaque");
    let ext_v = m.function_value(ext);
    let main = m.add_function("main");
    let b = m.add_block(main);
    let x = m.push(main, b, Opcode::Alloca { size: 4 });
    let call_i = m.push(main, b, call(ext_v, vec![x]));
    m.push(main, b, Opcode::Ret);

    let mut o = FakeOracle::default();
    o.point(x, x, Offset::new(0));

    let mut opts = Options::default();
    opts.undefined_are_pure = true;
    let out = build_with(&m, &o, opts);
    assert!(out.graph.node(out.nodes[&call_i]).defs().is_empty());
}

#[test]
fn modeled_call_defines_operand_ranges() {
    let mut m = Module::new();
    let ext = m.add_function("fgets_s");
    let ext_v = m.function_value(ext);
    let main = m.add_function("main");
    let b = m.add_block(main);
    let buf = m.push(main, b, Opcode::Alloca { size: 64 });
    let c24 = m.constant(64, 24);
    let call_i = m.push(main, b, call(ext_v, vec![buf, c24]));
    m.push(main, b, Opcode::Ret);

    let mut o = FakeOracle::default();
    o.point(buf, buf, Offset::new(0));

    let mut opts = Options::default();
    opts.models = yarg::Models::from_json(
        r#"[{
            "name": "fgets_s",
            "defines": [{"from": {"offset": 0}, "to": {"operand": 1}}, null]
        }]"#,
    )
    .unwrap();
    let out = build_with(&m, &o, opts);
    let n = out.graph.node(out.nodes[&call_i]);
    assert_eq!(
        n.defs(),
        &[DefSite::new(out.nodes[&buf], Offset::new(0), Offset::new(24))]
    );
}

// ------------------------------------------------------------------
// Graph shape (property 5) and globals

#[test]
fn graph_shape_holds_across_branches() {
    let mut m = Module::new();
    let main = m.add_function("main");
    let b0 = m.add_block(main);
    let b1 = m.add_block(main);
    let b2 = m.add_block(main);
    let b3 = m.add_block(main);
    let x = m.push(main, b0, Opcode::Alloca { size: 4 });
    let c = m.constant(32, 1);
    m.push(
        main,
        b1,
        Opcode::Store {
            value: c,
            pointer: x,
            size: 4,
        },
    );
    m.push(
        main,
        b2,
        Opcode::Store {
            value: c,
            pointer: x,
            size: 4,
        },
    );
    m.push(main, b3, Opcode::Ret);
    m.set_successors(main, b0, vec![b1, b2]);
    m.set_successors(main, b1, vec![b3]);
    m.set_successors(main, b2, vec![b3]);

    let mut o = FakeOracle::default();
    o.point(x, x, Offset::new(0));

    let out = build(&m, &o);
    let g = &out.graph;
    let preds = g.predecessor_counts();

    // The root has no predecessors.
    assert_eq!(preds[g.root().index()], 0);

    // No block-entry join has more predecessors than CFG predecessors.
    for phi in nodes_of_kind(&out, NodeKind::Phi) {
        assert!(preds[phi.index()] <= 2);
    }

    // Every return feeds the unified ret of its function.
    let sub = out.subgraphs.values().next().unwrap();
    for ret in nodes_of_kind(&out, NodeKind::Return) {
        assert!(g.node(ret).successors().contains(&sub.ret));
    }

    // Everything is reachable from the root.
    let reachable = g.reachable_from(g.root());
    for phi in nodes_of_kind(&out, NodeKind::Phi) {
        assert!(reachable.contains(&phi));
    }
}

#[test]
fn globals_chain_prefixes_the_entry() {
    let mut m = Module::new();
    let g1 = m.add_global("a", false);
    let g2 = m.add_global("b", false);
    let main = m.add_function("main");
    let b = m.add_block(main);
    m.push(main, b, Opcode::Ret);

    let o = FakeOracle::default();
    let out = build(&m, &o);

    let n1 = out.nodes[&g1];
    let n2 = out.nodes[&g2];
    assert_eq!(out.graph.root(), n1);
    assert_eq!(out.graph.node(n1).kind(), NodeKind::Alloc);
    assert_eq!(out.graph.node(n1).successors(), &[n2]);
    let sub = out.subgraphs.values().next().unwrap();
    assert_eq!(out.graph.node(n2).successors(), &[sub.root]);
}

#[test]
fn missing_entry_is_a_fatal_error() {
    let m = Module::new();
    let o = FakeOracle::default();
    let err = Builder::new(&m, &o, Options::default()).build().unwrap_err();
    assert!(matches!(err, BuildError::MissingEntry(name) if name == "main"));
}

// ------------------------------------------------------------------
// Indirect calls

#[test]
fn multi_target_calls_are_bracketed() {
    let mut m = Module::new();
    let f1 = m.add_function("f1");
    let bf1 = m.add_block(f1);
    m.push(f1, bf1, Opcode::Ret);
    let f2 = m.add_function("f2");
    let bf2 = m.add_block(f2);
    m.push(f2, bf2, Opcode::Ret);

    let main = m.add_function("main");
    let b = m.add_block(main);
    let fp = m.push(main, b, Opcode::Other);
    let call_i = m.push(main, b, call(fp, vec![]));
    m.push(main, b, Opcode::Ret);

    let mut o = FakeOracle::default();
    o.point(fp, m.function_value(f1), Offset::new(0));
    o.point(fp, m.function_value(f2), Offset::new(0));

    let out = build(&m, &o);

    // The call site owns a synthetic CALL node fanning out to both
    // subgraphs, and the block resumes at a single CALL_RETURN.
    let bracket = out.nodes[&call_i];
    assert_eq!(out.graph.node(bracket).kind(), NodeKind::Call);
    let sub1 = out.subgraphs[&f1];
    let sub2 = out.subgraphs[&f2];
    let succs = out.graph.node(bracket).successors();
    assert_eq!(succs.len(), 2);
    let join = out.mapping[&call_i];
    assert_eq!(out.graph.node(join).kind(), NodeKind::CallReturn);
    for entry in succs {
        // Each branch goes through its own CALL dummy into a subgraph and
        // back to the shared join.
        assert!(
            out.graph.node(*entry).successors().contains(&sub1.root)
                || out.graph.node(*entry).successors().contains(&sub2.root)
        );
    }
}

// ------------------------------------------------------------------
// Fork/join (property 8)

fn thread_module() -> (Module, ValueId, ValueId, ValueId, yarg::ir::FunctionId) {
    let mut m = Module::new();
    let create = m.add_function("pthread_create");
    let create_v = m.function_value(create);
    let join = m.add_function("pthread_join");
    let join_v = m.function_value(join);

    let worker = m.add_function("worker");
    let wb = m.add_block(worker);
    m.push(worker, wb, Opcode::Ret);
    let worker_v = m.function_value(worker);

    let main = m.add_function("main");
    let b = m.add_block(main);
    let h = m.push(main, b, Opcode::Alloca { size: 8 });
    let c0 = m.constant(64, 0);
    let fork_i = m.push(main, b, call(create_v, vec![h, c0, worker_v, c0]));
    let hv = m.push(main, b, Opcode::Other);
    let join_i = m.push(main, b, call(join_v, vec![hv, c0]));
    m.push(main, b, Opcode::Ret);

    (m, h, fork_i, join_i, worker)
}

#[test]
fn matching_fork_and_join_are_connected() {
    let (m, h, fork_i, join_i, worker) = thread_module();
    let mut o = FakeOracle::default();
    o.handle(h, h);
    let hv = match m.value(join_i) {
        yarg::ir::Value::Instruction {
            opcode: Opcode::Call { args, .. },
            ..
        } => args[0],
        _ => unreachable!(),
    };
    o.handle(hv, h);

    let out = build(&m, &o);
    let sub = out.subgraphs[&worker];
    let join_node = out.nodes[&join_i];
    assert!(out.graph.node(sub.ret).successors().contains(&join_node));

    // The fork edge is asynchronous: the thread root hangs off the linear
    // flow without consuming it.
    let preds = out.graph.predecessor_counts();
    assert!(preds[sub.root.index()] >= 1);
    assert_eq!(out.mapping[&fork_i], out.mapping[&h]);
}

#[test]
fn disjoint_handles_are_not_connected() {
    let (m, h, _fork_i, join_i, worker) = thread_module();
    let mut o = FakeOracle::default();
    o.handle(h, h);
    let hv = match m.value(join_i) {
        yarg::ir::Value::Instruction {
            opcode: Opcode::Call { args, .. },
            ..
        } => args[0],
        _ => unreachable!(),
    };
    // The join waits on different memory.
    o.handle(hv, hv);

    let out = build(&m, &o);
    let sub = out.subgraphs[&worker];
    let join_node = out.nodes[&join_i];
    assert!(!out.graph.node(sub.ret).successors().contains(&join_node));
}
