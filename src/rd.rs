// SPDX-License-Identifier: BSD-3-Clause
//! Nodes of the reaching-definitions graph and the graph arena.
//!
//! A node stands for one memory-relevant event: an allocation, a store, a
//! load, a call boundary, a return, or a control-flow dummy (block-entry
//! PHI, CALL/CALL_RETURN bracket, subgraph root/return NOOP). Nodes carry
//! three def-site multisets: `defs` (what the event may write),
//! `overwrites` (definitions it masks), and `uses` (what it may read).
//! Node equality is identity; there is no structural deduplication.

use crate::offset::Offset;

/// Index of a node in its owning [`RdGraph`].
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeId(u32);

impl NodeId {
    /// The arena index, e.g. for indexing [`RdGraph::predecessor_counts`].
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// The distinguished node standing for "any memory". Always present at
/// slot 0 of every graph.
pub const UNKNOWN_MEMORY: NodeId = NodeId(0);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeKind {
    Alloc,
    DynAlloc,
    Store,
    Load,
    Phi,
    Call,
    CallReturn,
    Return,
    Noop,
}

/// A possible memory write: bytes `[offset, offset + len)` of the region
/// represented by `target`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DefSite {
    pub target: NodeId,
    pub offset: Offset,
    pub len: Offset,
}

impl DefSite {
    pub fn new(target: NodeId, offset: Offset, len: Offset) -> Self {
        DefSite {
            target,
            offset,
            len,
        }
    }

    /// A write anywhere into unknown memory.
    pub fn unknown_memory() -> Self {
        DefSite::new(UNKNOWN_MEMORY, Offset::UNKNOWN, Offset::UNKNOWN)
    }
}

#[derive(Clone, Debug)]
pub struct RdNode {
    kind: NodeKind,
    defs: Vec<DefSite>,
    overwrites: Vec<DefSite>,
    uses: Vec<DefSite>,
    successors: Vec<NodeId>,
    size: Option<Offset>,
}

impl RdNode {
    fn new(kind: NodeKind) -> Self {
        RdNode {
            kind,
            defs: Vec::new(),
            overwrites: Vec::new(),
            uses: Vec::new(),
            successors: Vec::new(),
            size: None,
        }
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn defs(&self) -> &[DefSite] {
        &self.defs
    }

    pub fn overwrites(&self) -> &[DefSite] {
        &self.overwrites
    }

    pub fn uses(&self) -> &[DefSite] {
        &self.uses
    }

    pub fn successors(&self) -> &[NodeId] {
        &self.successors
    }

    /// Allocation size, when one was recorded.
    pub fn size(&self) -> Option<Offset> {
        self.size
    }

    /// Whether `ds` was recorded as an overwrite, i.e. a strong update.
    pub fn is_strong_update(&self, ds: &DefSite) -> bool {
        self.overwrites.contains(ds)
    }
}

#[derive(Clone, Debug)]
pub struct RdGraph {
    nodes: Vec<RdNode>,
    root: NodeId,
}

impl Default for RdGraph {
    fn default() -> Self {
        RdGraph::new()
    }
}

impl RdGraph {
    pub fn new() -> Self {
        // Slot 0 is the unknown-memory node.
        RdGraph {
            nodes: vec![RdNode::new(NodeKind::Noop)],
            root: UNKNOWN_MEMORY,
        }
    }

    pub fn add_node(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(RdNode::new(kind));
        id
    }

    pub fn node(&self, id: NodeId) -> &RdNode {
        &self.nodes[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        // The reserved unknown-memory node does not count.
        self.nodes.len() <= 1
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len()).map(|i| NodeId(i as u32))
    }

    pub fn set_root(&mut self, root: NodeId) {
        self.root = root;
    }

    /// Append a control-flow edge. Idempotent; self-loops are a caller bug.
    pub fn add_successor(&mut self, from: NodeId, to: NodeId) {
        assert!(from != to, "tried creating a self-loop");
        let succs = &mut self.nodes[from.0 as usize].successors;
        if !succs.contains(&to) {
            succs.push(to);
        }
    }

    /// Record a definition; a strong update also masks prior definitions
    /// of the same site, so it is recorded as an overwrite too.
    pub fn add_def(&mut self, node: NodeId, ds: DefSite, strong_update: bool) {
        let n = &mut self.nodes[node.0 as usize];
        n.defs.push(ds);
        if strong_update {
            n.overwrites.push(ds);
        }
    }

    pub fn add_overwrite(&mut self, node: NodeId, ds: DefSite) {
        self.nodes[node.0 as usize].overwrites.push(ds);
    }

    pub fn add_use(&mut self, node: NodeId, ds: DefSite) {
        self.nodes[node.0 as usize].uses.push(ds);
    }

    pub fn set_size(&mut self, node: NodeId, size: Offset) {
        self.nodes[node.0 as usize].size = Some(size);
    }

    /// Nodes reachable from `from` along successor edges, in breadth-first
    /// order, `from` included.
    pub fn reachable_from(&self, from: NodeId) -> Vec<NodeId> {
        let mut seen = vec![false; self.nodes.len()];
        let mut queue = std::collections::VecDeque::from([from]);
        let mut out = Vec::new();
        seen[from.0 as usize] = true;
        while let Some(n) = queue.pop_front() {
            out.push(n);
            for &s in self.node(n).successors() {
                if !seen[s.0 as usize] {
                    seen[s.0 as usize] = true;
                    queue.push_back(s);
                }
            }
        }
        out
    }

    /// Predecessor counts for every node, computed on demand; the shape
    /// checks in tests and the dumper want them.
    pub fn predecessor_counts(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.nodes.len()];
        for n in &self.nodes {
            for s in &n.successors {
                counts[s.0 as usize] += 1;
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offset::Offset;

    #[test]
    fn add_successor_is_idempotent() {
        let mut g = RdGraph::new();
        let a = g.add_node(NodeKind::Phi);
        let b = g.add_node(NodeKind::Store);
        g.add_successor(a, b);
        g.add_successor(a, b);
        assert_eq!(g.node(a).successors(), &[b]);
    }

    #[test]
    #[should_panic(expected = "self-loop")]
    fn self_loop_is_rejected() {
        let mut g = RdGraph::new();
        let a = g.add_node(NodeKind::Phi);
        g.add_successor(a, a);
    }

    #[test]
    fn strong_update_records_overwrite() {
        let mut g = RdGraph::new();
        let alloc = g.add_node(NodeKind::Alloc);
        let store = g.add_node(NodeKind::Store);
        let ds = DefSite::new(alloc, Offset::new(0), Offset::new(4));
        g.add_def(store, ds, true);
        assert!(g.node(store).is_strong_update(&ds));
        let weak = g.add_node(NodeKind::Store);
        g.add_def(weak, ds, false);
        assert!(!g.node(weak).is_strong_update(&ds));
    }
}
