// SPDX-License-Identifier: BSD-3-Clause
//! The bucket graph underlying the value-relations store.
//!
//! Buckets are equivalence classes of program values, represented as `u32`
//! indices into an arena. Edges are relation-labeled and stored in both
//! directions (`a -R-> b` always coexists with the inverse `b -R'-> a`).
//! An `EQ` edge
//! between distinct buckets never persists: it merges them, the
//! lower-identity bucket surviving and the other slot turning into a
//! forward pointer. The forward pointers keep previously handed-out bucket
//! identities usable after merges; [`RelationsGraph::resolve`] follows them.

use std::collections::BTreeMap;

use crate::relations::{conflicts, RelationType, Relations};

/// An opaque bucket identity. Stable as long as the bucket is not merged
/// *away*; identities of merged-away buckets keep resolving to their
/// survivor.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Bucket(pub(crate) u32);

#[derive(Clone, Debug)]
enum Slot {
    Live(BTreeMap<Bucket, Relations>),
    Merged(Bucket),
    Erased,
}

/// A single labeled edge, as produced by [`RelationsGraph::edges`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Edge {
    pub from: Bucket,
    pub to: Bucket,
    pub rel: RelationType,
}

/// Outcome of [`RelationsGraph::add_relation`]: whether anything changed,
/// and which buckets were merged away (survivor first) so the owning store
/// can retarget its value tables.
#[derive(Debug, Default)]
pub struct AddResult {
    pub changed: bool,
    pub merges: Vec<(Bucket, Bucket)>,
}

#[derive(Clone, Debug, Default)]
pub struct RelationsGraph {
    slots: Vec<Slot>,
}

impl RelationsGraph {
    pub fn new() -> Self {
        RelationsGraph::default()
    }

    pub fn new_bucket(&mut self) -> Bucket {
        let b = Bucket(self.slots.len() as u32);
        self.slots.push(Slot::Live(BTreeMap::new()));
        b
    }

    /// Follow merge redirections to the surviving bucket.
    pub fn resolve(&self, mut b: Bucket) -> Bucket {
        loop {
            match &self.slots[b.0 as usize] {
                Slot::Merged(next) => b = *next,
                _ => return b,
            }
        }
    }

    pub fn is_live(&self, b: Bucket) -> bool {
        matches!(self.slots[self.resolve(b).0 as usize], Slot::Live(_))
    }

    pub fn is_empty(&self) -> bool {
        !self.slots.iter().any(|s| matches!(s, Slot::Live(_)))
    }

    fn succs(&self, b: Bucket) -> &BTreeMap<Bucket, Relations> {
        match &self.slots[b.0 as usize] {
            Slot::Live(m) => m,
            _ => panic!("bucket {:?} is not live", b),
        }
    }

    fn succs_mut(&mut self, b: Bucket) -> &mut BTreeMap<Bucket, Relations> {
        match &mut self.slots[b.0 as usize] {
            Slot::Live(m) => m,
            _ => panic!("bucket {:?} is not live", b),
        }
    }

    /// The unique `PT` successor, if the bucket points anywhere.
    pub fn pt_successor(&self, b: Bucket) -> Option<Bucket> {
        let b = self.resolve(b);
        self.succs(b)
            .iter()
            .find(|(_, rels)| rels.has(RelationType::Pt))
            .map(|(nbr, _)| *nbr)
    }

    /// A bucket this one is pointed from, i.e. some pointer to `b`. When
    /// several buckets point to `b`, the lowest identity is returned.
    pub fn pf_successor(&self, b: Bucket) -> Option<Bucket> {
        let b = self.resolve(b);
        self.succs(b)
            .iter()
            .find(|(_, rels)| rels.has(RelationType::Pf))
            .map(|(nbr, _)| *nbr)
    }

    /// Whether any of `rels` holds directly on an edge out of `b`.
    pub fn has_any_relation(&self, b: Bucket, rels: Relations) -> bool {
        let b = self.resolve(b);
        self.succs(b).values().any(|r| r.any_common(rels))
    }

    /// Insert `a -R-> b` together with everything `R` implies and the
    /// inverse edges. `EQ` between distinct buckets merges them instead.
    pub fn add_relation(&mut self, a: Bucket, rel: RelationType, b: Bucket) -> AddResult {
        let mut res = AddResult::default();
        let a = self.resolve(a);
        let b = self.resolve(b);

        if rel == RelationType::Eq {
            if a != b {
                self.merge(a, b, &mut res);
            }
            return res;
        }
        if a == b {
            // Non-strict self relations are implicit in self-EQ; strict
            // ones would be contradictions the caller must rule out.
            debug_assert!(!conflicts(Relations::new().eq().add_implied(), Relations::new().set(rel)));
            return res;
        }

        // Keep the at-most-one-PT invariant: a second pointee merges with
        // the existing one.
        if rel == RelationType::Pt {
            if let Some(old) = self.pt_successor(a) {
                if old != b {
                    self.merge(old, b, &mut res);
                }
                let b = self.resolve(b);
                debug_assert_eq!(self.pt_successor(self.resolve(a)), Some(b));
                return res;
            }
        }

        let forward = Relations::new().set(rel).add_implied();
        res.changed |= self.insert_edge(a, b, forward);
        res.changed |= self.insert_edge(b, a, forward.invert());
        res
    }

    fn insert_edge(&mut self, from: Bucket, to: Bucket, rels: Relations) -> bool {
        let entry = self.succs_mut(from).entry(to).or_default();
        let merged = entry.union(rels);
        let changed = merged != *entry;
        *entry = merged;
        changed
    }

    /// Merge `a` and `b`; the lower identity survives. Edges of the
    /// absorbed bucket are retargeted onto the survivor, and every merge
    /// performed (the requested one plus any pointee merges it cascades
    /// into) is reported through `res`.
    fn merge(&mut self, a: Bucket, b: Bucket, res: &mut AddResult) {
        debug_assert!(a != b);
        let (survivor, absorbed) = if a < b { (a, b) } else { (b, a) };

        let edges = std::mem::take(self.succs_mut(absorbed));
        self.slots[absorbed.0 as usize] = Slot::Merged(survivor);
        res.changed = true;
        res.merges.push((survivor, absorbed));

        for (nbr, rels) in edges {
            self.succs_mut(nbr).remove(&absorbed);
            if nbr == survivor {
                // Relations between the merged pair collapse into self-EQ.
                continue;
            }
            self.insert_edge(survivor, nbr, rels);
            self.insert_edge(nbr, survivor, rels.invert());
        }

        // The union may have left the survivor with two pointees.
        let pointees: Vec<Bucket> = self
            .succs(survivor)
            .iter()
            .filter(|(_, rels)| rels.has(RelationType::Pt))
            .map(|(nbr, _)| *nbr)
            .collect();
        if let [first, rest @ ..] = pointees.as_slice() {
            for other in rest {
                let first = self.resolve(*first);
                let other = self.resolve(*other);
                if first != other {
                    self.merge(first, other, res);
                }
            }
        }
    }

    /// True iff a label already present between `a` and `b` contradicts
    /// `rel` under the implication closure. Callers skip the insertion in
    /// that case rather than erroring.
    pub fn have_conflicting_relation(&self, a: Bucket, rel: RelationType, b: Bucket) -> bool {
        let a = self.resolve(a);
        let b = self.resolve(b);
        let existing = if a == b {
            Relations::new().eq().add_implied()
        } else {
            self.succs(a).get(&b).copied().unwrap_or_default()
        };
        conflicts(existing, Relations::new().set(rel))
    }

    /// Every bucket reachable from `h` over edges labeled in `filter`,
    /// mapped to the composed relation along the paths (union over paths,
    /// closed under implication). The traversal saturates, so cycles are
    /// fine. With `direct_only`, only immediate neighbors are visited.
    pub fn get_related(
        &self,
        h: Bucket,
        filter: Relations,
        direct_only: bool,
    ) -> BTreeMap<Bucket, Relations> {
        let h = self.resolve(h);
        let mut result = BTreeMap::new();

        if direct_only {
            for (nbr, rels) in self.succs(h) {
                let mut step = Relations::new();
                for t in rels.iter() {
                    if filter.has(t) {
                        step = step.set(t);
                    }
                }
                if !step.is_empty() {
                    result.insert(*nbr, step.add_implied());
                }
            }
            return result;
        }

        result.insert(h, Relations::new().eq().add_implied());
        let mut work = vec![h];
        while let Some(x) = work.pop() {
            let through = result[&x];
            let nbrs: Vec<(Bucket, Relations)> =
                self.succs(x).iter().map(|(n, r)| (*n, *r)).collect();
            for (nbr, rels) in nbrs {
                for t in rels.iter() {
                    if !filter.has(t) {
                        continue;
                    }
                    let composed = through.compose(Relations::new().set(t));
                    if composed.is_empty() {
                        continue;
                    }
                    let entry = result.entry(nbr).or_default();
                    let widened = entry.union(composed).add_implied();
                    if widened != *entry {
                        *entry = widened;
                        work.push(nbr);
                    }
                }
            }
        }
        result
    }

    /// Remove a bucket from the graph. The owning store must already have
    /// dropped its value bindings.
    pub fn erase(&mut self, h: Bucket) {
        let h = self.resolve(h);
        let edges = std::mem::take(self.succs_mut(h));
        for (nbr, _) in edges {
            if nbr != h {
                self.succs_mut(nbr).remove(&h);
            }
        }
        self.slots[h.0 as usize] = Slot::Erased;
    }

    /// Deterministic edge iteration: for every live bucket, ascending, a
    /// self-`EQ` edge followed by each directed labeled edge. This is the
    /// shape the store-level merge walks.
    pub fn edges(&self) -> impl Iterator<Item = Edge> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| match slot {
                Slot::Live(succs) => Some((Bucket(i as u32), succs)),
                _ => None,
            })
            .flat_map(|(b, succs)| {
                std::iter::once(Edge {
                    from: b,
                    to: b,
                    rel: RelationType::Eq,
                })
                .chain(succs.iter().flat_map(move |(nbr, rels)| {
                    let nbr = *nbr;
                    rels.iter().map(move |rel| Edge {
                        from: b,
                        to: nbr,
                        rel,
                    })
                }))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverse_edges_are_stored() {
        let mut g = RelationsGraph::new();
        let a = g.new_bucket();
        let b = g.new_bucket();
        let res = g.add_relation(a, RelationType::Slt, b);
        assert!(res.changed);
        let back = g.get_related(b, Relations::all(), true);
        assert!(back[&a].has(RelationType::Sgt));
    }

    #[test]
    fn eq_merges_lowest_survives() {
        let mut g = RelationsGraph::new();
        let a = g.new_bucket();
        let b = g.new_bucket();
        let c = g.new_bucket();
        g.add_relation(b, RelationType::Slt, c);
        let res = g.add_relation(a, RelationType::Eq, b);
        assert_eq!(res.merges, vec![(a, b)]);
        assert_eq!(g.resolve(b), a);
        // b's edge moved onto a.
        let related = g.get_related(a, Relations::all(), false);
        assert!(related[&c].has(RelationType::Slt));
    }

    #[test]
    fn second_pt_successor_merges_pointees() {
        let mut g = RelationsGraph::new();
        let p = g.new_bucket();
        let x = g.new_bucket();
        let y = g.new_bucket();
        g.add_relation(p, RelationType::Pt, x);
        let res = g.add_relation(p, RelationType::Pt, y);
        assert_eq!(res.merges, vec![(x, y)]);
        assert_eq!(g.pt_successor(p), Some(x));
    }

    #[test]
    fn related_composes_through_paths() {
        let mut g = RelationsGraph::new();
        let a = g.new_bucket();
        let b = g.new_bucket();
        let c = g.new_bucket();
        g.add_relation(a, RelationType::Sle, b);
        g.add_relation(b, RelationType::Slt, c);
        let related = g.get_related(a, Relations::new().sle().slt(), false);
        assert!(related[&c].has(RelationType::Slt));
        // A filter that matches no label on the first edge stops there.
        let related = g.get_related(a, Relations::new().slt(), false);
        assert!(!related.contains_key(&b));
        assert!(!related.contains_key(&c));
    }

    #[test]
    fn conflict_detection() {
        let mut g = RelationsGraph::new();
        let a = g.new_bucket();
        let b = g.new_bucket();
        g.add_relation(a, RelationType::Slt, b);
        assert!(g.have_conflicting_relation(a, RelationType::Sgt, b));
        assert!(g.have_conflicting_relation(a, RelationType::Eq, b));
        assert!(!g.have_conflicting_relation(a, RelationType::Sle, b));
    }

    #[test]
    fn erase_drops_all_edges() {
        let mut g = RelationsGraph::new();
        let a = g.new_bucket();
        let b = g.new_bucket();
        g.add_relation(a, RelationType::Ult, b);
        g.erase(b);
        assert!(g.get_related(a, Relations::all(), true).is_empty());
        assert!(!g.is_live(b));
    }
}
