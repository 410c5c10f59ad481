// SPDX-License-Identifier: BSD-3-Clause
//! The value-relations store: program values mapped onto buckets of the
//! relation graph, with constant shortcuts and inter-store transfer.
//!
//! The store keeps two mappings, `val → bucket` (1:1) and `bucket → {vals}`
//! (1:many, possibly empty). Buckets with an empty value set are
//! *placeholders*: anonymous program values, typically the abstract pointee
//! of a known pointer. Mutations funnel through the graph, whose merge
//! notifications retarget the value tables, so bucket identities handed out
//! earlier keep resolving.

use std::collections::{BTreeMap, BTreeSet};

use crate::ir::ValueId;
use crate::relations::graph::{AddResult, Bucket, RelationsGraph};
use crate::relations::{RelationType, Relations};

/// An integer constant together with its bit width.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Int {
    pub bits: u32,
    pub value: u64,
}

impl Int {
    pub const fn new(bits: u32, value: u64) -> Self {
        Int { bits, value }
    }

    /// The sign-extended value.
    pub fn sext(self) -> i64 {
        if self.bits == 0 || self.bits >= 64 {
            return self.value as i64;
        }
        let shift = 64 - self.bits;
        ((self.value << shift) as i64) >> shift
    }
}

/// A value the store can hold: an instruction result, a function argument
/// (distinguished because inter-store correspondence matches against
/// arguments), or an integer constant.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Val {
    Inst(ValueId),
    Arg(ValueId),
    Const(Int),
}

impl Val {
    pub const fn constant(bits: u32, value: u64) -> Val {
        Val::Const(Int::new(bits, value))
    }

    #[inline]
    pub fn as_const(self) -> Option<Int> {
        match self {
            Val::Const(c) => Some(c),
            _ => None,
        }
    }

    #[inline]
    pub fn is_arg(self) -> bool {
        matches!(self, Val::Arg(_))
    }
}

/// Compare two constants. A 1-bit value compared against a wider one
/// yields the empty set; otherwise the sign-extended values decide.
pub fn compare(lt: Int, rt: Int) -> Relations {
    if (lt.bits == 1 || rt.bits == 1) && lt.bits != rt.bits {
        return Relations::new();
    }
    let l = lt.sext();
    let r = rt.sext();
    let result = match l.cmp(&r) {
        std::cmp::Ordering::Less => Relations::new().slt(),
        std::cmp::Ordering::Greater => Relations::new().sgt(),
        std::cmp::Ordering::Equal => Relations::new().eq(),
    };
    result.add_implied()
}

fn compare_has(lt: Int, rel: RelationType, rt: Int) -> bool {
    compare(lt, rt).has(rel)
}

fn compare_any(lt: Int, rels: Relations, rt: Int) -> bool {
    compare(lt, rt).any_common(rels)
}

#[derive(Clone, Debug, Default)]
pub struct ValueRelations {
    graph: RelationsGraph,
    val_to_bucket: BTreeMap<Val, Bucket>,
    bucket_to_vals: BTreeMap<Bucket, BTreeSet<Val>>,
    changed: bool,
}

impl ValueRelations {
    pub fn new() -> Self {
        ValueRelations::default()
    }

    pub fn holds_any_relations(&self) -> bool {
        !self.val_to_bucket.is_empty() && !self.graph.is_empty()
    }

    /// Whether any mutation happened since the flag was last taken. Client
    /// fixpoint loops poll this.
    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn take_changed(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }

    fn update_changed(&mut self, ch: bool) {
        self.changed |= ch;
    }

    /// Fold a graph mutation result into the value tables: merged-away
    /// buckets donate their values to the survivor.
    fn apply(&mut self, res: &AddResult) {
        self.update_changed(res.changed);
        for (to, from) in &res.merges {
            let vals = self.bucket_to_vals.remove(from).unwrap_or_default();
            let target = self.bucket_to_vals.entry(*to).or_default();
            for val in vals {
                target.insert(val);
                self.val_to_bucket.insert(val, *to);
            }
        }
    }

    // ------------------------------------------------------------------
    // Lookup

    pub fn maybe_get(&self, val: Val) -> Option<Bucket> {
        self.val_to_bucket.get(&val).copied()
    }

    /// The bucket of `val`, allocating one if absent. A freshly inserted
    /// constant is wired into the existing constant lattice.
    pub fn get(&mut self, val: Val) -> Bucket {
        if let Some(h) = self.maybe_get(val) {
            return h;
        }
        let h = self.graph.new_bucket();
        self.add(val, h)
    }

    /// The equal-set of a bucket.
    pub fn get_equal_bucket(&self, h: Bucket) -> &BTreeSet<Val> {
        let h = self.graph.resolve(h);
        self.bucket_to_vals
            .get(&h)
            .expect("bucket without a value table entry")
    }

    /// The values known equal to `val`; a value absent from the store is
    /// equal only to itself.
    pub fn get_equal(&self, val: Val) -> BTreeSet<Val> {
        match self.maybe_get(val) {
            Some(h) => self.get_equal_bucket(h).clone(),
            None => BTreeSet::from([val]),
        }
    }

    /// Some value of the bucket's equal-set. Panics on placeholders, which
    /// by definition have none.
    pub fn get_any(&self, h: Bucket) -> Val {
        *self
            .get_equal_bucket(h)
            .iter()
            .next()
            .expect("placeholder bucket has no values")
    }

    pub fn get_any_const(&self, h: Bucket) -> Option<Int> {
        self.get_equal_bucket(h)
            .iter()
            .find_map(|v| v.as_const())
    }

    /// Values directly related to `val` by an edge labeled in `rels`.
    pub fn get_directly_related(&self, val: Val, rels: Relations) -> Vec<Val> {
        let Some(h) = self.maybe_get(val) else {
            return Vec::new();
        };
        self.graph
            .get_related(h, rels, true)
            .keys()
            .map(|b| self.get_any(*b))
            .collect()
    }

    fn get_related_val(&self, val: Val, rels: Relations) -> BTreeMap<Bucket, Relations> {
        match self.maybe_get(val) {
            Some(h) => self.graph.get_related(h, rels, false),
            None => BTreeMap::new(),
        }
    }

    // ------------------------------------------------------------------
    // Binding

    fn bind(&mut self, val: Val, h: Bucket) {
        let h = self.graph.resolve(h);
        if let Some(old) = self.val_to_bucket.get(&val).copied() {
            if old == h {
                return;
            }
            if let Some(set) = self.bucket_to_vals.get_mut(&old) {
                set.remove(&val);
            }
        }
        self.val_to_bucket.insert(val, h);
        self.bucket_to_vals.entry(h).or_default().insert(val);
        self.update_changed(true);
    }

    /// Bind `val` to `h` and, for a constant, relate the bucket to every
    /// other constant-bearing bucket so constants form a densely related
    /// lattice. Returns the final (possibly merged) bucket of `val`.
    pub fn add(&mut self, val: Val, h: Bucket) -> Bucket {
        self.bind(val, h);
        let h = self.graph.resolve(h);

        let Some(c) = val.as_const() else {
            return h;
        };

        let others: Vec<(Bucket, Int)> = self
            .bucket_to_vals
            .iter()
            .filter(|(b, vals)| **b != h && !vals.is_empty())
            .filter_map(|(b, _)| self.get_any_const(*b).map(|c| (*b, c)))
            .collect();

        for (other_h, other_c) in others {
            if compare_has(c, RelationType::Eq, other_c) {
                let res = self.graph.add_relation(h, RelationType::Eq, other_h);
                self.apply(&res);
                return self.val_to_bucket[&val];
            }
            for t in [
                RelationType::Slt,
                RelationType::Ult,
                RelationType::Sgt,
                RelationType::Ugt,
            ] {
                if compare_has(c, t, other_c) {
                    let res = self.graph.add_relation(h, t, other_h);
                    self.apply(&res);
                }
            }
        }

        self.val_to_bucket[&val]
    }

    /// Ensure `lhs R rhs` holds. Returns whether the store changed.
    pub fn set(&mut self, lhs: Val, rel: RelationType, rhs: Val) -> bool {
        let h1 = self.get(lhs);
        let h2 = self.get(rhs);
        self.set_buckets(h1, rel, h2)
    }

    /// Bucket-level variant of [`set`](Self::set), used where one side is
    /// a placeholder and therefore has no value to name it by.
    pub fn set_buckets(&mut self, h1: Bucket, rel: RelationType, h2: Bucket) -> bool {
        let res = self.graph.add_relation(h1, rel, h2);
        let changed = res.changed;
        self.apply(&res);
        changed
    }

    pub fn has_conflicting_relation(&self, lhs: Val, rel: RelationType, rhs: Val) -> bool {
        match (self.maybe_get(lhs), self.maybe_get(rhs)) {
            (Some(h1), Some(h2)) => self.graph.have_conflicting_relation(h1, rel, h2),
            _ => false,
        }
    }

    // ------------------------------------------------------------------
    // Queries

    /// The full relation set known between two operands, each independently
    /// a stored value or a bare constant.
    pub fn between(&self, lhs: Val, rhs: Val) -> Relations {
        if lhs == rhs {
            return Relations::new().eq().add_implied();
        }
        if let Some(hl) = self.maybe_get(lhs) {
            if let Some(hr) = self.maybe_get(rhs) {
                return self.between_buckets(hl, hr);
            }
            if let Some(c) = rhs.as_const() {
                return self.between_bucket_const(hl, c);
            }
            return Relations::new();
        }
        if let Some(hr) = self.maybe_get(rhs) {
            if let Some(c) = lhs.as_const() {
                return self.between_bucket_const(hr, c).invert();
            }
            return Relations::new();
        }
        match (lhs.as_const(), rhs.as_const()) {
            (Some(a), Some(b)) => compare(a, b),
            _ => Relations::new(),
        }
    }

    fn between_buckets(&self, lt: Bucket, rt: Bucket) -> Relations {
        let rt = self.graph.resolve(rt);
        self.graph
            .get_related(lt, Relations::all(), false)
            .get(&rt)
            .copied()
            .unwrap_or_default()
    }

    /// Relate a stored bucket to a bare constant through the bucket's
    /// constant bounds: `lt ≤ bound ≤ c` (or the mirrored chain) composes
    /// into a relation between `lt` and `c`.
    fn between_bucket_const(&self, lt: Bucket, c: Int) -> Relations {
        for rel in [
            RelationType::Sle,
            RelationType::Ule,
            RelationType::Sge,
            RelationType::Uge,
        ] {
            let filter = Relations::new().set(rel);
            let Some((bound, rels_lt)) = self.get_bound_bucket(lt, filter) else {
                continue;
            };
            let rels_bound = compare(bound, c);
            if rels_bound.has(rel) {
                return rels_lt.compose(rels_bound);
            }
        }
        Relations::new()
    }

    /// The tightest constant related to `h` under `filter`, with the
    /// composed relation that actually holds towards it.
    pub fn get_bound_bucket(&self, h: Bucket, filter: Relations) -> Option<(Int, Relations)> {
        let related = self.graph.get_related(h, filter, false);
        let mut result: Option<(Int, Relations)> = None;
        for (bucket, rels) in related {
            let Some(c) = self.get_any_const(bucket) else {
                continue;
            };
            match result {
                Some((best, _)) if !compare_any(c, filter, best) => {}
                _ => result = Some((c, rels)),
            }
        }
        result
    }

    pub fn get_bound(&self, val: Val, filter: Relations) -> Option<(Int, Relations)> {
        match self.maybe_get(val) {
            Some(h) => self.get_bound_bucket(h, filter),
            None => val
                .as_const()
                .map(|c| (c, Relations::new().eq().add_implied())),
        }
    }

    /// The greatest constant known to be `≤ val`.
    pub fn get_lesser_equal_bound(&self, val: Val) -> Option<Int> {
        self.get_bound(val, Relations::new().sge()).map(|b| b.0)
    }

    /// The least constant known to be `≥ val`.
    pub fn get_greater_equal_bound(&self, val: Val) -> Option<Int> {
        self.get_bound(val, Relations::new().sle()).map(|b| b.0)
    }

    /// The equal-set of the bucket `from` points to, if a `PT` edge exists.
    pub fn get_vals_by_ptr(&self, from: Val) -> BTreeSet<Val> {
        let Some(h) = self.maybe_get(from) else {
            return BTreeSet::new();
        };
        let Some(to) = self.graph.pt_successor(h) else {
            return BTreeSet::new();
        };
        self.get_equal_bucket(to).clone()
    }

    // ------------------------------------------------------------------
    // Placeholders

    /// A fresh bucket with an empty equal-set.
    pub fn new_placeholder_bucket(&mut self) -> Bucket {
        let h = self.graph.new_bucket();
        self.bucket_to_vals.insert(h, BTreeSet::new());
        h
    }

    /// Only legal while the equal-set is empty.
    pub fn erase_placeholder_bucket(&mut self, h: Bucket) {
        let h = self.graph.resolve(h);
        let vals = self.bucket_to_vals.remove(&h);
        debug_assert!(vals.map(|v| v.is_empty()).unwrap_or(true));
        self.graph.erase(h);
    }

    // ------------------------------------------------------------------
    // Inter-store correspondence

    /// The best local counterpart of `other_h`, a bucket of `other`.
    /// Returns `None` when the values equal to `other_h` are bound to
    /// distinct local buckets whose fusion a conflicting relation forbids.
    pub fn get_corresponding(&mut self, other: &Self, other_h: Bucket) -> Option<Bucket> {
        let other_equal = other.get_equal_bucket(other_h).clone();
        self.get_corresponding_impl(other, other_h, &other_equal)
    }

    fn get_corresponding_impl(
        &mut self,
        other: &Self,
        other_h: Bucket,
        other_equal: &BTreeSet<Val>,
    ) -> Option<Bucket> {
        if other_equal.is_empty() {
            // A placeholder in `other`. If something points to it, mirror
            // the pointer structure locally; otherwise try to find a
            // pre-existing border placeholder with the same argument
            // relations before conjuring a fresh one.
            let Some(other_from) = other.graph.pf_successor(other_h) else {
                let border = self.get_corresponding_border(other, other_h);
                return Some(border.unwrap_or_else(|| self.new_placeholder_bucket()));
            };
            let this_from = self.get_corresponding(other, other_from)?;
            let h = self.new_placeholder_bucket();
            let res = self.graph.add_relation(this_from, RelationType::Pt, h);
            self.apply(&res);
            return Some(self.graph.resolve(h));
        }

        // Find the unique local bucket for all values equal in `other`,
        // fusing distinct ones when no conflict forbids it.
        let mut m_h: Option<Bucket> = None;
        for val in other_equal {
            let o_h = self.maybe_get(*val);
            match (m_h, o_h) {
                (None, Some(o)) => m_h = Some(o),
                (Some(m), Some(o)) if o != m => {
                    if self.graph.have_conflicting_relation(o, RelationType::Eq, m) {
                        return None;
                    }
                    self.set_buckets(o, RelationType::Eq, m);
                    m_h = self.maybe_get(*val);
                    debug_assert!(m_h.is_some());
                }
                _ => {}
            }
        }

        match m_h {
            Some(m) => Some(m),
            None => {
                let any = *other_equal.iter().next().unwrap();
                let b = self.graph.new_bucket();
                Some(self.add(any, b))
            }
        }
    }

    /// Locate a local placeholder equivalent to `other_h` by matching its
    /// ordered relations to function arguments. Two distinct matches mean
    /// the correspondence is ambiguous and none is returned.
    fn get_corresponding_border(&self, other: &Self, other_h: Bucket) -> Option<Bucket> {
        let mut result: Option<Bucket> = None;
        let ordering = Relations::new().sle().sge();
        for (other_rel_h, other_rels) in other.graph.get_related(other_h, ordering, false) {
            if other_rels.has(RelationType::Eq) {
                continue;
            }
            let Some(arg) = other
                .get_equal_bucket(other_rel_h)
                .iter()
                .copied()
                .find(|v| v.is_arg())
            else {
                continue;
            };
            for (this_rel_h, _) in self.get_related_val(arg, other_rels.invert()) {
                if self.get_equal_bucket(this_rel_h).is_empty()
                    && !self
                        .graph
                        .has_any_relation(this_rel_h, Relations::new().pf())
                {
                    match result {
                        Some(r) if r != this_rel_h => return None,
                        _ => result = Some(this_rel_h),
                    }
                }
            }
        }
        result
    }

    /// Correspondence plus value import: every value equal to `other_h` in
    /// `other` becomes equal to the local counterpart.
    pub fn get_and_merge(&mut self, other: &Self, other_h: Bucket) -> Option<Bucket> {
        let other_equal = other.get_equal_bucket(other_h).clone();
        let this_h = self.get_corresponding_impl(other, other_h, &other_equal)?;

        for val in other_equal {
            self.add(val, this_h);
        }
        Some(self.graph.resolve(this_h))
    }

    /// Import every edge of `other` whose label is in `filter`. `EQ` edges
    /// towards placeholders are skipped (merging anonymous buckets across
    /// stores would be spurious). Conflicting edges are skipped and make
    /// the result `false`; the rest is still applied.
    pub fn merge(&mut self, other: &Self, filter: Relations) -> bool {
        let mut no_conflict = true;
        let edges: Vec<_> = other.graph.edges().collect();
        for edge in edges {
            if !filter.has(edge.rel) {
                continue;
            }
            if edge.rel == RelationType::Eq && other.get_equal_bucket(edge.to).is_empty() {
                continue;
            }

            let this_to = self.get_and_merge(other, edge.to);
            let this_from = self.get_corresponding(other, edge.from);
            let (Some(to), Some(from)) = (this_to, this_from) else {
                no_conflict = false;
                continue;
            };

            if self.graph.have_conflicting_relation(from, edge.rel, to) {
                no_conflict = false;
            } else {
                self.set_buckets(from, edge.rel, to);
            }
        }
        no_conflict
    }
}
