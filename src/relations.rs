// SPDX-License-Identifier: BSD-3-Clause
//! The algebra of binary relations between program values.
//!
//! Eleven relation tags: equality, the four signed/unsigned ordering pairs,
//! and points-to / pointed-from. A [`Relations`] value is a set of tags,
//! closed on demand under a fixed implication table (`SLT` implies `SLE`,
//! `EQ` implies all four non-strict orderings). The composition table below
//! is the whole of what the value-relations store can infer along a path;
//! the graph traversal in [`graph`](crate::relations::graph) composes edge
//! labels with it.

use std::fmt;

pub mod graph;
pub mod store;

/// A single relation tag.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum RelationType {
    Eq,
    Sle,
    Slt,
    Sge,
    Sgt,
    Ule,
    Ult,
    Uge,
    Ugt,
    Pt,
    Pf,
}

impl RelationType {
    /// All tags, in the fixed order used for deterministic iteration.
    pub const ALL: [RelationType; 11] = [
        RelationType::Eq,
        RelationType::Sle,
        RelationType::Slt,
        RelationType::Sge,
        RelationType::Sgt,
        RelationType::Ule,
        RelationType::Ult,
        RelationType::Uge,
        RelationType::Ugt,
        RelationType::Pt,
        RelationType::Pf,
    ];

    #[inline]
    const fn bit(self) -> u16 {
        1 << self as u16
    }

    /// Swap the direction of the tag: `LT ↔ GT`, `LE ↔ GE`, `PT ↔ PF`;
    /// `EQ` is its own inverse.
    pub const fn inverted(self) -> RelationType {
        match self {
            RelationType::Eq => RelationType::Eq,
            RelationType::Sle => RelationType::Sge,
            RelationType::Slt => RelationType::Sgt,
            RelationType::Sge => RelationType::Sle,
            RelationType::Sgt => RelationType::Slt,
            RelationType::Ule => RelationType::Uge,
            RelationType::Ult => RelationType::Ugt,
            RelationType::Uge => RelationType::Ule,
            RelationType::Ugt => RelationType::Ult,
            RelationType::Pt => RelationType::Pf,
            RelationType::Pf => RelationType::Pt,
        }
    }
}

impl fmt::Display for RelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RelationType::Eq => "EQ",
            RelationType::Sle => "SLE",
            RelationType::Slt => "SLT",
            RelationType::Sge => "SGE",
            RelationType::Sgt => "SGT",
            RelationType::Ule => "ULE",
            RelationType::Ult => "ULT",
            RelationType::Uge => "UGE",
            RelationType::Ugt => "UGT",
            RelationType::Pt => "PT",
            RelationType::Pf => "PF",
        };
        write!(f, "{}", s)
    }
}

/// A set of relation tags.
#[derive(Clone, Copy, Default, Eq, Hash, PartialEq)]
pub struct Relations(u16);

impl Relations {
    #[inline]
    pub const fn new() -> Self {
        Relations(0)
    }

    /// The full set, used as the unrestricted traversal filter.
    pub const fn all() -> Self {
        let mut r = 0u16;
        let mut i = 0;
        while i < RelationType::ALL.len() {
            r |= RelationType::ALL[i].bit();
            i += 1;
        }
        Relations(r)
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn has(self, t: RelationType) -> bool {
        self.0 & t.bit() != 0
    }

    #[inline]
    pub const fn any_common(self, other: Relations) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub const fn set(self, t: RelationType) -> Relations {
        Relations(self.0 | t.bit())
    }

    #[inline]
    pub const fn union(self, other: Relations) -> Relations {
        Relations(self.0 | other.0)
    }

    // Builder-style setters, mirroring the tag names.
    pub const fn eq(self) -> Self {
        self.set(RelationType::Eq)
    }
    pub const fn sle(self) -> Self {
        self.set(RelationType::Sle)
    }
    pub const fn slt(self) -> Self {
        self.set(RelationType::Slt)
    }
    pub const fn sge(self) -> Self {
        self.set(RelationType::Sge)
    }
    pub const fn sgt(self) -> Self {
        self.set(RelationType::Sgt)
    }
    pub const fn ule(self) -> Self {
        self.set(RelationType::Ule)
    }
    pub const fn ult(self) -> Self {
        self.set(RelationType::Ult)
    }
    pub const fn uge(self) -> Self {
        self.set(RelationType::Uge)
    }
    pub const fn ugt(self) -> Self {
        self.set(RelationType::Ugt)
    }
    pub const fn pt(self) -> Self {
        self.set(RelationType::Pt)
    }
    pub const fn pf(self) -> Self {
        self.set(RelationType::Pf)
    }

    /// Iterate the contained tags in the fixed order.
    pub fn iter(self) -> impl Iterator<Item = RelationType> {
        RelationType::ALL.into_iter().filter(move |t| self.has(*t))
    }

    /// Close the set under the implication table: `EQ` implies every
    /// non-strict ordering, each strict ordering implies its non-strict
    /// counterpart. One pass suffices, the table has no chains.
    pub const fn add_implied(self) -> Relations {
        let mut r = self.0;
        if self.has(RelationType::Eq) {
            r |= RelationType::Sle.bit()
                | RelationType::Sge.bit()
                | RelationType::Ule.bit()
                | RelationType::Uge.bit();
        }
        if self.has(RelationType::Slt) {
            r |= RelationType::Sle.bit();
        }
        if self.has(RelationType::Sgt) {
            r |= RelationType::Sge.bit();
        }
        if self.has(RelationType::Ult) {
            r |= RelationType::Ule.bit();
        }
        if self.has(RelationType::Ugt) {
            r |= RelationType::Uge.bit();
        }
        Relations(r)
    }

    /// Invert every tag in the set.
    pub fn invert(self) -> Relations {
        let mut out = Relations::new();
        for t in self.iter() {
            out = out.set(t.inverted());
        }
        out
    }

    /// Relational composition: the relations known to hold between `a` and
    /// `c` given `a R1 b` and `b R2 c`. Union of the per-tag table entries,
    /// closed under implication.
    pub fn compose(self, other: Relations) -> Relations {
        let mut out = Relations::new();
        for t1 in self.iter() {
            for t2 in other.iter() {
                out = out.union(compose_pair(t1, t2));
            }
        }
        out.add_implied()
    }
}

/// The static composition table for a single pair of tags.
///
/// `EQ` is the identity on both sides. Within one signedness family a
/// strict tag composed with any same-direction tag stays strict, and two
/// non-strict tags stay non-strict. Opposite directions, mixed signedness,
/// and the pointer tags compose to nothing (`PT ∘ EQ = PT` is covered by
/// the identity rule).
const fn compose_pair(t1: RelationType, t2: RelationType) -> Relations {
    use RelationType::*;
    match (t1, t2) {
        (Eq, t) | (t, Eq) => Relations::new().set(t),
        (Slt, Slt) | (Slt, Sle) | (Sle, Slt) => Relations::new().slt(),
        (Sle, Sle) => Relations::new().sle(),
        (Sgt, Sgt) | (Sgt, Sge) | (Sge, Sgt) => Relations::new().sgt(),
        (Sge, Sge) => Relations::new().sge(),
        (Ult, Ult) | (Ult, Ule) | (Ule, Ult) => Relations::new().ult(),
        (Ule, Ule) => Relations::new().ule(),
        (Ugt, Ugt) | (Ugt, Uge) | (Uge, Ugt) => Relations::new().ugt(),
        (Uge, Uge) => Relations::new().uge(),
        _ => Relations::new(),
    }
}

/// Whether `existing` (already closed) contradicts adding `added` between
/// the same ordered pair of distinct buckets.
///
/// A strict ordering conflicts with equality and with both tags of the
/// opposite direction in its family; a non-strict ordering conflicts only
/// with the opposite strict one. The pointer tags never conflict here
/// (the at-most-one-`PT`-successor invariant is enforced structurally by
/// the graph).
pub(crate) fn conflicts(existing: Relations, added: Relations) -> bool {
    use RelationType::*;
    let added = added.add_implied();
    for t in added.iter() {
        let bad = match t {
            Eq => Relations::new().slt().sgt().ult().ugt(),
            Slt => Relations::new().eq().sgt().sge(),
            Sle => Relations::new().sgt(),
            Sgt => Relations::new().eq().slt().sle(),
            Sge => Relations::new().slt(),
            Ult => Relations::new().eq().ugt().uge(),
            Ule => Relations::new().ugt(),
            Ugt => Relations::new().eq().ult().ule(),
            Uge => Relations::new().ult(),
            Pt | Pf => Relations::new(),
        };
        if existing.any_common(bad) {
            return true;
        }
    }
    false
}

impl fmt::Debug for Relations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Relations{{{}}}", self)
    }
}

impl fmt::Display for Relations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for t in self.iter() {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{}", t)?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{conflicts, RelationType, Relations};

    #[test]
    fn implied_closure() {
        let r = Relations::new().eq().add_implied();
        for t in [
            RelationType::Sle,
            RelationType::Sge,
            RelationType::Ule,
            RelationType::Uge,
        ] {
            assert!(r.has(t));
        }
        assert!(Relations::new().slt().add_implied().has(RelationType::Sle));
        assert!(Relations::new().ugt().add_implied().has(RelationType::Uge));
        assert!(!Relations::new().pt().add_implied().has(RelationType::Sle));
    }

    #[test]
    fn inversion() {
        let r = Relations::new().slt().ule().pt().invert();
        assert!(r.has(RelationType::Sgt));
        assert!(r.has(RelationType::Uge));
        assert!(r.has(RelationType::Pf));
        assert!(!r.has(RelationType::Slt));
        // EQ is fixed, and inversion is an involution.
        let s = Relations::new().eq().sge();
        assert_eq!(s.invert().invert(), s);
    }

    #[test]
    fn composition() {
        let sle = Relations::new().sle();
        let slt = Relations::new().slt();
        let eq = Relations::new().eq();
        assert!(sle.compose(slt).has(RelationType::Slt));
        assert!(slt.compose(eq).has(RelationType::Slt));
        assert!(eq.compose(Relations::new().pt()).has(RelationType::Pt));
        // Opposite directions compose to nothing.
        assert!(slt.compose(Relations::new().sgt()).is_empty());
        // Mixed signedness composes to nothing.
        assert!(slt.compose(Relations::new().ult()).is_empty());
        // Composition results are closed.
        assert!(sle.compose(slt).has(RelationType::Sle));
    }

    #[test]
    fn conflict_table() {
        let slt = Relations::new().slt();
        assert!(conflicts(slt, Relations::new().sgt()));
        assert!(conflicts(slt, Relations::new().eq()));
        assert!(conflicts(slt, Relations::new().sge()));
        assert!(!conflicts(slt, Relations::new().sle()));
        assert!(!conflicts(slt, Relations::new().ult()));
        assert!(!conflicts(Relations::new().sle(), Relations::new().sge()));
        assert!(!conflicts(Relations::new().pt(), Relations::new().pt()));
    }
}
