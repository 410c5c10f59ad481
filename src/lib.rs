// SPDX-License-Identifier: BSD-3-Clause
//! Yet another reaching-definitions graph.
//!
//! Two engines for dependence-based reasoning over low-level programs:
//!
//! - the reaching-definitions graph builder ([`analysis::reaching`]): from
//!   a module of functions, blocks, and instructions plus an external
//!   points-to oracle, a directed graph of definition nodes whose edges
//!   follow control flow and whose nodes carry def-sites, overwrites, and
//!   uses;
//! - the value-relations store ([`relations`]): a union-find-with-partial-
//!   order over program values, supporting relation queries, constant
//!   bounds, and merging at control-flow joins.
//!
//! IR parsing, the points-to analysis, the slicer, and any output format
//! are external collaborators; their contracts live in [`ir`],
//! [`pointsto`], and [`model`].

pub mod analysis;
pub mod ir;
pub mod model;
pub mod offset;
pub mod pointsto;
pub mod rd;
pub mod relations;

pub use analysis::reaching::{BuildError, Builder, BuiltGraph, Subgraph};
pub use model::{AllocKind, ByteRange, FunctionModel, ModelOffset, Models, Options};
pub use offset::Offset;
pub use pointsto::{Pointer, PointsToOracle, PointsToSet};
pub use rd::{DefSite, NodeId, NodeKind, RdGraph, RdNode, UNKNOWN_MEMORY};
pub use relations::graph::{Bucket, RelationsGraph};
pub use relations::store::{Int, Val, ValueRelations};
pub use relations::{RelationType, Relations};
