//! Node storage behind `ProjectionTree`.
//!
//! Everything a generation owns lives here and is dropped or recycled with it:
//! nodes in a `NodeArena` linked by `NodeIndex` handles, names in a `NamePool`,
//! and per-folder `SortedChildren` kept in case-folded order.

mod arena;
mod children;
mod index_types;
mod name_order;
mod namepool;
mod node;

pub use arena::NodeArena;
pub use children::SortedChildren;
pub use index_types::{NodeIndex, OptionNodeIndex};
pub use name_order::{compare_names, fold_path_into, names_equal};
pub use namepool::{NameId, NamePool};
pub use node::{LazySize, NodeKind, ProjectionNode};
