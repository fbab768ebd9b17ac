//! The in-memory projection of the index.

mod tree;

pub use tree::{ProjectedEntry, ProjectionTree};
