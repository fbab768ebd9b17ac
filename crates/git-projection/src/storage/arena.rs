//! NodeArena - typed vector of projection nodes.

use std::ops::{Index, IndexMut};

use super::index_types::NodeIndex;
use super::node::ProjectionNode;

/// Append-only node storage addressed by [`NodeIndex`].
///
/// A generation never removes nodes; the whole arena is cleared when the
/// generation is recycled.
#[derive(Debug, Default)]
pub struct NodeArena {
    nodes: Vec<ProjectionNode>,
}

impl NodeArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an arena sized for an expected number of nodes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity),
        }
    }

    /// Inserts a node, returning its index.
    pub fn insert(&mut self, node: ProjectionNode) -> NodeIndex {
        let index = NodeIndex::new(self.nodes.len());
        self.nodes.push(node);
        index
    }

    #[inline]
    pub fn get(&self, index: NodeIndex) -> Option<&ProjectionNode> {
        self.nodes.get(index.get())
    }

    #[inline]
    pub fn get_mut(&mut self, index: NodeIndex) -> Option<&mut ProjectionNode> {
        self.nodes.get_mut(index.get())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.nodes.capacity()
    }

    /// Drops every node while keeping the allocation.
    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    /// Releases spare capacity.
    pub fn compact(&mut self) {
        self.nodes.shrink_to_fit();
    }

    /// Iterates over all nodes with their indices.
    pub fn iter(&self) -> impl Iterator<Item = (NodeIndex, &ProjectionNode)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (NodeIndex::new(i), node))
    }
}

impl Index<NodeIndex> for NodeArena {
    type Output = ProjectionNode;

    fn index(&self, index: NodeIndex) -> &Self::Output {
        &self.nodes[index.get()]
    }
}

impl IndexMut<NodeIndex> for NodeArena {
    fn index_mut(&mut self, index: NodeIndex) -> &mut Self::Output {
        &mut self.nodes[index.get()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{NamePool, OptionNodeIndex};

    #[test]
    fn arena_basic_operations() {
        let mut pool = NamePool::new();
        let mut arena = NodeArena::with_capacity(4);
        assert!(arena.is_empty());

        let root = arena.insert(ProjectionNode::folder(pool.intern(b""), OptionNodeIndex::none()));
        let child = arena.insert(ProjectionNode::folder(
            pool.intern(b"src"),
            OptionNodeIndex::some(root),
        ));
        assert_eq!(arena.len(), 2);
        assert_eq!(arena[child].parent(), Some(root));
        assert!(arena.get(NodeIndex::new(7)).is_none());

        let capacity = arena.capacity();
        arena.clear();
        assert!(arena.is_empty());
        assert_eq!(arena.capacity(), capacity);
    }
}
