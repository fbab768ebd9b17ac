//! Sorted child lists for projection folders.

use std::cmp::Ordering;

use thin_vec::ThinVec;

use super::index_types::NodeIndex;

/// Children of a folder, kept in case-insensitive name order.
///
/// Backed by `ThinVec`, so the many empty or tiny folders of a large
/// repository cost a single pointer each. Files and folders interleave by
/// name; the comparison is supplied by the caller because names live in the
/// generation's [`NamePool`](super::NamePool).
#[derive(Debug, Clone, Default)]
#[repr(transparent)]
pub struct SortedChildren {
    indices: ThinVec<NodeIndex>,
}

impl SortedChildren {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.indices.iter().copied()
    }

    #[inline]
    pub fn as_slice(&self) -> &[NodeIndex] {
        &self.indices
    }

    /// Binary-searches for a child.
    ///
    /// `compare` returns the ordering of a child relative to the target.
    pub fn find_by<F>(&self, mut compare: F) -> Option<NodeIndex>
    where
        F: FnMut(NodeIndex) -> Ordering,
    {
        self.indices
            .binary_search_by(|&child| compare(child))
            .ok()
            .map(|pos| self.indices[pos])
    }

    /// Inserts a child in order.
    ///
    /// Returns `Err(existing)` when a child comparing equal is already
    /// present. Index entries arrive mostly sorted, so appending after the
    /// last child is checked before falling back to a binary search.
    pub fn insert_by<F>(&mut self, index: NodeIndex, mut compare: F) -> Result<(), NodeIndex>
    where
        F: FnMut(NodeIndex) -> Ordering,
    {
        match self.indices.last() {
            None => {
                self.indices.push(index);
                return Ok(());
            }
            Some(&last) if compare(last) == Ordering::Less => {
                self.indices.push(index);
                return Ok(());
            }
            Some(_) => {}
        }

        match self.indices.binary_search_by(|&child| compare(child)) {
            Ok(pos) => Err(self.indices[pos]),
            Err(pos) => {
                self.indices.insert(pos, index);
                Ok(())
            }
        }
    }

    pub fn shrink_to_fit(&mut self) {
        self.indices.shrink_to_fit();
    }
}
