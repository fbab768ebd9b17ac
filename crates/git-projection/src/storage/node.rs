//! Projection node types.
//!
//! A node is either a file carrying its blob id and a lazily resolved size, or
//! a folder carrying its sorted children. Size fields use atomics so readers
//! holding only the tree's shared lock can memoize sizes they resolved.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::children::SortedChildren;
use super::index_types::{NodeIndex, OptionNodeIndex};
use super::namepool::NameId;
use crate::object_id::ObjectId;

/// File size that is unknown until first requested.
#[derive(Debug)]
pub struct LazySize(AtomicU64);

impl LazySize {
    const UNKNOWN: u64 = u64::MAX;

    pub fn unknown() -> Self {
        Self(AtomicU64::new(Self::UNKNOWN))
    }

    #[inline]
    pub fn get(&self) -> Option<u64> {
        match self.0.load(Ordering::Acquire) {
            Self::UNKNOWN => None,
            size => Some(size),
        }
    }

    /// Memoizes a resolved size. Racing writers store the same value.
    #[inline]
    pub fn set(&self, size: u64) {
        self.0.store(size.min(Self::UNKNOWN - 1), Ordering::Release);
    }
}

#[derive(Debug)]
pub enum NodeKind {
    File {
        hash: ObjectId,
        size: LazySize,
    },
    Folder {
        children: SortedChildren,
        /// Set once every child file has a known size. Never cleared within a
        /// generation.
        children_have_sizes: AtomicBool,
    },
}

/// A node in the projection arena.
#[derive(Debug)]
pub struct ProjectionNode {
    name: NameId,
    parent: OptionNodeIndex,
    pub kind: NodeKind,
}

impl ProjectionNode {
    pub fn file(name: NameId, parent: OptionNodeIndex, hash: ObjectId) -> Self {
        Self {
            name,
            parent,
            kind: NodeKind::File {
                hash,
                size: LazySize::unknown(),
            },
        }
    }

    pub fn folder(name: NameId, parent: OptionNodeIndex) -> Self {
        Self {
            name,
            parent,
            kind: NodeKind::Folder {
                children: SortedChildren::new(),
                children_have_sizes: AtomicBool::new(false),
            },
        }
    }

    #[inline]
    pub fn name(&self) -> NameId {
        self.name
    }

    #[inline]
    pub fn parent(&self) -> Option<NodeIndex> {
        self.parent.to_option()
    }

    #[inline]
    pub fn is_folder(&self) -> bool {
        matches!(self.kind, NodeKind::Folder { .. })
    }

    #[inline]
    pub fn is_file(&self) -> bool {
        matches!(self.kind, NodeKind::File { .. })
    }

    /// Blob id for files, `None` for folders.
    #[inline]
    pub fn hash(&self) -> Option<ObjectId> {
        match &self.kind {
            NodeKind::File { hash, .. } => Some(*hash),
            NodeKind::Folder { .. } => None,
        }
    }

    /// Memoized size for files, `None` for folders or unresolved files.
    #[inline]
    pub fn size(&self) -> Option<u64> {
        match &self.kind {
            NodeKind::File { size, .. } => size.get(),
            NodeKind::Folder { .. } => None,
        }
    }

    #[inline]
    pub fn children(&self) -> Option<&SortedChildren> {
        match &self.kind {
            NodeKind::Folder { children, .. } => Some(children),
            NodeKind::File { .. } => None,
        }
    }

    #[inline]
    pub fn children_mut(&mut self) -> Option<&mut SortedChildren> {
        match &mut self.kind {
            NodeKind::Folder { children, .. } => Some(children),
            NodeKind::File { .. } => None,
        }
    }

    /// True once every child file of this folder has a memoized size.
    #[inline]
    pub fn children_have_sizes(&self) -> bool {
        match &self.kind {
            NodeKind::Folder {
                children_have_sizes,
                ..
            } => children_have_sizes.load(Ordering::Acquire),
            NodeKind::File { .. } => false,
        }
    }

    pub fn mark_children_have_sizes(&self) {
        if let NodeKind::Folder {
            children_have_sizes,
            ..
        } = &self.kind
        {
            children_have_sizes.store(true, Ordering::Release);
        }
    }
}
