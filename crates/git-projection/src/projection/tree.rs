//! ProjectionTree - the in-memory folder hierarchy built from the index.
//!
//! One tree is one generation: it owns its node arena and name pool, is
//! filled by a single parse on the background thread, and is read-only once
//! published. The only state readers change is memoized file sizes and the
//! folder lookup cache, both of which are safe behind a shared reference.

use fnv::FnvHashMap;
use parking_lot::Mutex;

use crate::error::{ProjectionError, Result};
use crate::index::IndexEntry;
use crate::object_id::ObjectId;
use crate::placeholders::SizeResolver;
use crate::storage::{
    compare_names, fold_path_into, NameId, NamePool, NodeArena, NodeIndex, NodeKind,
    OptionNodeIndex, ProjectionNode,
};

/// Folder cache entries kept before the cache is flushed.
const FOLDER_CACHE_LIMIT: usize = 64 * 1024;

/// A child as reported to the virtualization layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectedEntry {
    pub name: String,
    pub is_folder: bool,
    /// Blob id for files.
    pub hash: Option<ObjectId>,
    /// Size for files, 0 for folders.
    pub size: u64,
}

#[derive(Debug)]
pub struct ProjectionTree {
    arena: NodeArena,
    names: NamePool,
    root: NodeIndex,
    files: usize,
    folders: usize,
    generation: u64,
    /// Case-folded folder path to folder node.
    folder_cache: Mutex<FnvHashMap<Box<[u8]>, NodeIndex>>,
}

impl Default for ProjectionTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ProjectionTree {
    /// Creates an empty tree holding only the root folder.
    pub fn new() -> Self {
        let mut names = NamePool::new();
        let mut arena = NodeArena::new();
        let root = arena.insert(ProjectionNode::folder(names.intern(b""), OptionNodeIndex::none()));
        Self {
            arena,
            names,
            root,
            files: 0,
            folders: 0,
            generation: 0,
            folder_cache: Mutex::new(FnvHashMap::default()),
        }
    }

    /// Resets this tree for the next generation, keeping its allocations.
    pub fn recycle(&mut self) {
        self.arena.clear();
        self.names.reset();
        self.folder_cache.get_mut().clear();
        self.root = self
            .arena
            .insert(ProjectionNode::folder(self.names.intern(b""), OptionNodeIndex::none()));
        self.files = 0;
        self.folders = 0;
        self.generation += 1;
    }

    /// Releases spare capacity left over from a larger generation.
    pub fn compact(&mut self) {
        self.arena.compact();
        self.names.compact();
        let cache = self.folder_cache.get_mut();
        cache.clear();
        cache.shrink_to_fit();
    }

    /// Capacity of the node arena, used to decide when to compact.
    pub fn node_capacity(&self) -> usize {
        self.arena.capacity()
    }

    #[inline]
    pub fn root(&self) -> NodeIndex {
        self.root
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    #[inline]
    pub fn node(&self, index: NodeIndex) -> &ProjectionNode {
        &self.arena[index]
    }

    #[inline]
    pub fn name(&self, index: NodeIndex) -> &[u8] {
        self.names.get(self.arena[index].name())
    }

    pub fn file_count(&self) -> usize {
        self.files
    }

    pub fn folder_count(&self) -> usize {
        self.folders
    }

    /// Total nodes including the root.
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files == 0 && self.folders == 0
    }

    // -------------------------------------------------------------------------
    // Build (background thread only, before publication)
    // -------------------------------------------------------------------------

    /// Adds the file described by an index entry, creating parent folders.
    ///
    /// Returns false when a sibling with the same case-insensitive name
    /// already exists.
    pub fn add_index_entry(&mut self, entry: &mut IndexEntry) -> Result<bool> {
        let parent = match entry.cached_parent() {
            Some(parent) => parent,
            None => {
                let parent = self.add_folder_path(entry.parent_path())?;
                entry.set_cached_parent(parent);
                parent
            }
        };
        Ok(self.add_file(parent, entry.file_name(), entry.hash())?.is_some())
    }

    /// Returns the folder at `path`, creating missing folders along the way.
    pub fn add_folder_path(&mut self, path: &[u8]) -> Result<NodeIndex> {
        let mut current = self.root;
        for segment in segments(path) {
            current = self.add_folder(current, segment)?;
        }
        Ok(current)
    }

    /// Returns the child folder `name` of `parent`, creating it if needed.
    pub fn add_folder(&mut self, parent: NodeIndex, name: &[u8]) -> Result<NodeIndex> {
        if let Some(existing) = self.child(parent, name)? {
            if self.arena[existing].is_folder() {
                return Ok(existing);
            }
            return Err(ProjectionError::Corrupt(format!(
                "{:?} is a file but the index has entries beneath it",
                String::from_utf8_lossy(&self.node_path(existing))
            )));
        }
        let name_id = self.names.intern(name);
        let folder = self
            .arena
            .insert(ProjectionNode::folder(name_id, OptionNodeIndex::some(parent)));
        self.link_child(parent, folder, name_id)?;
        self.folders += 1;
        Ok(folder)
    }

    /// Adds a file under `parent`. Returns `None` for a case-insensitive
    /// duplicate, which keeps the first entry.
    pub fn add_file(
        &mut self,
        parent: NodeIndex,
        name: &[u8],
        hash: ObjectId,
    ) -> Result<Option<NodeIndex>> {
        if let Some(existing) = self.child(parent, name)? {
            log::debug!(
                "skipping duplicate projected name {:?} (kept {:?})",
                String::from_utf8_lossy(name),
                String::from_utf8_lossy(self.name(existing))
            );
            return Ok(None);
        }
        let name_id = self.names.intern(name);
        let file = self
            .arena
            .insert(ProjectionNode::file(name_id, OptionNodeIndex::some(parent), hash));
        self.link_child(parent, file, name_id)?;
        self.files += 1;
        Ok(Some(file))
    }

    fn link_child(&mut self, parent: NodeIndex, child: NodeIndex, name: NameId) -> Result<()> {
        let mut children = match self.arena[parent].children_mut() {
            Some(children) => std::mem::take(children),
            None => {
                return Err(ProjectionError::Corrupt(
                    "attempted to add a child to a file".to_string(),
                ))
            }
        };
        let target = self.names.get(name);
        let (arena, names) = (&self.arena, &self.names);
        let inserted =
            children.insert_by(child, |existing| compare_names(names.get(arena[existing].name()), target));
        if let Some(slot) = self.arena[parent].children_mut() {
            *slot = children;
        }
        inserted.map_err(|_| {
            ProjectionError::Corrupt("child inserted twice under the same folder".to_string())
        })
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Finds the child named `name` (case-insensitive) of a folder.
    pub fn child(&self, folder: NodeIndex, name: &[u8]) -> Result<Option<NodeIndex>> {
        let children = self.arena[folder].children().ok_or_else(|| {
            ProjectionError::Corrupt(format!(
                "{:?} is a file, not a folder",
                String::from_utf8_lossy(&self.node_path(folder))
            ))
        })?;
        Ok(children.find_by(|child| compare_names(self.name(child), name)))
    }

    /// Looks up any node by its '/'-separated path. The empty path is the root.
    ///
    /// Passing through a file is a corruption error, not a miss.
    pub fn lookup(&self, path: &[u8]) -> Result<Option<NodeIndex>> {
        let path = trim_separators(path);
        if path.is_empty() {
            return Ok(Some(self.root));
        }
        let (parent, name) = split_parent(path);
        let Some(parent) = self.walk(parent)? else {
            return Ok(None);
        };
        self.child(parent, name)
    }

    /// Looks up a folder by path, consulting the folder cache first.
    /// A file at `path` is reported as `None`.
    pub fn find_folder(&self, path: &[u8]) -> Result<Option<NodeIndex>> {
        Ok(self
            .walk(path)?
            .filter(|&index| self.arena[index].is_folder()))
    }

    fn walk(&self, path: &[u8]) -> Result<Option<NodeIndex>> {
        let path = trim_separators(path);
        if path.is_empty() {
            return Ok(Some(self.root));
        }

        let mut key = Vec::with_capacity(path.len());
        fold_path_into(path, &mut key);
        if let Some(found) = self.folder_cache.lock().get(key.as_slice()) {
            return Ok(Some(*found));
        }

        let mut current = self.root;
        for segment in segments(path) {
            match self.child(current, segment)? {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        if !self.arena[current].is_folder() {
            return Ok(Some(current));
        }

        let mut cache = self.folder_cache.lock();
        if cache.len() >= FOLDER_CACHE_LIMIT {
            cache.clear();
        }
        cache.insert(key.into_boxed_slice(), current);
        Ok(Some(current))
    }

    /// Projected blob id of the file at `path`; `None` if absent or a folder.
    pub fn file_hash(&self, path: &[u8]) -> Result<Option<ObjectId>> {
        Ok(self
            .lookup(path)?
            .and_then(|index| self.arena[index].hash()))
    }

    /// Rebuilds the full path of a node.
    pub fn node_path(&self, index: NodeIndex) -> Vec<u8> {
        let mut segments = Vec::new();
        let mut current = Some(index);
        while let Some(node_index) = current {
            let node = &self.arena[node_index];
            if node.parent().is_some() {
                segments.push(self.names.get(node.name()));
            }
            current = node.parent();
        }
        segments.reverse();
        segments.join(&b'/')
    }

    /// Children of the folder at `path`, in projection order, with sizes.
    ///
    /// Unknown file sizes are resolved through `sizes` and memoized on the
    /// nodes. Returns `None` when no folder exists at `path`.
    pub fn enumerate(
        &self,
        path: &[u8],
        sizes: &SizeResolver<'_>,
    ) -> Result<Option<Vec<ProjectedEntry>>> {
        let Some(folder) = self.find_folder(path)? else {
            return Ok(None);
        };
        self.populate_sizes(folder, sizes)?;
        Ok(Some(self.projected_children(folder)))
    }

    /// Like [`Self::enumerate`] but never resolves sizes: answers only when
    /// every child size is already memoized.
    pub fn enumerate_from_memory(&self, path: &[u8]) -> Result<Option<Vec<ProjectedEntry>>> {
        let Some(folder) = self.find_folder(path)? else {
            return Ok(None);
        };
        if !self.arena[folder].children_have_sizes() {
            return Ok(None);
        }
        Ok(Some(self.projected_children(folder)))
    }

    /// Resolves and memoizes the sizes of a folder's files.
    pub fn populate_sizes(&self, folder: NodeIndex, sizes: &SizeResolver<'_>) -> Result<()> {
        let node = &self.arena[folder];
        if node.children_have_sizes() {
            return Ok(());
        }
        let Some(children) = node.children() else {
            return Err(ProjectionError::Corrupt(
                "size population requested for a file".to_string(),
            ));
        };

        let missing: Vec<ObjectId> = children
            .iter()
            .filter_map(|child| {
                let child = &self.arena[child];
                match &child.kind {
                    NodeKind::File { hash, size } if size.get().is_none() => Some(*hash),
                    _ => None,
                }
            })
            .collect();

        if !missing.is_empty() {
            let resolved = sizes.resolve(&missing);
            for child in children.iter() {
                if let NodeKind::File { hash, size } = &self.arena[child].kind {
                    if let Some(found) = resolved.get(hash) {
                        size.set(found);
                    }
                }
            }
            if !resolved.unavailable.is_empty() {
                return Err(ProjectionError::SizesUnavailable(format!(
                    "{} blob sizes under {:?}",
                    resolved.unavailable.len(),
                    String::from_utf8_lossy(&self.node_path(folder))
                )));
            }
        }

        node.mark_children_have_sizes();
        Ok(())
    }

    /// Size of a single file node, resolving and memoizing it if unknown.
    pub fn file_size(&self, file: NodeIndex, sizes: &SizeResolver<'_>) -> Result<u64> {
        let NodeKind::File { hash, size } = &self.arena[file].kind else {
            return Err(ProjectionError::InvalidInput(format!(
                "{:?} is a folder",
                String::from_utf8_lossy(&self.node_path(file))
            )));
        };
        if let Some(known) = size.get() {
            return Ok(known);
        }
        let resolved = sizes.resolve(std::slice::from_ref(hash));
        match resolved.get(hash) {
            Some(found) => {
                size.set(found);
                Ok(found)
            }
            None => Err(ProjectionError::SizesUnavailable(format!("blob {hash}"))),
        }
    }

    fn projected_children(&self, folder: NodeIndex) -> Vec<ProjectedEntry> {
        let Some(children) = self.arena[folder].children() else {
            return Vec::new();
        };
        children
            .iter()
            .map(|child| {
                let node = &self.arena[child];
                ProjectedEntry {
                    name: String::from_utf8_lossy(self.names.get(node.name())).into_owned(),
                    is_folder: node.is_folder(),
                    hash: node.hash(),
                    size: node.size().unwrap_or(0),
                }
            })
            .collect()
    }

    /// Every file in preorder, as `(path, hash)`.
    pub fn file_entries(&self) -> Vec<(Vec<u8>, ObjectId)> {
        let mut out = Vec::with_capacity(self.files);
        let mut stack = vec![self.root];
        while let Some(index) = stack.pop() {
            let node = &self.arena[index];
            match &node.kind {
                NodeKind::File { hash, .. } => out.push((self.node_path(index), *hash)),
                NodeKind::Folder { children, .. } => {
                    stack.extend(children.as_slice().iter().rev().copied());
                }
            }
        }
        out
    }
}

/// Non-empty '/'-separated segments of a path.
fn segments(path: &[u8]) -> impl Iterator<Item = &[u8]> {
    path.split(|&b| b == b'/').filter(|s| !s.is_empty())
}

fn trim_separators(mut path: &[u8]) -> &[u8] {
    while let [b'/', rest @ ..] = path {
        path = rest;
    }
    while let [rest @ .., b'/'] = path {
        path = rest;
    }
    path
}

/// Splits a trimmed path into parent path and final component.
fn split_parent(path: &[u8]) -> (&[u8], &[u8]) {
    match memchr::memrchr(b'/', path) {
        Some(sep) => (&path[..sep], &path[sep + 1..]),
        None => (&path[..0], path),
    }
}
