use serde::{Deserialize, Serialize};

use crate::object_id::ObjectId;

/// A placeholder the virtualization layer created on disk.
///
/// Files carry the blob id they were created from; folders carry none.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlaceholderRecord {
    pub path: String,
    pub hash: Option<ObjectId>,
}

impl PlaceholderRecord {
    pub fn file(path: impl Into<String>, hash: ObjectId) -> Self {
        Self {
            path: path.into(),
            hash: Some(hash),
        }
    }

    pub fn folder(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            hash: None,
        }
    }

    #[inline]
    pub fn is_folder(&self) -> bool {
        self.hash.is_none()
    }

    /// Case-folded path, the identity of a record in the store.
    pub fn key(&self) -> String {
        path_key(&self.path)
    }
}

/// Case-folded form of a placeholder path.
pub(crate) fn path_key(path: &str) -> String {
    path.trim_matches('/').to_ascii_lowercase()
}

/// Final component of a '/'-separated path.
pub(crate) fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Parent of a '/'-separated path; `None` at the top level.
pub(crate) fn parent_path(path: &str) -> Option<&str> {
    path.rfind('/').map(|sep| &path[..sep])
}
