//! Projection state and the persisted record of outstanding work.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{ProjectionError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProjectionState {
    /// The published tree reflects the latest index.
    Valid,
    /// The index changed and no rebuild has started yet.
    Invalid,
    /// The background thread is rebuilding.
    Rebuilding,
}

impl ProjectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::Rebuilding => "rebuilding",
        }
    }
}

bitflags! {
    /// Work the background thread still owes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PendingWork: u32 {
        /// Rebuild the tree and reconcile placeholders.
        const PROJECTION = 0x1;
        /// Record entries git materialized as modified paths.
        const MODIFIED_PATHS = 0x2;
    }
}

const MARKER_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Marker {
    version: u32,
    pending: u32,
}

/// Loads the pending work recorded by a previous run.
///
/// A missing marker means nothing is pending. An unreadable one is treated as
/// all work pending.
pub fn load_marker(path: &Path) -> Result<PendingWork> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(PendingWork::empty()),
        Err(error) => return Err(error.into()),
    };
    match postcard::from_bytes::<Marker>(&bytes) {
        Ok(marker) if marker.version == MARKER_VERSION => {
            Ok(PendingWork::from_bits_truncate(marker.pending))
        }
        Ok(marker) => {
            log::warn!(
                "projection marker version mismatch path={} version={}",
                path.display(),
                marker.version
            );
            Ok(PendingWork::all())
        }
        Err(error) => {
            log::warn!(
                "projection marker unreadable path={} error={}",
                path.display(),
                error
            );
            Ok(PendingWork::all())
        }
    }
}

/// Atomically records `pending`. An empty set removes the marker.
pub fn store_marker(path: &Path, pending: PendingWork) -> Result<()> {
    if pending.is_empty() {
        return match fs::remove_file(path) {
            Err(error) if error.kind() != ErrorKind::NotFound => Err(error.into()),
            _ => Ok(()),
        };
    }

    let bytes = postcard::to_stdvec(&Marker {
        version: MARKER_VERSION,
        pending: pending.bits(),
    })
    .map_err(|error| ProjectionError::Serialization(format!("projection marker: {error}")))?;

    let dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(&bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|error| error.error)?;
    Ok(())
}
