use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use crate::error::{ProjectionError, Result};

/// Takes a private copy of the index so git can replace it mid-parse.
///
/// A hard link is tried first. Git writes a new index by renaming over the
/// old one, so the link keeps the old content alive. Linking fails across
/// volumes and on some filesystems, in which case the file is copied.
pub fn snapshot_index(index: &Path, snapshot: &Path) -> Result<()> {
    if let Some(dir) = snapshot.parent() {
        fs::create_dir_all(dir)?;
    }
    match fs::remove_file(snapshot) {
        Err(error) if error.kind() != ErrorKind::NotFound => return Err(error.into()),
        _ => {}
    }

    match fs::hard_link(index, snapshot) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == ErrorKind::NotFound && !index.exists() => {
            Err(ProjectionError::IndexMissing(index.to_path_buf()))
        }
        Err(error) => {
            log::debug!(
                "index hard link failed, copying instead index={} error={}",
                index.display(),
                error
            );
            match fs::copy(index, snapshot) {
                Ok(_) => Ok(()),
                Err(error) if error.kind() == ErrorKind::NotFound => {
                    Err(ProjectionError::IndexMissing(index.to_path_buf()))
                }
                Err(error) => Err(error.into()),
            }
        }
    }
}
