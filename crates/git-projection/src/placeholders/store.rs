//! File-backed placeholder list.
//!
//! The list is an append-only log of postcard records framed with COBS, so a
//! zero byte ends every record. Single additions and removals append one
//! frame and flush; a bulk rewrite replaces the whole file atomically through
//! a temp file in the same directory. Loading replays the log in order.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use super::record::{path_key, PlaceholderRecord};
use crate::collaborators::PlaceholderStore;
use crate::error::{ProjectionError, Result};

/// Log format version, written as the first frame.
pub const PLACEHOLDER_LOG_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
enum LogFrame {
    Header { version: u32 },
    Add(PlaceholderRecord),
    Remove(String),
}

#[derive(Debug)]
struct StoreState {
    records: BTreeMap<String, PlaceholderRecord>,
    log: File,
}

#[derive(Debug)]
pub struct FilePlaceholderStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl FilePlaceholderStore {
    /// Opens the log at `path`, creating it if missing.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let records = match fs::read(&path) {
            Ok(mut bytes) => {
                let (records, truncated) = replay(&path, &mut bytes)?;
                if truncated {
                    rewrite(&path, records.values())?;
                }
                records
            }
            Err(error) if error.kind() == ErrorKind::NotFound => {
                rewrite(&path, std::iter::empty())?;
                BTreeMap::new()
            }
            Err(error) => return Err(error.into()),
        };

        let log = OpenOptions::new().append(true).open(&path)?;
        log::debug!(
            "opened placeholder log path={} records={}",
            path.display(),
            records.len()
        );
        Ok(Self {
            path,
            state: Mutex::new(StoreState { records, log }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PlaceholderStore for FilePlaceholderStore {
    fn get_all(&self) -> Result<Vec<PlaceholderRecord>> {
        Ok(self.state.lock().records.values().cloned().collect())
    }

    fn write_all_and_flush(&self, records: &[PlaceholderRecord]) -> Result<()> {
        let mut state = self.state.lock();
        rewrite(&self.path, records.iter())?;
        state.log = OpenOptions::new().append(true).open(&self.path)?;
        state.records = records
            .iter()
            .map(|record| (record.key(), record.clone()))
            .collect();
        Ok(())
    }

    fn add_and_flush(&self, record: PlaceholderRecord) -> Result<()> {
        let mut state = self.state.lock();
        let frame = encode(&LogFrame::Add(record.clone()))?;
        append(&mut state.log, &frame)?;
        state.records.insert(record.key(), record);
        Ok(())
    }

    fn remove_and_flush(&self, path: &str) -> Result<()> {
        let mut state = self.state.lock();
        let key = path_key(path);
        if !state.records.contains_key(&key) {
            return Ok(());
        }
        let frame = encode(&LogFrame::Remove(path.to_string()))?;
        append(&mut state.log, &frame)?;
        state.records.remove(&key);
        Ok(())
    }

    fn count(&self) -> Result<usize> {
        Ok(self.state.lock().records.len())
    }
}

fn encode(frame: &LogFrame) -> Result<Vec<u8>> {
    postcard::to_stdvec_cobs(frame).map_err(|error| {
        ProjectionError::Serialization(format!("failed to encode placeholder record: {error}"))
    })
}

fn append(log: &mut File, frame: &[u8]) -> Result<()> {
    log.write_all(frame)?;
    log.sync_data()?;
    Ok(())
}

/// Writes a fresh log containing `records` and atomically replaces `path`.
fn rewrite<'a>(path: &Path, records: impl Iterator<Item = &'a PlaceholderRecord>) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(&encode(&LogFrame::Header {
        version: PLACEHOLDER_LOG_VERSION,
    })?)?;
    for record in records {
        temp.write_all(&encode(&LogFrame::Add(record.clone()))?)?;
    }
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|error| error.error)?;
    Ok(())
}

/// Rebuilds the record map from a log. Also reports whether the log ended in
/// a partial frame.
fn replay(path: &Path, bytes: &mut [u8]) -> Result<(BTreeMap<String, PlaceholderRecord>, bool)> {
    let mut records = BTreeMap::new();
    let total = bytes.len();
    let mut start = 0;
    let mut first = true;

    while start < total {
        let Some(len) = memchr::memchr(0, &bytes[start..]) else {
            // Interrupted append: the tail never got its terminator.
            log::warn!(
                "ignoring truncated placeholder record path={} offset={}",
                path.display(),
                start
            );
            return Ok((records, true));
        };
        let end = start + len + 1;
        let frame: LogFrame = postcard::from_bytes_cobs(&mut bytes[start..end]).map_err(|error| {
            ProjectionError::Serialization(format!(
                "corrupt placeholder log {} at offset {start}: {error}",
                path.display()
            ))
        })?;
        start = end;

        match frame {
            LogFrame::Header { version } if first => {
                if version != PLACEHOLDER_LOG_VERSION {
                    return Err(ProjectionError::Serialization(format!(
                        "placeholder log {} has version {version}, expected {PLACEHOLDER_LOG_VERSION}",
                        path.display()
                    )));
                }
            }
            LogFrame::Header { .. } => {
                return Err(ProjectionError::Serialization(format!(
                    "placeholder log {} has a header after its first record",
                    path.display()
                )));
            }
            LogFrame::Add(record) => {
                records.insert(record.key(), record);
            }
            LogFrame::Remove(removed) => {
                records.remove(&path_key(&removed));
            }
        }
        first = false;
    }

    Ok((records, false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_id::ObjectId;

    fn id(byte: u8) -> ObjectId {
        ObjectId::from_bytes([byte; 20])
    }

    #[test]
    fn add_remove_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("placeholders.log");

        let store = FilePlaceholderStore::open(&path).unwrap();
        store.add_and_flush(PlaceholderRecord::folder("a")).unwrap();
        store.add_and_flush(PlaceholderRecord::file("a/b.txt", id(1))).unwrap();
        store.add_and_flush(PlaceholderRecord::file("a/c.txt", id(2))).unwrap();
        store.add_and_flush(PlaceholderRecord::file("A/B.txt", id(3))).unwrap();
        store.remove_and_flush("a/C.TXT").unwrap();
        assert_eq!(store.count().unwrap(), 2);
        drop(store);

        let reopened = FilePlaceholderStore::open(&path).unwrap();
        assert_eq!(
            reopened.get_all().unwrap(),
            vec![
                PlaceholderRecord::folder("a"),
                PlaceholderRecord::file("A/B.txt", id(3)),
            ]
        );
    }

    #[test]
    fn write_all_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("placeholders.log");

        let store = FilePlaceholderStore::open(&path).unwrap();
        store.add_and_flush(PlaceholderRecord::file("old.txt", id(1))).unwrap();
        store
            .write_all_and_flush(&[PlaceholderRecord::file("new.txt", id(2))])
            .unwrap();
        store.add_and_flush(PlaceholderRecord::folder("dir")).unwrap();
        drop(store);

        let reopened = FilePlaceholderStore::open(&path).unwrap();
        assert_eq!(
            reopened.get_all().unwrap(),
            vec![
                PlaceholderRecord::folder("dir"),
                PlaceholderRecord::file("new.txt", id(2)),
            ]
        );
    }

    #[test]
    fn truncated_tail_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("placeholders.log");
        {
            let store = FilePlaceholderStore::open(&path).unwrap();
            store.add_and_flush(PlaceholderRecord::file("kept.txt", id(1))).unwrap();
        }
        let mut partial = encode(&LogFrame::Add(PlaceholderRecord::file("lost.txt", id(2)))).unwrap();
        partial.pop();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&partial).unwrap();
        drop(file);

        let reopened = FilePlaceholderStore::open(&path).unwrap();
        assert_eq!(
            reopened.get_all().unwrap(),
            vec![PlaceholderRecord::file("kept.txt", id(1))]
        );

        // The partial frame is dropped so later appends decode cleanly.
        reopened.add_and_flush(PlaceholderRecord::folder("next")).unwrap();
        drop(reopened);
        let again = FilePlaceholderStore::open(&path).unwrap();
        assert_eq!(again.count().unwrap(), 2);
    }

    #[test]
    fn garbage_is_a_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("placeholders.log");
        fs::write(&path, [0xFF, 0xFF, 0xFF, 0x00]).unwrap();
        let error = FilePlaceholderStore::open(&path).unwrap_err();
        assert!(matches!(error, ProjectionError::Serialization(_)));
    }
}
