use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::*;
use crate::collaborators::{PlaceholderStore, ProviderResult};
use crate::index::{IndexWriter, WriterEntry};
use crate::placeholders::SyncOptions;
use crate::testing::{FakeSizes, Fakes, ProviderCall};

const WAIT: Duration = Duration::from_secs(10);

fn id(byte: u8) -> ObjectId {
    ObjectId::from_bytes([byte; 20])
}

struct Fixture {
    _dir: tempfile::TempDir,
    config: ProjectionConfig,
    fakes: Fakes,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = ProjectionConfig::new(dir.path().join("index"), dir.path().join("state"))
            .with_retry_interval(Duration::from_millis(10))
            .with_lock_poll_interval(Duration::from_millis(1))
            .with_sync_options(SyncOptions {
                worker_threads: 2,
                min_items_per_worker: 4,
                size_batch: 16,
            });
        let fakes = Fakes {
            sizes: Arc::new(FakeSizes::all_known(32)),
            ..Fakes::default()
        };
        Self {
            _dir: dir,
            config,
            fakes,
        }
    }

    fn write_index(&self, entries: &[WriterEntry]) {
        let mut writer = IndexWriter::new();
        for entry in entries {
            writer.push(entry.clone());
        }
        writer.write_to(&self.config.index_path).unwrap();
    }

    fn engine(&self) -> GitIndexProjection {
        let engine =
            GitIndexProjection::new(self.config.clone(), self.fakes.collaborators()).unwrap();
        engine.set_fatal_handler(|error| panic!("unexpected fatal error: {error}"));
        engine
    }

    fn started(&self) -> GitIndexProjection {
        let engine = self.engine();
        engine.initialize().unwrap();
        assert!(engine.wait_for_projection_update_timeout(WAIT).unwrap());
        engine
    }
}

fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(1));
    }
}

fn names(entries: &[ProjectedEntry]) -> Vec<&str> {
    entries.iter().map(|e| e.name.as_str()).collect()
}

#[test]
fn initialize_builds_and_serves_projection() {
    let fx = Fixture::new();
    fx.write_index(&[
        WriterEntry::new("a/b.txt", id(1)),
        WriterEntry::new("a/c.txt", id(2)).with_skip_worktree(false),
        WriterEntry::new("readme.md", id(3)),
    ]);
    let engine = fx.started();

    assert_eq!(engine.state(), ProjectionState::Valid);
    assert_eq!(engine.generation(), 1);
    assert_eq!(fx.fakes.provider.cache_clears(), 1);

    let root = engine.get_projected_items("").unwrap().unwrap();
    assert_eq!(names(&root), vec!["a", "readme.md"]);
    let a = engine.get_projected_items("a").unwrap().unwrap();
    assert_eq!(names(&a), vec!["b.txt"]);
    assert_eq!(a[0].size, FakeSizes::known_size(&id(1)));
    assert_eq!(engine.get_projected_items("missing").unwrap(), None);

    assert_eq!(
        engine.is_path_projected("A").unwrap(),
        Some(ProjectedPath {
            name: "a".to_string(),
            is_folder: true
        })
    );
    assert_eq!(engine.is_path_projected("a/c.txt").unwrap(), None);
    assert_eq!(
        engine.get_projected_file_info("readme.md").unwrap(),
        Some(ProjectedFileInfo {
            hash: id(3),
            size: FakeSizes::known_size(&id(3)),
        })
    );
    assert_eq!(engine.get_projected_file_info("a").unwrap(), None);

    // No persisted work, so startup did not touch placeholders.
    assert!(fx.fakes.provider.calls().is_empty());
    assert_eq!(fx.fakes.placeholders.rewrites(), 0);
}

#[test]
fn memory_enumeration_needs_known_sizes() {
    let fx = Fixture::new();
    fx.write_index(&[WriterEntry::new("dir/f.txt", id(1))]);
    let engine = fx.started();

    assert_eq!(engine.try_get_projected_items_from_memory("dir").unwrap(), None);
    let blocking = engine.get_projected_items("dir").unwrap().unwrap();
    assert_eq!(
        engine.try_get_projected_items_from_memory("dir").unwrap(),
        Some(blocking)
    );
}

#[test]
fn modified_files_pass_records_materialized_entries() {
    let fx = Fixture::new();
    fx.write_index(&[
        WriterEntry::new("a/b.txt", id(1)),
        WriterEntry::new("a/c.txt", id(2)).with_skip_worktree(false),
    ]);
    let engine = fx.started();

    engine.invalidate_modified_files().unwrap();
    engine.invalidate_projection().unwrap();
    assert!(engine.wait_for_projection_update_timeout(WAIT).unwrap());

    assert_eq!(fx.fakes.modified_paths.paths(), vec!["a/c.txt".to_string()]);
    assert_eq!(
        engine.is_path_projected("a/b.txt").unwrap(),
        Some(ProjectedPath {
            name: "b.txt".to_string(),
            is_folder: false
        })
    );
    assert_eq!(engine.is_path_projected("a/c.txt").unwrap(), None);
}

#[test]
fn invalidation_rebuilds_and_syncs_placeholders() {
    let fx = Fixture::new();
    fx.write_index(&[
        WriterEntry::new("a/b.txt", id(1)),
        WriterEntry::new("x/y.txt", id(2)),
    ]);
    let engine = fx.started();
    engine.on_placeholder_folder_created("a").unwrap();
    engine.on_placeholder_file_created("a/b.txt", id(1)).unwrap();
    engine.on_placeholder_folder_created("x").unwrap();
    engine.on_placeholder_file_created("x/y.txt", id(2)).unwrap();
    assert_eq!(engine.placeholder_count().unwrap(), 4);

    fx.fakes.provider.respond("x", ProviderResult::DirectoryNotEmpty);
    fx.write_index(&[WriterEntry::new("a/b.txt", id(5))]);
    engine.invalidate_projection().unwrap();
    assert!(engine.wait_for_projection_update_timeout(WAIT).unwrap());

    assert_eq!(engine.generation(), 2);
    assert_eq!(
        fx.fakes.provider.calls(),
        vec![
            ProviderCall::Update {
                path: "a/b.txt".to_string(),
                hash: id(5),
                size: FakeSizes::known_size(&id(5)),
            },
            ProviderCall::Delete {
                path: "x/y.txt".to_string()
            },
            ProviderCall::Delete {
                path: "x".to_string()
            },
        ]
    );
    assert_eq!(
        fx.fakes.placeholders.get_all().unwrap(),
        vec![
            PlaceholderRecord::folder("a"),
            PlaceholderRecord::file("a/b.txt", id(5)),
            PlaceholderRecord::folder("x"),
        ]
    );
    assert!(engine.last_sync_failures().is_empty());

    engine.on_placeholder_removed("x").unwrap();
    assert_eq!(engine.placeholder_count().unwrap(), 2);
}

#[test]
fn sync_failures_are_reported() {
    let fx = Fixture::new();
    fx.write_index(&[WriterEntry::new("f.txt", id(1))]);
    let engine = fx.started();
    engine.on_placeholder_file_created("f.txt", id(1)).unwrap();

    fx.fakes.provider.respond("f.txt", ProviderResult::Other(42));
    fx.write_index(&[WriterEntry::new("f.txt", id(2))]);
    engine.invalidate_projection().unwrap();
    assert!(engine.wait_for_projection_update_timeout(WAIT).unwrap());

    assert_eq!(
        engine.last_sync_failures(),
        BTreeSet::from(["f.txt".to_string()])
    );
    assert_eq!(fx.fakes.remediation.tasks().len(), 1);
}

#[test]
fn pending_work_survives_restart() {
    let fx = Fixture::new();
    fx.write_index(&[WriterEntry::new("f.txt", id(2))]);
    fx.fakes
        .placeholders
        .add_and_flush(PlaceholderRecord::file("f.txt", id(1)))
        .unwrap();

    // A previous run was invalidated but never finished.
    store_marker(&fx.config.marker_path(), PendingWork::PROJECTION).unwrap();
    let engine = fx.started();

    assert_eq!(fx.fakes.placeholders.rewrites(), 1);
    assert_eq!(
        fx.fakes.placeholders.get_all().unwrap(),
        vec![PlaceholderRecord::file("f.txt", id(2))]
    );
    assert_eq!(load_marker(&fx.config.marker_path()).unwrap(), PendingWork::empty());
    drop(engine);
}

#[test]
fn invalidation_is_persisted_before_rebuild() {
    let fx = Fixture::new();
    fx.write_index(&[WriterEntry::new("f.txt", id(1))]);
    let engine = fx.started();

    fx.fakes.lock.hold();
    engine.invalidate_projection().unwrap();
    assert_eq!(
        load_marker(&fx.config.marker_path()).unwrap(),
        PendingWork::PROJECTION
    );
    engine.shutdown();
    assert_eq!(
        load_marker(&fx.config.marker_path()).unwrap(),
        PendingWork::PROJECTION
    );
}

#[test]
fn marker_keeps_running_work_when_more_is_requested() {
    let fx = Fixture::new();
    fx.write_index(&[WriterEntry::new("f.txt", id(1))]);
    let engine = fx.started();

    fx.fakes.lock.hold();
    engine.invalidate_projection().unwrap();
    wait_for(|| engine.state() == ProjectionState::Rebuilding);
    engine.invalidate_modified_files().unwrap();
    assert_eq!(
        load_marker(&fx.config.marker_path()).unwrap(),
        PendingWork::PROJECTION | PendingWork::MODIFIED_PATHS
    );

    fx.fakes.lock.release();
    assert!(engine.wait_for_projection_update_timeout(WAIT).unwrap());
    wait_for(|| load_marker(&fx.config.marker_path()).unwrap().is_empty());
}

#[test]
fn failed_marker_write_still_wakes_the_worker() {
    let fx = Fixture::new();
    fx.write_index(&[WriterEntry::new("f.txt", id(1))]);
    let engine = fx.started();

    // A directory where the marker belongs makes every write fail.
    std::fs::create_dir_all(fx.config.marker_path().join("blocked")).unwrap();
    fx.write_index(&[WriterEntry::new("g.txt", id(2))]);
    assert!(engine.invalidate_projection().is_err());

    assert!(engine.wait_for_projection_update_timeout(WAIT).unwrap());
    assert_eq!(engine.generation(), 2);
    assert!(engine.is_path_projected("g.txt").unwrap().is_some());
}

#[test]
fn invalidations_during_rebuild_coalesce() {
    let fx = Fixture::new();
    fx.write_index(&[WriterEntry::new("f.txt", id(1))]);
    fx.fakes.lock.hold();
    let engine = fx.engine();
    engine.initialize().unwrap();

    // The first iteration is parked on the external lock.
    wait_for(|| fx.fakes.lock.polls() > 0);
    fx.write_index(&[WriterEntry::new("g.txt", id(2))]);
    for _ in 0..3 {
        engine.invalidate_projection().unwrap();
    }
    fx.fakes.lock.release();

    assert!(engine.wait_for_projection_update_timeout(WAIT).unwrap());
    assert_eq!(engine.generation(), 2);
    assert!(engine.is_path_projected("g.txt").unwrap().is_some());
}

#[test]
fn waiting_reader_sees_only_the_new_generation() {
    let fx = Fixture::new();
    fx.write_index(&[WriterEntry::new("old.txt", id(1))]);
    let engine = Arc::new(fx.started());

    fx.fakes.lock.hold();
    fx.write_index(&[WriterEntry::new("new.txt", id(2))]);
    engine.invalidate_projection().unwrap();

    let reader = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            let items = engine.get_projected_items("").unwrap().unwrap();
            (engine.generation(), names(&items).join(","))
        })
    };
    wait_for(|| engine.state() == ProjectionState::Rebuilding);
    thread::sleep(Duration::from_millis(10));
    fx.fakes.lock.release();

    let (generation, listing) = reader.join().unwrap();
    assert_eq!(generation, 2);
    assert_eq!(listing, "new.txt");
}

#[test]
fn concurrent_readers_see_one_generation() {
    let fx = Fixture::new();
    let entries: Vec<WriterEntry> = (0..50u8)
        .map(|i| WriterEntry::new(format!("dir/file{i:02}.txt"), id(i % 30 + 1)))
        .collect();
    fx.write_index(&entries);
    let engine = Arc::new(fx.started());

    let readers: Vec<_> = (0..8)
        .map(|_| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let items = engine.get_projected_items("dir").unwrap().unwrap();
                (engine.generation(), items)
            })
        })
        .collect();
    let results: Vec<_> = readers.into_iter().map(|r| r.join().unwrap()).collect();
    for (generation, items) in &results {
        assert_eq!(*generation, 1);
        assert_eq!(items, &results[0].1);
        assert_eq!(items.len(), 50);
    }
}

#[test]
fn transient_errors_are_retried() {
    let fx = Fixture::new();
    let engine = fx.engine();
    engine.initialize().unwrap();

    // No index yet: the rebuild keeps failing and readers keep waiting.
    assert!(!engine.wait_for_projection_update_timeout(Duration::from_millis(50)).unwrap());
    assert_ne!(engine.state(), ProjectionState::Valid);

    fx.write_index(&[WriterEntry::new("late.txt", id(1))]);
    assert!(engine.wait_for_projection_update_timeout(WAIT).unwrap());
    assert!(engine.is_path_projected("late.txt").unwrap().is_some());
}

#[test]
fn format_errors_are_fatal() {
    let fx = Fixture::new();
    std::fs::write(&fx.config.index_path, b"not an index at all").unwrap();
    let engine =
        GitIndexProjection::new(fx.config.clone(), fx.fakes.collaborators()).unwrap();
    let fatal = Arc::new(AtomicUsize::new(0));
    {
        let fatal = Arc::clone(&fatal);
        engine.set_fatal_handler(move |error| {
            assert!(matches!(error, ProjectionError::Format(_)));
            fatal.fetch_add(1, Ordering::SeqCst);
        });
    }
    engine.initialize().unwrap();

    let error = engine.wait_for_projection_update().unwrap_err();
    assert!(matches!(error, ProjectionError::ShutDown));
    assert_eq!(fatal.load(Ordering::SeqCst), 1);
    assert!(matches!(
        engine.invalidate_projection(),
        Err(ProjectionError::ShutDown)
    ));
}

#[test]
fn shutdown_stops_waiters_and_is_idempotent() {
    let fx = Fixture::new();
    fx.fakes.lock.hold();
    fx.write_index(&[WriterEntry::new("f.txt", id(1))]);
    let engine = Arc::new(fx.engine());
    engine.initialize().unwrap();

    let waiter = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || engine.wait_for_projection_update())
    };
    thread::sleep(Duration::from_millis(10));
    engine.shutdown();
    engine.shutdown();

    assert!(matches!(
        waiter.join().unwrap(),
        Err(ProjectionError::ShutDown)
    ));
    assert!(matches!(engine.initialize(), Ok(()) | Err(ProjectionError::ShutDown)));
}
