//! Fatal latch integration tests
//!
//! These tests verify engine behavior once an unrecoverable error is
//! reported:
//! - Every thread sees the same fatal cause on its next check
//! - A second trip keeps the original cause
//! - Every volume operation fails with the fatal error, before any I/O
//! - The emergency step forces volumes and writes the fatal marker
//! - Close still releases resources and reports the fatal cause

use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::TempDir;
use vellum_core::{FatalCause, VellumError, VolumeSpec};
use vellum_durability::testing::MemOpener;
use vellum_durability::{CancelToken, ChannelOpener};
use vellum_engine::{Engine, EngineConfig, FATAL_MARKER_FILE};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn engine_with_volume(cfg: EngineConfig) -> (TempDir, Arc<MemOpener>, Arc<Engine>) {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let opener = Arc::new(MemOpener::new());
    let cfg = cfg.with_volume(
        VolumeSpec::new("main.v01")
            .with_alias("main")
            .with_page_size(512)
            .with_initial_pages(4),
    );
    let engine = Engine::with_opener(dir.path(), cfg, opener.clone()).unwrap();
    (dir, opener, engine)
}

#[test]
fn test_trip_seen_by_all_threads() {
    let (_dir, _opener, engine) = engine_with_volume(EngineConfig::default());

    let err = engine.fatal("corruption detected at page 42");
    let cause = err.fatal_cause().unwrap().clone();
    assert_eq!(cause.message, "corruption detected at page 42");

    let barrier = Arc::new(Barrier::new(3));
    let handles: Vec<_> = (0..3)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                engine.check_ok().unwrap_err()
            })
        })
        .collect();

    for h in handles {
        let err = h.join().unwrap();
        assert_eq!(err.fatal_cause(), Some(&cause));
    }

    // Second trip keeps the original cause
    let again = engine.fatal("something else");
    assert_eq!(again.fatal_cause(), Some(&cause));
    assert_eq!(engine.fatal_cause(), Some(&cause));
}

#[test]
fn test_concurrent_trips_record_exactly_one_cause() {
    let (dir, _opener, engine) = engine_with_volume(EngineConfig::default());
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                engine.fatal(format!("tripper {}", i))
            })
        })
        .collect();

    let causes: Vec<FatalCause> = handles
        .into_iter()
        .map(|h| h.join().unwrap().fatal_cause().unwrap().clone())
        .collect();
    assert!(causes.iter().all(|c| c == &causes[0]));

    let marker = std::fs::read(dir.path().join(FATAL_MARKER_FILE)).unwrap();
    let written: FatalCause = serde_json::from_slice(&marker).unwrap();
    assert_eq!(written, causes[0]);
}

#[test]
fn test_every_volume_operation_fails_after_trip() {
    let (dir, opener, engine) = engine_with_volume(EngineConfig::default());
    let volume = engine.volume("main").unwrap();
    let cancel = CancelToken::new();
    let before = opener.contents(&dir.path().join("main.v01")).unwrap();

    engine.fatal("checksum mismatch");

    let mut page = vec![0u8; 512];
    let results: Vec<VellumError> = vec![
        volume.read_page(0, &mut page, &cancel).unwrap_err(),
        volume.write_page(0, &[7u8; 512], &cancel).unwrap_err(),
        volume.read_at(&mut page, 0, &cancel).unwrap_err(),
        volume.write_at(&[1], 0, &cancel).unwrap_err(),
        volume.size(&cancel).unwrap_err(),
        volume.page_count(&cancel).unwrap_err(),
        volume.extend_to_pages(8, &cancel).unwrap_err(),
        volume.grow(&cancel).unwrap_err(),
        volume.truncate(1, &cancel).unwrap_err(),
        volume.force(&cancel).unwrap_err(),
        volume.try_lock(0, 1, true).unwrap_err(),
        engine.volume("main").unwrap_err(),
        engine.open_volume(VolumeSpec::new("other.v01")).unwrap_err(),
    ];
    for err in results {
        assert!(err.is_fatal(), "expected fatal error, got {err}");
    }

    // No partial mutation reached the file
    assert_eq!(opener.contents(&dir.path().join("main.v01")).unwrap(), before);
}

#[test]
fn test_emergency_step_forces_volumes() {
    let (dir, opener, engine) = engine_with_volume(EngineConfig::default());
    let path = dir.path().join("main.v01");
    let syncs_before = opener.syncs(&path);

    engine.fatal("journal tail unreadable");
    assert_eq!(opener.syncs(&path), syncs_before + 1);
    assert!(dir.path().join(FATAL_MARKER_FILE).exists());

    // Later trips run no emergency step
    engine.fatal("again");
    assert_eq!(opener.syncs(&path), syncs_before + 1);
}

#[test]
fn test_emergency_flush_disabled() {
    let cfg = EngineConfig {
        emergency_flush: false,
        ..EngineConfig::default()
    };
    let (dir, opener, engine) = engine_with_volume(cfg);
    let path = dir.path().join("main.v01");
    let syncs_before = opener.syncs(&path);

    engine.fatal("bad page header");
    assert_eq!(opener.syncs(&path), syncs_before);
    assert!(dir.path().join(FATAL_MARKER_FILE).exists());
}

#[test]
fn test_fatal_with_source_records_source() {
    let (_dir, _opener, engine) = engine_with_volume(EngineConfig::default());
    let io = std::io::Error::new(std::io::ErrorKind::InvalidData, "bad magic");
    let err = engine.fatal_with_source("volume header invalid", &io);
    let cause = err.fatal_cause().unwrap();
    assert_eq!(cause.source.as_deref(), Some("bad magic"));
    assert!(err.to_string().contains("volume header invalid (bad magic)"));
}

#[test]
fn test_close_after_trip_reports_cause_and_releases_volumes() {
    let (dir, opener, engine) = engine_with_volume(EngineConfig::default());
    engine.fatal("tree structure inconsistent");

    let err = engine.close().unwrap_err();
    assert_eq!(err.fatal_cause().unwrap().message, "tree structure inconsistent");
    assert!(engine.volume_names().is_empty());
    assert_eq!(opener.open_handles(&dir.path().join("main.v01")), 0);
    assert!(!opener.exists(&dir.path().join("main.v01.lck")));

    // The latch still wins over the shut-down state
    assert!(engine.check_ok().unwrap_err().is_fatal());
    assert!(engine.volume("main").unwrap_err().is_fatal());
}

#[test]
fn test_marker_reported_by_next_instance() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let opener = Arc::new(MemOpener::new());
    let tripped_at = {
        let engine =
            Engine::with_opener(dir.path(), EngineConfig::default(), opener.clone()).unwrap();
        let err = engine.fatal("corruption detected at page 42");
        err.fatal_cause().unwrap().tripped_at
    };

    let engine = Engine::with_opener(dir.path(), EngineConfig::default(), opener).unwrap();
    let previous = engine.previous_fatal().unwrap();
    assert_eq!(previous.message, "corruption detected at page 42");
    assert_eq!(previous.tripped_at, tripped_at);
    assert!(!dir.path().join(FATAL_MARKER_FILE).exists());
    assert!(!engine.is_tripped());
}

#[test]
fn test_unreadable_marker_is_reported_and_removed() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join(FATAL_MARKER_FILE), b"not json").unwrap();

    let engine = Engine::with_opener(
        dir.path(),
        EngineConfig::default(),
        Arc::new(MemOpener::new()),
    )
    .unwrap();
    assert_eq!(
        engine.previous_fatal().unwrap().message,
        "unreadable fatal marker"
    );
    assert!(!dir.path().join(FATAL_MARKER_FILE).exists());
}
