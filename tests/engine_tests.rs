//! Tests for Engine
//!
//! These tests verify:
//! - Engine lifecycle (open/close) and the directory lock
//! - Table add/remove and name rules
//! - Schema markers left by an interrupted add
//! - Backups and incremental log archiving

use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use atlaspage::{AtlasError, Config, Engine};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn config_for(path: &Path) -> Config {
    Config::builder()
        .data_dir(path)
        .checkpoint_period_ms(0)
        .build()
}

fn setup_temp_engine() -> (TempDir, Engine) {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open(config_for(temp_dir.path())).unwrap();
    (temp_dir, engine)
}

fn log_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

// =============================================================================
// Lifecycle
// =============================================================================

#[test]
fn test_engine_open_creates_directories() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("mydb");

    let _engine = Engine::open(config_for(&root)).unwrap();

    assert!(root.join("data").is_dir());
    assert!(root.join("log").is_dir());
    assert!(root.join("lock").is_file());
}

#[test]
fn test_second_open_is_locked_out() {
    let (temp, engine) = setup_temp_engine();

    match Engine::open(config_for(temp.path())) {
        Err(AtlasError::DatabaseLocked(_)) => {}
        other => panic!("expected DatabaseLocked, got {:?}", other.map(|_| ())),
    }

    engine.close().unwrap();
    Engine::open(config_for(temp.path())).unwrap();
}

#[test]
fn test_close_writes_final_checkpoint() {
    let (temp, engine) = setup_temp_engine();
    engine.add_tables(&["t"]).unwrap();
    {
        let table = engine.open_table("t").unwrap();
        for i in 0..500u32 {
            table.insert(&i.to_be_bytes(), b"payload").unwrap();
        }
    }
    engine.close().unwrap();

    let engine = Engine::open(config_for(temp.path())).unwrap();
    let table = engine.open_table("t").unwrap();
    assert_eq!(table.record_count(), 500);
    assert_eq!(table.get(&499u32.to_be_bytes()).unwrap(), Some(b"payload".to_vec()));
}

#[test]
fn test_drop_writes_final_checkpoint() {
    let temp = TempDir::new().unwrap();
    {
        let engine = Engine::open(config_for(temp.path())).unwrap();
        engine.add_tables(&["t"]).unwrap();
        engine.open_table("t").unwrap().insert(b"k", b"v").unwrap();
    }

    let engine = Engine::open(config_for(temp.path())).unwrap();
    assert_eq!(engine.open_table("t").unwrap().get(b"k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn test_background_checkpoint_runs_on_timer() {
    let temp = TempDir::new().unwrap();
    let engine = Engine::open(
        Config::builder()
            .data_dir(temp.path())
            .checkpoint_period_ms(20)
            .build(),
    )
    .unwrap();
    engine.add_tables(&["t"]).unwrap();
    engine.open_table("t").unwrap().insert(b"k", b"v").unwrap();
    thread::sleep(Duration::from_millis(300));

    // The timer already made the edit durable; a crash now keeps it.
    let copy = TempDir::new().unwrap();
    for dir in ["data", "log"] {
        fs::create_dir_all(copy.path().join(dir)).unwrap();
        for entry in fs::read_dir(temp.path().join(dir)).unwrap() {
            let entry = entry.unwrap();
            fs::copy(entry.path(), copy.path().join(dir).join(entry.file_name())).unwrap();
        }
    }
    let restored = Engine::open(config_for(copy.path())).unwrap();
    assert_eq!(restored.open_table("t").unwrap().get(b"k").unwrap(), Some(b"v".to_vec()));
}

// =============================================================================
// Tables
// =============================================================================

#[test]
fn test_tables_persist_with_lowercase_names() {
    let (temp, engine) = setup_temp_engine();
    engine.add_tables(&["Users", "orders"]).unwrap();
    assert_eq!(engine.table_names(), vec!["orders".to_string(), "users".to_string()]);
    engine.open_table("USERS").unwrap().insert(b"alice", b"1").unwrap();
    engine.close().unwrap();

    let engine = Engine::open(config_for(temp.path())).unwrap();
    assert_eq!(engine.table_names(), vec!["orders".to_string(), "users".to_string()]);
    assert!(temp.path().join("data").join("users").is_file());
    assert_eq!(engine.open_table("users").unwrap().get(b"alice").unwrap(), Some(b"1".to_vec()));
}

#[test]
fn test_table_name_errors() {
    let (_temp, engine) = setup_temp_engine();
    engine.add_tables(&["t"]).unwrap();

    assert!(matches!(engine.add_tables(&["T"]), Err(AtlasError::TableExists(_))));
    assert!(matches!(engine.add_tables(&["a", "A"]), Err(AtlasError::TableExists(_))));
    assert!(matches!(engine.add_tables(&["bad/name"]), Err(AtlasError::InvalidTableName(_))));
    assert!(matches!(engine.add_tables(&[""]), Err(AtlasError::InvalidTableName(_))));
    assert!(matches!(engine.open_table("missing"), Err(AtlasError::TableNotFound(_))));
    assert!(matches!(engine.remove_tables(&["missing"]), Err(AtlasError::TableNotFound(_))));

    // A rejected batch adds nothing.
    assert_eq!(engine.table_names(), vec!["t".to_string()]);
}

#[test]
fn test_remove_tables_deletes_data() {
    let (temp, engine) = setup_temp_engine();
    engine.add_tables(&["keep", "drop"]).unwrap();
    engine.open_table("drop").unwrap().insert(b"k", b"v").unwrap();
    engine.checkpoint(false).unwrap();

    engine.remove_tables(&["drop"]).unwrap();
    assert_eq!(engine.table_names(), vec!["keep".to_string()]);
    assert!(!temp.path().join("data").join("drop").exists());
    engine.close().unwrap();

    let engine = Engine::open(config_for(temp.path())).unwrap();
    assert_eq!(engine.table_names(), vec!["keep".to_string()]);

    // The name is free again, and the new table starts empty.
    engine.add_tables(&["drop"]).unwrap();
    assert_eq!(engine.open_table("drop").unwrap().get(b"k").unwrap(), None);
}

#[test]
fn test_remove_tables_waits_for_open_handles() {
    let (_temp, engine) = setup_temp_engine();
    engine.add_tables(&["t"]).unwrap();
    let handle = engine.open_table("t").unwrap();

    let holder = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        handle.insert(b"late", b"write").unwrap();
        drop(handle);
    });
    engine.remove_tables(&["t"]).unwrap();
    holder.join().unwrap();
    assert!(engine.table_names().is_empty());
}

#[test]
fn test_torn_add_marker_is_discarded() {
    let (temp, engine) = setup_temp_engine();
    engine.add_tables(&["t"]).unwrap();
    engine.open_table("t").unwrap().insert(b"k", b"v").unwrap();
    engine.close().unwrap();

    let marker = temp.path().join(".tables.add");
    fs::write(&marker, [1u8, 0, 0]).unwrap();

    let engine = Engine::open(config_for(temp.path())).unwrap();
    assert!(!marker.exists());
    assert_eq!(engine.open_table("t").unwrap().get(b"k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn test_foreign_files_in_data_dir_are_ignored() {
    let (temp, engine) = setup_temp_engine();
    engine.add_tables(&["t"]).unwrap();
    engine.close().unwrap();

    fs::write(temp.path().join("data").join("Not.A.Table"), b"junk").unwrap();
    let engine = Engine::open(config_for(temp.path())).unwrap();
    assert_eq!(engine.table_names(), vec!["t".to_string()]);
}

// =============================================================================
// Backup
// =============================================================================

#[test]
fn test_backup_opens_as_database() {
    let (_temp, engine) = setup_temp_engine();
    let backup = TempDir::new().unwrap();
    engine.add_tables(&["t"]).unwrap();
    let table = engine.open_table("t").unwrap();
    for i in 0..200u32 {
        table.insert(format!("k{:04}", i).as_bytes(), b"v").unwrap();
    }
    engine.checkpoint(false).unwrap();
    engine.backup(backup.path(), false).unwrap();

    // Later edits stay out of the backup.
    table.insert(b"after", b"backup").unwrap();
    engine.checkpoint(false).unwrap();

    let restored = Engine::open(config_for(backup.path())).unwrap();
    let copy = restored.open_table("t").unwrap();
    assert_eq!(copy.record_count(), 200);
    assert_eq!(copy.get(b"k0123").unwrap(), Some(b"v".to_vec()));
    assert_eq!(copy.get(b"after").unwrap(), None);
}

#[test]
fn test_incremental_backup_archives_retired_logs() {
    let (temp, engine) = setup_temp_engine();
    let backup = TempDir::new().unwrap();
    engine.add_tables(&["t"]).unwrap();
    engine.open_table("t").unwrap().insert(b"a", b"1").unwrap();
    engine.checkpoint(false).unwrap();

    let live_log = temp.path().join("log");
    let before = log_files(&live_log);
    assert_eq!(before.len(), 1);

    engine.backup(backup.path(), true).unwrap();
    engine.open_table("t").unwrap().insert(b"b", b"2").unwrap();
    engine.checkpoint(true).unwrap();

    let after = log_files(&live_log);
    assert_eq!(after.len(), 1);
    assert_ne!(after, before);
    assert!(log_files(&backup.path().join("log")).contains(&before[0]));
}
