//! Tests for table operations
//!
//! These tests verify:
//! - Scan ordering after arbitrary inserts and removes
//! - Round trips of records spanning many data pages
//! - Replace semantics and record counts
//! - Leaf page splits and merges
//! - Scans staying correct under cache eviction pressure

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use atlaspage::storage::PAGE_SIZE;
use atlaspage::{Config, Engine, TableHandle};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_engine_with(leaf_capacity: usize, cache_pages: usize) -> (TempDir, Engine) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .checkpoint_period_ms(0)
        .leaf_capacity(leaf_capacity)
        .cache_pages(cache_pages)
        .build();
    let engine = Engine::open(config).unwrap();
    engine.add_tables(&["t"]).unwrap();
    (temp_dir, engine)
}

fn setup_temp_engine() -> (TempDir, Engine) {
    setup_temp_engine_with(340, 4096)
}

fn keys_of(table: &TableHandle, forward: bool) -> Vec<Vec<u8>> {
    let mut keys = Vec::new();
    let visit = |key: &[u8], _: &[u8]| {
        keys.push(key.to_vec());
        true
    };
    if forward {
        table.walk(visit).unwrap();
    } else {
        table.rwalk(visit).unwrap();
    }
    keys
}

/// Deterministic pseudo-random sequence for shuffling test input
fn scramble(seed: u64, n: usize) -> Vec<u64> {
    let mut state = seed;
    (0..n)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        })
        .collect()
}

// =============================================================================
// Ordering
// =============================================================================

#[test]
fn test_scan_is_strictly_ascending_after_mixed_edits() {
    let (_temp, engine) = setup_temp_engine_with(16, 4096);
    let table = engine.open_table("t").unwrap();
    let mut expected = std::collections::BTreeSet::new();

    for (i, n) in scramble(7, 2000).into_iter().enumerate() {
        let key = format!("{:05}", n % 5000).into_bytes();
        if i % 3 == 2 {
            let removed = table.remove(&key).unwrap();
            assert_eq!(removed.is_some(), expected.remove(&key));
        } else {
            table.replace(&key, &key).unwrap();
            expected.insert(key);
        }
    }

    let forward = keys_of(&table, true);
    assert!(forward.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(forward, expected.iter().cloned().collect::<Vec<_>>());

    let mut backward = keys_of(&table, false);
    backward.reverse();
    assert_eq!(backward, forward);
    assert_eq!(table.record_count(), expected.len() as u64);
}

#[test]
fn test_long_keys_sharing_prefixes_sort_correctly() {
    let (_temp, engine) = setup_temp_engine_with(8, 4096);
    let table = engine.open_table("t").unwrap();
    let base = "shared-prefix-longer-than-fifteen/";

    for n in scramble(11, 300) {
        let key = format!("{}{}", base, n % 1000);
        table.replace(key.as_bytes(), b"v").unwrap();
    }
    table.replace(base.as_bytes(), b"root").unwrap();
    table.replace(&base.as_bytes()[..15], b"cut").unwrap();

    let keys = keys_of(&table, true);
    assert!(keys.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(keys[0], base.as_bytes()[..15].to_vec());
    assert_eq!(keys[1], base.as_bytes().to_vec());
    assert_eq!(table.get(&base.as_bytes()[..15]).unwrap(), Some(b"cut".to_vec()));
}

// =============================================================================
// Records
// =============================================================================

#[test]
fn test_large_values_round_trip() {
    let (temp, engine) = setup_temp_engine();
    let sizes = [PAGE_SIZE, 3 * PAGE_SIZE, 10 * PAGE_SIZE];
    {
        let table = engine.open_table("t").unwrap();
        for (i, size) in sizes.iter().enumerate() {
            let value: Vec<u8> = (0..*size).map(|b| (b % 251) as u8).collect();
            table.insert(format!("big{}", i).as_bytes(), &value).unwrap();
        }
        table.insert(b"small", b"tiny").unwrap();
        for (i, size) in sizes.iter().enumerate() {
            let value = table.get(format!("big{}", i).as_bytes()).unwrap().unwrap();
            assert_eq!(value.len(), *size);
            assert!(value.iter().enumerate().all(|(b, v)| *v == (b % 251) as u8));
        }
    }
    engine.close().unwrap();

    let engine = Engine::open(Config::builder().data_dir(temp.path()).checkpoint_period_ms(0).build()).unwrap();
    let table = engine.open_table("t").unwrap();
    for (i, size) in sizes.iter().enumerate() {
        let value = table.get(format!("big{}", i).as_bytes()).unwrap().unwrap();
        assert_eq!(value.len(), *size);
    }
    assert_eq!(table.get(b"small").unwrap(), Some(b"tiny".to_vec()));
}

#[test]
fn test_replace_keeps_record_count() {
    let (_temp, engine) = setup_temp_engine();
    let table = engine.open_table("t").unwrap();

    assert!(table.put(b"k", b"v1", true).unwrap());
    assert!(table.put(b"k", b"v2", true).unwrap());
    assert_eq!(table.get(b"k").unwrap(), Some(b"v2".to_vec()));
    assert_eq!(table.record_count(), 1);

    // Grow past one data page, then shrink back.
    let big = vec![9u8; 5 * PAGE_SIZE];
    table.replace(b"k", &big).unwrap();
    assert_eq!(table.get(b"k").unwrap(), Some(big));
    table.replace(b"k", b"v3").unwrap();
    assert_eq!(table.get(b"k").unwrap(), Some(b"v3".to_vec()));
    assert_eq!(table.record_count(), 1);

    assert!(!table.insert(b"k", b"ignored").unwrap());
    assert_eq!(table.get(b"k").unwrap(), Some(b"v3".to_vec()));
}

#[test]
fn test_empty_key_and_value() {
    let (_temp, engine) = setup_temp_engine();
    let table = engine.open_table("t").unwrap();
    table.insert(b"", b"").unwrap();
    table.insert(b"a", b"").unwrap();
    assert_eq!(table.get(b"").unwrap(), Some(Vec::new()));
    assert_eq!(table.first_key().unwrap(), Some(Vec::new()));
    assert_eq!(table.next_key(b"").unwrap(), Some(b"a".to_vec()));
}

// =============================================================================
// Leaf Pages
// =============================================================================

#[test]
fn test_alphabet_fills_three_leaf_pages() {
    let (_temp, engine) = setup_temp_engine_with(10, 4096);
    let table = engine.open_table("t").unwrap();
    for c in b'a'..=b'z' {
        table.insert(&[c], &[c]).unwrap();
    }

    assert_eq!(engine.leaf_chain("t").unwrap().len(), 3);
    assert_eq!(table.first_key().unwrap(), Some(b"a".to_vec()));
    assert_eq!(table.last_key().unwrap(), Some(b"z".to_vec()));
    assert_eq!(table.next_key(b"m").unwrap(), Some(b"n".to_vec()));
    assert_eq!(table.prev_key(b"m").unwrap(), Some(b"l".to_vec()));
}

#[test]
fn test_removals_merge_back_into_one_page() {
    for from_front in [true, false] {
        let (_temp, engine) = setup_temp_engine_with(10, 4096);
        let table = engine.open_table("t").unwrap();
        let keys: Vec<Vec<u8>> = (0..25u8).map(|i| vec![b'k', i]).collect();
        for key in &keys {
            table.insert(key, b"v").unwrap();
        }
        assert_eq!(engine.leaf_chain("t").unwrap(), vec![10, 10, 5]);

        let survivors: Vec<Vec<u8>> = if from_front {
            for key in &keys[..20] {
                table.remove(key).unwrap().unwrap();
            }
            keys[20..].to_vec()
        } else {
            for key in keys[5..].iter().rev() {
                table.remove(key).unwrap().unwrap();
            }
            keys[..5].to_vec()
        };
        assert_eq!(engine.leaf_chain("t").unwrap(), vec![5]);
        assert_eq!(keys_of(&table, true), survivors);
    }
}

#[test]
fn test_scattered_removals_match_fresh_table() {
    let (_temp, engine) = setup_temp_engine_with(6, 4096);
    engine.add_tables(&["fresh"]).unwrap();
    let table = engine.open_table("t").unwrap();
    let fresh = engine.open_table("fresh").unwrap();

    let keys: Vec<Vec<u8>> = (0..60u32).map(|i| format!("{:03}", i).into_bytes()).collect();
    for key in &keys {
        table.insert(key, key).unwrap();
    }
    let survivors: Vec<&Vec<u8>> = keys.iter().filter(|key| key[2] == b'3').collect();
    for key in keys.iter().filter(|key| key[2] != b'3') {
        table.remove(key).unwrap().unwrap();
    }
    for key in &survivors {
        fresh.insert(key, key).unwrap();
    }

    assert_eq!(keys_of(&table, true), keys_of(&fresh, true));
    assert_eq!(keys_of(&table, false), keys_of(&fresh, false));
    let rows: usize = engine.leaf_chain("t").unwrap().iter().sum();
    assert_eq!(rows, survivors.len());
}

// =============================================================================
// Eviction Safety
// =============================================================================

#[test]
fn test_scan_survives_concurrent_writes_under_eviction() {
    let (_temp, engine) = setup_temp_engine_with(32, 32);
    let table = engine.open_table("t").unwrap();
    let value = vec![3u8; 200];
    let scanned: Vec<Vec<u8>> = (0..2000u32).map(|i| format!("a{:05}", i).into_bytes()).collect();
    for key in &scanned {
        table.insert(key, &value).unwrap();
    }
    engine.checkpoint(false).unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let writer = {
        let table = table.clone();
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut round = 0u32;
            while !stop.load(Ordering::Relaxed) {
                for i in 0..50u32 {
                    let key = format!("z{:03}{:03}", (round / 2) % 10, i);
                    if round % 2 == 0 {
                        table.replace(key.as_bytes(), &[round as u8; 300]).unwrap();
                    } else {
                        table.remove(key.as_bytes()).unwrap();
                    }
                }
                round += 1;
            }
        })
    };

    for _ in 0..5 {
        let mut seen = Vec::new();
        table
            .walk(|key, val| {
                if key[0] == b'a' {
                    assert_eq!(val, value.as_slice());
                    seen.push(key.to_vec());
                }
                true
            })
            .unwrap();
        assert_eq!(seen, scanned);
    }

    stop.store(true, Ordering::Relaxed);
    writer.join().unwrap();
}
