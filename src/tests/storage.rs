use std::ops::Bound;
use std::sync::Arc;

use bytes::Bytes;
use tempfile::{tempdir, TempDir};

use crate::iterators::StorageIterator;
use crate::lsm_storage::{LsmStorageOptions, Silt};
use crate::table::{SsTable, SsTableBuilder};

use super::harness::{as_bytes, check_iter_result_by_key};

fn open_storage(dir: &TempDir) -> Silt {
    Silt::open(dir, LsmStorageOptions::default()).unwrap()
}

#[test]
fn test_put_get_delete_scan() {
    let dir = tempdir().unwrap();
    let storage = open_storage(&dir);
    storage.put(b"a", b"1").unwrap();
    storage.put(b"b", b"2").unwrap();
    assert_eq!(storage.get(b"a").unwrap(), Some(Bytes::from_static(b"1")));
    assert_eq!(storage.get(b"b").unwrap(), Some(Bytes::from_static(b"2")));

    storage.delete(b"a").unwrap();
    assert_eq!(storage.get(b"a").unwrap(), None);

    let mut iter = storage.scan(Bound::Unbounded, Bound::Unbounded).unwrap();
    check_iter_result_by_key(&mut iter, as_bytes(&[("b", "2")]));
}

#[test]
fn test_overwrite_returns_latest() {
    let dir = tempdir().unwrap();
    let storage = open_storage(&dir);
    storage.put(b"k", b"v1").unwrap();
    storage.put(b"k", b"v2").unwrap();
    assert_eq!(storage.get(b"k").unwrap(), Some(Bytes::from_static(b"v2")));
}

#[test]
fn test_get_across_frozen_memtables() {
    let dir = tempdir().unwrap();
    let storage = open_storage(&dir);
    storage.put(b"a", b"1").unwrap();
    storage
        .inner
        .force_freeze_memtable(&storage.inner.state_lock.lock())
        .unwrap();
    storage.put(b"b", b"2").unwrap();
    storage.put(b"a", b"11").unwrap();
    storage
        .inner
        .force_freeze_memtable(&storage.inner.state_lock.lock())
        .unwrap();
    storage.put(b"c", b"3").unwrap();

    assert_eq!(storage.inner.state.read().imm_memtables.len(), 2);
    // the frozen overwrite shadows the older frozen value
    assert_eq!(storage.get(b"a").unwrap(), Some(Bytes::from_static(b"11")));
    assert_eq!(storage.get(b"b").unwrap(), Some(Bytes::from_static(b"2")));
    assert_eq!(storage.get(b"c").unwrap(), Some(Bytes::from_static(b"3")));

    let mut iter = storage.scan(Bound::Unbounded, Bound::Unbounded).unwrap();
    check_iter_result_by_key(
        &mut iter,
        as_bytes(&[("a", "11"), ("b", "2"), ("c", "3")]),
    );
}

#[test]
fn test_flush_and_read_from_l0() {
    let dir = tempdir().unwrap();
    let storage = open_storage(&dir);
    storage.put(b"a", b"1").unwrap();
    storage.put(b"b", b"2").unwrap();
    storage.force_flush().unwrap();

    {
        let state = storage.inner.state.read();
        assert_eq!(state.imm_memtables.len(), 0);
        assert_eq!(state.l0_sstables.len(), 1);
        assert!(state.memtable.is_empty());
    }

    assert_eq!(storage.get(b"a").unwrap(), Some(Bytes::from_static(b"1")));
    assert_eq!(storage.get(b"b").unwrap(), Some(Bytes::from_static(b"2")));
    assert_eq!(storage.get(b"missing").unwrap(), None);

    let mut iter = storage.scan(Bound::Unbounded, Bound::Unbounded).unwrap();
    check_iter_result_by_key(&mut iter, as_bytes(&[("a", "1"), ("b", "2")]));
}

#[test]
fn test_newer_l0_shadows_older_l0() {
    let dir = tempdir().unwrap();
    let storage = open_storage(&dir);
    storage.put(b"k", b"old").unwrap();
    storage.force_flush().unwrap();
    storage.put(b"k", b"new").unwrap();
    storage.force_flush().unwrap();

    assert_eq!(storage.inner.state.read().l0_sstables.len(), 2);
    assert_eq!(storage.get(b"k").unwrap(), Some(Bytes::from_static(b"new")));
    let mut iter = storage.scan(Bound::Unbounded, Bound::Unbounded).unwrap();
    check_iter_result_by_key(&mut iter, as_bytes(&[("k", "new")]));
}

#[test]
fn test_tombstone_hides_flushed_value() {
    let dir = tempdir().unwrap();
    let storage = open_storage(&dir);
    storage.put(b"a", b"1").unwrap();
    storage.put(b"b", b"2").unwrap();
    storage.force_flush().unwrap();

    storage.delete(b"a").unwrap();
    assert_eq!(storage.get(b"a").unwrap(), None);
    let mut iter = storage.scan(Bound::Unbounded, Bound::Unbounded).unwrap();
    check_iter_result_by_key(&mut iter, as_bytes(&[("b", "2")]));

    // the tombstone survives its own flush
    storage.force_flush().unwrap();
    assert_eq!(storage.get(b"a").unwrap(), None);
    let mut iter = storage.scan(Bound::Unbounded, Bound::Unbounded).unwrap();
    check_iter_result_by_key(&mut iter, as_bytes(&[("b", "2")]));
}

#[test]
fn test_scan_bounds_across_sources() {
    let dir = tempdir().unwrap();
    let storage = open_storage(&dir);
    for (k, v) in [("a", "1"), ("b", "2"), ("c", "3")] {
        storage.put(k.as_bytes(), v.as_bytes()).unwrap();
    }
    storage.force_flush().unwrap();
    for (k, v) in [("b", "22"), ("d", "4")] {
        storage.put(k.as_bytes(), v.as_bytes()).unwrap();
    }

    let mut iter = storage
        .scan(Bound::Included(b"b"), Bound::Included(b"c"))
        .unwrap();
    check_iter_result_by_key(&mut iter, as_bytes(&[("b", "22"), ("c", "3")]));

    let mut iter = storage
        .scan(Bound::Excluded(b"b"), Bound::Excluded(b"d"))
        .unwrap();
    check_iter_result_by_key(&mut iter, as_bytes(&[("c", "3")]));

    let mut iter = storage.scan(Bound::Included(b"e"), Bound::Unbounded).unwrap();
    check_iter_result_by_key(&mut iter, Vec::new());
}

#[test]
fn test_automatic_rotation_above_threshold() {
    let dir = tempdir().unwrap();
    let options = LsmStorageOptions {
        max_table_size: 64,
        ..Default::default()
    };
    let storage = Silt::open(&dir, options).unwrap();
    for i in 0..32 {
        let key = format!("key-{i:02}");
        storage.put(key.as_bytes(), b"0123456789").unwrap();
    }
    let state = storage.inner.state.read().clone();
    assert!(!state.imm_memtables.is_empty());
    for memtable in &state.imm_memtables {
        assert!(!memtable.is_empty(), "rotation froze an empty memtable");
    }
    // ids grow with age of creation
    let mut previous = None;
    for memtable in &state.imm_memtables {
        if let Some(previous) = previous {
            assert!(memtable.id() > previous);
        }
        previous = Some(memtable.id());
    }
    drop(state);
    for i in 0..32 {
        let key = format!("key-{i:02}");
        assert_eq!(
            storage.get(key.as_bytes()).unwrap(),
            Some(Bytes::from_static(b"0123456789")),
        );
    }
}

#[test]
fn test_rotation_under_concurrent_writers() {
    let dir = tempdir().unwrap();
    let options = LsmStorageOptions {
        max_table_size: 256,
        ..Default::default()
    };
    let storage = Silt::open(&dir, options).unwrap();
    crossbeam::scope(|s| {
        for t in 0..4 {
            let storage = &storage;
            s.spawn(move |_| {
                for i in 0..200 {
                    let key = format!("t{t}-key{i:03}");
                    storage.put(key.as_bytes(), b"payload-payload").unwrap();
                }
            });
        }
    })
    .unwrap();

    let state = storage.inner.state.read().clone();
    for memtable in &state.imm_memtables {
        assert!(!memtable.is_empty(), "rotation froze an empty memtable");
    }
    let mut ids: Vec<usize> = state.imm_memtables.iter().map(|m| m.id()).collect();
    ids.push(state.memtable.id());
    let mut deduped = ids.clone();
    deduped.sort();
    deduped.dedup();
    assert_eq!(deduped.len(), ids.len(), "memtable ids must be unique");
    drop(state);

    for t in 0..4 {
        for i in 0..200 {
            let key = format!("t{t}-key{i:03}");
            assert_eq!(
                storage.get(key.as_bytes()).unwrap(),
                Some(Bytes::from_static(b"payload-payload")),
                "lost write for {key}",
            );
        }
    }
}

#[test]
fn test_write_batch() {
    use crate::lsm_storage::WriteBatchRecord;

    let dir = tempdir().unwrap();
    let storage = open_storage(&dir);
    storage
        .write_batch(&[
            WriteBatchRecord::Put("a", "1"),
            WriteBatchRecord::Put("b", "2"),
            WriteBatchRecord::Del("a"),
            WriteBatchRecord::Put("c", "3"),
        ])
        .unwrap();
    assert_eq!(storage.get(b"a").unwrap(), None);
    let mut iter = storage.scan(Bound::Unbounded, Bound::Unbounded).unwrap();
    check_iter_result_by_key(&mut iter, as_bytes(&[("b", "2"), ("c", "3")]));
}

#[test]
fn test_scan_iterator_is_fused() {
    let dir = tempdir().unwrap();
    let storage = open_storage(&dir);
    storage.put(b"a", b"1").unwrap();
    let mut iter = storage.scan(Bound::Unbounded, Bound::Unbounded).unwrap();
    assert!(iter.is_valid());
    iter.next().unwrap();
    assert!(!iter.is_valid());
    // past-end advances stay quiet
    iter.next().unwrap();
    iter.next().unwrap();
    assert!(!iter.is_valid());
}

#[test]
fn test_memtable_size_counter_is_monotone() {
    let dir = tempdir().unwrap();
    let storage = open_storage(&dir);
    storage.put(b"k", b"0123456789").unwrap();
    let first = storage.inner.state.read().memtable.approximate_size();
    assert_eq!(first, 11);
    // overwrites add, they never subtract
    storage.put(b"k", b"x").unwrap();
    let second = storage.inner.state.read().memtable.approximate_size();
    assert_eq!(second, first + 2);
    // deletes count the key bytes of the tombstone
    storage.delete(b"k").unwrap();
    let third = storage.inner.state.read().memtable.approximate_size();
    assert_eq!(third, second + 1);
}

#[test]
fn test_invalid_input_is_rejected() {
    let dir = tempdir().unwrap();
    let storage = open_storage(&dir);
    let oversized = vec![0x61u8; 70000];
    assert!(storage.put(&oversized, b"v").is_err());
    assert!(storage.put(b"k", &oversized).is_err());
    assert!(storage.delete(&oversized).is_err());
    // the store stays usable
    storage.put(b"k", b"v").unwrap();
    assert_eq!(storage.get(b"k").unwrap(), Some(Bytes::from_static(b"v")));
}

fn build_level_table(dir: &TempDir, id: usize, pairs: &[(&str, &str)]) -> Arc<SsTable> {
    let mut builder = SsTableBuilder::new(4096);
    for (k, v) in pairs {
        builder.add(k.as_bytes(), v.as_bytes());
    }
    let path = dir.path().join(format!("{id:05}.sst"));
    Arc::new(builder.build(id, None, path).unwrap())
}

fn install_level(storage: &Silt, level: usize, tables: Vec<Arc<SsTable>>) {
    let mut guard = storage.inner.state.write();
    let mut snapshot = guard.as_ref().clone();
    for table in tables {
        snapshot.levels[level].push(table.sst_id());
        snapshot.sstables.insert(table.sst_id(), table);
    }
    *guard = Arc::new(snapshot);
}

#[test]
fn test_read_path_through_deeper_levels() {
    let dir = tempdir().unwrap();
    let storage = open_storage(&dir);
    let t1 = build_level_table(&dir, 100, &[("a", "A"), ("c", "C")]);
    let t2 = build_level_table(&dir, 101, &[("m", "M"), ("q", "Q")]);
    install_level(&storage, 0, vec![t1, t2]);

    assert_eq!(storage.get(b"a").unwrap(), Some(Bytes::from_static(b"A")));
    assert_eq!(storage.get(b"q").unwrap(), Some(Bytes::from_static(b"Q")));
    assert_eq!(storage.get(b"b").unwrap(), None);

    let mut iter = storage.scan(Bound::Unbounded, Bound::Unbounded).unwrap();
    check_iter_result_by_key(
        &mut iter,
        as_bytes(&[("a", "A"), ("c", "C"), ("m", "M"), ("q", "Q")]),
    );

    let mut iter = storage
        .scan(Bound::Included(b"c"), Bound::Excluded(b"q"))
        .unwrap();
    check_iter_result_by_key(&mut iter, as_bytes(&[("c", "C"), ("m", "M")]));
}

#[test]
fn test_memtable_and_l0_shadow_deeper_levels() {
    let dir = tempdir().unwrap();
    let storage = open_storage(&dir);
    let table = build_level_table(&dir, 100, &[("a", "level"), ("b", "level"), ("c", "level")]);
    install_level(&storage, 0, vec![table]);

    // L0 beats the deeper level
    storage.put(b"b", b"l0").unwrap();
    storage.force_flush().unwrap();
    // the memtable beats both
    storage.put(b"a", b"mem").unwrap();
    // a tombstone in the memtable hides the level value
    storage.delete(b"c").unwrap();

    assert_eq!(storage.get(b"a").unwrap(), Some(Bytes::from_static(b"mem")));
    assert_eq!(storage.get(b"b").unwrap(), Some(Bytes::from_static(b"l0")));
    assert_eq!(storage.get(b"c").unwrap(), None);

    let mut iter = storage.scan(Bound::Unbounded, Bound::Unbounded).unwrap();
    check_iter_result_by_key(&mut iter, as_bytes(&[("a", "mem"), ("b", "l0")]));
}

#[test]
fn test_multiple_engines_in_one_process() {
    let dir_a = tempdir().unwrap();
    let dir_b = tempdir().unwrap();
    let a = open_storage(&dir_a);
    let b = open_storage(&dir_b);
    a.put(b"k", b"from-a").unwrap();
    b.put(b"k", b"from-b").unwrap();
    a.force_flush().unwrap();
    assert_eq!(a.get(b"k").unwrap(), Some(Bytes::from_static(b"from-a")));
    assert_eq!(b.get(b"k").unwrap(), Some(Bytes::from_static(b"from-b")));
}

#[test]
fn test_close_shuts_table_handles() {
    let dir = tempdir().unwrap();
    let storage = open_storage(&dir);
    storage.put(b"a", b"1").unwrap();
    storage.force_flush().unwrap();
    storage.close().unwrap();
    storage.close().unwrap();
    // table reads now fail; the memtable path still answers
    assert!(storage.get(b"a").is_err());
}
