//! Index-file lifecycle: creation, reopen validation, metadata mismatch
//! rejection, and behaviour of trees deep enough to split interior nodes.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use settdb::config::LEAF_CAPACITY;
use settdb::{AttrType, BTreeIndex, EmptySource, HeapFile, IndexError, Operator, Rid};
use tempfile::tempdir;

const RECORD_LEN: usize = 8;

fn make_record(key: i32) -> [u8; RECORD_LEN] {
    let mut record = [0u8; RECORD_LEN];
    record[..4].copy_from_slice(&key.to_le_bytes());
    record
}

fn scan_count(index: &mut BTreeIndex, low: i32, lop: Operator, high: i32, hop: Operator) -> usize {
    match index.start_scan(low, lop, high, hop) {
        Ok(()) => {}
        Err(e) => {
            assert_eq!(
                e.downcast_ref::<IndexError>(),
                Some(&IndexError::NoSuchKeyFound)
            );
            return 0;
        }
    }
    let mut count = 0;
    while index.scan_next().is_ok() {
        count += 1;
    }
    index.end_scan().unwrap();
    count
}

fn build(dir: &Path, relation: &str, keys: &[i32]) -> BTreeIndex {
    let mut heap = HeapFile::create(dir.join(relation), RECORD_LEN).unwrap();
    for &key in keys {
        heap.append(&make_record(key)).unwrap();
    }
    BTreeIndex::open(dir, relation, 0, AttrType::Int, &mut heap.scan()).unwrap()
}

#[test]
fn index_name_is_relation_dot_offset() {
    let dir = tempdir().unwrap();
    let index = build(dir.path(), "orders", &[1, 2, 3]);
    assert_eq!(index.index_name(), "orders.0");
    assert!(dir.path().join("orders.0").is_file());
}

#[test]
fn reopen_serves_persisted_entries_without_rebuilding() {
    let dir = tempdir().unwrap();
    let keys: Vec<i32> = (0..3000).collect();
    drop(build(dir.path(), "persist", &keys));

    // Reopening with an empty source must not rebuild: the counts can
    // only come from the stored tree.
    let mut index =
        BTreeIndex::open(dir.path(), "persist", 0, AttrType::Int, &mut EmptySource).unwrap();
    assert_eq!(
        scan_count(&mut index, i32::MIN, Operator::Gte, i32::MAX, Operator::Lte),
        3000
    );
    assert_eq!(scan_count(&mut index, 100, Operator::Gt, 200, Operator::Lt), 99);
}

#[test]
fn reopen_with_wrong_attr_type_is_rejected() {
    let dir = tempdir().unwrap();
    drop(build(dir.path(), "typed", &[1, 2, 3]));

    let err =
        BTreeIndex::open(dir.path(), "typed", 0, AttrType::Double, &mut EmptySource).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<IndexError>(),
        Some(IndexError::BadIndexInfo { .. })
    ));
}

#[test]
fn corrupted_relation_name_is_rejected() {
    let dir = tempdir().unwrap();
    drop(build(dir.path(), "victim", &[1, 2, 3]));

    // The stored relation name starts at byte 20 of the header page.
    let path = dir.path().join("victim.0");
    let mut file = OpenOptions::new().write(true).open(&path).unwrap();
    file.seek(SeekFrom::Start(20)).unwrap();
    file.write_all(b"x").unwrap();
    drop(file);

    let err =
        BTreeIndex::open(dir.path(), "victim", 0, AttrType::Int, &mut EmptySource).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<IndexError>(),
        Some(IndexError::BadIndexInfo { .. })
    ));
}

#[test]
fn single_leaf_root_survives_reopen() {
    let dir = tempdir().unwrap();
    let keys: Vec<i32> = (0..50).collect();
    drop(build(dir.path(), "tiny", &keys));

    let mut index =
        BTreeIndex::open(dir.path(), "tiny", 0, AttrType::Int, &mut EmptySource).unwrap();
    assert_eq!(scan_count(&mut index, 0, Operator::Gte, 49, Operator::Lte), 50);

    // Inserts after reopen must still hit the leaf-root path, then grow
    // past it correctly.
    for i in 50..(LEAF_CAPACITY as i32 + 50) {
        index.insert_entry(i, Rid::new(9, 0)).unwrap();
    }
    assert_eq!(
        scan_count(&mut index, i32::MIN, Operator::Gte, i32::MAX, Operator::Lte),
        LEAF_CAPACITY + 50
    );
    assert_eq!(index.pinned_pages(), 0);
}

#[test]
fn promoted_root_survives_reopen() {
    let dir = tempdir().unwrap();
    let keys: Vec<i32> = (0..(3 * LEAF_CAPACITY as i32)).collect();
    drop(build(dir.path(), "grown", &keys));

    let mut index =
        BTreeIndex::open(dir.path(), "grown", 0, AttrType::Int, &mut EmptySource).unwrap();
    assert_eq!(
        scan_count(&mut index, i32::MIN, Operator::Gte, i32::MAX, Operator::Lte),
        3 * LEAF_CAPACITY
    );

    // The reopened tree keeps accepting inserts through interior routing.
    index.insert_entry(-1, Rid::new(9, 1)).unwrap();
    index
        .insert_entry(3 * LEAF_CAPACITY as i32, Rid::new(9, 2))
        .unwrap();
    assert_eq!(
        scan_count(&mut index, i32::MIN, Operator::Gte, i32::MAX, Operator::Lte),
        3 * LEAF_CAPACITY + 2
    );
}

#[test]
fn deep_tree_with_interior_splits() {
    let dir = tempdir().unwrap();
    let mut index =
        BTreeIndex::open(dir.path(), "deep", 0, AttrType::Int, &mut EmptySource).unwrap();

    // Ascending inserts leave each split-off leaf about half full, so this
    // produces enough leaves to fill and split the level-1 root.
    let n: i32 = 120_000;
    for i in 0..n {
        index.insert_entry(i, Rid::new((i / 100 + 1) as u32, (i % 100) as u16)).unwrap();
    }
    assert_eq!(index.pinned_pages(), 0);

    assert_eq!(
        scan_count(&mut index, i32::MIN, Operator::Gte, i32::MAX, Operator::Lte),
        n as usize
    );
    assert_eq!(
        scan_count(&mut index, 59_000, Operator::Gte, 60_000, Operator::Lt),
        1000
    );
    assert_eq!(scan_count(&mut index, -5, Operator::Gt, 5, Operator::Lt), 5);
    assert_eq!(
        scan_count(&mut index, n - 1, Operator::Gte, n, Operator::Lt),
        1
    );

    // And the three-level tree survives a reopen.
    drop(index);
    let mut index =
        BTreeIndex::open(dir.path(), "deep", 0, AttrType::Int, &mut EmptySource).unwrap();
    assert_eq!(
        scan_count(&mut index, i32::MIN, Operator::Gte, i32::MAX, Operator::Lte),
        n as usize
    );
    assert_eq!(
        scan_count(&mut index, 100_000, Operator::Gt, 100_500, Operator::Lte),
        500
    );
}

#[test]
fn two_indexes_over_different_offsets_coexist() {
    let dir = tempdir().unwrap();

    let mut heap = HeapFile::create(dir.path().join("multi"), RECORD_LEN).unwrap();
    for i in 0..500i32 {
        let mut record = [0u8; RECORD_LEN];
        record[..4].copy_from_slice(&i.to_le_bytes());
        record[4..].copy_from_slice(&(-i).to_le_bytes());
        heap.append(&record).unwrap();
    }

    let mut by_first =
        BTreeIndex::open(dir.path(), "multi", 0, AttrType::Int, &mut heap.scan()).unwrap();
    let mut by_second =
        BTreeIndex::open(dir.path(), "multi", 4, AttrType::Int, &mut heap.scan()).unwrap();

    assert_eq!(by_first.index_name(), "multi.0");
    assert_eq!(by_second.index_name(), "multi.4");
    assert_eq!(scan_count(&mut by_first, 0, Operator::Gte, 99, Operator::Lte), 100);
    assert_eq!(
        scan_count(&mut by_second, -99, Operator::Gte, 0, Operator::Lte),
        100
    );
}
