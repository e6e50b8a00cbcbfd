//! # Engine Smoke Test
//!
//! End-to-end scenarios through the public API against real files:
//! CRUD semantics, traversal and cursor behavior, space reuse, wipe, and
//! whole-database locking. If any test here fails after a change, the
//! engine regressed; fix the engine, not the expected values.

use std::collections::BTreeSet;

use tempfile::tempdir;

use flatdb::{Database, Error, StoreMode, TraverseAction};

fn create_db(hash_size: u32) -> (Database, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let db = Database::options()
        .hash_size(hash_size)
        .open(dir.path().join("smoke.fdb"))
        .unwrap();
    (db, dir)
}

mod crud {
    use super::*;

    #[test]
    fn roundtrip_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reopen.fdb");

        {
            let db = Database::open(&path).unwrap();
            db.store(b"alpha", b"one", StoreMode::Replace).unwrap();
            db.store(b"beta", b"two", StoreMode::Replace).unwrap();
        }

        let db = Database::open(&path).unwrap();
        assert_eq!(db.fetch(b"alpha").unwrap(), b"one");
        assert_eq!(db.fetch(b"beta").unwrap(), b"two");
        assert_eq!(db.hash_size(), 131);
    }

    #[test]
    fn binary_keys_and_values_are_preserved() {
        let (db, _dir) = create_db(31);
        let key = [0u8, 255, 10, 13, 0, 7];
        let value: Vec<u8> = (0..=255u8).cycle().take(1000).collect();

        db.store(&key, &value, StoreMode::Replace).unwrap();

        assert_eq!(db.fetch(&key).unwrap(), value);
    }

    #[test]
    fn many_keys_with_collisions() {
        // One bucket forces every key onto the same chain.
        let (db, _dir) = create_db(1);

        for i in 0..200u32 {
            db.store(&i.to_le_bytes(), &i.to_le_bytes(), StoreMode::Replace)
                .unwrap();
        }
        for i in 0..200u32 {
            assert_eq!(db.fetch(&i.to_le_bytes()).unwrap(), i.to_le_bytes());
        }

        for i in (0..200u32).step_by(2) {
            db.delete(&i.to_le_bytes()).unwrap();
        }
        for i in 0..200u32 {
            assert_eq!(db.exists(&i.to_le_bytes()).unwrap(), i % 2 == 1);
        }
    }

    #[test]
    fn growing_updates_relocate_the_record() {
        let (db, _dir) = create_db(31);

        db.store(b"k", b"small", StoreMode::Replace).unwrap();
        let big = vec![b'x'; 500];
        db.store(b"k", &big, StoreMode::Replace).unwrap();

        assert_eq!(db.fetch(b"k").unwrap(), big);
    }

    #[test]
    fn delete_then_insert_reuses_space() {
        let (db, _dir) = create_db(31);

        db.store(b"victim", &vec![1u8; 200], StoreMode::Replace)
            .unwrap();
        // Hold the heap end so the freed record stays mid-file.
        db.store(b"anchor", b"x", StoreMode::Replace).unwrap();
        db.delete(b"victim").unwrap();

        let len_before = file_len(&db);
        db.store(b"reuser", &vec![2u8; 150], StoreMode::Replace)
            .unwrap();

        assert_eq!(file_len(&db), len_before, "expected recycled space");
        assert_eq!(db.fetch(b"reuser").unwrap(), vec![2u8; 150]);
    }

    fn file_len(db: &Database) -> u64 {
        std::fs::metadata(db.name().unwrap()).unwrap().len()
    }
}

mod allocator_behavior {
    use super::*;

    fn file_len(db: &Database) -> u64 {
        std::fs::metadata(db.name().unwrap()).unwrap().len()
    }

    #[test]
    fn adjacent_frees_coalesce_for_reuse() {
        let (db, _dir) = create_db(1);

        // Two 64-byte-capacity records, laid out back to back, then a
        // spacer pinning the end of the heap.
        db.store(b"a", &vec![1u8; 63], StoreMode::Replace).unwrap();
        db.store(b"b", &vec![2u8; 63], StoreMode::Replace).unwrap();
        db.store(b"c", b"spacer", StoreMode::Replace).unwrap();

        db.delete(b"a").unwrap();
        db.delete(b"b").unwrap();

        // 64 + 64 + 28 bytes of record overhead reclaimed between them:
        // an allocation of exactly that payload must not grow the file.
        let len_before = file_len(&db);
        db.store(b"d", &vec![3u8; 155], StoreMode::Replace).unwrap();

        assert_eq!(file_len(&db), len_before);
        assert_eq!(db.fetch(b"d").unwrap(), vec![3u8; 155]);
    }

    #[test]
    fn wipe_all_is_size_stable() {
        let (db, _dir) = create_db(31);

        for i in 0..100u32 {
            db.store(&i.to_le_bytes(), &vec![9u8; 40], StoreMode::Replace)
                .unwrap();
        }
        db.wipe_all().unwrap();
        let len = file_len(&db);

        for round in 0..5 {
            db.wipe_all().unwrap();
            assert_eq!(file_len(&db), len, "size changed on wipe round {round}");
        }

        assert!(db.firstkey().unwrap().is_none());
        db.store(b"after", b"wipe", StoreMode::Replace).unwrap();
        assert_eq!(db.fetch(b"after").unwrap(), b"wipe");
        assert_eq!(file_len(&db), len, "wiped space should be recycled");
    }

    #[test]
    fn store_churn_does_not_leak_space_without_bound() {
        let (db, _dir) = create_db(7);

        for _ in 0..10 {
            for i in 0..20u32 {
                db.store(&i.to_le_bytes(), &vec![5u8; 100], StoreMode::Replace)
                    .unwrap();
            }
            for i in 0..20u32 {
                db.delete(&i.to_le_bytes()).unwrap();
            }
        }
        let settled = file_len(&db);

        for i in 0..20u32 {
            db.store(&i.to_le_bytes(), &vec![5u8; 100], StoreMode::Replace)
                .unwrap();
        }

        assert_eq!(file_len(&db), settled, "steady-state churn grew the file");
    }
}

mod traversal_scenarios {
    use super::*;

    #[test]
    fn three_key_walk_then_delete_one() {
        let (db, _dir) = create_db(31);
        db.store(b"a", b"1", StoreMode::Replace).unwrap();
        db.store(b"b", b"22", StoreMode::Replace).unwrap();
        db.store(b"c", b"333", StoreMode::Replace).unwrap();

        let mut seen = BTreeSet::new();
        let mut key = db.firstkey().unwrap();
        while let Some(k) = key {
            assert!(seen.insert(k.clone()), "cursor revisited {k:?}");
            key = db.nextkey(&k).unwrap();
        }
        let expected: BTreeSet<Vec<u8>> =
            [b"a".to_vec(), b"b".to_vec(), b"c".to_vec()].into();
        assert_eq!(seen, expected);

        db.delete(b"b").unwrap();

        let mut seen = BTreeSet::new();
        let mut key = db.firstkey().unwrap();
        while let Some(k) = key {
            seen.insert(k.clone());
            key = db.nextkey(&k).unwrap();
        }
        let expected: BTreeSet<Vec<u8>> = [b"a".to_vec(), b"c".to_vec()].into();
        assert_eq!(seen, expected);

        assert!(matches!(db.fetch(b"b").unwrap_err(), Error::NotFound));
    }

    #[test]
    fn destructive_traversal_terminates_and_empties() {
        let (db, _dir) = create_db(7);
        for i in 0..100u32 {
            db.store(&i.to_le_bytes(), b"doomed", StoreMode::Replace)
                .unwrap();
        }

        let visited = db.traverse(|_, _| TraverseAction::Delete).unwrap();
        assert_eq!(visited, 100);

        assert!(db.firstkey().unwrap().is_none());
        assert_eq!(db.traverse_read(|_, _| TraverseAction::Continue).unwrap(), 0);
    }

    #[test]
    fn traversal_collects_matching_pairs() {
        let (db, _dir) = create_db(31);
        for i in 0..10u32 {
            db.store(format!("key{i}").as_bytes(), format!("val{i}").as_bytes(), StoreMode::Replace)
                .unwrap();
        }

        let mut pairs = Vec::new();
        db.traverse_read(|key, data| {
            pairs.push((key.to_vec(), data.to_vec()));
            TraverseAction::Continue
        })
        .unwrap();

        assert_eq!(pairs.len(), 10);
        for (key, data) in pairs {
            let suffix = &key[b"key".len()..];
            assert_eq!(&data[..b"val".len()], b"val");
            assert_eq!(&data[b"val".len()..], suffix);
        }
    }

    #[test]
    fn cursor_falls_back_when_its_record_moves() {
        let (db, _dir) = create_db(31);
        for i in 0..10u32 {
            db.store(&i.to_le_bytes(), b"v", StoreMode::Replace).unwrap();
        }

        let first = db.firstkey().unwrap().unwrap();
        // Replace with a larger value: the record is relocated, so the
        // cursor's offset no longer carries this key.
        db.store(&first, &vec![7u8; 300], StoreMode::Replace).unwrap();

        let mut seen = BTreeSet::new();
        seen.insert(first.clone());
        let mut key = db.nextkey(&first).unwrap();
        while let Some(k) = key {
            seen.insert(k.clone());
            key = db.nextkey(&k).unwrap();
        }

        // The fresh find-by-key resumed the walk from the stored key.
        assert!(seen.len() >= 2, "walk should continue past a moved record");
    }
}

mod locking {
    use super::*;

    #[test]
    fn whole_database_lock_cycles() {
        let (db, _dir) = create_db(31);

        db.lock_all().unwrap();
        // Operations from the locking handle proceed under the lock.
        db.store(b"k", b"v", StoreMode::Replace).unwrap();
        db.unlock_all().unwrap();

        db.lock_all_read().unwrap();
        assert_eq!(db.fetch(b"k").unwrap(), b"v");
        db.unlock_all_read().unwrap();
    }

    #[test]
    fn try_lock_all_succeeds_uncontended() {
        let (db, _dir) = create_db(31);

        db.try_lock_all().unwrap();
        db.unlock_all().unwrap();
        db.try_lock_all_read().unwrap();
        db.unlock_all_read().unwrap();
    }

    #[test]
    fn unlock_without_lock_is_an_error() {
        let (db, _dir) = create_db(31);

        assert!(matches!(db.unlock_all().unwrap_err(), Error::Lock(_)));
    }

    #[test]
    fn no_lock_mode_still_works_single_process() {
        let dir = tempdir().unwrap();
        let db = Database::options()
            .no_lock(true)
            .open(dir.path().join("nolock.fdb"))
            .unwrap();

        db.store(b"k", b"v", StoreMode::Replace).unwrap();
        assert_eq!(db.fetch(b"k").unwrap(), b"v");
        db.lock_all().unwrap();
        db.unlock_all().unwrap();
    }

    #[test]
    fn handle_is_shareable_across_threads() {
        use std::sync::Arc;

        let (db, _dir) = create_db(31);
        let db = Arc::new(db);

        let mut handles = Vec::new();
        for t in 0..4u32 {
            let db = Arc::clone(&db);
            handles.push(std::thread::spawn(move || {
                for i in 0..50u32 {
                    let key = (t * 1000 + i).to_le_bytes();
                    db.store(&key, b"thread", StoreMode::Replace).unwrap();
                    assert_eq!(db.fetch(&key).unwrap(), b"thread");
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let count = db.traverse_read(|_, _| TraverseAction::Continue).unwrap();
        assert_eq!(count, 200);
    }
}

mod dead_records {
    use super::*;

    #[test]
    fn budgeted_deletes_stay_correct_under_churn() {
        let dir = tempdir().unwrap();
        let db = Database::options()
            .hash_size(2)
            .max_dead(5)
            .open(dir.path().join("dead.fdb"))
            .unwrap();

        for round in 0..5u8 {
            for i in 0..30u32 {
                db.store(&i.to_le_bytes(), &vec![round; 20], StoreMode::Replace)
                    .unwrap();
            }
            for i in 0..30u32 {
                if i % 3 == 0 {
                    db.delete(&i.to_le_bytes()).unwrap();
                }
            }
            for i in 0..30u32 {
                if i % 3 == 0 {
                    assert!(!db.exists(&i.to_le_bytes()).unwrap());
                } else {
                    assert_eq!(db.fetch(&i.to_le_bytes()).unwrap(), vec![round; 20]);
                }
            }
        }
    }

    #[test]
    fn writable_traversal_reclaims_dead_records() {
        let dir = tempdir().unwrap();
        let db = Database::options()
            .hash_size(1)
            .max_dead(100)
            .open(dir.path().join("reclaim.fdb"))
            .unwrap();

        for i in 0..20u32 {
            db.store(&i.to_le_bytes(), b"v", StoreMode::Replace).unwrap();
        }
        for i in 0..20u32 {
            db.delete(&i.to_le_bytes()).unwrap();
        }

        // Dead records are invisible to traversal, and a writable walk
        // sweeps them out in passing.
        assert_eq!(db.traverse(|_, _| TraverseAction::Continue).unwrap(), 0);

        db.store(b"fresh", b"start", StoreMode::Replace).unwrap();
        assert_eq!(db.fetch(b"fresh").unwrap(), b"start");
    }
}

mod sequences {
    use super::*;

    #[test]
    fn mutations_bump_the_counter_when_enabled() {
        let (db, _dir) = create_db(31);
        db.enable_sequence();
        let base = db.sequence_number().unwrap();

        db.store(b"k", b"v", StoreMode::Replace).unwrap();
        db.append(b"k", b"w").unwrap();
        db.delete(b"k").unwrap();

        assert_eq!(db.sequence_number().unwrap(), base + 3);
    }

    #[test]
    fn counter_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seq.fdb");

        {
            let db = Database::options().sequence(true).open(&path).unwrap();
            db.store(b"k", b"v", StoreMode::Replace).unwrap();
            db.set_sequence_number(1000).unwrap();
        }

        let db = Database::open(&path).unwrap();
        assert_eq!(db.sequence_number().unwrap(), 1000);
    }

    #[test]
    fn reads_never_bump_the_counter() {
        let (db, _dir) = create_db(31);
        db.enable_sequence();
        db.store(b"k", b"v", StoreMode::Replace).unwrap();
        let seq = db.sequence_number().unwrap();

        db.fetch(b"k").unwrap();
        db.exists(b"k").unwrap();
        db.firstkey().unwrap();
        db.traverse_read(|_, _| TraverseAction::Continue).unwrap();

        assert_eq!(db.sequence_number().unwrap(), seq);
    }
}
