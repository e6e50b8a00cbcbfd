//! # On-Disk Format Tests
//!
//! Exercises the file format contract from the outside: header
//! validation, corruption detection on poisoned bytes, read-only
//! handles, and cross-endian files. These tests manipulate database
//! files directly, so they spell out the layout they expect:
//!
//! ```text
//! 0    .. 32    magic
//! 32   .. 52    version, hash_size, reserved, recovery_start, seqnum
//! 52   .. 128   padding
//! 128  ..       directory: (hash_size + 1) x u32, slot 0 = free chain
//! heap ..       records: 24-byte header, payload, 4-byte tailer
//! ```

use std::fs;
use std::path::Path;

use tempfile::tempdir;

use flatdb::{Database, Error, ErrorCode, StoreMode};

const DIRECTORY_OFFSET: u64 = 128;
const RECORD_HEADER_SIZE: u64 = 24;
const TAG_OFFSET: u64 = 20;

fn read_u32(bytes: &[u8], off: u64) -> u32 {
    let off = off as usize;
    u32::from_ne_bytes(bytes[off..off + 4].try_into().unwrap())
}

fn write_u32(bytes: &mut [u8], off: u64, value: u32) {
    let off = off as usize;
    bytes[off..off + 4].copy_from_slice(&value.to_ne_bytes());
}

/// Creates a single-bucket database holding one record and returns the
/// record's offset as read from the bucket's directory slot.
fn seeded_db(path: &Path) -> u64 {
    let db = Database::options().hash_size(1).open(path).unwrap();
    db.store(b"k", b"value", StoreMode::Replace).unwrap();
    drop(db);

    let bytes = fs::read(path).unwrap();
    let bucket_slot = DIRECTORY_OFFSET + 4;
    u64::from(read_u32(&bytes, bucket_slot))
}

#[test]
fn poisoned_status_tag_reads_as_corruption() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("poison.fdb");
    let rec_off = seeded_db(&path);

    let mut bytes = fs::read(&path).unwrap();
    write_u32(&mut bytes, rec_off + TAG_OFFSET, 0xbaad_f00d);
    fs::write(&path, &bytes).unwrap();

    let db = Database::open(&path).unwrap();
    let err = db.fetch(b"k").unwrap_err();

    assert!(matches!(err, Error::Corrupt(_)), "got {err:?}");
    assert_eq!(db.last_error(), ErrorCode::Corrupt);
}

#[test]
fn self_referential_chain_reads_as_corruption() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cycle.fdb");
    let rec_off = seeded_db(&path);

    let mut bytes = fs::read(&path).unwrap();
    // Point the record's next pointer back at itself.
    write_u32(&mut bytes, rec_off, rec_off as u32);
    fs::write(&path, &bytes).unwrap();

    let db = Database::open(&path).unwrap();
    // Any lookup in this bucket walks into the bad link.
    let err = db.fetch(b"missing").unwrap_err();

    assert!(matches!(err, Error::Corrupt(_)), "got {err:?}");
}

#[test]
fn overlong_record_reads_as_corruption() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("overlong.fdb");
    let rec_off = seeded_db(&path);

    let mut bytes = fs::read(&path).unwrap();
    // Capacity far past end of file.
    write_u32(&mut bytes, rec_off + 4, 0x00ff_ffff);
    fs::write(&path, &bytes).unwrap();

    let db = Database::open(&path).unwrap();
    let err = db.fetch(b"k").unwrap_err();

    assert!(matches!(err, Error::Corrupt(_)), "got {err:?}");
}

#[test]
fn truncated_header_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("stub.fdb");
    fs::write(&path, b"flatdb key-value store v1\n").unwrap();

    let err = Database::open(&path).unwrap_err();
    assert!(matches!(err, Error::Corrupt(_)), "got {err:?}");
}

#[test]
fn foreign_file_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("foreign.fdb");
    fs::write(&path, vec![0x42u8; 4096]).unwrap();

    let err = Database::open(&path).unwrap_err();
    assert!(matches!(err, Error::Corrupt(_)), "got {err:?}");
}

#[test]
fn read_only_handle_reads_but_never_writes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ro.fdb");

    {
        let db = Database::open(&path).unwrap();
        db.store(b"k", b"v", StoreMode::Replace).unwrap();
    }

    let db = Database::options().read_only(true).open(&path).unwrap();
    assert_eq!(db.fetch(b"k").unwrap(), b"v");
    assert!(db.exists(b"k").unwrap());
    assert_eq!(db.firstkey().unwrap().unwrap(), b"k");

    assert!(matches!(
        db.store(b"k", b"w", StoreMode::Replace).unwrap_err(),
        Error::ReadOnly
    ));
    assert!(matches!(db.delete(b"k").unwrap_err(), Error::ReadOnly));
    assert!(matches!(db.append(b"k", b"w").unwrap_err(), Error::ReadOnly));
    assert!(matches!(db.wipe_all().unwrap_err(), Error::ReadOnly));
    assert_eq!(db.last_error(), ErrorCode::ReadOnly);
}

#[test]
fn missing_file_without_create_is_an_io_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("absent.fdb");

    let err = Database::options().create(false).open(&path).unwrap_err();
    assert!(matches!(err, Error::Io(_)), "got {err:?}");
}

#[test]
fn raw_fd_is_exposed_for_file_databases() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path().join("fd.fdb")).unwrap();

    assert!(db.raw_fd().is_some());

    let mem = Database::options().open_in_memory().unwrap();
    assert!(mem.raw_fd().is_none());
}

#[test]
fn cross_endian_file_is_converted_transparently() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("swapped.fdb");

    {
        let db = Database::options().hash_size(1).open(&path).unwrap();
        db.store(b"k", b"v", StoreMode::Replace).unwrap();
    }

    // Byte-swap every multi-byte field, simulating a file written on a
    // machine of the opposite endianness: five header words, both
    // directory slots, the record's six header words, and its tailer.
    let mut bytes = fs::read(&path).unwrap();
    let rec_off = u64::from(read_u32(&bytes, DIRECTORY_OFFSET + 4));
    let capacity = u64::from(read_u32(&bytes, rec_off + 4));
    let mut words = vec![32, 36, 40, 44, 48, DIRECTORY_OFFSET, DIRECTORY_OFFSET + 4];
    for field in 0..6 {
        words.push(rec_off + field * 4);
    }
    words.push(rec_off + RECORD_HEADER_SIZE + capacity);
    for off in words {
        let value = read_u32(&bytes, off);
        write_u32(&mut bytes, off, value.swap_bytes());
    }
    fs::write(&path, &bytes).unwrap();

    let db = Database::open(&path).unwrap();
    assert_eq!(db.hash_size(), 1);
    assert_eq!(db.fetch(b"k").unwrap(), b"v");

    // Writes through the converting handle keep the foreign byte order.
    db.store(b"second", b"record", StoreMode::Replace).unwrap();
    db.store(b"k", b"updated!!", StoreMode::Replace).unwrap();
    drop(db);

    let db = Database::open(&path).unwrap();
    assert_eq!(db.fetch(b"k").unwrap(), b"updated!!");
    assert_eq!(db.fetch(b"second").unwrap(), b"record");
}
