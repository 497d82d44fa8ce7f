#![allow(dead_code)]

use std::path::{Path, PathBuf};

use uuid::Uuid;

/// Deterministic UUIDv7 at the given millisecond timestamp.
pub fn key_at(ts_ms: i64, seed: u32) -> Uuid {
    let mut b = [0u8; 16];
    b[0] = (ts_ms >> 40) as u8;
    b[1] = (ts_ms >> 32) as u8;
    b[2] = (ts_ms >> 24) as u8;
    b[3] = (ts_ms >> 16) as u8;
    b[4] = (ts_ms >> 8) as u8;
    b[5] = ts_ms as u8;
    b[6] = 0x70;
    b[7] = (seed >> 16) as u8;
    b[8] = 0x80;
    // keep the random portion nonzero so no seed collides with the
    // engine's null-random key shape
    b[9] = 1;
    b[14] = (seed >> 8) as u8;
    b[15] = seed as u8;
    Uuid::from_bytes(b)
}

pub fn scratch_db(row_size: u64, skew_ms: i64) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.fdb");
    frozendb::create_database(&path, row_size, skew_ms).unwrap();
    (dir, path)
}

pub fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).unwrap().len()
}

pub fn row_bytes(path: &Path, row_size: u64, index: u64) -> Vec<u8> {
    let all = std::fs::read(path).unwrap();
    let off = (64 + index * row_size) as usize;
    all[off..off + row_size as usize].to_vec()
}

pub fn start_control(path: &Path, row_size: u64, index: u64) -> u8 {
    row_bytes(path, row_size, index)[1]
}

pub fn end_control(path: &Path, row_size: u64, index: u64) -> [u8; 2] {
    let row = row_bytes(path, row_size, index);
    [row[row.len() - 5], row[row.len() - 4]]
}
