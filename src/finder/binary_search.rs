use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::key;
use crate::manager::DbFile;
use crate::row::Row;

use super::{scan_transaction_end, scan_transaction_start, Finder, MaxTimestamp};

struct Entry {
    ts: i64,
    key: Uuid,
    index: u64,
}

/// Finder over a timestamp-sorted array. UUIDv7 keys arrive in
/// near-insertion order, so inserts are an O(1) push except within the skew
/// window; lookups binary-search to the window and compare full keys from
/// there. Transaction boundaries use the capped file scans.
pub struct BinarySearchFinder {
    file: Arc<DbFile>,
    row_size: u64,
    skew_ms: i64,
    entries: RwLock<Vec<Entry>>,
    max_ts: MaxTimestamp,
}

impl BinarySearchFinder {
    pub fn new(file: Arc<DbFile>, row_size: u64, skew_ms: i64) -> Self {
        Self {
            file,
            row_size,
            skew_ms,
            entries: RwLock::new(Vec::new()),
            max_ts: MaxTimestamp::default(),
        }
    }
}

impl Finder for BinarySearchFinder {
    fn get_index(&self, key: &Uuid) -> Result<u64> {
        key::validate(key)?;
        let ts = key::timestamp_ms(key);

        let entries = self.entries.read();
        let window_start = ts.saturating_sub(self.skew_ms);
        let window_end = ts.saturating_add(self.skew_ms);

        let mut i = entries.partition_point(|e| e.ts < window_start);
        while let Some(entry) = entries.get(i) {
            if entry.ts > window_end {
                break;
            }
            if entry.key == *key {
                return Ok(entry.index);
            }
            i += 1;
        }
        Err(Error::KeyNotFound)
    }

    fn transaction_start(&self, index: u64) -> Result<u64> {
        scan_transaction_start(&self.file, self.row_size, index)
    }

    fn transaction_end(&self, index: u64) -> Result<u64> {
        scan_transaction_end(&self.file, self.row_size, index)
    }

    fn max_timestamp(&self) -> i64 {
        self.max_ts.get()
    }

    fn on_row(&self, index: u64, row: &Row) -> Result<()> {
        self.max_ts.observe(row);

        if let Row::Data(data) = row {
            if let Some(k) = data.key.filter(|k| !key::is_null_random(k)) {
                let ts = key::timestamp_ms(&k);
                let mut entries = self.entries.write();
                let at = match entries.last() {
                    // the common case: timestamps only move forward
                    Some(last) if last.ts <= ts => entries.len(),
                    _ => entries.partition_point(|e| e.ts <= ts),
                };
                entries.insert(at, Entry { ts, key: k, index });
            }
        }
        Ok(())
    }
}
