use std::sync::Arc;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::key;
use crate::manager::DbFile;
use crate::row::Row;

use super::{
    read_row, row_count, scan_transaction_end, scan_transaction_start, Finder, MaxTimestamp,
};

/// The no-memory finder: every query is a file scan. O(n) lookups, O(1)
/// state.
pub struct SimpleFinder {
    file: Arc<DbFile>,
    row_size: u64,
    max_ts: MaxTimestamp,
}

impl SimpleFinder {
    pub fn new(file: Arc<DbFile>, row_size: u64) -> Self {
        Self {
            file,
            row_size,
            max_ts: MaxTimestamp::default(),
        }
    }
}

impl Finder for SimpleFinder {
    fn get_index(&self, key: &Uuid) -> Result<u64> {
        key::validate(key)?;
        let count = row_count(&self.file, self.row_size);
        for index in 0..count {
            if let Row::Data(data) = read_row(&self.file, self.row_size, index)? {
                if data.key.as_ref() == Some(key) && !key::is_null_random(key) {
                    return Ok(index);
                }
            }
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

    fn on_row(&self, _index: u64, row: &Row) -> Result<()> {
        self.max_ts.observe(row);
        Ok(())
    }
}
