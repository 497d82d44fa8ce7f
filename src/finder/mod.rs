use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::header::HEADER_SIZE;
use crate::manager::DbFile;
use crate::row::{Row, StartControl};

pub mod binary_search;
pub mod in_memory;
pub mod simple;

pub use binary_search::BinarySearchFinder;
pub use in_memory::InMemoryFinder;
pub use simple::SimpleFinder;

/// Key lookup strategy, chosen per handle at open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Forward file scans, no memory.
    Simple,
    /// Full key and transaction-boundary maps, O(1) queries.
    #[default]
    InMemory,
    /// Timestamp-sorted array searched within the skew window.
    BinarySearch,
}

/// Query interface over the row stream. Implementations keep their state
/// current from row notifications and are safe for concurrent queries.
///
/// Row indexes are zero-based over everything after the header, checksum
/// rows included; the transaction-boundary methods reject an index pointing
/// at a checksum row.
pub trait Finder: Send + Sync {
    fn get_index(&self, key: &Uuid) -> Result<u64>;
    fn transaction_start(&self, index: u64) -> Result<u64>;
    fn transaction_end(&self, index: u64) -> Result<u64>;
    fn max_timestamp(&self) -> i64;

    /// Row notification entry point, driven by the emitter.
    fn on_row(&self, index: u64, row: &Row) -> Result<()>;
}

pub(crate) fn build(
    strategy: Strategy,
    file: Arc<DbFile>,
    row_size: u64,
    skew_ms: i64,
) -> Arc<dyn Finder> {
    match strategy {
        Strategy::Simple => Arc::new(SimpleFinder::new(file, row_size)),
        Strategy::InMemory => Arc::new(InMemoryFinder::new()),
        Strategy::BinarySearch => Arc::new(BinarySearchFinder::new(file, row_size, skew_ms)),
    }
}

/// Longest possible transaction footprint in rows: 100 data rows plus the
/// single checksum row a 10,000-row boundary can interleave, with one row of
/// slack.
pub(crate) const MAX_TX_SPAN: u64 = 102;

/// Highest timestamp seen across every DataRow and NullRow notification,
/// rolled-back rows included. A single atomic; 0 until the first row.
#[derive(Default)]
pub(crate) struct MaxTimestamp(AtomicI64);

impl MaxTimestamp {
    pub(crate) fn observe(&self, row: &Row) {
        if let Some(ts) = row.timestamp_ms() {
            self.0.fetch_max(ts, Ordering::AcqRel);
        }
    }

    pub(crate) fn get(&self) -> i64 {
        self.0.load(Ordering::Acquire)
    }
}

pub(crate) fn row_count(file: &DbFile, row_size: u64) -> u64 {
    file.size().saturating_sub(HEADER_SIZE) / row_size
}

pub(crate) fn read_row(file: &DbFile, row_size: u64, index: u64) -> Result<Row> {
    let buf = file.read(HEADER_SIZE + index * row_size, row_size)?;
    Row::decode(&buf)
}

/// File-scanning transaction-boundary queries, shared by the finders that
/// keep no boundary maps. Walks backward to the nearest `T` start.
pub(crate) fn scan_transaction_start(file: &DbFile, row_size: u64, index: u64) -> Result<u64> {
    if index >= row_count(file, row_size) {
        return Err(Error::invalid_input(format!("row index {index} out of range")));
    }
    let mut i = index;
    let mut steps = 0u64;
    loop {
        let row = read_row(file, row_size, i)?;
        if row.is_checksum() {
            if i == index {
                return Err(Error::invalid_input(
                    "transaction query on a checksum row",
                ));
            }
        } else {
            if row.start() == StartControl::TransactionStart {
                return Ok(i);
            }
            if i != index && row.end().is_terminating() {
                return Err(Error::corrupt(format!(
                    "row {i} terminates before the start of the transaction at {index}"
                )));
            }
        }
        if i == 0 || steps >= MAX_TX_SPAN {
            return Err(Error::corrupt(format!(
                "no transaction start within {MAX_TX_SPAN} rows of {index}"
            )));
        }
        i -= 1;
        steps += 1;
    }
}

/// Walks forward to the transaction's terminating row. A second `T` start
/// before any terminator means the chain was abandoned by a crash and will
/// never terminate, which still reads as an active transaction.
pub(crate) fn scan_transaction_end(file: &DbFile, row_size: u64, index: u64) -> Result<u64> {
    let count = row_count(file, row_size);
    if index >= count {
        return Err(Error::invalid_input(format!("row index {index} out of range")));
    }
    let mut i = index;
    let mut steps = 0u64;
    loop {
        let row = read_row(file, row_size, i)?;
        if !row.is_checksum() {
            if i > index && row.start() == StartControl::TransactionStart {
                return Err(Error::TransactionActive);
            }
            if row.end().is_terminating() {
                return Ok(i);
            }
        } else if i == index {
            return Err(Error::invalid_input(
                "transaction query on a checksum row",
            ));
        }
        i += 1;
        steps += 1;
        if i >= count {
            return Err(Error::TransactionActive);
        }
        if steps > MAX_TX_SPAN {
            return Err(Error::corrupt(format!(
                "no terminator within {MAX_TX_SPAN} rows of {index}"
            )));
        }
    }
}
