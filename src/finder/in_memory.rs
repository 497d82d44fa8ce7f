use std::collections::HashMap;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::key;
use crate::row::{Row, StartControl};

use super::{Finder, MaxTimestamp};

/// Per-row bookkeeping. One slot per row in file order, checksum rows
/// included so slot position equals row index.
enum Slot {
    Checksum,
    Entry {
        tx_start: u64,
        /// `None` while the transaction has no terminating row.
        tx_end: Option<u64>,
    },
}

#[derive(Default)]
struct Index {
    by_key: HashMap<Uuid, u64>,
    slots: Vec<Slot>,
    /// Start index of the transaction currently missing a terminator.
    open_tx: Option<u64>,
}

/// Finder with full in-memory maps: key to row index, row index to
/// transaction boundaries. Built by the open-time sweep, maintained
/// incrementally; every query is O(1) under a read lock.
#[derive(Default)]
pub struct InMemoryFinder {
    index: RwLock<Index>,
    max_ts: MaxTimestamp,
}

impl InMemoryFinder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Finder for InMemoryFinder {
    fn get_index(&self, key: &Uuid) -> Result<u64> {
        key::validate(key)?;
        self.index
            .read()
            .by_key
            .get(key)
            .copied()
            .ok_or(Error::KeyNotFound)
    }

    fn transaction_start(&self, index: u64) -> Result<u64> {
        match self.index.read().slots.get(index as usize) {
            Some(Slot::Entry { tx_start, .. }) => Ok(*tx_start),
            Some(Slot::Checksum) => Err(Error::invalid_input(
                "transaction query on a checksum row",
            )),
            None => Err(Error::invalid_input(format!("row index {index} out of range"))),
        }
    }

    fn transaction_end(&self, index: u64) -> Result<u64> {
        match self.index.read().slots.get(index as usize) {
            Some(Slot::Entry { tx_end, .. }) => tx_end.ok_or(Error::TransactionActive),
            Some(Slot::Checksum) => Err(Error::invalid_input(
                "transaction query on a checksum row",
            )),
            None => Err(Error::invalid_input(format!("row index {index} out of range"))),
        }
    }

    fn max_timestamp(&self) -> i64 {
        self.max_ts.get()
    }

    fn on_row(&self, index: u64, row: &Row) -> Result<()> {
        self.max_ts.observe(row);

        let mut index_guard = self.index.write();
        let idx = &mut *index_guard;
        debug_assert_eq!(idx.slots.len() as u64, index, "rows must arrive in order");

        match row {
            Row::Checksum(_) => idx.slots.push(Slot::Checksum),
            Row::Data(_) | Row::Null(_) => {
                let tx_start = match row.start() {
                    StartControl::TransactionStart => {
                        idx.open_tx = Some(index);
                        index
                    }
                    // a continuation without an open transaction is a crash
                    // artifact; treat the row as its own start
                    _ => idx.open_tx.unwrap_or(index),
                };

                idx.slots.push(Slot::Entry {
                    tx_start,
                    tx_end: None,
                });

                // real keys only: null-random keys mark rolled-back or
                // recovery-terminated slots
                if let Row::Data(data) = row {
                    if let Some(k) = data.key {
                        if !key::is_null_random(&k) {
                            idx.by_key.insert(k, index);
                        }
                    }
                }

                if row.end().is_terminating() {
                    for i in tx_start..=index {
                        if let Some(Slot::Entry { tx_end, .. }) = idx.slots.get_mut(i as usize) {
                            *tx_end = Some(index);
                        }
                    }
                    idx.open_tx = None;
                }
            }
        }
        Ok(())
    }
}
