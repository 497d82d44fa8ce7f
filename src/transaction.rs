use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam::channel::{bounded, Sender};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::finder::Finder;
use crate::header::HEADER_SIZE;
use crate::key;
use crate::manager::{DbFile, WriteRequest};
use crate::row::checksum::{self, CHECKSUM_INTERVAL};
use crate::row::{self, EndControl, StartControl};

pub(crate) const MAX_ROWS_PER_TX: usize = 100;
pub(crate) const MAX_SAVEPOINTS: u8 = 9;

/// The shared slot FrozenDb uses to gate `begin_tx` and answer
/// `active_tx`. A transaction clears it when it completes.
pub(crate) type ActiveSlot = Arc<Mutex<Option<Arc<Transaction>>>>;

struct PendingRow {
    key: Uuid,
    value: Vec<u8>,
    start: StartControl,
}

/// A trailing row fragment left on disk by an interrupted writer, owned by
/// the recovered transaction until rollback completes it.
pub(crate) struct PartialTail {
    pub offset: u64,
    pub len: u64,
    /// Start control resolved by recovery; the fragment itself may be too
    /// short to carry one.
    pub start: StartControl,
}

enum Origin {
    Fresh,
    Recovered { partial: Option<PartialTail> },
}

struct TxInner {
    file: Arc<DbFile>,
    finder: Arc<dyn Finder>,
    row_size: u64,
    skew_ms: i64,
    /// Count of checksum rows on disk, maintained by the database's emitter
    /// subscription; lets the boundary test run off the file size alone.
    checksum_rows: Arc<AtomicU64>,
    writer: Option<Sender<WriteRequest>>,
    origin: Origin,
    /// The in-flight row: its head is already on disk, its payload and end
    /// control are decided by the next operation.
    pending: Option<PendingRow>,
    rows_accepted: usize,
    savepoints_declared: u8,
    savepoint_pending: bool,
    local_max_ts: i64,
    closed: bool,
    tombstoned: bool,
}

/// A write transaction. Emits a legal row sequence: the first row opens with
/// `T`, continuations with `R`, and exactly one terminating end control
/// closes the transaction on disk. Rows are durable (written and fsync'd)
/// as soon as the operation that finalizes them returns.
pub struct Transaction {
    inner: Mutex<TxInner>,
    slot: ActiveSlot,
}

impl Transaction {
    pub(crate) fn begin(
        file: Arc<DbFile>,
        finder: Arc<dyn Finder>,
        row_size: u64,
        skew_ms: i64,
        checksum_rows: Arc<AtomicU64>,
        writer: Sender<WriteRequest>,
        slot: ActiveSlot,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(TxInner {
                file,
                finder,
                row_size,
                skew_ms,
                checksum_rows,
                writer: Some(writer),
                origin: Origin::Fresh,
                pending: None,
                rows_accepted: 0,
                savepoints_declared: 0,
                savepoint_pending: false,
                local_max_ts: 0,
                closed: false,
                tombstoned: false,
            }),
            slot,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn recovered(
        file: Arc<DbFile>,
        finder: Arc<dyn Finder>,
        row_size: u64,
        skew_ms: i64,
        checksum_rows: Arc<AtomicU64>,
        writer: Sender<WriteRequest>,
        slot: ActiveSlot,
        rows_accepted: usize,
        savepoints_declared: u8,
        partial: Option<PartialTail>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(TxInner {
                file,
                finder,
                row_size,
                skew_ms,
                checksum_rows,
                writer: Some(writer),
                origin: Origin::Recovered { partial },
                pending: None,
                rows_accepted,
                savepoints_declared,
                savepoint_pending: false,
                local_max_ts: 0,
                closed: false,
                tombstoned: false,
            }),
            slot,
        })
    }

    /// True for a transaction reconstructed from the file tail at open.
    /// Recovered transactions only support `rollback`.
    pub fn is_recovered(&self) -> bool {
        matches!(self.inner.lock().origin, Origin::Recovered { .. })
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of data rows accepted so far, the in-flight one included.
    pub fn row_count(&self) -> usize {
        self.inner.lock().rows_accepted
    }

    /// Append a key/value row. The key must be a UUIDv7 whose timestamp is
    /// within `skew_ms` above everything already on disk.
    #[tracing::instrument(skip(self, key, value))]
    pub fn add_row(&self, key: &Uuid, value: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.ensure_active()?;
        if matches!(inner.origin, Origin::Recovered { .. }) {
            return Err(Error::InvalidAction(
                "recovered transaction only supports rollback",
            ));
        }
        if inner.rows_accepted >= MAX_ROWS_PER_TX {
            return Err(Error::InvalidAction("transaction row limit reached"));
        }
        key::validate(key)?;
        if value.len() > row::max_value_len(inner.row_size) {
            return Err(Error::invalid_input(format!(
                "value of {} bytes exceeds the {}-byte row capacity",
                value.len(),
                row::max_value_len(inner.row_size)
            )));
        }

        let ts = key::timestamp_ms(key);
        let max_ts = inner.finder.max_timestamp().max(inner.local_max_ts);
        if ts + inner.skew_ms <= max_ts {
            return Err(Error::KeyOrdering {
                timestamp: ts,
                max_timestamp: max_ts,
                skew_ms: inner.skew_ms,
            });
        }

        if let Some(p) = inner.pending.take() {
            let end = if inner.savepoint_pending {
                EndControl::SavepointRowEnd
            } else {
                EndControl::RowEnd
            };
            inner.savepoint_pending = false;
            inner.finalize_pending(p, end)?;
            inner.maybe_seal_block()?;
        }

        let start = if inner.rows_accepted == 0 {
            StartControl::TransactionStart
        } else {
            StartControl::Continuation
        };
        inner.append(row::head(start).to_vec())?;
        inner.pending = Some(PendingRow {
            key: *key,
            value: value.to_vec(),
            start,
        });
        inner.rows_accepted += 1;
        inner.local_max_ts = inner.local_max_ts.max(ts);
        Ok(())
    }

    /// Declare a savepoint after the most recent row. At most 9 per
    /// transaction, one per row. Returns the savepoint id.
    pub fn savepoint(&self) -> Result<u8> {
        let mut inner = self.inner.lock();
        inner.ensure_active()?;
        if matches!(inner.origin, Origin::Recovered { .. }) {
            return Err(Error::InvalidAction(
                "recovered transaction only supports rollback",
            ));
        }
        if inner.pending.is_none() {
            return Err(Error::InvalidAction(
                "savepoint requires a row in the transaction",
            ));
        }
        if inner.savepoint_pending {
            return Err(Error::InvalidAction(
                "savepoint already declared for this row",
            ));
        }
        if inner.savepoints_declared >= MAX_SAVEPOINTS {
            return Err(Error::InvalidAction("savepoint limit reached"));
        }
        inner.savepoints_declared += 1;
        inner.savepoint_pending = true;
        tracing::debug!(savepoint = inner.savepoints_declared, "savepoint declared");
        Ok(inner.savepoints_declared)
    }

    /// Finalize the in-flight row with a commit terminator and wait for the
    /// writer task to drain. A transaction that never added a row commits as
    /// a no-op.
    #[tracing::instrument(skip(self))]
    pub fn commit(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.ensure_active()?;
        if matches!(inner.origin, Origin::Recovered { .. }) {
            return Err(Error::InvalidAction(
                "recovered transaction only supports rollback",
            ));
        }

        if let Some(p) = inner.pending.take() {
            let end = if inner.savepoint_pending {
                EndControl::SavepointCommit
            } else {
                EndControl::Commit
            };
            inner.savepoint_pending = false;
            inner.finalize_pending(p, end)?;
            inner.maybe_seal_block()?;
        }

        inner.finish()?;
        drop(inner);
        self.release_slot();
        Ok(())
    }

    /// Roll back to savepoint `n` (0 = everything). On a transaction that
    /// never added a row, appends a NullRow to reserve the slot.
    #[tracing::instrument(skip(self))]
    pub fn rollback(&self, n: u8) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.ensure_active()?;
        if n > inner.savepoints_declared {
            return Err(Error::InvalidAction(
                "rollback target beyond declared savepoints",
            ));
        }

        let recovered = match &mut inner.origin {
            Origin::Recovered { partial } => Some(partial.take()),
            Origin::Fresh => None,
        };
        match recovered {
            Some(Some(tail)) => {
                // complete the fragment in place: only the missing suffix is
                // appended
                let prefix = inner.file.read(tail.offset, tail.len)?;
                let full = row::complete_row(
                    inner.row_size,
                    &prefix,
                    Some(tail.start),
                    EndControl::Rollback(n),
                )?;
                inner.append(full[tail.len as usize..].to_vec())?;
                inner.maybe_seal_block()?;
            }
            Some(None) => {
                // the tail rows are all complete; terminate the chain with a
                // slot carrying the null-random key
                let ts = key::unix_ms_now().max(inner.finder.max_timestamp());
                let bytes = row::encode_data_row(
                    inner.row_size,
                    StartControl::Continuation,
                    &key::null_key(ts),
                    &[],
                    EndControl::Rollback(n),
                );
                inner.append(bytes)?;
                inner.maybe_seal_block()?;
            }
            None => match inner.pending.take() {
                Some(p) => {
                    let end = if inner.savepoint_pending {
                        EndControl::SavepointRollback(n)
                    } else {
                        EndControl::Rollback(n)
                    };
                    inner.savepoint_pending = false;
                    inner.finalize_pending(p, end)?;
                    inner.maybe_seal_block()?;
                }
                None => {
                    let ts = key::unix_ms_now().max(inner.finder.max_timestamp());
                    let row_size = inner.row_size;
                    inner.append(row::encode_null_row(row_size, ts))?;
                    inner.maybe_seal_block()?;
                }
            },
        }

        inner.finish()?;
        drop(inner);
        self.release_slot();
        Ok(())
    }

    fn release_slot(&self) {
        self.slot.lock().take();
    }
}

impl TxInner {
    fn ensure_active(&self) -> Result<()> {
        if self.tombstoned {
            return Err(Error::Tombstoned);
        }
        if self.closed {
            return Err(Error::InvalidAction("transaction already completed"));
        }
        Ok(())
    }

    /// Send one append to the writer task and wait for its outcome. Any
    /// failure tombstones the transaction.
    fn append(&mut self, bytes: Vec<u8>) -> Result<u64> {
        let writer = self.writer.as_ref().ok_or(Error::Tombstoned)?;
        let (done_tx, done_rx) = bounded(1);
        let sent = writer.send(WriteRequest {
            bytes: Bytes::from(bytes),
            done: done_tx,
        });
        if sent.is_err() {
            self.tombstoned = true;
            return Err(Error::Tombstoned);
        }
        match done_rx.recv() {
            Ok(Ok(new_size)) => Ok(new_size),
            Ok(Err(e)) => {
                self.tombstoned = true;
                Err(e)
            }
            Err(_) => {
                self.tombstoned = true;
                Err(Error::Tombstoned)
            }
        }
    }

    /// Append everything of the buffered row past its on-disk head.
    fn finalize_pending(&mut self, p: PendingRow, end: EndControl) -> Result<()> {
        let full = row::encode_data_row(self.row_size, p.start, &p.key, &p.value, end);
        self.append(full[2..].to_vec())?;
        Ok(())
    }

    /// After every completed row: if the count of data rows since the last
    /// checksum row reached a multiple of the interval, seal the block now,
    /// before any further head is appended. Every row of the block must pass
    /// the parity check before its bytes enter the CRC.
    fn maybe_seal_block(&mut self) -> Result<()> {
        let size = self.file.size();
        let total_rows = size.saturating_sub(HEADER_SIZE) / self.row_size;
        let data_rows = total_rows - self.checksum_rows.load(Ordering::Acquire);
        if data_rows == 0 || data_rows % CHECKSUM_INTERVAL != 0 {
            return Ok(());
        }

        // the previous checksum row (or the header) sits immediately before
        // these rows, so the block is exactly the last interval's bytes
        let block_start = size - CHECKSUM_INTERVAL * self.row_size;
        let mut block = checksum::BlockChecksum::new();
        let mut offset = block_start;
        const ROWS_PER_READ: u64 = 128;
        while offset < size {
            let rows = ROWS_PER_READ.min((size - offset) / self.row_size);
            let buf = self.file.read(offset, rows * self.row_size)?;
            for chunk in buf.chunks_exact(self.row_size as usize) {
                block.update(chunk)?;
            }
            offset += rows * self.row_size;
        }
        let crc = block.finalize();
        tracing::debug!(data_rows, crc, "sealing checksum block");
        self.append(checksum::encode_checksum_row(self.row_size, crc))?;
        Ok(())
    }

    /// Close the writer channel and wait for the task to drain, so the next
    /// `begin_tx` finds a clean writer slot.
    fn finish(&mut self) -> Result<()> {
        self.writer = None;
        self.closed = true;
        self.file.writer_closed()
    }
}
