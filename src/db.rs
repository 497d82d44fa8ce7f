use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam::channel::{bounded, unbounded};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::emitter::RowEmitter;
use crate::error::{Error, Result};
use crate::finder::{self, Finder, Strategy};
use crate::header::{Header, HEADER_SIZE};
use crate::io::FileExt;
use crate::manager::{DbFile, OpenMode, WriteRequest};
use crate::recovery::{self, TailState};
use crate::row::checksum::{self, CHECKSUM_INTERVAL};
use crate::row::{EndControl, Row};
use crate::transaction::{ActiveSlot, Transaction};
use crate::watcher::FileWatcher;

/// Write the unprivileged part of a new database: the 64-byte header and the
/// initial checksum row at index 0. Setting the filesystem append-only
/// attribute is left to the privileged creation utility; the engine itself
/// never creates files at open.
pub fn create_database(path: &Path, row_size: u64, skew_ms: i64) -> Result<()> {
    let header = Header::new(row_size, skew_ms)?;
    let file = std::fs::OpenOptions::new()
        .create_new(true)
        .read(true)
        .write(true)
        .open(path)
        .map_err(|source| Error::Path {
            path: path.to_owned(),
            source,
        })?;

    file.write_all_at(&header.encode(), 0)
        .map_err(|e| Error::Write(format!("write header: {e}")))?;
    // an empty block seals to CRC 0
    file.write_all_at(&checksum::encode_checksum_row(row_size, 0), HEADER_SIZE)
        .map_err(|e| Error::Write(format!("write initial checksum row: {e}")))?;
    file.sync_data()
        .map_err(|e| Error::Write(format!("sync new database: {e}")))?;
    tracing::info!(?path, row_size, skew_ms, "created database");
    Ok(())
}

struct Subscriptions {
    counter: u64,
    finder: u64,
    file: u64,
}

/// The database façade. Owns the file manager, row emitter, finder and (in
/// read mode) the file watcher; gates the single active transaction; and
/// resolves reads through the visibility rules.
pub struct FrozenDb {
    file: Arc<DbFile>,
    emitter: Arc<RowEmitter>,
    finder: Arc<dyn Finder>,
    watcher: Mutex<Option<FileWatcher>>,
    header: Header,
    mode: OpenMode,
    active: ActiveSlot,
    /// Checksum rows on disk, fed by our own emitter subscription.
    checksum_rows: Arc<AtomicU64>,
    subs: Subscriptions,
    closed: AtomicBool,
}

impl FrozenDb {
    /// Open an existing database. Validates the header, recovers any open
    /// transaction (write mode), builds the finder by sweeping every row
    /// through the live notification path, and, in read mode, brings the
    /// watcher up race-free.
    #[tracing::instrument]
    pub fn open(path: &Path, mode: OpenMode, strategy: Strategy) -> Result<Self> {
        let file = DbFile::open(path, mode)?;
        let result = Self::build(path, file.clone(), mode, strategy);
        if result.is_err() {
            let _ = file.close();
        }
        result
    }

    fn build(
        path: &Path,
        file: Arc<DbFile>,
        mode: OpenMode,
        strategy: Strategy,
    ) -> Result<Self> {
        if file.size() < HEADER_SIZE {
            return Err(Error::corrupt("file is shorter than the header"));
        }
        let header = Header::decode(&file.read(0, HEADER_SIZE)?)?;
        let row_size = header.row_size();

        // row 0 is the creation utility's checksum row; its absence is
        // tolerated only while the file has no rows at all
        if file.size() >= HEADER_SIZE + row_size {
            if !finder::read_row(&file, row_size, 0)?.is_checksum() {
                return Err(Error::corrupt("row 0 is not the initial checksum row"));
            }
        }

        let mut recovered = None;
        if mode == OpenMode::Write {
            recovered = match recovery::scan_tail(&file, row_size)? {
                TailState::Clean => None,
                TailState::Active(state) => Some(state),
                TailState::PartialChecksum { offset, len } => {
                    complete_checksum_fragment(&file, row_size, offset, len)?;
                    match recovery::scan_tail(&file, row_size)? {
                        TailState::Clean => None,
                        TailState::Active(state) => Some(state),
                        TailState::PartialChecksum { .. } => {
                            return Err(Error::corrupt("torn checksum row survived completion"))
                        }
                    }
                }
            };
        }

        let emitter = RowEmitter::new(file.clone(), row_size);

        let checksum_rows = Arc::new(AtomicU64::new(0));
        let counter = checksum_rows.clone();
        let counter_sub = emitter.subscribe(Box::new(move |_, row| {
            if row.is_checksum() {
                counter.fetch_add(1, Ordering::AcqRel);
            }
            Ok(())
        }));

        let finder = finder::build(strategy, file.clone(), row_size, header.skew_ms());
        let finder_sub = {
            let finder = finder.clone();
            emitter.subscribe(Box::new(move |index, row| finder.on_row(index, row)))
        };

        // read mode: register the watch first so growth during the sweep
        // queues instead of racing it
        let mut watcher = match mode {
            OpenMode::Read => Some(FileWatcher::register(path)?),
            OpenMode::Write => None,
        };

        let file_sub = emitter.attach();

        // sweep everything already on disk through the live path
        emitter.on_growth(0, file.size())?;

        if let Some(watcher) = watcher.as_mut() {
            watcher.start(file.clone())?;
        }

        let active: ActiveSlot = Arc::new(Mutex::new(None));
        let db = Self {
            file,
            emitter,
            finder,
            watcher: Mutex::new(watcher),
            header,
            mode,
            active: active.clone(),
            checksum_rows,
            subs: Subscriptions {
                counter: counter_sub,
                finder: finder_sub,
                file: file_sub,
            },
            closed: AtomicBool::new(false),
        };

        if let Some(state) = recovered {
            tracing::warn!(
                rows = state.rows,
                has_partial = state.partial.is_some(),
                "recovered an open transaction; it must be rolled back"
            );
            let (sender, receiver) = unbounded();
            db.file.set_writer(receiver)?;
            let tx = Transaction::recovered(
                db.file.clone(),
                db.finder.clone(),
                row_size,
                db.header.skew_ms(),
                db.checksum_rows.clone(),
                sender,
                active.clone(),
                state.rows,
                state.savepoints,
                state.partial,
            );
            *active.lock() = Some(tx);
        }

        Ok(db)
    }

    pub fn row_size(&self) -> u64 {
        self.header.row_size()
    }

    pub fn skew_ms(&self) -> i64 {
        self.header.skew_ms()
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Tombstoned);
        }
        Ok(())
    }

    /// Begin the write transaction. Fails while another (or a recovered)
    /// transaction is active.
    pub fn begin_tx(&self) -> Result<Arc<Transaction>> {
        self.ensure_open()?;
        if self.mode != OpenMode::Write {
            return Err(Error::InvalidAction("begin_tx on a read-mode handle"));
        }
        let mut slot = self.active.lock();
        if slot.is_some() {
            return Err(Error::InvalidAction("a transaction is already active"));
        }
        let (sender, receiver) = unbounded();
        self.file.set_writer(receiver)?;
        let tx = Transaction::begin(
            self.file.clone(),
            self.finder.clone(),
            self.row_size(),
            self.skew_ms(),
            self.checksum_rows.clone(),
            sender,
            self.active.clone(),
        );
        *slot = Some(tx.clone());
        Ok(tx)
    }

    /// The currently active transaction, recovered ones included.
    pub fn active_tx(&self) -> Option<Arc<Transaction>> {
        self.active.lock().clone()
    }

    /// Look the key up and decode its stored value into `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &Uuid) -> Result<T> {
        let raw = self.get_raw(key)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Look the key up and return the stored value bytes. Keys inside a
    /// rolled-back range read as `KeyNotFound`; keys in a transaction with
    /// no terminator yet read as `TransactionActive`.
    pub fn get_raw(&self, key: &Uuid) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let index = self.finder.get_index(key)?;
        let start = self.finder.transaction_start(index)?;
        let end_index = self.finder.transaction_end(start)?;
        let end_row = finder::read_row(&self.file, self.row_size(), end_index)?;

        let visible = match end_row.end() {
            EndControl::Commit | EndControl::SavepointCommit => true,
            EndControl::NullRow => false,
            EndControl::Rollback(0) | EndControl::SavepointRollback(0) => false,
            EndControl::Rollback(n) | EndControl::SavepointRollback(n) => {
                index <= self.nth_savepoint_index(start, end_index, n)?
            }
            EndControl::RowEnd | EndControl::SavepointRowEnd | EndControl::ChecksumSeal => {
                return Err(Error::corrupt(format!(
                    "transaction end scan stopped at a non-terminator at row {end_index}"
                )))
            }
        };
        if !visible {
            return Err(Error::KeyNotFound);
        }

        match finder::read_row(&self.file, self.row_size(), index)? {
            Row::Data(data) if data.key.as_ref() == Some(key) => Ok(data.value),
            _ => Err(Error::corrupt(format!(
                "row {index} does not hold key {key}"
            ))),
        }
    }

    /// Index of the n-th savepoint-marked row of the transaction spanning
    /// `start..=end`.
    fn nth_savepoint_index(&self, start: u64, end: u64, n: u8) -> Result<u64> {
        let mut seen = 0u8;
        for i in start..=end {
            let row = finder::read_row(&self.file, self.row_size(), i)?;
            if row.is_checksum() {
                continue;
            }
            if row.end().marks_savepoint() {
                seen += 1;
                if seen == n {
                    return Ok(i);
                }
            }
        }
        Err(Error::corrupt(format!(
            "savepoint {n} missing from transaction {start}..={end}"
        )))
    }

    pub fn max_timestamp(&self) -> i64 {
        self.finder.max_timestamp()
    }

    /// Offline integrity sweep: sentinels, parity, control pairs and stored
    /// block CRCs over the whole file.
    pub fn check(&self) -> Result<()> {
        self.ensure_open()?;
        recovery::sweep(&self.file, self.row_size())
    }

    /// Idempotent. Stops the watcher, detaches the finder and emitter, and
    /// closes the file manager.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::debug!("closing database");
        if let Some(mut watcher) = self.watcher.lock().take() {
            watcher.close();
        }
        self.emitter.unsubscribe(self.subs.finder);
        self.emitter.unsubscribe(self.subs.counter);
        self.file.unsubscribe(self.subs.file);
        self.active.lock().take();
        self.file.close()
    }
}

impl Drop for FrozenDb {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// A checksum row torn mid-append: its CRC is a pure function of the block
/// already on disk, so rebuild the row, verify the fragment is a prefix of
/// it, and append the missing suffix.
fn complete_checksum_fragment(
    file: &Arc<DbFile>,
    row_size: u64,
    offset: u64,
    len: u64,
) -> Result<()> {
    if offset < HEADER_SIZE + CHECKSUM_INTERVAL * row_size {
        return Err(Error::corrupt("torn checksum row without a full block"));
    }
    let block_start = offset - CHECKSUM_INTERVAL * row_size;
    let mut block = checksum::BlockChecksum::new();
    let mut at = block_start;
    const ROWS_PER_READ: u64 = 128;
    while at < offset {
        let rows = ROWS_PER_READ.min((offset - at) / row_size);
        let buf = file.read(at, rows * row_size)?;
        for chunk in buf.chunks_exact(row_size as usize) {
            block.update(chunk)?;
        }
        at += rows * row_size;
    }

    let full = checksum::encode_checksum_row(row_size, block.finalize());
    let prefix = file.read(offset, len)?;
    if full[..len as usize] != prefix[..] {
        return Err(Error::corrupt("torn checksum row does not match its block"));
    }

    tracing::warn!(offset, len, "completing a torn checksum row");
    let (sender, receiver) = unbounded();
    file.set_writer(receiver)?;
    let (done_tx, done_rx) = bounded(1);
    sender
        .send(WriteRequest {
            bytes: Bytes::from(full[len as usize..].to_vec()),
            done: done_tx,
        })
        .map_err(|_| Error::Tombstoned)?;
    let outcome = done_rx.recv().map_err(|_| Error::Tombstoned)?;
    drop(sender);
    file.writer_closed()?;
    outcome.map(|_| ())
}
