use crate::error::{Error, Result};
use crate::finder::{read_row, MAX_TX_SPAN};
use crate::header::HEADER_SIZE;
use crate::manager::DbFile;
use crate::row::{EndControl, Row, StartControl, ROW_START};
use crate::transaction::PartialTail;

/// What the tail of the file says about transaction state.
pub(crate) enum TailState {
    /// The last row terminates its transaction (or the file has no rows).
    Clean,
    /// An open transaction must be reconstructed.
    Active(RecoveredState),
    /// A checksum row was torn mid-append. It must be completed (its CRC is
    /// recomputable from the block) before the tail can be classified.
    PartialChecksum { offset: u64, len: u64 },
}

pub(crate) struct RecoveredState {
    /// Complete rows already belonging to the open transaction.
    pub rows: usize,
    /// Savepoints declared by those rows.
    pub savepoints: u8,
    pub partial: Option<PartialTail>,
}

/// Classify the file tail. Called at write-mode open, before the finder
/// sweep.
pub(crate) fn scan_tail(file: &DbFile, row_size: u64) -> Result<TailState> {
    let size = file.size();
    let body = size - HEADER_SIZE;
    let complete = body / row_size;
    let rem = body % row_size;

    if rem == 0 {
        if complete == 0 {
            return Ok(TailState::Clean);
        }
        let last = read_row(file, row_size, complete - 1)?;
        if last.end().is_terminating() {
            return Ok(TailState::Clean);
        }
        let (_, rows, savepoints) = walk_open_chain(file, row_size, complete - 1)?;
        return Ok(TailState::Active(RecoveredState {
            rows,
            savepoints,
            partial: None,
        }));
    }

    // a fragment longer than this has its end control partly on disk and
    // cannot be steered to a terminator any more
    if rem > row_size - 5 {
        return Err(Error::corrupt(format!(
            "trailing fragment of {rem} bytes is too advanced to complete"
        )));
    }

    let offset = size - rem;
    let prefix = file.read(offset, rem)?;
    if prefix[0] != ROW_START {
        return Err(Error::corrupt("trailing fragment lost its start sentinel"));
    }
    let known_start = if rem >= 2 {
        Some(StartControl::from_byte(prefix[1])?)
    } else {
        None
    };

    if known_start == Some(StartControl::Checksum) {
        return Ok(TailState::PartialChecksum { offset, len: rem });
    }

    let predecessor = last_data_end(file, row_size, complete)?;
    let start = match known_start {
        Some(s) => s,
        // a one-byte fragment: whether it opened or continued a transaction
        // follows from the row before it
        None => match &predecessor {
            Some((_, end)) if !end.is_terminating() => StartControl::Continuation,
            _ => StartControl::TransactionStart,
        },
    };

    match start {
        StartControl::TransactionStart => {
            if let Some((i, end)) = predecessor {
                if !end.is_terminating() {
                    return Err(Error::corrupt(format!(
                        "fragment opens a transaction while row {i} leaves one open"
                    )));
                }
            }
            Ok(TailState::Active(RecoveredState {
                rows: 0,
                savepoints: 0,
                partial: Some(PartialTail {
                    offset,
                    len: rem,
                    start,
                }),
            }))
        }
        StartControl::Continuation => {
            let Some((pred_index, end)) = predecessor else {
                return Err(Error::corrupt("continuation fragment with no prior row"));
            };
            if end.is_terminating() {
                return Err(Error::corrupt(format!(
                    "continuation fragment after terminated row {pred_index}"
                )));
            }
            let (_, rows, savepoints) = walk_open_chain(file, row_size, pred_index)?;
            Ok(TailState::Active(RecoveredState {
                rows,
                savepoints,
                partial: Some(PartialTail {
                    offset,
                    len: rem,
                    start,
                }),
            }))
        }
        StartControl::Checksum => unreachable!("handled above"),
    }
}

/// Index and end control of the last non-checksum row below `count`, if any.
fn last_data_end(file: &DbFile, row_size: u64, count: u64) -> Result<Option<(u64, EndControl)>> {
    let mut i = count;
    let mut steps = 0u64;
    while i > 0 {
        i -= 1;
        let row = read_row(file, row_size, i)?;
        if !row.is_checksum() {
            return Ok(Some((i, row.end())));
        }
        steps += 1;
        if steps > MAX_TX_SPAN {
            return Err(Error::corrupt("checksum rows all the way down"));
        }
    }
    Ok(None)
}

/// Walk backward from `top` (a row with a non-terminating end control) to
/// the transaction's `T` row, counting rows and savepoints. Checksum rows
/// inside the chain are transparent. A terminating end control or a missing
/// start inside the window is corruption.
fn walk_open_chain(file: &DbFile, row_size: u64, top: u64) -> Result<(u64, usize, u8)> {
    let mut i = top;
    let mut rows = 0usize;
    let mut savepoints = 0u8;
    let mut steps = 0u64;
    loop {
        let row = read_row(file, row_size, i)?;
        if !row.is_checksum() {
            if row.end().is_terminating() {
                if rows == 0 {
                    return Err(Error::corrupt(format!(
                        "row {i} is not part of an open transaction"
                    )));
                }
                return Err(Error::corrupt(format!(
                    "terminator at row {i} inside an open transaction"
                )));
            }
            rows += 1;
            if row.end().marks_savepoint() {
                savepoints += 1;
            }
            if row.start() == StartControl::TransactionStart {
                return Ok((i, rows, savepoints));
            }
        }
        if i == 0 || steps >= MAX_TX_SPAN {
            return Err(Error::corrupt(format!(
                "no transaction start within {MAX_TX_SPAN} rows of {top}"
            )));
        }
        i -= 1;
        steps += 1;
    }
}

/// Reads used by `FrozenDb::check`: decode every complete row, verifying the
/// stored CRC of each checksum block on the way, and permit a fragment only
/// at the very end.
pub(crate) fn sweep(file: &DbFile, row_size: u64) -> Result<()> {
    let size = file.size();
    let body = size.saturating_sub(HEADER_SIZE);
    let complete = body / row_size;
    let rem = body % row_size;

    let mut block = crate::row::checksum::BlockChecksum::new();
    let mut block_rows = 0u64;
    for index in 0..complete {
        let offset = HEADER_SIZE + index * row_size;
        let buf = file.read(offset, row_size)?;
        let row = Row::decode(&buf)
            .map_err(|e| Error::corrupt(format!("row {index}: {e}")))?;
        match row {
            Row::Checksum(c) => {
                let computed = std::mem::take(&mut block).finalize();
                if block_rows > 0 && computed != c.crc {
                    return Err(Error::corrupt(format!(
                        "checksum row {index}: stored {:#010x}, computed {computed:#010x}",
                        c.crc
                    )));
                }
                block_rows = 0;
            }
            _ => {
                block.update(&buf)?;
                block_rows += 1;
            }
        }
    }

    if rem > 0 {
        let prefix = file.read(size - rem, rem)?;
        if prefix[0] != ROW_START || rem > row_size - 5 {
            return Err(Error::corrupt("unrecoverable trailing fragment"));
        }
    }
    Ok(())
}
