use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::header::HEADER_SIZE;
use crate::manager::DbFile;
use crate::row::Row;

pub type RowCallback = Box<dyn Fn(u64, &Row) -> Result<()> + Send + Sync>;

/// Carves committed byte growth into whole rows and fans each decoded row
/// out to subscribers, in registration order, exactly once, in strictly
/// increasing index order. A trailing fragment shorter than a row is left
/// for the next growth event.
pub struct RowEmitter {
    file: Arc<DbFile>,
    row_size: u64,
    /// Everything below this offset has been delivered.
    cursor: Mutex<u64>,
    subscribers: Mutex<Vec<(u64, RowCallback)>>,
    next_sub_id: AtomicU64,
}

impl RowEmitter {
    pub fn new(file: Arc<DbFile>, row_size: u64) -> Arc<Self> {
        Arc::new(Self {
            file,
            row_size,
            cursor: Mutex::new(HEADER_SIZE),
            subscribers: Mutex::new(Vec::new()),
            next_sub_id: AtomicU64::new(0),
        })
    }

    pub fn subscribe(&self, callback: RowCallback) -> u64 {
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push((id, callback));
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().retain(|(sub_id, _)| *sub_id != id);
    }

    /// Offset of the first byte not yet delivered.
    pub fn cursor(&self) -> u64 {
        *self.cursor.lock()
    }

    /// Growth callback: deliver every whole row in `[cursor, new_size)`.
    ///
    /// Decode failures abort the batch without advancing past the bad row.
    /// Subscriber failures do not stop delivery to later subscribers or
    /// later rows; the first one is returned to the caller that published
    /// the growth.
    pub fn on_growth(&self, _prev: u64, new_size: u64) -> Result<()> {
        let mut cursor = self.cursor.lock();
        let mut first_err = None;

        while *cursor + self.row_size <= new_size {
            let buf = self.file.read(*cursor, self.row_size)?;
            let row = Row::decode(&buf)?;
            let index = (*cursor - HEADER_SIZE) / self.row_size;
            tracing::trace!(index, end = ?row.end(), "row visible");

            let subscribers = self.subscribers.lock();
            for (_, callback) in subscribers.iter() {
                if let Err(e) = callback(index, &row) {
                    tracing::error!(index, error = %e, "row subscriber failed");
                    first_err.get_or_insert(e);
                }
            }
            drop(subscribers);

            *cursor += self.row_size;
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Wire this emitter into the file manager's growth notifications. The
    /// subscription holds a weak reference so the manager never keeps the
    /// emitter alive.
    pub fn attach(self: &Arc<Self>) -> u64 {
        let weak = Arc::downgrade(self);
        self.file.subscribe(Box::new(move |prev, new| {
            match weak.upgrade() {
                Some(emitter) => emitter.on_growth(prev, new),
                None => Ok(()),
            }
        }))
    }
}
