use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::Bytes;
use crossbeam::channel::{bounded, Receiver, Sender};
use nix::fcntl::{Flock, FlockArg};
use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::io::FileExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

/// One append handed to the writer task. `done` is signaled exactly once
/// with the outcome; on success it carries the new committed size.
pub struct WriteRequest {
    pub bytes: Bytes,
    pub done: Sender<Result<u64>>,
}

pub type GrowthCallback = Box<dyn Fn(u64, u64) -> Result<()> + Send + Sync>;

enum FileKind {
    Plain(File),
    Locked(Flock<File>),
}

impl FileKind {
    fn file(&self) -> &File {
        match self {
            FileKind::Plain(f) => f,
            FileKind::Locked(l) => l,
        }
    }
}

#[derive(Default)]
struct WriterSlot {
    handle: Option<JoinHandle<()>>,
    shutdown: Option<Sender<()>>,
}

/// The file manager. Owns the open handle (and, in write mode, the exclusive
/// advisory lock), tracks the committed size as a single atomic, serializes
/// appends through one writer task, and fans growth out to subscribers in
/// registration order.
pub struct DbFile {
    inner: RwLock<Option<FileKind>>,
    path: PathBuf,
    mode: OpenMode,
    size: AtomicU64,
    subscribers: Mutex<Vec<(u64, GrowthCallback)>>,
    next_sub_id: AtomicU64,
    writer: Mutex<WriterSlot>,
    tombstoned: AtomicBool,
    closed: AtomicBool,
}

impl DbFile {
    pub fn open(path: &Path, mode: OpenMode) -> Result<Arc<Self>> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(mode == OpenMode::Write)
            .open(path)
            .map_err(|source| Error::Path {
                path: path.to_owned(),
                source,
            })?;

        let kind = match mode {
            OpenMode::Read => FileKind::Plain(file),
            OpenMode::Write => match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(lock) => FileKind::Locked(lock),
                Err((file, errno)) => {
                    drop(file);
                    return Err(Error::Write(format!(
                        "exclusive lock on {path:?}: {errno}"
                    )));
                }
            },
        };

        let size = kind.file().len().map_err(Error::Read)?;
        tracing::debug!(?path, ?mode, size, "opened database file");

        Ok(Arc::new(Self {
            inner: RwLock::new(Some(kind)),
            path: path.to_owned(),
            mode,
            size: AtomicU64::new(size),
            subscribers: Mutex::new(Vec::new()),
            next_sub_id: AtomicU64::new(0),
            writer: Mutex::new(WriterSlot::default()),
            tombstoned: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Committed size. Never includes bytes of an append still in flight.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    fn with_file<R>(&self, f: impl FnOnce(&File) -> R) -> Result<R> {
        let guard = self.inner.read();
        match guard.as_ref() {
            Some(kind) => Ok(f(kind.file())),
            None => Err(Error::Tombstoned),
        }
    }

    /// Positional read of a stable byte range.
    pub fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Tombstoned);
        }
        if offset + len > self.size() {
            return Err(Error::Read(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "read of {len} bytes at {offset} past committed size {}",
                    self.size()
                ),
            )));
        }
        let mut buf = vec![0u8; len as usize];
        self.with_file(|f| f.read_exact_at(&mut buf, offset))?
            .map_err(Error::Read)?;
        Ok(buf)
    }

    /// Read mode: re-stat the file and publish any growth to subscribers.
    /// Returns `(prev, new)` committed sizes.
    pub fn refresh_size(&self) -> Result<(u64, u64)> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Tombstoned);
        }
        let actual = self.with_file(|f| f.len())?.map_err(Error::Read)?;
        let prev = self.size();
        if actual <= prev {
            return Ok((prev, prev));
        }
        self.size.store(actual, Ordering::Release);
        self.notify_growth(prev, actual)?;
        Ok((prev, actual))
    }

    /// Register a growth subscriber. Subscribers are invoked in registration
    /// order; the returned id removes this one without disturbing the rest.
    pub fn subscribe(&self, callback: GrowthCallback) -> u64 {
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push((id, callback));
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().retain(|(sub_id, _)| *sub_id != id);
    }

    fn notify_growth(&self, prev: u64, new: u64) -> Result<()> {
        let subscribers = self.subscribers.lock();
        let mut first_err = None;
        for (_, callback) in subscribers.iter() {
            if let Err(e) = callback(prev, new) {
                tracing::error!(error = %e, "growth subscriber failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Install the writer task consuming `requests`. Write mode only; one
    /// writer per manager at a time.
    pub fn set_writer(self: &Arc<Self>, requests: Receiver<WriteRequest>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Tombstoned);
        }
        if self.mode != OpenMode::Write {
            return Err(Error::InvalidAction("set_writer on a read-mode file"));
        }
        if self.tombstoned.load(Ordering::Acquire) {
            return Err(Error::Tombstoned);
        }

        let mut slot = self.writer.lock();
        if slot.handle.is_some() {
            return Err(Error::InvalidAction("writer already installed"));
        }

        let (shutdown_tx, shutdown_rx) = bounded(1);
        let this = self.clone();
        let handle = std::thread::Builder::new()
            .name("frozendb-writer".into())
            .spawn(move || this.writer_loop(requests, shutdown_rx))
            .map_err(|e| Error::Write(format!("spawn writer task: {e}")))?;

        slot.handle = Some(handle);
        slot.shutdown = Some(shutdown_tx);
        Ok(())
    }

    fn writer_loop(&self, requests: Receiver<WriteRequest>, shutdown: Receiver<()>) {
        tracing::trace!("writer task started");
        loop {
            crossbeam::select! {
                recv(requests) -> msg => match msg {
                    Ok(req) => {
                        if !self.handle_write(req, &requests) {
                            break;
                        }
                    }
                    // every sender dropped: drained, clean exit
                    Err(_) => break,
                },
                recv(shutdown) -> _ => {
                    Self::drain(&requests);
                    break;
                }
            }
        }
        tracing::trace!("writer task exited");
    }

    /// Returns false when the task must exit.
    fn handle_write(&self, req: WriteRequest, requests: &Receiver<WriteRequest>) -> bool {
        let prev = self.size();
        let outcome = match self.with_file(|f| {
            f.write_all_at(&req.bytes, prev)
                .and_then(|_| f.sync_data())
        }) {
            Ok(io) => io,
            Err(_) => {
                // closed under us
                let _ = req.done.send(Err(Error::Tombstoned));
                return false;
            }
        };

        if let Err(e) = outcome {
            tracing::error!(error = %e, offset = prev, "append failed, tombstoning writer");
            self.tombstoned.store(true, Ordering::Release);
            let _ = req.done.send(Err(Error::Write(format!("append at {prev}: {e}"))));
            Self::drain(requests);
            return false;
        }

        let new = prev + req.bytes.len() as u64;
        self.size.store(new, Ordering::Release);
        let result = self.notify_growth(prev, new).map(|_| new);
        let _ = req.done.send(result);
        true
    }

    fn drain(requests: &Receiver<WriteRequest>) {
        while let Ok(req) = requests.try_recv() {
            let _ = req.done.send(Err(Error::Tombstoned));
        }
    }

    /// Block until the writer task has drained its channel and exited. The
    /// caller must have dropped every request sender first. No-op in read
    /// mode or when no writer is installed.
    pub fn writer_closed(&self) -> Result<()> {
        let handle = self.writer.lock().handle.take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| Error::Write("writer task panicked".into()))?;
            self.writer.lock().shutdown = None;
        }
        Ok(())
    }

    /// Idempotent. Stops the writer task, drops subscribers and releases the
    /// handle (and lock). Every subsequent operation returns `Tombstoned`.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::debug!(path = ?self.path, "closing database file");

        let (handle, shutdown) = {
            let mut slot = self.writer.lock();
            (slot.handle.take(), slot.shutdown.take())
        };
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(());
        }
        if let Some(handle) = handle {
            let _ = handle.join();
        }

        self.subscribers.lock().clear();
        *self.inner.write() = None;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for DbFile {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
