use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::error::{Error, Result};
use crate::manager::DbFile;

/// Read-mode growth detector. Watches the database file's parent directory
/// through OS change notifications and re-reads the committed size on every
/// relevant event, which drives the file manager's subscribers (and with
/// them the row emitter).
///
/// Registration and dispatch are split so a finder can be brought up
/// race-free: between `register` and `start`, events queue in the channel;
/// the dispatch thread first drains that queue and loops until the size is
/// stable, then blocks on live events.
pub struct FileWatcher {
    // kept alive for the lifetime of the watch
    _watcher: RecommendedWatcher,
    path: PathBuf,
    events: Option<Receiver<notify::Result<Event>>>,
    shutdown_tx: Sender<()>,
    shutdown_rx: Option<Receiver<()>>,
    thread: Option<JoinHandle<()>>,
}

impl FileWatcher {
    /// Register the OS watch. Events start queueing immediately; nothing is
    /// dispatched until `start`. Registration failure is a hard error.
    pub fn register(path: &Path) -> Result<Self> {
        let path = path.canonicalize().map_err(|source| Error::Path {
            path: path.to_owned(),
            source,
        })?;
        let parent = path.parent().unwrap_or_else(|| Path::new(".")).to_owned();

        let (event_tx, event_rx) = unbounded();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = event_tx.send(res);
        })?;
        watcher.watch(&parent, RecursiveMode::NonRecursive)?;
        tracing::debug!(?parent, target = ?path, "registered file watcher");

        let (shutdown_tx, shutdown_rx) = bounded(1);
        Ok(Self {
            _watcher: watcher,
            path,
            events: Some(event_rx),
            shutdown_tx,
            shutdown_rx: Some(shutdown_rx),
            thread: None,
        })
    }

    /// Spawn the dispatch thread: catch up on queued events, then deliver
    /// live ones until shutdown.
    pub fn start(&mut self, file: Arc<DbFile>) -> Result<()> {
        let events = self
            .events
            .take()
            .ok_or(Error::InvalidAction("watcher already started"))?;
        let shutdown = self.shutdown_rx.take().expect("taken with events");
        let path = self.path.clone();

        let handle = std::thread::Builder::new()
            .name("frozendb-watcher".into())
            .spawn(move || dispatch_loop(file, path, events, shutdown))
            .map_err(|e| Error::Watcher(notify::Error::io(e)))?;
        self.thread = Some(handle);
        Ok(())
    }

    /// Stop the dispatch thread and drop the OS watch. Idempotent.
    pub fn close(&mut self) {
        let _ = self.shutdown_tx.try_send(());
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.close();
    }
}

fn dispatch_loop(
    file: Arc<DbFile>,
    path: PathBuf,
    events: Receiver<notify::Result<Event>>,
    shutdown: Receiver<()>,
) {
    // Catch-up: drain whatever queued while the finder was scanning, and
    // keep re-reading until the size is stable with an empty queue.
    loop {
        if shutdown.try_recv().is_ok() {
            return;
        }
        let mut saw_event = false;
        while let Ok(res) = events.try_recv() {
            saw_event |= is_relevant(&path, res);
        }
        match file.refresh_size() {
            Ok((prev, new)) if !saw_event && new == prev => break,
            Ok(_) => {}
            Err(Error::Tombstoned) => return,
            Err(e) => {
                tracing::error!(error = %e, "file watcher stopping during catch-up");
                return;
            }
        }
    }
    tracing::trace!("file watcher caught up, dispatching live events");

    loop {
        crossbeam::select! {
            recv(events) -> msg => match msg {
                Ok(res) => {
                    if !is_relevant(&path, res) {
                        continue;
                    }
                    match file.refresh_size() {
                        Ok(_) => {}
                        Err(Error::Tombstoned) => return,
                        Err(e) => {
                            tracing::error!(error = %e, "file watcher stopping");
                            return;
                        }
                    }
                }
                Err(_) => return,
            },
            recv(shutdown) -> _ => return,
        }
    }
}

fn is_relevant(path: &Path, res: notify::Result<Event>) -> bool {
    let event = match res {
        Ok(event) => event,
        Err(e) => {
            tracing::error!(error = %e, "file watcher event error");
            return false;
        }
    };
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any => {}
        _ => return false,
    }
    // a notification without paths gives no way to filter; re-read the size
    event.paths.is_empty() || event.paths.iter().any(|p| p == path)
}

#[cfg(test)]
mod test {
    use std::io::Write as _;
    use std::time::{Duration, Instant};

    use parking_lot::Mutex;

    use super::*;
    use crate::manager::OpenMode;

    #[test]
    fn observes_external_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watched.fdb");
        std::fs::write(&path, [0u8; 64]).unwrap();

        let file = DbFile::open(&path, OpenMode::Read).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        file.subscribe(Box::new(move |prev, new| {
            seen2.lock().push((prev, new));
            Ok(())
        }));

        let mut watcher = FileWatcher::register(&path).unwrap();
        watcher.start(file.clone()).unwrap();

        let mut raw = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        raw.write_all(&[1u8; 100]).unwrap();
        raw.sync_data().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while file.size() < 164 {
            assert!(Instant::now() < deadline, "watcher missed the append");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(seen.lock().iter().any(|(_, new)| *new == 164));

        watcher.close();
        file.close().unwrap();
    }

    #[test]
    fn registration_on_missing_parent_fails() {
        let missing = Path::new("/definitely/not/a/real/dir/x.fdb");
        assert!(FileWatcher::register(missing).is_err());
    }
}
