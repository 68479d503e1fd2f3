//! File Manager: concurrent-reader/single-writer file access, exclusive
//! advisory locking, an asynchronous append writer, and the size-change
//! notification bus (spec.md §4.3).
//!
//! Every successful [`FileManager::append`] dispatches its bus
//! subscribers synchronously before returning, and the Row Emitter's
//! subscription bridges that synchronous callback back into an async row
//! read via `block_in_place` + `Handle::block_on` (see `emitter.rs`).
//! `block_in_place` panics on a current-thread runtime, so any caller
//! that writes through a `FrozenDB` opened in write mode must run on a
//! multi-thread Tokio runtime (`#[tokio::main]`'s default, or
//! `#[tokio::test(flavor = "multi_thread")]` in tests).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use fs2::FileExt;
use notify::{EventKind, RecursiveMode, Watcher};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;

use crate::bus::{SubscriberBus, Unsubscribe};
use crate::error::{Error, Result};

/// How a [`FileManager`] was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
}

/// A single append submitted on the writer channel, with its own
/// response channel for per-write error propagation.
pub struct WriteSubmission {
    pub bytes: Vec<u8>,
    pub resp: oneshot::Sender<Result<()>>,
}

/// The owning end of the installed writer channel, returned by
/// [`FileManager::set_writer`].
pub type WriterSender = mpsc::Sender<WriteSubmission>;

struct WriteTaskHandles {
    sender: WriterSender,
    task: JoinHandle<()>,
}

/// Owns the file handle; provides random-access reads, an async append
/// writer, and size-change notifications. One instance per open file.
pub struct FileManager {
    path: PathBuf,
    mode: Mode,
    row_size: usize,
    file: AsyncMutex<Option<tokio::fs::File>>,
    /// Kept only to hold the OS advisory lock for the handle's lifetime in
    /// write mode; never read otherwise.
    _lock_file: Option<std::fs::File>,
    size: AtomicI64,
    writer: AsyncMutex<Option<WriteTaskHandles>>,
    writer_drained: Notify,
    bus: SubscriberBus<()>,
    tombstoned: AtomicBool,
    watcher_task: AsyncMutex<Option<JoinHandle<()>>>,
    _watcher: AsyncMutex<Option<notify::RecommendedWatcher>>,
}

impl FileManager {
    /// Open `path` in `mode`. Write mode opens `O_RDWR` and acquires a
    /// non-blocking OS advisory exclusive lock, failing with `write-error`
    /// if another writer already holds it. Read mode opens `O_RDONLY` and
    /// takes no lock. `row_size` is required up front so the row-aligned
    /// read-mode emitter math (spec.md §4.5) has it available; callers
    /// obtain it by reading and validating the header first.
    pub async fn open(path: impl AsRef<Path>, mode: Mode, row_size: usize) -> Result<Arc<Self>> {
        let path = path.as_ref().to_path_buf();

        let (std_file, lock_file) = match mode {
            Mode::Read => {
                let f = std::fs::OpenOptions::new()
                    .read(true)
                    .open(&path)
                    .map_err(|e| path_or_read_error(e, "open for read"))?;
                (f, None)
            }
            Mode::Write => {
                let f = std::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&path)
                    .map_err(|e| path_or_read_error(e, "open for write"))?;
                f.try_lock_exclusive().map_err(|_| {
                    Error::WriteError(format!(
                        "could not acquire exclusive lock on {}",
                        path.display()
                    ))
                })?;
                let lock_copy = f
                    .try_clone()
                    .map_err(|e| Error::WriteError(format!("failed to clone lock handle: {e}")))?;
                (f, Some(lock_copy))
            }
        };

        let initial_len = std_file
            .metadata()
            .map_err(|e| Error::ReadError(format!("stat failed: {e}")))?
            .len();

        let file = tokio::fs::File::from_std(std_file);

        let manager = Arc::new(FileManager {
            path: path.clone(),
            mode,
            row_size,
            file: AsyncMutex::new(Some(file)),
            _lock_file: lock_file,
            size: AtomicI64::new(initial_len as i64),
            writer: AsyncMutex::new(None),
            writer_drained: Notify::new(),
            bus: SubscriberBus::new(),
            tombstoned: AtomicBool::new(false),
            watcher_task: AsyncMutex::new(None),
            _watcher: AsyncMutex::new(None),
        });

        if mode == Mode::Read {
            manager.clone().start_watcher().await?;
        }

        Ok(manager)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn row_size(&self) -> usize {
        self.row_size
    }

    fn check_alive(&self) -> Result<()> {
        if self.tombstoned.load(Ordering::SeqCst) {
            return Err(Error::Tombstoned);
        }
        Ok(())
    }

    /// Last observed size of the file, updated atomically after any
    /// successful write and on external-change detection.
    pub fn size(&self) -> i64 {
        self.size.load(Ordering::SeqCst)
    }

    /// Positional read of `size` bytes starting at `offset`.
    pub async fn read(&self, offset: i64, size: i64) -> Result<Vec<u8>> {
        self.check_alive()?;
        if offset < 0 {
            return Err(Error::invalid_input("negative read offset"));
        }
        if size <= 0 {
            return Err(Error::invalid_input("non-positive read size"));
        }
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or(Error::Tombstoned)?;
        file.seek(std::io::SeekFrom::Start(offset as u64))
            .await
            .map_err(|e| Error::ReadError(format!("seek failed: {e}")))?;
        let mut buf = vec![0u8; size as usize];
        file.read_exact(&mut buf)
            .await
            .map_err(|e| Error::ReadError(format!("read past EOF or I/O failure: {e}")))?;
        Ok(buf)
    }

    /// Install the single writer channel for this manager, spawning the
    /// task that consumes submissions in FIFO order and appends them to
    /// the file. Fails `invalid-action` if a writer is already installed.
    pub async fn set_writer(self: &Arc<Self>) -> Result<WriterSender> {
        self.check_alive()?;
        let mut slot = self.writer.lock().await;
        if slot.is_some() {
            return Err(Error::invalid_action("a writer is already installed"));
        }
        let (tx, mut rx) = mpsc::channel::<WriteSubmission>(32);
        let manager = self.clone();
        let task = tokio::spawn(async move {
            while let Some(sub) = rx.recv().await {
                let result = manager.append(&sub.bytes).await;
                let _ = sub.resp.send(result);
            }
            manager.writer_drained.notify_waiters();
            let mut slot = manager.writer.lock().await;
            *slot = None;
        });
        *slot = Some(WriteTaskHandles {
            sender: tx.clone(),
            task,
        });
        Ok(tx)
    }

    async fn append(&self, bytes: &[u8]) -> Result<()> {
        self.check_alive()?;
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or(Error::Tombstoned)?;
        let offset = self.size.load(Ordering::SeqCst);
        file.seek(std::io::SeekFrom::Start(offset as u64))
            .await
            .map_err(|e| Error::WriteError(format!("seek failed: {e}")))?;
        file.write_all(bytes)
            .await
            .map_err(|e| Error::WriteError(format!("write failed: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| Error::WriteError(format!("fsync failed: {e}")))?;
        self.size
            .store(offset + bytes.len() as i64, Ordering::SeqCst);
        drop(guard);
        log::debug!(
            "file manager appended {} bytes at offset {offset}, new size {}",
            bytes.len(),
            self.size()
        );
        // In write mode the process performing the append already knows
        // about the growth; publish directly instead of waiting on an OS
        // notification (which only fires for external, read-mode growth).
        self.bus.publish(())
    }

    /// Blocks until the currently installed writer has drained and is no
    /// longer registered. No-op in read mode.
    pub async fn writer_closed(&self) {
        loop {
            {
                let slot = self.writer.lock().await;
                if slot.is_none() {
                    return;
                }
            }
            self.writer_drained.notified().await;
        }
    }

    /// Register a listener for size-increasing change events. Read mode
    /// only: write-mode growth is observed directly by the writer, not
    /// through this bus's dispatch path from external callers.
    pub fn subscribe<F>(&self, cb: F) -> Unsubscribe
    where
        F: Fn(()) -> Result<()> + Send + Sync + 'static,
    {
        self.bus.subscribe(cb)
    }

    async fn start_watcher(self: Arc<Self>) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let path = self.path.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    let _ = tx.send(());
                }
            }
        })
        .map_err(|e| Error::ReadError(format!("failed to create file watcher: {e}")))?;
        watcher
            .watch(&path, RecursiveMode::NonRecursive)
            .map_err(|e| Error::ReadError(format!("failed to watch {}: {e}", path.display())))?;
        *self._watcher.lock().await = Some(watcher);

        // Kickstart: catch any growth that happened between recording the
        // initial size and the watcher becoming active.
        self.run_update_cycle().await;

        let manager = self.clone();
        let task = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                // Coalesce a burst of events arriving during one cycle.
                while rx.try_recv().is_ok() {}
                if !manager.run_update_cycle().await {
                    log::error!("size-change watcher shutting down after subscriber error");
                    break;
                }
            }
        });
        *self.watcher_task.lock().await = Some(task);
        Ok(())
    }

    /// Runs one update cycle: recompute size, and if it grew, update the
    /// atomic and publish before returning. Returns `false` if a
    /// subscriber errored (the watcher loop should stop).
    async fn run_update_cycle(&self) -> bool {
        if self.tombstoned.load(Ordering::SeqCst) {
            return false;
        }
        let new_len = {
            let guard = self.file.lock().await;
            match guard.as_ref() {
                Some(f) => match f.metadata().await {
                    Ok(m) => m.len() as i64,
                    Err(e) => {
                        log::warn!("size-change watcher stat failed: {e}");
                        return true;
                    }
                },
                None => return false,
            }
        };
        let old_len = self.size.load(Ordering::SeqCst);
        if new_len <= old_len {
            return true;
        }
        self.size.store(new_len, Ordering::SeqCst);
        match self.bus.publish(()) {
            Ok(()) => true,
            Err(e) => {
                log::error!("size-change subscriber error: {e}");
                false
            }
        }
    }

    /// Idempotent: releases the writer, closes the file, releases the
    /// lock, and tombstones the handle. Subsequent operations fail with
    /// `tombstoned`.
    pub async fn close(&self) {
        if self.tombstoned.swap(true, Ordering::SeqCst) {
            return; // already closed
        }
        if let Some(task) = self.watcher_task.lock().await.take() {
            task.abort();
        }
        *self._watcher.lock().await = None;
        self.writer.lock().await.take();
        self.writer_drained.notify_waiters();
        self.file.lock().await.take();
        // Dropping `_lock_file` (on drop of `self`) releases the advisory
        // lock; closing here just tombstones the handle.
        log::info!("file manager closed {}", self.path.display());
    }
}

fn path_or_read_error(e: std::io::Error, what: &str) -> Error {
    match e.kind() {
        std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
            Error::PathError(format!("{what} failed: {e}"))
        }
        _ => Error::ReadError(format!("{what} failed: {e}")),
    }
}
