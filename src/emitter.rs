//! Row Emitter: turns byte-level file growth into chronologically-ordered
//! complete-row events for downstream indexers (spec.md §4.5).
//!
//! The subscription this installs on the file manager's bus runs
//! synchronously inside [`crate::filemanager::FileManager::append`] and
//! bridges into this module's async row reads via `block_in_place` +
//! `Handle::block_on`. That bridge requires a multi-thread Tokio
//! runtime: a current-thread runtime panics the moment a row is
//! appended. Any process driving a write-mode `FrozenDB` must run on
//! `#[tokio::main]` (default multi-thread) or
//! `#[tokio::test(flavor = "multi_thread")]`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::bus::{SubscriberBus, Unsubscribe};
use crate::error::Result;
use crate::filemanager::FileManager;
use crate::header::HEADER_SIZE;
use crate::row::{unmarshal_row, RowUnion};

/// A single complete row becoming visible at file-row-index `index`.
#[derive(Debug, Clone)]
pub struct RowEvent {
    pub index: i64,
    pub row: RowUnion,
}

fn row_count_for_size(size: i64, row_size: usize) -> i64 {
    let body = size - HEADER_SIZE as i64;
    if body <= 0 {
        0
    } else {
        body / row_size as i64
    }
}

/// Subscribes to a [`FileManager`]'s size-change bus and republishes each
/// newly complete row, in ascending index order, to its own subscribers
/// (the finders).
pub struct RowEmitter {
    manager: Arc<FileManager>,
    row_size: usize,
    last_emitted_row_count: AtomicI64,
    bus: SubscriberBus<Arc<RowEvent>>,
    _file_manager_sub: Unsubscribe,
}

impl RowEmitter {
    /// Construct and immediately subscribe to `manager`'s change bus. Rows
    /// already present in the file before construction are never emitted.
    pub fn new(manager: Arc<FileManager>) -> Arc<Self> {
        let row_size = manager.row_size();
        let initial_row_count = row_count_for_size(manager.size(), row_size);

        let emitter = Arc::new_cyclic(|weak: &std::sync::Weak<RowEmitter>| {
            let weak = weak.clone();
            let sub = manager.subscribe(move |()| {
                let Some(emitter) = weak.upgrade() else {
                    return Ok(());
                };
                // The file manager's bus is dispatched from inside an
                // already-async task (the writer or the watcher loop); the
                // emitter's own row reads are async, so bridge with
                // `block_in_place`, mirroring the teacher's
                // `tokio::task::block_in_place` + `block_on` pattern for
                // calling async code from a synchronous callback.
                tokio::task::block_in_place(|| {
                    tokio::runtime::Handle::current().block_on(emitter.emit_new_rows())
                })
            });
            RowEmitter {
                manager,
                row_size,
                last_emitted_row_count: AtomicI64::new(initial_row_count),
                bus: SubscriberBus::new(),
                _file_manager_sub: sub,
            }
        });
        emitter
    }

    /// Register a listener for per-row events.
    pub fn subscribe<F>(&self, cb: F) -> Unsubscribe
    where
        F: Fn(Arc<RowEvent>) -> Result<()> + Send + Sync + 'static,
    {
        self.bus.subscribe(cb)
    }

    async fn emit_new_rows(&self) -> Result<()> {
        let size = self.manager.size();
        let new_row_count = row_count_for_size(size, self.row_size);
        let old_row_count = self.last_emitted_row_count.load(Ordering::SeqCst);
        if new_row_count <= old_row_count {
            return Ok(());
        }
        for i in old_row_count..new_row_count {
            let offset = HEADER_SIZE as i64 + i * self.row_size as i64;
            // Only emit rows that are fully present on disk.
            if offset + self.row_size as i64 > size {
                break;
            }
            let bytes = self.manager.read(offset, self.row_size as i64).await?;
            let row = unmarshal_row(self.row_size, &bytes, offset as u64)?;
            self.bus.publish(Arc::new(RowEvent { index: i, row }))?;
            self.last_emitted_row_count.store(i + 1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filemanager::{Mode, WriteSubmission};
    use crate::row::{marshal_null_row, new_nullrow_uuid, NullRow};
    use std::sync::Mutex;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn emits_only_rows_added_after_construction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.fdb");
        let row_size = 128usize;

        // Pre-populate header + one committed null row before the emitter exists.
        let mut bytes = vec![0u8; HEADER_SIZE];
        bytes[HEADER_SIZE - 1] = b'\n';
        bytes.extend(marshal_null_row(row_size, &NullRow { uuid: new_nullrow_uuid() }));
        std::fs::write(&path, &bytes).unwrap();

        let manager = FileManager::open(&path, Mode::Write, row_size).await.unwrap();
        let emitter = RowEmitter::new(manager.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let _sub = emitter.subscribe(move |ev| {
            seen2.lock().unwrap().push(ev.index);
            Ok(())
        });

        let tx = manager.set_writer().await.unwrap();
        let (resp_tx, resp_rx) = tokio::sync::oneshot::channel();
        let row = marshal_null_row(row_size, &NullRow { uuid: new_nullrow_uuid() });
        tx.send(WriteSubmission { bytes: row, resp: resp_tx }).await.unwrap();
        resp_rx.await.unwrap().unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }
}
