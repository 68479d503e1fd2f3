//! FrozenDB: an append-only, crash-safe, single-writer/many-reader
//! key-value store over a single file. Keys are UUIDv7; values are
//! opaque JSON byte strings. See the module docs for the on-disk format,
//! transaction engine, and recovery procedure.
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

use std::path::Path;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use crc32fast::Hasher;
use parking_lot::Mutex;
use uuid::Uuid;

pub mod bus;
pub mod emitter;
pub mod error;
pub mod filemanager;
pub mod finder;
pub mod header;
pub mod ownership;
pub mod recovery;
pub mod row;
pub mod transaction;
pub mod verify;

pub use error::{Error, Result};

use bus::Unsubscribe;
use emitter::RowEmitter;
pub use filemanager::Mode;
use filemanager::{FileManager, WriterSender};
use finder::{BinarySearchFinder, Finder, InMemoryFinder, SimpleFinder};
use header::{Header, HEADER_SIZE};
use row::{marshal_checksum_row, unmarshal_row, ChecksumRow, EndControl, RowUnion};
use transaction::Transaction;
pub use verify::VerifyReport;

/// Which [`Finder`] strategy an [`FrozenDB::open`] call should build
/// (spec.md §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinderStrategy {
    /// O(n) forward scan, no auxiliary state.
    Simple,
    /// O(1) lookup backed by an in-memory `uuid -> row-index` map.
    InMemory,
    /// O(log n) lookup exploiting UUIDv7 quasi-monotonicity.
    BinarySearch,
}

/// Snapshot of the currently active transaction, returned by
/// [`FrozenDB::get_active_tx`]. Only meaningful in write mode: a
/// recovered transaction has no live [`WriterSender`] to reattach in read
/// mode, so read-mode opens never populate one (spec.md §4.8, §6.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveTxInfo {
    /// Finalized rows written so far in this transaction.
    pub rows_written: usize,
    /// Bytes of the current in-progress row, if any.
    pub row_bytes_written: usize,
    /// Savepoints taken so far (0-9).
    pub savepoints_taken: u8,
}

/// The facade tying the file manager, row emitter, finder, and
/// transaction engine together into the external interface (spec.md
/// §6.2).
pub struct FrozenDB {
    manager: Arc<FileManager>,
    finder: Arc<dyn Finder>,
    emitter: Arc<RowEmitter>,
    _row_sub: Unsubscribe,
    checksum_counter: Arc<AtomicU64>,
    writer: Option<WriterSender>,
    active_tx: Mutex<Option<Transaction>>,
    row_size: usize,
    mode: Mode,
}

impl FrozenDB {
    /// Create a new, empty database file at `path`: header + initial
    /// checksum row, written to a temp file in the same directory and
    /// renamed into place so a crash mid-creation never leaves a
    /// half-written file visible at `path`. Ownership of `path` is handed
    /// to the `sudo` caller, if any, on a best-effort basis.
    pub async fn create(path: impl AsRef<Path>, row_size: u32, skew_ms: u64) -> Result<()> {
        use std::io::Write as _;

        let path = path.as_ref();
        let row_size = header::RowSize::new(row_size)?;
        let skew_ms = header::SkewMs::new(skew_ms)?;
        let header = Header::new(row_size, skew_ms);
        let header_bytes = header.to_bytes()?;

        let mut hasher = Hasher::new();
        hasher.update(&header_bytes);
        let checksum_row =
            marshal_checksum_row(row_size.as_usize(), ChecksumRow { crc: hasher.finalize() });

        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| {
            Error::PathError(format!("failed to create temp file in {}: {e}", dir.display()))
        })?;
        tmp.write_all(&header_bytes).map_err(Error::Io)?;
        tmp.write_all(&checksum_row).map_err(Error::Io)?;
        tmp.as_file().sync_all().map_err(Error::Io)?;
        tmp.persist(path)
            .map_err(|e| Error::WriteError(format!("failed to finalize {}: {}", path.display(), e.error)))?;

        if let Some(owner) = ownership::sudo_owner_ids() {
            ownership::apply_ownership(path, owner);
        }
        Ok(())
    }

    /// Open an existing database file, running recovery and wiring up the
    /// requested finder strategy. Write mode installs the single writer
    /// channel and reconstructs any transaction left active by a prior
    /// crash; read mode does neither (spec.md §4.8, §6.2).
    pub async fn open(path: impl AsRef<Path>, mode: Mode, strategy: FinderStrategy) -> Result<Self> {
        let path = path.as_ref();
        let probe = std::fs::read(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                Error::PathError(format!("open {}: {e}", path.display()))
            }
            _ => Error::ReadError(format!("open {}: {e}", path.display())),
        })?;
        if probe.len() < HEADER_SIZE {
            return Err(Error::corrupt(0, "file is shorter than the 64-byte header"));
        }
        let header = Header::from_bytes(&probe[..HEADER_SIZE])?;
        let row_size = header.row_size.as_usize();

        let manager = FileManager::open(path, mode, row_size).await?;
        let recovered = recovery::recover(&manager).await?;

        let finder: Arc<dyn Finder> = match strategy {
            FinderStrategy::Simple => Arc::new(SimpleFinder::new(manager.clone())),
            FinderStrategy::InMemory => Arc::new(InMemoryFinder::new(manager.clone()).await?),
            FinderStrategy::BinarySearch => {
                Arc::new(BinarySearchFinder::new(manager.clone(), header.skew_ms.get()))
            }
        };

        let emitter = RowEmitter::new(manager.clone());
        let finder_for_sub = finder.clone();
        let row_sub = emitter.subscribe(move |event| finder_for_sub.on_row_added(&event));

        let checksum_counter = Arc::new(AtomicU64::new(recovered.checksum_rows_since_last));

        let (writer, active_tx) = match mode {
            Mode::Write => {
                let writer = manager.set_writer().await?;
                let active_tx = recovered.active_transaction.map(|rt| {
                    Transaction::from_recovered(
                        manager.clone(),
                        writer.clone(),
                        row_size,
                        checksum_counter.clone(),
                        rt.last,
                        rt.rows,
                        rt.row_bytes_written,
                        rt.savepoints_taken,
                    )
                });
                (Some(writer), active_tx)
            }
            Mode::Read => (None, None),
        };

        Ok(FrozenDB {
            manager,
            finder,
            emitter,
            _row_sub: row_sub,
            checksum_counter,
            writer,
            active_tx: Mutex::new(active_tx),
            row_size,
            mode,
        })
    }

    /// `Get(key)`: look up the visible value stored under `key` (spec.md
    /// §3.4, §6.2). Locates the row via the active finder, applies
    /// visibility based on the enclosing transaction's terminator, then
    /// validates the stored bytes parse as JSON.
    pub async fn get(&self, key: Uuid) -> Result<Vec<u8>> {
        let index = self.finder.get_index(key).await?;
        if !self.is_visible(index).await? {
            return Err(Error::KeyNotFound);
        }
        let offset = HEADER_SIZE as i64 + index * self.row_size as i64;
        let bytes = self.manager.read(offset, self.row_size as i64).await?;
        let json = match unmarshal_row(self.row_size, &bytes, offset as u64)? {
            RowUnion::Data(d) => d.json,
            _ => return Err(Error::corrupt(offset as u64, "finder returned a non-data row")),
        };
        serde_json::from_slice::<serde_json::Value>(&json)
            .map_err(|e| Error::InvalidData(format!("stored value is not valid JSON: {e}")))?;
        Ok(json)
    }

    async fn read_row_union(&self, index: i64) -> Result<RowUnion> {
        let offset = HEADER_SIZE as i64 + index * self.row_size as i64;
        let bytes = self.manager.read(offset, self.row_size as i64).await?;
        unmarshal_row(self.row_size, &bytes, offset as u64)
    }

    /// Apply spec.md §3.4's visibility predicate to the data row at
    /// `index`: an active enclosing transaction, or one terminated by
    /// `R0`/`S0`, makes it invisible; `TC`/`SC` makes the whole
    /// transaction visible; `Rn`/`Sn` makes only rows up to and including
    /// the row carrying savepoint `n` visible.
    async fn is_visible(&self, index: i64) -> Result<bool> {
        let end_index = match self.finder.get_transaction_end(index).await {
            Ok(i) => i,
            Err(Error::TransactionActive) => return Ok(false),
            Err(e) => return Err(e),
        };
        let end_row = self.read_row_union(end_index).await?;
        let ec = end_row.end_control().ok_or_else(|| {
            Error::corrupt(
                HEADER_SIZE as u64 + end_index as u64 * self.row_size as u64,
                "transaction end row has no end_control",
            )
        })?;
        match ec {
            EndControl::Tc | EndControl::Sc => Ok(true),
            EndControl::R0 | EndControl::S0 => Ok(false),
            EndControl::Rn(n) | EndControl::Sn(n) => {
                let start_index = self.finder.get_transaction_start(index).await?;
                let savepoint_index = self.find_savepoint_row(start_index, end_index, n).await?;
                Ok(index <= savepoint_index)
            }
            EndControl::Nr | EndControl::Cs => Err(Error::corrupt(
                HEADER_SIZE as u64 + end_index as u64 * self.row_size as u64,
                "transaction end row is not a terminator",
            )),
        }
    }

    /// Walk `[start_index, end_index]` counting savepoint-creating rows in
    /// order, returning the index of the row that materialized savepoint
    /// `n` (1-9).
    async fn find_savepoint_row(&self, start_index: i64, end_index: i64, n: u8) -> Result<i64> {
        let mut seen = 0u8;
        for i in start_index..=end_index {
            let row = self.read_row_union(i).await?;
            if let Some(ec) = row.end_control() {
                if ec.creates_savepoint() {
                    seen += 1;
                    if seen == n {
                        return Ok(i);
                    }
                }
            }
        }
        Err(Error::corrupt(
            HEADER_SIZE as u64 + start_index as u64 * self.row_size as u64,
            format!("savepoint {n} not found within its transaction"),
        ))
    }

    fn take_active_tx(&self) -> Result<Transaction> {
        self.active_tx
            .lock()
            .take()
            .ok_or_else(|| Error::invalid_action("no active transaction"))
    }

    /// `BeginTx()`: starts a new transaction. Write mode only; fails if a
    /// transaction is already active. Callers are expected to serialize
    /// their own calls to this and the other transaction methods, per the
    /// single-writer contract already enforced at the file level.
    pub async fn begin_tx(&self) -> Result<()> {
        if self.mode != Mode::Write {
            return Err(Error::invalid_action("begin_tx requires write mode"));
        }
        if self.active_tx.lock().is_some() {
            return Err(Error::invalid_action("a transaction is already active"));
        }
        let writer = self
            .writer
            .clone()
            .expect("write mode always installs a writer");
        let tx = Transaction::begin(
            self.manager.clone(),
            writer,
            self.row_size,
            self.checksum_counter.clone(),
        )
        .await?;
        *self.active_tx.lock() = Some(tx);
        Ok(())
    }

    /// `GetActiveTx()`: a read-only snapshot of the active transaction's
    /// progress, or `None` if there is none (always `None` in read mode).
    pub fn get_active_tx(&self) -> Option<ActiveTxInfo> {
        if self.mode != Mode::Write {
            return None;
        }
        self.active_tx.lock().as_ref().map(|tx| ActiveTxInfo {
            rows_written: tx.rows().len(),
            row_bytes_written: tx.row_bytes_written(),
            savepoints_taken: tx.savepoints_taken(),
        })
    }

    /// `AddRow(uuid, json)` on the active transaction.
    pub async fn add_row(&self, uuid: Uuid, json: Vec<u8>) -> Result<()> {
        let mut tx = self.take_active_tx()?;
        let result = tx.add_row(uuid, json).await;
        self.active_tx.lock().replace(tx);
        result
    }

    /// `Savepoint()` on the active transaction.
    pub async fn savepoint(&self) -> Result<()> {
        let mut tx = self.take_active_tx()?;
        let result = tx.savepoint().await;
        self.active_tx.lock().replace(tx);
        result
    }

    /// `EndRow()` on the active transaction.
    pub async fn end_row(&self) -> Result<()> {
        let mut tx = self.take_active_tx()?;
        let result = tx.end_row().await;
        self.active_tx.lock().replace(tx);
        result
    }

    /// `Commit()`: finalizes and clears the active transaction. On
    /// failure the transaction remains active so the caller can retry or
    /// roll back.
    pub async fn commit(&self) -> Result<()> {
        let tx = self.take_active_tx()?;
        match tx.commit().await {
            Ok(()) => Ok(()),
            Err((tx, e)) => {
                self.active_tx.lock().replace(tx);
                Err(e)
            }
        }
    }

    /// `Rollback(n)`: rolls back to savepoint `n` (`0` discards the whole
    /// transaction) and clears the active transaction.
    pub async fn rollback(&self, n: u8) -> Result<()> {
        let tx = self.take_active_tx()?;
        match tx.rollback(n).await {
            Ok(()) => Ok(()),
            Err((tx, e)) => {
                self.active_tx.lock().replace(tx);
                Err(e)
            }
        }
    }

    /// `Close()`: idempotent shutdown of the underlying file manager.
    pub async fn close(&self) {
        self.manager.close().await;
        let _ = &self.emitter; // kept alive for the manager's lifetime
    }

    /// `Verify(path)`: run end-to-end file verification without opening a
    /// live `FrozenDB`.
    pub async fn verify(path: impl AsRef<Path>) -> Result<VerifyReport> {
        verify::verify(path).await
    }
}
