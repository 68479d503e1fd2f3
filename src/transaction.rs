//! Transaction engine: composes rows into multi-row transactions with
//! savepoints, commit, and rollback, driven by the crash-safe partial-row
//! state machine (spec.md §3.5, §4.7).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crc32fast::Hasher;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::filemanager::{FileManager, WriteSubmission, WriterSender};
use crate::finder::MAX_TX_ROWS;
use crate::row::{
    marshal_checksum_row, marshal_data_row, marshal_null_row, new_nullrow_uuid, validate_key_uuid,
    ChecksumRow, DataRow, EndControl, NullRow, PartialDataRow, ROW_START,
};

/// Rows between checksum rows (spec.md §3.7/§4.1).
pub const CHECKSUM_CADENCE: u64 = 10_000;

fn validate_json_bytes(json: &[u8]) -> Result<()> {
    if json.is_empty() {
        return Err(Error::invalid_input("json payload must be non-empty"));
    }
    std::str::from_utf8(json)
        .map_err(|_| Error::invalid_input("json payload must be valid UTF-8"))?;
    Ok(())
}

fn rollback_end_control(n: u8, savepoint_on_this_row: bool) -> EndControl {
    match (n, savepoint_on_this_row) {
        (0, false) => EndControl::R0,
        (0, true) => EndControl::S0,
        (n, false) => EndControl::Rn(n),
        (n, true) => EndControl::Sn(n),
    }
}

/// Build the row bytes of `[from, row_size-5)` for `uuid`/`json` with the
/// given `start_control`, reusing the row codec's payload encoding. The
/// trailer produced by this throwaway marshal is discarded; only the
/// sentinel/control/payload/padding prefix, which does not depend on
/// `end_control`, is used.
fn row_prefix(row_size: usize, start_control: u8, uuid: &Uuid, json: &[u8], from: usize) -> Result<Vec<u8>> {
    let row = DataRow {
        start_control,
        uuid: *uuid,
        json: json.to_vec(),
        end_control: EndControl::Re,
    };
    let full = marshal_data_row(row_size, &row)?;
    Ok(full[from..row_size - 5].to_vec())
}

/// A single in-progress or recovered transaction. Owns the partial-row
/// builder, the finalized rows written so far, and (for an empty commit)
/// the resulting `NullRow`.
pub struct Transaction {
    manager: Arc<FileManager>,
    writer: WriterSender,
    row_size: usize,
    checksum_counter: Arc<AtomicU64>,
    last: Option<PartialDataRow>,
    rows: Vec<DataRow>,
    empty: Option<NullRow>,
    row_bytes_written: usize,
    savepoints_taken: u8,
}

impl Transaction {
    /// `Begin()`: writes the 2-byte `ROW_START | 'T'` prefix and installs
    /// `last` in State 1.
    pub(crate) async fn begin(
        manager: Arc<FileManager>,
        writer: WriterSender,
        row_size: usize,
        checksum_counter: Arc<AtomicU64>,
    ) -> Result<Self> {
        let mut tx = Transaction {
            manager,
            writer,
            row_size,
            checksum_counter,
            last: None,
            rows: Vec::new(),
            empty: None,
            row_bytes_written: 0,
            savepoints_taken: 0,
        };
        tx.write_bytes(&[ROW_START, b'T']).await?;
        tx.row_bytes_written = 2;
        tx.last = Some(PartialDataRow::State1 { start_control: b'T' });
        Ok(tx)
    }

    /// Reconstruct a `Transaction` from recovered state (spec.md §4.8). Does
    /// not write anything: the bytes it describes are already on disk.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_recovered(
        manager: Arc<FileManager>,
        writer: WriterSender,
        row_size: usize,
        checksum_counter: Arc<AtomicU64>,
        last: Option<PartialDataRow>,
        rows: Vec<DataRow>,
        row_bytes_written: usize,
        savepoints_taken: u8,
    ) -> Self {
        Transaction {
            manager,
            writer,
            row_size,
            checksum_counter,
            last,
            rows,
            empty: None,
            row_bytes_written,
            savepoints_taken,
        }
    }

    pub fn rows(&self) -> &[DataRow] {
        &self.rows
    }

    pub fn last(&self) -> Option<&PartialDataRow> {
        self.last.as_ref()
    }

    pub fn row_bytes_written(&self) -> usize {
        self.row_bytes_written
    }

    pub fn savepoints_taken(&self) -> u8 {
        self.savepoints_taken
    }

    async fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        let (resp_tx, resp_rx) = tokio::sync::oneshot::channel();
        self.writer
            .send(WriteSubmission {
                bytes: bytes.to_vec(),
                resp: resp_tx,
            })
            .await
            .map_err(|_| Error::WriteError("writer task is no longer running".into()))?;
        // Awaiting this response is also the commit-atomicity rendezvous
        // (spec.md §4.7): `FileManager::append` publishes to its
        // subscriber bus — which the Row Emitter and, transitively, the
        // finder drain synchronously — before sending this reply.
        resp_rx
            .await
            .map_err(|_| Error::WriteError("writer task dropped the response channel".into()))?
    }

    async fn finalize_row(
        &mut self,
        end_control: EndControl,
        start_control: u8,
        uuid: Uuid,
        json: Vec<u8>,
    ) -> Result<()> {
        let row = DataRow {
            start_control,
            uuid,
            json,
            end_control,
        };
        let full = marshal_data_row(self.row_size, &row)?;
        let trailer = &full[self.row_size - 5..];
        self.write_bytes(trailer).await?;
        self.row_bytes_written = 0;
        self.rows.push(row);
        self.bump_checksum_counter().await
    }

    async fn bump_checksum_counter(&mut self) -> Result<()> {
        let n = self.checksum_counter.fetch_add(1, Ordering::SeqCst) + 1;
        if n >= CHECKSUM_CADENCE {
            self.write_checksum_row().await?;
            self.checksum_counter.store(0, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn write_checksum_row(&self) -> Result<()> {
        let block_len = CHECKSUM_CADENCE as i64 * self.row_size as i64;
        let size = self.manager.size();
        let start = size - block_len;
        let bytes = self.manager.read(start, block_len).await?;
        let mut hasher = Hasher::new();
        hasher.update(&bytes);
        let row = marshal_checksum_row(self.row_size, ChecksumRow { crc: hasher.finalize() });
        self.write_bytes(&row).await
    }

    /// `AddRow(uuid, json)` (spec.md §4.7 table, §6.2).
    pub async fn add_row(&mut self, uuid: Uuid, json: Vec<u8>) -> Result<()> {
        validate_key_uuid(&uuid)?;
        validate_json_bytes(&json)?;
        if self.rows.len() >= MAX_TX_ROWS as usize {
            return Err(Error::invalid_action(format!(
                "transaction row cap ({MAX_TX_ROWS}) reached"
            )));
        }

        match self.last.take() {
            Some(PartialDataRow::State1 { start_control }) => {
                let payload = row_prefix(self.row_size, start_control, &uuid, &json, 2)?;
                self.write_bytes(&payload).await?;
                self.row_bytes_written = self.row_size - 5;
                self.last = Some(PartialDataRow::State2 {
                    start_control,
                    uuid,
                    json,
                });
                Ok(())
            }
            Some(PartialDataRow::State2 {
                start_control: prev_sc,
                uuid: prev_uuid,
                json: prev_json,
            }) => {
                self.finalize_row(EndControl::Re, prev_sc, prev_uuid, prev_json)
                    .await?;
                self.start_fresh_row(uuid, json).await
            }
            Some(PartialDataRow::State3 {
                start_control: prev_sc,
                uuid: prev_uuid,
                json: prev_json,
            }) => {
                self.finalize_row(EndControl::Se, prev_sc, prev_uuid, prev_json)
                    .await?;
                self.start_fresh_row(uuid, json).await
            }
            None => self.start_fresh_row(uuid, json).await,
        }
    }

    async fn start_fresh_row(&mut self, uuid: Uuid, json: Vec<u8>) -> Result<()> {
        let prefix = row_prefix(self.row_size, b'R', &uuid, &json, 0)?;
        self.write_bytes(&prefix).await?;
        self.row_bytes_written = self.row_size - 5;
        self.last = Some(PartialDataRow::State2 {
            start_control: b'R',
            uuid,
            json,
        });
        Ok(())
    }

    /// `Savepoint()`: State 2 -> State 3. Invalid from State 1, State 3, or
    /// with no pending row, or once 9 savepoints have already been taken
    /// (the single-digit encoding's ceiling).
    pub async fn savepoint(&mut self) -> Result<()> {
        match self.last.take() {
            Some(PartialDataRow::State2 {
                start_control,
                uuid,
                json,
            }) => {
                if self.savepoints_taken >= 9 {
                    self.last = Some(PartialDataRow::State2 {
                        start_control,
                        uuid,
                        json,
                    });
                    return Err(Error::invalid_action("at most 9 savepoints per transaction"));
                }
                self.write_bytes(&[b'S']).await?;
                self.row_bytes_written += 1;
                self.savepoints_taken += 1;
                self.last = Some(PartialDataRow::State3 {
                    start_control,
                    uuid,
                    json,
                });
                Ok(())
            }
            Some(other) => {
                self.last = Some(other);
                Err(Error::invalid_action("savepoint requires a row in State 2"))
            }
            None => Err(Error::invalid_action("no pending row for savepoint")),
        }
    }

    /// `EndRow()`: finalizes the pending row with `RE`/`SE` without
    /// starting a new one or ending the transaction.
    pub async fn end_row(&mut self) -> Result<()> {
        match self.last.take() {
            Some(PartialDataRow::State2 {
                start_control,
                uuid,
                json,
            }) => {
                self.finalize_row(EndControl::Re, start_control, uuid, json)
                    .await
            }
            Some(PartialDataRow::State3 {
                start_control,
                uuid,
                json,
            }) => {
                self.finalize_row(EndControl::Se, start_control, uuid, json)
                    .await
            }
            Some(other @ PartialDataRow::State1 { .. }) => {
                self.last = Some(other);
                Err(Error::invalid_action(
                    "end_row requires a fully-written row (State 2 or 3)",
                ))
            }
            None => Err(Error::invalid_action("no pending row to end")),
        }
    }

    /// `Commit()`. Consumes `self`; on failure the transaction is handed
    /// back alongside the error so the caller can retry or roll back.
    pub async fn commit(mut self) -> std::result::Result<(), (Self, Error)> {
        match self.do_commit().await {
            Ok(()) => Ok(()),
            Err(e) => Err((self, e)),
        }
    }

    async fn do_commit(&mut self) -> Result<()> {
        match self.last.take() {
            Some(PartialDataRow::State1 { start_control }) if self.rows.is_empty() => {
                let uuid = new_nullrow_uuid();
                let bytes = marshal_null_row(self.row_size, &NullRow { uuid });
                self.write_bytes(&bytes).await?;
                self.row_bytes_written = 0;
                self.empty = Some(NullRow { uuid });
                self.bump_checksum_counter().await?;
                let _ = start_control;
                Ok(())
            }
            Some(other @ PartialDataRow::State1 { .. }) => {
                self.last = Some(other);
                Err(Error::invalid_action(
                    "cannot commit a row stuck in State 1 with prior finalized rows",
                ))
            }
            Some(PartialDataRow::State2 {
                start_control,
                uuid,
                json,
            }) => self.finalize_row(EndControl::Tc, start_control, uuid, json).await,
            Some(PartialDataRow::State3 {
                start_control,
                uuid,
                json,
            }) => self.finalize_row(EndControl::Sc, start_control, uuid, json).await,
            None => Err(Error::invalid_action(
                "no pending row to commit (did a prior end_row() leave nothing open?)",
            )),
        }
    }

    /// `Rollback(n)`. Consumes `self`; on failure the transaction is handed
    /// back alongside the error.
    pub async fn rollback(mut self, n: u8) -> std::result::Result<(), (Self, Error)> {
        match self.do_rollback(n).await {
            Ok(()) => Ok(()),
            Err(e) => Err((self, e)),
        }
    }

    async fn do_rollback(&mut self, n: u8) -> Result<()> {
        if n > self.savepoints_taken {
            return Err(Error::invalid_action(format!(
                "rollback target {n} exceeds {} savepoints taken",
                self.savepoints_taken
            )));
        }
        match self.last.take() {
            Some(PartialDataRow::State1 { start_control }) => {
                if n != 0 {
                    self.last = Some(PartialDataRow::State1 { start_control });
                    return Err(Error::invalid_action(
                        "rollback to a savepoint requires a prior add_row",
                    ));
                }
                let uuid = new_nullrow_uuid();
                let json = b"{}".to_vec();
                self.finalize_row(EndControl::R0, start_control, uuid, json)
                    .await
            }
            Some(PartialDataRow::State2 {
                start_control,
                uuid,
                json,
            }) => {
                let ec = rollback_end_control(n, false);
                self.finalize_row(ec, start_control, uuid, json).await
            }
            Some(PartialDataRow::State3 {
                start_control,
                uuid,
                json,
            }) => {
                let ec = rollback_end_control(n, true);
                self.finalize_row(ec, start_control, uuid, json).await
            }
            None => Err(Error::invalid_action("no pending row to roll back")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filemanager::Mode;
    use crate::header::{Header, RowSize, SkewMs};
    use crate::row::unmarshal_row;

    async fn fresh_manager(row_size: usize) -> (tempfile::TempDir, Arc<FileManager>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.fdb");
        let header = Header::new(
            RowSize::new(row_size as u32).unwrap(),
            SkewMs::new(5000).unwrap(),
        );
        let header_bytes = header.to_bytes().unwrap();
        let mut hasher = Hasher::new();
        hasher.update(&header_bytes);
        let checksum = marshal_checksum_row(row_size, ChecksumRow { crc: hasher.finalize() });
        let mut bytes = header_bytes.to_vec();
        bytes.extend(checksum);
        std::fs::write(&path, &bytes).unwrap();
        let manager = FileManager::open(&path, Mode::Write, row_size).await.unwrap();
        (dir, manager)
    }

    #[tokio::test]
    async fn single_row_commit_round_trips() {
        let (_dir, manager) = fresh_manager(256).await;
        let writer = manager.set_writer().await.unwrap();
        let counter = Arc::new(AtomicU64::new(0));
        let mut tx = Transaction::begin(manager.clone(), writer, 256, counter).await.unwrap();
        let uuid = Uuid::now_v7();
        tx.add_row(uuid, br#"{"i":1}"#.to_vec()).await.unwrap();
        tx.commit().await.unwrap();

        let bytes = manager.read(64 + 256, 256).await.unwrap();
        let row = unmarshal_row(256, &bytes, 64 + 256).unwrap();
        match row {
            crate::row::RowUnion::Data(d) => {
                assert_eq!(d.uuid, uuid);
                assert_eq!(d.end_control, EndControl::Tc);
            }
            other => panic!("expected DataRow, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_commit_writes_null_row() {
        let (_dir, manager) = fresh_manager(256).await;
        let writer = manager.set_writer().await.unwrap();
        let counter = Arc::new(AtomicU64::new(0));
        let tx = Transaction::begin(manager.clone(), writer, 256, counter).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(manager.size(), 64 + 256 + 256);
        let bytes = manager.read(64 + 256, 256).await.unwrap();
        let row = unmarshal_row(256, &bytes, 64 + 256).unwrap();
        assert!(row.is_null());
    }

    #[tokio::test]
    async fn savepoint_then_rollback_to_it() {
        let (_dir, manager) = fresh_manager(256).await;
        let writer = manager.set_writer().await.unwrap();
        let counter = Arc::new(AtomicU64::new(0));
        let mut tx = Transaction::begin(manager.clone(), writer, 256, counter).await.unwrap();

        let k1 = Uuid::now_v7();
        tx.add_row(k1, br#"{"i":1}"#.to_vec()).await.unwrap();
        tx.savepoint().await.unwrap();
        let k2 = Uuid::now_v7();
        tx.add_row(k2, br#"{"i":2}"#.to_vec()).await.unwrap();
        let k3 = Uuid::now_v7();
        tx.add_row(k3, br#"{"i":3}"#.to_vec()).await.unwrap();
        tx.rollback(1).await.unwrap();

        // Row 1 (index 1): T/SE since savepoint 1 was recorded on it.
        let row1_bytes = manager.read(64 + 256, 256).await.unwrap();
        let row1 = unmarshal_row(256, &row1_bytes, 0).unwrap();
        assert_eq!(row1.end_control(), Some(EndControl::Se));

        // Row 3 (index 3, last written): R/R1.
        let row3_bytes = manager.read(64 + 256 * 3, 256).await.unwrap();
        let row3 = unmarshal_row(256, &row3_bytes, 0).unwrap();
        assert_eq!(row3.end_control(), Some(EndControl::Rn(1)));
    }

    #[tokio::test]
    async fn savepoint_from_state1_is_invalid() {
        let (_dir, manager) = fresh_manager(256).await;
        let writer = manager.set_writer().await.unwrap();
        let counter = Arc::new(AtomicU64::new(0));
        let mut tx = Transaction::begin(manager.clone(), writer, 256, counter).await.unwrap();
        assert!(tx.savepoint().await.is_err());
    }
}
