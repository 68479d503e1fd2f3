//! Recovery: reconstructs in-memory transaction state from the file on
//! every open (spec.md §4.8).

use crc32fast::Hasher;

use crate::error::{Error, Result};
use crate::filemanager::FileManager;
use crate::finder::MAX_TX_ROWS;
use crate::header::{Header, HEADER_SIZE};
use crate::row::{parse_partial, unmarshal_row, DataRow, EndControl, PartialDataRow, RowUnion};
use crate::transaction::CHECKSUM_CADENCE;

/// A recovered active transaction's state, ready to be handed to
/// [`crate::transaction::Transaction::from_recovered`] once a writer
/// channel is available.
#[derive(Debug, Clone)]
pub struct RecoveredTransaction {
    pub last: Option<PartialDataRow>,
    pub rows: Vec<DataRow>,
    pub row_bytes_written: usize,
    pub savepoints_taken: u8,
}

/// The full result of running recovery on open.
#[derive(Debug, Clone)]
pub struct RecoveryResult {
    pub header: Header,
    pub row_count: i64,
    pub active_transaction: Option<RecoveredTransaction>,
    pub checksum_rows_since_last: u64,
}

async fn read_row(manager: &FileManager, row_size: usize, index: i64) -> Result<RowUnion> {
    let offset = HEADER_SIZE as i64 + index * row_size as i64;
    let bytes = manager.read(offset, row_size as i64).await?;
    unmarshal_row(row_size, &bytes, offset as u64)
}

/// Run the full recovery procedure against an already-opened manager.
pub async fn recover(manager: &FileManager) -> Result<RecoveryResult> {
    let row_size = manager.row_size();

    let header_bytes = manager.read(0, HEADER_SIZE as i64).await?;
    let header = Header::from_bytes(&header_bytes)?;

    let checksum_bytes = manager.read(HEADER_SIZE as i64, row_size as i64).await?;
    let checksum_row = unmarshal_row(row_size, &checksum_bytes, HEADER_SIZE as u64)?;
    let RowUnion::Checksum(initial) = checksum_row else {
        return Err(Error::corrupt(
            HEADER_SIZE as u64,
            "row-index 0 must be the initial checksum row",
        ));
    };
    let mut hasher = Hasher::new();
    hasher.update(&header_bytes);
    if initial.crc != hasher.finalize() {
        return Err(Error::corrupt(
            HEADER_SIZE as u64,
            "initial checksum row CRC does not match the header",
        ));
    }

    let size = manager.size();
    let body = size - HEADER_SIZE as i64;
    let row_size_i64 = row_size as i64;
    let row_count = body / row_size_i64;
    let tail_len = (body % row_size_i64) as usize;

    let tail_partial = if tail_len > 0 {
        let tail_offset = HEADER_SIZE as i64 + row_count * row_size_i64;
        let tail_bytes = manager.read(tail_offset, tail_len as i64).await?;
        Some(parse_partial(row_size, &tail_bytes, tail_offset as u64)?)
    } else {
        None
    };

    let active_transaction =
        reconstruct_active_transaction(manager, row_size, row_count, tail_partial).await?;
    let checksum_rows_since_last = recover_checksum_counter(manager, row_size, row_count).await?;

    Ok(RecoveryResult {
        header,
        row_count,
        active_transaction,
        checksum_rows_since_last,
    })
}

fn tail_only_transaction(row_size: usize, p: PartialDataRow) -> RecoveredTransaction {
    let n = p.byte_len(row_size);
    // A tail partial already in State 3 has its 'S' byte on disk: the
    // live engine counted that savepoint the moment it wrote the byte
    // (transaction.rs's `savepoint()`), so recovery must count it too.
    let savepoints_taken = matches!(p, PartialDataRow::State3 { .. }) as u8;
    RecoveredTransaction {
        last: Some(p),
        rows: Vec::new(),
        row_bytes_written: n,
        savepoints_taken,
    }
}

async fn reconstruct_active_transaction(
    manager: &FileManager,
    row_size: usize,
    row_count: i64,
    tail_partial: Option<PartialDataRow>,
) -> Result<Option<RecoveredTransaction>> {
    let last_complete_index = row_count - 1;

    // Only the initial checksum row exists (no data/null rows yet).
    if last_complete_index < 1 {
        return Ok(tail_partial.map(|p| tail_only_transaction(row_size, p)));
    }

    let last_row = read_row(manager, row_size, last_complete_index).await?;
    let last_terminates = match &last_row {
        RowUnion::Checksum(_) => true,
        other => other
            .end_control()
            .map(|ec| ec.terminates_transaction())
            .unwrap_or(true),
    };

    if last_terminates {
        // No active transaction in the file. Per spec.md §4.8 step 4, any
        // tail partial row must be the start of a fresh transaction.
        return Ok(tail_partial.map(|p| tail_only_transaction(row_size, p)));
    }

    // Walk backward to the enclosing 'T' row, collecting finalized rows in
    // file order, bounded by the 100-row transaction cap.
    let mut rows_reversed = Vec::new();
    let mut savepoints_taken = 0u8;
    let mut found_start = false;
    let mut i = last_complete_index;
    for steps in 0..=MAX_TX_ROWS {
        let row = if i == last_complete_index {
            last_row.clone()
        } else {
            read_row(manager, row_size, i).await?
        };
        if let RowUnion::Checksum(_) = row {
            if i == 0 {
                break;
            }
            i -= 1;
            continue;
        }
        if let RowUnion::Data(d) = &row {
            if d.end_control.creates_savepoint() {
                savepoints_taken += 1;
            }
            rows_reversed.push(d.clone());
        }
        if row.start_control() == Some(b'T') {
            found_start = true;
            break;
        }
        if i == 0 || steps == MAX_TX_ROWS {
            break;
        }
        i -= 1;
    }
    if !found_start {
        return Err(Error::corrupt(
            0,
            "enclosing transaction start not found within the 100-row cap",
        ));
    }
    rows_reversed.reverse();
    let rows = rows_reversed;

    let (last, row_bytes_written) = match tail_partial {
        Some(p) => {
            let n = p.byte_len(row_size);
            // Same State-3-already-recorded-a-savepoint correction as
            // `tail_only_transaction`: this savepoint was never finalized
            // into a row, so the backward walk above never counted it.
            if matches!(p, PartialDataRow::State3 { .. }) {
                savepoints_taken += 1;
            }
            (Some(p), n)
        }
        None => {
            let last_data = rows
                .last()
                .cloned()
                .ok_or_else(|| Error::corrupt(0, "active transaction has no finalized rows"))?;
            match last_data.end_control {
                EndControl::Re | EndControl::Se => (None, 0),
                _ => {
                    return Err(Error::corrupt(
                        0,
                        "active transaction's last finalized row is not open-ended",
                    ))
                }
            }
        }
    };

    Ok(Some(RecoveredTransaction {
        last,
        rows,
        row_bytes_written,
        savepoints_taken,
    }))
}

/// Count non-checksum rows written since the last checksum row, scanning
/// backward from the tail. Terminates at worst at row-index 0, which is
/// always the initial checksum row.
async fn recover_checksum_counter(manager: &FileManager, row_size: usize, row_count: i64) -> Result<u64> {
    let mut count = 0u64;
    let mut i = row_count - 1;
    while i >= 0 {
        let row = read_row(manager, row_size, i).await?;
        if row.is_checksum() {
            return Ok(count);
        }
        count += 1;
        if count > CHECKSUM_CADENCE {
            return Err(Error::corrupt(0, "no checksum row found within the cadence window"));
        }
        i -= 1;
    }
    Ok(count)
}
