//! End-to-end file verification (spec.md §4.9): walks every row from the
//! header forward, checking sentinels, control bytes, parity, checksum
//! cadence, and key shape. Fails on the first violation found, reporting
//! its absolute byte offset and a description of what failed.

use crc32fast::Hasher;

use crate::error::{Error, Result};
use crate::filemanager::{FileManager, Mode};
use crate::header::{Header, HEADER_SIZE};
use crate::row::{has_v7_shape, is_nullrow_shaped, parse_partial, unmarshal_row, RowUnion};
use crate::transaction::CHECKSUM_CADENCE;

/// Summary of a clean verification pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyReport {
    pub header: Header,
    pub row_count: i64,
    pub has_tail_partial: bool,
}

/// Open `path` read-only and verify it from the header through the tail.
/// Returns the first [`Error::CorruptDatabase`] encountered, annotated with
/// the offending byte offset.
pub async fn verify(path: impl AsRef<std::path::Path>) -> Result<VerifyReport> {
    let path = path.as_ref();

    let probe_bytes = std::fs::read(path).map_err(Error::Io)?;
    if probe_bytes.len() < HEADER_SIZE {
        return Err(Error::corrupt(0, "file is shorter than the 64-byte header"));
    }
    let header = Header::from_bytes(&probe_bytes[..HEADER_SIZE])?;
    let row_size = header.row_size.as_usize();

    let manager = FileManager::open(path, Mode::Read, row_size).await?;
    let size = manager.size();
    let body = size - HEADER_SIZE as i64;
    if body < row_size as i64 {
        return Err(Error::corrupt(
            HEADER_SIZE as u64,
            "file does not contain even the initial checksum row",
        ));
    }

    let row_size_i64 = row_size as i64;
    let row_count = body / row_size_i64;
    let tail_len = (body % row_size_i64) as usize;

    let header_bytes = manager.read(0, HEADER_SIZE as i64).await?;

    let first = manager.read(HEADER_SIZE as i64, row_size_i64).await?;
    let first_row = unmarshal_row(row_size, &first, HEADER_SIZE as u64)?;
    let RowUnion::Checksum(initial) = first_row else {
        return Err(Error::corrupt(
            HEADER_SIZE as u64,
            "row-index 0 must be a checksum row covering the header",
        ));
    };
    let mut hasher = Hasher::new();
    hasher.update(&header_bytes);
    if initial.crc != hasher.finalize() {
        return Err(Error::corrupt(
            HEADER_SIZE as u64,
            "initial checksum row CRC does not match the header bytes",
        ));
    }

    let mut rows_since_checksum: u64 = 0;
    let mut block_start_index: i64 = 1;

    for index in 1..row_count {
        let offset = HEADER_SIZE as i64 + index * row_size_i64;
        let bytes = manager.read(offset, row_size_i64).await?;
        let row = unmarshal_row(row_size, &bytes, offset as u64)?;

        match &row {
            RowUnion::Data(d) => {
                if !has_v7_shape(&d.uuid) {
                    return Err(Error::corrupt(offset as u64 + 2, "data row key lacks a v7 shape"));
                }
                if is_nullrow_shaped(&d.uuid) {
                    return Err(Error::corrupt(
                        offset as u64 + 2,
                        "data row key is NullRow-shaped",
                    ));
                }
                if std::str::from_utf8(&d.json).is_err() {
                    return Err(Error::corrupt(offset as u64, "data row JSON bytes are not valid UTF-8"));
                }
                rows_since_checksum += 1;
            }
            RowUnion::Null(n) => {
                if !has_v7_shape(&n.uuid) || !is_nullrow_shaped(&n.uuid) {
                    return Err(Error::corrupt(offset as u64 + 2, "null row key has the wrong shape"));
                }
                rows_since_checksum += 1;
            }
            RowUnion::Checksum(c) => {
                let block_len = (index - block_start_index) * row_size_i64;
                if rows_since_checksum != CHECKSUM_CADENCE {
                    return Err(Error::corrupt(
                        offset as u64,
                        format!(
                            "checksum row covers {rows_since_checksum} rows, want {CHECKSUM_CADENCE}"
                        ),
                    ));
                }
                let block_offset = HEADER_SIZE as i64 + block_start_index * row_size_i64;
                let block = manager.read(block_offset, block_len).await?;
                let mut hasher = Hasher::new();
                hasher.update(&block);
                if c.crc != hasher.finalize() {
                    return Err(Error::corrupt(offset as u64, "checksum row CRC mismatch"));
                }
                rows_since_checksum = 0;
                block_start_index = index + 1;
            }
        }
    }

    let has_tail_partial = tail_len > 0;
    if has_tail_partial {
        let tail_offset = HEADER_SIZE as i64 + row_count * row_size_i64;
        let tail = manager.read(tail_offset, tail_len as i64).await?;
        parse_partial(row_size, &tail, tail_offset as u64)?;
    }

    manager.close().await;

    Ok(VerifyReport {
        header,
        row_count,
        has_tail_partial,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{RowSize, SkewMs};
    use crate::row::{marshal_checksum_row, marshal_data_row, marshal_null_row, ChecksumRow, DataRow, EndControl, NullRow};
    use uuid::Uuid;

    fn write_initial(row_size: usize) -> (tempfile::TempDir, std::path::PathBuf, Vec<u8>) {
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
        (dir, path, bytes)
    }

    #[tokio::test]
    async fn empty_database_verifies() {
        let (_dir, path, bytes) = write_initial(256);
        std::fs::write(&path, &bytes).unwrap();
        let report = verify(&path).await.unwrap();
        assert_eq!(report.row_count, 1);
        assert!(!report.has_tail_partial);
    }

    #[tokio::test]
    async fn single_committed_row_verifies() {
        let (_dir, path, mut bytes) = write_initial(256);
        let row = DataRow {
            start_control: b'T',
            uuid: Uuid::now_v7(),
            json: br#"{"i":1}"#.to_vec(),
            end_control: EndControl::Tc,
        };
        bytes.extend(marshal_data_row(256, &row).unwrap());
        std::fs::write(&path, &bytes).unwrap();
        let report = verify(&path).await.unwrap();
        assert_eq!(report.row_count, 2);
    }

    #[tokio::test]
    async fn null_row_with_bad_shape_is_rejected() {
        let (_dir, path, mut bytes) = write_initial(256);
        let row = NullRow { uuid: Uuid::now_v7() }; // not NullRow-shaped
        bytes.extend(marshal_null_row(256, &row));
        std::fs::write(&path, &bytes).unwrap();
        assert!(verify(&path).await.is_err());
    }

    #[tokio::test]
    async fn corrupted_payload_byte_breaks_parity() {
        let (_dir, path, mut bytes) = write_initial(256);
        let row = DataRow {
            start_control: b'T',
            uuid: Uuid::now_v7(),
            json: br#"{"i":1}"#.to_vec(),
            end_control: EndControl::Tc,
        };
        let mut row_bytes = marshal_data_row(256, &row).unwrap();
        row_bytes[10] ^= 0xFF;
        bytes.extend(row_bytes);
        std::fs::write(&path, &bytes).unwrap();
        assert!(verify(&path).await.is_err());
    }

    #[tokio::test]
    async fn non_utf8_payload_bytes_are_rejected() {
        let (_dir, path, mut bytes) = write_initial(256);
        let row = DataRow {
            start_control: b'T',
            uuid: Uuid::now_v7(),
            json: vec![0xFF, 0xFE, 0xFD],
            end_control: EndControl::Tc,
        };
        bytes.extend(marshal_data_row(256, &row).unwrap());
        std::fs::write(&path, &bytes).unwrap();
        assert!(verify(&path).await.is_err());
    }

    #[tokio::test]
    async fn tail_partial_row_verifies_as_state1() {
        let (_dir, path, mut bytes) = write_initial(256);
        bytes.extend(vec![crate::row::ROW_START, b'T']);
        std::fs::write(&path, &bytes).unwrap();
        let report = verify(&path).await.unwrap();
        assert!(report.has_tail_partial);
    }
}
