//! Row codec: the fixed-size, sentinel-delimited row format (spec.md §3.2,
//! §4.2) and its four kinds — `DataRow`, `ChecksumRow`, `NullRow`, and the
//! crash-safe `PartialDataRow` builder (spec.md §3.5).
//!
//! Row layout, `row_size` bytes, indices 0-based:
//! ```text
//! [0]                    ROW_START (0x1F)
//! [1]                    start_control  ('T' | 'R' | 'C')
//! [2 .. row_size-5)      payload (uuid/json/crc-hex, null-padded)
//! [row_size-5 .. -3)     end_control (2 ASCII bytes)
//! [row_size-3 .. -1)     parity (2 ASCII hex nibbles, one LRC byte)
//! [row_size-1]           ROW_END (0x0A)
//! ```
//! The LRC range is fixed per spec.md §9's open question as the byte range
//! `[1, row_size-3)` — `start_control` through the last byte of
//! `end_control`, inclusive — XORed down to a single byte and rendered as
//! two uppercase ASCII hex nibbles (see SPEC_FULL.md §3.6).

use base64::engine::general_purpose::URL_SAFE as B64;
use base64::Engine;
use uuid::Uuid;

use crate::error::{Error, Result};

pub const ROW_START: u8 = 0x1F;
pub const ROW_END: u8 = 0x0A;
pub const UUID_B64_LEN: usize = 24;
pub const END_CONTROL_LEN: usize = 2;
pub const PARITY_LEN: usize = 2;
/// Bytes of fixed overhead in every row: ROW_START + start_control +
/// end_control + parity + ROW_END.
pub const ROW_FIXED_OVERHEAD: usize = 1 + 1 + END_CONTROL_LEN + PARITY_LEN + 1;

const START_CONTROL_T: u8 = b'T';
const START_CONTROL_R: u8 = b'R';
const START_CONTROL_C: u8 = b'C';

fn end_control_range(row_size: usize) -> std::ops::Range<usize> {
    (row_size - 5)..(row_size - 3)
}

fn parity_range(row_size: usize) -> std::ops::Range<usize> {
    (row_size - 3)..(row_size - 1)
}

/// `end_control` codes (spec.md §3.2 table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndControl {
    /// Commit of a `T`-started transaction.
    Tc,
    /// Commit, with a savepoint materialized on this row.
    Sc,
    /// Row end, transaction continues.
    Re,
    /// Row end + savepoint on this row, transaction continues.
    Se,
    /// Full rollback: entire transaction discarded.
    R0,
    /// Rollback to savepoint `n` (1..=9).
    Rn(u8),
    /// Savepoint on this row, then full rollback.
    S0,
    /// Savepoint on this row, then rollback to previous savepoint `n`.
    Sn(u8),
    /// NullRow: empty transaction commit.
    Nr,
    /// ChecksumRow terminator.
    Cs,
}

impl EndControl {
    pub fn encode(self) -> [u8; 2] {
        match self {
            EndControl::Tc => *b"TC",
            EndControl::Sc => *b"SC",
            EndControl::Re => *b"RE",
            EndControl::Se => *b"SE",
            EndControl::R0 => *b"R0",
            EndControl::Rn(n) => [b'R', digit_to_ascii(n)],
            EndControl::S0 => *b"S0",
            EndControl::Sn(n) => [b'S', digit_to_ascii(n)],
            EndControl::Nr => *b"NR",
            EndControl::Cs => *b"CS",
        }
    }

    pub fn decode(bytes: [u8; 2], offset: u64) -> Result<Self> {
        Ok(match bytes {
            [b'T', b'C'] => EndControl::Tc,
            [b'S', b'C'] => EndControl::Sc,
            [b'R', b'E'] => EndControl::Re,
            [b'S', b'E'] => EndControl::Se,
            [b'R', b'0'] => EndControl::R0,
            [b'S', b'0'] => EndControl::S0,
            [b'N', b'R'] => EndControl::Nr,
            [b'C', b'S'] => EndControl::Cs,
            [b'R', d] if d.is_ascii_digit() && d != b'0' => EndControl::Rn(d - b'0'),
            [b'S', d] if d.is_ascii_digit() && d != b'0' => EndControl::Sn(d - b'0'),
            _ => {
                return Err(Error::corrupt(
                    offset,
                    format!("unrecognized end_control {:?}", String::from_utf8_lossy(&bytes)),
                ))
            }
        })
    }

    /// Every end_control terminates its row (spec.md §3.2 table: all rows
    /// "yes").
    pub fn terminates_row(self) -> bool {
        true
    }

    /// Whether this end_control closes the enclosing transaction.
    pub fn terminates_transaction(self) -> bool {
        !matches!(self, EndControl::Re | EndControl::Se | EndControl::Cs)
    }

    /// The savepoint number an `Rn`/`Sn` rolls back to, if any.
    pub fn rollback_target(self) -> Option<u8> {
        match self {
            EndControl::Rn(n) | EndControl::Sn(n) => Some(n),
            EndControl::R0 | EndControl::S0 => Some(0),
            _ => None,
        }
    }

    /// Whether this end_control materializes a new savepoint on its row
    /// (`SE`, `SC`, or `Sn`/`S0`, which record one before rolling back).
    pub fn creates_savepoint(self) -> bool {
        matches!(
            self,
            EndControl::Se | EndControl::Sc | EndControl::S0 | EndControl::Sn(_)
        )
    }
}

fn digit_to_ascii(n: u8) -> u8 {
    debug_assert!((1..=9).contains(&n));
    b'0' + n
}

/// XOR of bytes `[1, row_size-3)` — `start_control` through the last byte of
/// `end_control` inclusive — down to a single byte.
pub fn compute_lrc(row_size: usize, buf: &[u8]) -> u8 {
    buf[1..row_size - 3].iter().fold(0u8, |acc, &b| acc ^ b)
}

fn encode_parity(lrc: u8) -> [u8; 2] {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    [HEX[(lrc >> 4) as usize], HEX[(lrc & 0x0f) as usize]]
}

fn decode_hex_nibble(b: u8, offset: u64) -> Result<u8> {
    match b {
        b'0'..=b'9' => Ok(b - b'0'),
        b'A'..=b'F' => Ok(b - b'A' + 10),
        b'a'..=b'f' => Ok(b - b'a' + 10),
        _ => Err(Error::corrupt(offset, format!("invalid hex nibble 0x{b:02x}"))),
    }
}

/// Validate that the stored parity matches the recomputed LRC.
pub fn validate_parity(row_size: usize, buf: &[u8], row_offset: u64) -> Result<()> {
    let pr = parity_range(row_size);
    let hi = decode_hex_nibble(buf[pr.start], row_offset + pr.start as u64)?;
    let lo = decode_hex_nibble(buf[pr.start + 1], row_offset + pr.start as u64 + 1)?;
    let stored = (hi << 4) | lo;
    let computed = compute_lrc(row_size, buf);
    if stored != computed {
        return Err(Error::corrupt(
            row_offset,
            format!("LRC mismatch: stored 0x{stored:02x}, computed 0x{computed:02x}"),
        ));
    }
    Ok(())
}

/// Encode a UUID's 16 raw bytes as 24 ASCII bytes of padded URL-safe
/// Base64. The row layout fixes this field at exactly 24 bytes; the padded
/// alphabet is the only encoding of 16 bytes that lands on that width (see
/// DESIGN.md for the resolution of spec.md §9's "no padding" wording).
pub fn encode_uuid(uuid: &Uuid) -> [u8; UUID_B64_LEN] {
    let s = B64.encode(uuid.as_bytes());
    let mut out = [0u8; UUID_B64_LEN];
    out.copy_from_slice(s.as_bytes());
    out
}

pub fn decode_uuid(bytes: &[u8], offset: u64) -> Result<Uuid> {
    if bytes.len() != UUID_B64_LEN {
        return Err(Error::corrupt(offset, "uuid field has wrong width"));
    }
    let s = std::str::from_utf8(bytes)
        .map_err(|_| Error::corrupt(offset, "uuid field is not valid ASCII"))?;
    let raw = B64
        .decode(s)
        .map_err(|e| Error::corrupt(offset, format!("uuid base64 decode failed: {e}")))?;
    if raw.len() != 16 {
        return Err(Error::corrupt(offset, "decoded uuid is not 16 bytes"));
    }
    let mut arr = [0u8; 16];
    arr.copy_from_slice(&raw);
    Ok(Uuid::from_bytes(arr))
}

/// `true` if `uuid` has a plausible UUIDv7 timestamp and version/variant
/// bits, independent of whether its random bytes are zeroed.
pub fn has_v7_shape(uuid: &Uuid) -> bool {
    uuid.get_version_num() == 7
}

/// `true` if every non-timestamp byte (indices 7, 9..=15) is zero — the
/// shape reserved for `NullRow` UUIDs.
pub fn is_nullrow_shaped(uuid: &Uuid) -> bool {
    let b = uuid.as_bytes();
    b[7] == 0 && b[9..16].iter().all(|&x| x == 0)
}

/// Validate a caller-supplied key: non-nil, UUIDv7, and not shaped like a
/// NullRow UUID (spec.md §4.6, §6.2).
pub fn validate_key_uuid(uuid: &Uuid) -> Result<()> {
    if uuid.is_nil() {
        return Err(Error::invalid_input("uuid is nil"));
    }
    if !has_v7_shape(uuid) {
        return Err(Error::invalid_input(format!(
            "uuid is not v7 (version {:?})",
            uuid.get_version_num()
        )));
    }
    if is_nullrow_shaped(uuid) {
        return Err(Error::invalid_input("uuid is NullRow-shaped"));
    }
    Ok(())
}

/// Synthesize a NullRow UUID: a fresh v7 timestamp with every
/// non-timestamp byte zeroed.
pub fn new_nullrow_uuid() -> Uuid {
    let mut bytes = *Uuid::now_v7().as_bytes();
    bytes[7] = 0;
    for b in &mut bytes[9..16] {
        *b = 0;
    }
    Uuid::from_bytes(bytes)
}

/// A finalized data row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRow {
    pub start_control: u8,
    pub uuid: Uuid,
    pub json: Vec<u8>,
    pub end_control: EndControl,
}

/// A NullRow: marks a committed, empty transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NullRow {
    pub uuid: Uuid,
}

/// A ChecksumRow: covers either the header or the preceding 10,000 rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumRow {
    pub crc: u32,
}

/// The result of unmarshaling a complete, `row_size`-byte row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowUnion {
    Data(DataRow),
    Null(NullRow),
    Checksum(ChecksumRow),
}

impl RowUnion {
    pub fn is_checksum(&self) -> bool {
        matches!(self, RowUnion::Checksum(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RowUnion::Null(_))
    }

    pub fn is_data(&self) -> bool {
        matches!(self, RowUnion::Data(_))
    }

    pub fn start_control(&self) -> Option<u8> {
        match self {
            RowUnion::Data(d) => Some(d.start_control),
            RowUnion::Null(_) => Some(START_CONTROL_T),
            RowUnion::Checksum(_) => None,
        }
    }

    pub fn end_control(&self) -> Option<EndControl> {
        match self {
            RowUnion::Data(d) => Some(d.end_control),
            RowUnion::Null(_) => Some(EndControl::Nr),
            RowUnion::Checksum(_) => None,
        }
    }

    pub fn uuid(&self) -> Option<Uuid> {
        match self {
            RowUnion::Data(d) => Some(d.uuid),
            RowUnion::Null(n) => Some(n.uuid),
            RowUnion::Checksum(_) => None,
        }
    }
}

/// Write the sentinel, end_control, parity, and terminator of a row whose
/// `buf[1..row_size-5)` content is already populated. Returns the
/// completed `row_size`-byte row.
fn finish_row(row_size: usize, mut buf: Vec<u8>, end_control: EndControl) -> Vec<u8> {
    buf[0] = ROW_START;
    let ecr = end_control_range(row_size);
    buf[ecr.clone()].copy_from_slice(&end_control.encode());
    let lrc = compute_lrc(row_size, &buf);
    let pr = parity_range(row_size);
    buf[pr].copy_from_slice(&encode_parity(lrc));
    buf[row_size - 1] = ROW_END;
    buf
}

fn check_payload_fits(row_size: usize, used: usize) -> Result<()> {
    let max = row_size - 7; // payload region length: uuid/crc width + json/padding
    if used > max {
        return Err(Error::invalid_input(format!(
            "payload of {used} bytes exceeds row capacity of {max} bytes for row_size {row_size}"
        )));
    }
    Ok(())
}

/// Marshal a finalized data row. Fails if `uuid` + `json` overflow the
/// payload region.
pub fn marshal_data_row(row_size: usize, row: &DataRow) -> Result<Vec<u8>> {
    let used = UUID_B64_LEN + row.json.len();
    check_payload_fits(row_size, used)?;
    let mut buf = vec![0u8; row_size];
    buf[1] = row.start_control;
    buf[2..2 + UUID_B64_LEN].copy_from_slice(&encode_uuid(&row.uuid));
    let json_start = 2 + UUID_B64_LEN;
    buf[json_start..json_start + row.json.len()].copy_from_slice(&row.json);
    // Remaining bytes up to end_control are already zero from the initial fill.
    Ok(finish_row(row_size, buf, row.end_control))
}

/// Marshal a NullRow. `start_control` is always `'T'`; `end_control` is
/// always `NR`.
pub fn marshal_null_row(row_size: usize, row: &NullRow) -> Vec<u8> {
    let mut buf = vec![0u8; row_size];
    buf[1] = START_CONTROL_T;
    buf[2..2 + UUID_B64_LEN].copy_from_slice(&encode_uuid(&row.uuid));
    finish_row(row_size, buf, EndControl::Nr)
}

/// Marshal a ChecksumRow: `start_control='C'`, payload is 8 ASCII hex
/// digits of the CRC32, `end_control=CS`.
pub fn marshal_checksum_row(row_size: usize, row: ChecksumRow) -> Vec<u8> {
    let mut buf = vec![0u8; row_size];
    buf[1] = START_CONTROL_C;
    let hex = format!("{:08X}", row.crc);
    buf[2..10].copy_from_slice(hex.as_bytes());
    finish_row(row_size, buf, EndControl::Cs)
}

/// Unmarshal a complete `row_size`-byte row, routing by sentinels and
/// control bytes. `row_offset` is the row's absolute byte offset in the
/// file, used to annotate corruption errors.
pub fn unmarshal_row(row_size: usize, buf: &[u8], row_offset: u64) -> Result<RowUnion> {
    if buf.len() != row_size {
        return Err(Error::corrupt(
            row_offset,
            format!("row buffer is {} bytes, want {row_size}", buf.len()),
        ));
    }
    if buf[0] != ROW_START {
        return Err(Error::corrupt(row_offset, "missing ROW_START sentinel"));
    }
    if buf[row_size - 1] != ROW_END {
        return Err(Error::corrupt(
            row_offset + row_size as u64 - 1,
            "missing ROW_END sentinel",
        ));
    }
    validate_parity(row_size, buf, row_offset)?;

    let ecr = end_control_range(row_size);
    let mut ec_bytes = [0u8; 2];
    ec_bytes.copy_from_slice(&buf[ecr]);
    let end_control = EndControl::decode(ec_bytes, row_offset + end_control_range(row_size).start as u64)?;

    match buf[1] {
        START_CONTROL_C => {
            if end_control != EndControl::Cs {
                return Err(Error::corrupt(
                    row_offset,
                    "start_control 'C' requires end_control CS",
                ));
            }
            let hex = std::str::from_utf8(&buf[2..10])
                .map_err(|_| Error::corrupt(row_offset, "checksum payload is not ASCII"))?;
            let crc = u32::from_str_radix(hex, 16)
                .map_err(|_| Error::corrupt(row_offset, "checksum payload is not hex"))?;
            for (i, &b) in buf[10..ecr_start(row_size)].iter().enumerate() {
                if b != 0 {
                    return Err(Error::corrupt(
                        row_offset + 10 + i as u64,
                        "checksum row padding must be zero",
                    ));
                }
            }
            Ok(RowUnion::Checksum(ChecksumRow { crc }))
        }
        start @ (START_CONTROL_T | START_CONTROL_R) => {
            let uuid_off = row_offset + 2;
            let uuid = decode_uuid(&buf[2..2 + UUID_B64_LEN], uuid_off)?;
            if end_control == EndControl::Nr {
                if !is_nullrow_shaped(&uuid) {
                    return Err(Error::corrupt(uuid_off, "NR row uuid is not NullRow-shaped"));
                }
                if !has_v7_shape(&uuid) {
                    return Err(Error::corrupt(uuid_off, "NR row uuid lacks a v7 timestamp"));
                }
                return Ok(RowUnion::Null(NullRow { uuid }));
            }
            let json_start = 2 + UUID_B64_LEN;
            let json_region_end = ecr_start(row_size);
            let json_region = &buf[json_start..json_region_end];
            let json_len = json_region
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(json_region.len());
            let json = json_region[..json_len].to_vec();
            for (i, &b) in json_region[json_len..].iter().enumerate() {
                if b != 0 {
                    return Err(Error::corrupt(
                        row_offset + json_start as u64 + json_len as u64 + i as u64,
                        "data row padding must be zero",
                    ));
                }
            }
            if json.is_empty() {
                return Err(Error::corrupt(row_offset, "data row JSON payload is empty"));
            }
            Ok(RowUnion::Data(DataRow {
                start_control: start,
                uuid,
                json,
                end_control,
            }))
        }
        other => Err(Error::corrupt(
            row_offset + 1,
            format!("invalid start_control byte 0x{other:02x}"),
        )),
    }
}

fn ecr_start(row_size: usize) -> usize {
    row_size - 5
}

/// The in-progress partial row at the tail of the file (spec.md §3.5). At
/// most one exists in a valid file, and it must be the last bytes present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartialDataRow {
    /// `ROW_START | start_control` only.
    State1 { start_control: u8 },
    /// State 1 + uuid + json + padding: the row is full width but lacks
    /// its trailer.
    State2 {
        start_control: u8,
        uuid: Uuid,
        json: Vec<u8>,
    },
    /// State 2 + a single `'S'` byte: savepoint intent recorded, trailer
    /// still pending.
    State3 {
        start_control: u8,
        uuid: Uuid,
        json: Vec<u8>,
    },
}

impl PartialDataRow {
    pub fn start_control(&self) -> u8 {
        match self {
            PartialDataRow::State1 { start_control }
            | PartialDataRow::State2 { start_control, .. }
            | PartialDataRow::State3 { start_control, .. } => *start_control,
        }
    }

    /// Number of bytes this state contributes to the file.
    pub fn byte_len(&self, row_size: usize) -> usize {
        match self {
            PartialDataRow::State1 { .. } => 2,
            PartialDataRow::State2 { .. } => row_size - 5,
            PartialDataRow::State3 { .. } => row_size - 4,
        }
    }

    /// The bytes this state alone would append to the file (used by the
    /// transaction engine to know what to write for a transition that
    /// starts from empty).
    pub fn to_full_prefix_bytes(&self, row_size: usize) -> Vec<u8> {
        match self {
            PartialDataRow::State1 { start_control } => vec![ROW_START, *start_control],
            PartialDataRow::State2 {
                start_control,
                uuid,
                json,
            } => {
                let mut buf = vec![0u8; row_size - 5];
                buf[0] = ROW_START;
                buf[1] = *start_control;
                buf[2..2 + UUID_B64_LEN].copy_from_slice(&encode_uuid(uuid));
                let json_start = 2 + UUID_B64_LEN;
                buf[json_start..json_start + json.len()].copy_from_slice(json);
                buf
            }
            PartialDataRow::State3 { .. } => {
                let mut v = self.to_state2().unwrap().to_full_prefix_bytes(row_size);
                v.push(b'S');
                v
            }
        }
    }

    fn to_state2(&self) -> Option<PartialDataRow> {
        match self {
            PartialDataRow::State2 { .. } => Some(self.clone()),
            PartialDataRow::State3 {
                start_control,
                uuid,
                json,
            } => Some(PartialDataRow::State2 {
                start_control: *start_control,
                uuid: *uuid,
                json: json.clone(),
            }),
            PartialDataRow::State1 { .. } => None,
        }
    }
}

/// Parse a tail partial row found during recovery. `tail` is the file's
/// trailing bytes after the last complete row, and `row_size` the
/// configured row width. Anything that is not exactly State 1, 2, or 3 is
/// corrupt-database (spec.md §4.8 step 3).
pub fn parse_partial(row_size: usize, tail: &[u8], tail_offset: u64) -> Result<PartialDataRow> {
    if tail.is_empty() {
        return Err(Error::corrupt(tail_offset, "empty partial row tail"));
    }
    if tail[0] != ROW_START {
        return Err(Error::corrupt(tail_offset, "partial row missing ROW_START"));
    }
    let start_control = tail[1];
    if ![START_CONTROL_T, START_CONTROL_R].contains(&start_control) {
        return Err(Error::corrupt(
            tail_offset + 1,
            format!("partial row has invalid start_control 0x{start_control:02x}"),
        ));
    }

    match tail.len() {
        2 => Ok(PartialDataRow::State1 { start_control }),
        n if n == row_size - 5 => {
            let uuid = decode_uuid(&tail[2..2 + UUID_B64_LEN], tail_offset + 2)?;
            let json_start = 2 + UUID_B64_LEN;
            let json_region = &tail[json_start..];
            let json_len = json_region
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(json_region.len());
            let json = json_region[..json_len].to_vec();
            for (i, &b) in json_region[json_len..].iter().enumerate() {
                if b != 0 {
                    return Err(Error::corrupt(
                        tail_offset + json_start as u64 + json_len as u64 + i as u64,
                        "partial row padding must be zero",
                    ));
                }
            }
            Ok(PartialDataRow::State2 {
                start_control,
                uuid,
                json,
            })
        }
        n if n == row_size - 4 => {
            if tail[row_size - 5] != b'S' {
                return Err(Error::corrupt(
                    tail_offset + row_size as u64 - 5,
                    "State 3 partial row must end in 'S'",
                ));
            }
            let uuid = decode_uuid(&tail[2..2 + UUID_B64_LEN], tail_offset + 2)?;
            let json_start = 2 + UUID_B64_LEN;
            let json_region = &tail[json_start..row_size - 5];
            let json_len = json_region
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(json_region.len());
            let json = json_region[..json_len].to_vec();
            Ok(PartialDataRow::State3 {
                start_control,
                uuid,
                json,
            })
        }
        n => Err(Error::corrupt(
            tail_offset,
            format!("partial row tail has unrecognized length {n}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v7() -> Uuid {
        Uuid::now_v7()
    }

    #[test]
    fn data_row_round_trip() {
        let row_size = 256;
        let row = DataRow {
            start_control: b'T',
            uuid: v7(),
            json: br#"{"i":1}"#.to_vec(),
            end_control: EndControl::Tc,
        };
        let bytes = marshal_data_row(row_size, &row).unwrap();
        assert_eq!(bytes.len(), row_size);
        let parsed = unmarshal_row(row_size, &bytes, 0).unwrap();
        assert_eq!(parsed, RowUnion::Data(row));
    }

    #[test]
    fn all_end_controls_round_trip() {
        let row_size = 256;
        let codes = [
            EndControl::Tc,
            EndControl::Sc,
            EndControl::Re,
            EndControl::Se,
            EndControl::R0,
            EndControl::Rn(3),
            EndControl::S0,
            EndControl::Sn(5),
        ];
        for ec in codes {
            let row = DataRow {
                start_control: b'R',
                uuid: v7(),
                json: br#"{"k":"v"}"#.to_vec(),
                end_control: ec,
            };
            let bytes = marshal_data_row(row_size, &row).unwrap();
            let parsed = unmarshal_row(row_size, &bytes, 0).unwrap();
            assert_eq!(parsed, RowUnion::Data(row));
        }
    }

    #[test]
    fn null_row_round_trip() {
        let row_size = 256;
        let uuid = new_nullrow_uuid();
        assert!(is_nullrow_shaped(&uuid));
        assert!(has_v7_shape(&uuid));
        let row = NullRow { uuid };
        let bytes = marshal_null_row(row_size, &row);
        let parsed = unmarshal_row(row_size, &bytes, 0).unwrap();
        assert_eq!(parsed, RowUnion::Null(row));
    }

    #[test]
    fn checksum_row_round_trip() {
        let row_size = 256;
        let row = ChecksumRow { crc: 0xDEADBEEF };
        let bytes = marshal_checksum_row(row_size, row);
        let parsed = unmarshal_row(row_size, &bytes, 0).unwrap();
        assert_eq!(parsed, RowUnion::Checksum(row));
    }

    #[test]
    fn parity_mismatch_detected() {
        let row_size = 256;
        let row = DataRow {
            start_control: b'T',
            uuid: v7(),
            json: br#"{"i":1}"#.to_vec(),
            end_control: EndControl::Tc,
        };
        let mut bytes = marshal_data_row(row_size, &row).unwrap();
        let pr = parity_range(row_size);
        bytes[pr.start] = b'0';
        bytes[pr.start + 1] = b'0';
        assert!(unmarshal_row(row_size, &bytes, 0).is_err());
    }

    #[test]
    fn uuid_b64_is_24_bytes() {
        let uuid = v7();
        assert_eq!(encode_uuid(&uuid).len(), UUID_B64_LEN);
    }

    #[test]
    fn validate_key_uuid_rejects_nil_and_nullrow_shaped() {
        assert!(validate_key_uuid(&Uuid::nil()).is_err());
        assert!(validate_key_uuid(&new_nullrow_uuid()).is_err());
        assert!(validate_key_uuid(&v7()).is_ok());
    }

    #[test]
    fn partial_states_round_trip() {
        let row_size = 256;
        let s1 = PartialDataRow::State1 { start_control: b'T' };
        let bytes = s1.to_full_prefix_bytes(row_size);
        assert_eq!(parse_partial(row_size, &bytes, 0).unwrap(), s1);

        let s2 = PartialDataRow::State2 {
            start_control: b'T',
            uuid: v7(),
            json: br#"{"a":1}"#.to_vec(),
        };
        let bytes = s2.to_full_prefix_bytes(row_size);
        assert_eq!(bytes.len(), row_size - 5);
        assert_eq!(parse_partial(row_size, &bytes, 0).unwrap(), s2);

        let s3 = PartialDataRow::State3 {
            start_control: b'T',
            uuid: v7(),
            json: br#"{"a":1}"#.to_vec(),
        };
        let bytes = s3.to_full_prefix_bytes(row_size);
        assert_eq!(bytes.len(), row_size - 4);
        assert_eq!(parse_partial(row_size, &bytes, 0).unwrap(), s3);
    }
}
