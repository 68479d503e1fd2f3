//! The 64-byte file header (spec.md §3.1, §4.1).
//!
//! A UTF-8 JSON object with keys in a fixed order (`sig`, `ver`, `row_size`,
//! `skew_ms`), null-padded, terminated by `\n` at byte 63. Key order is part
//! of the on-disk format: a byte-identical reorder is corruption, not just a
//! style nit, so deserialization re-validates the raw byte order rather than
//! trusting a round-trip through a reordering map type.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Exact size of the header in bytes.
pub const HEADER_SIZE: usize = 64;

const SIG: &str = "fDB";
const VERSION: u32 = 1;

const ROW_SIZE_MIN: u32 = 128;
const ROW_SIZE_MAX: u32 = 65536;
const SKEW_MS_MAX: u64 = 86_400_000;

/// A validated `row_size`, constructible only through [`RowSize::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowSize(u32);

impl RowSize {
    /// Validate and wrap a raw row size. Fails `invalid-input` outside
    /// `[128, 65536]`.
    pub fn new(value: u32) -> Result<Self> {
        if !(ROW_SIZE_MIN..=ROW_SIZE_MAX).contains(&value) {
            return Err(Error::invalid_input(format!(
                "row_size {} out of range [{}, {}]",
                value, ROW_SIZE_MIN, ROW_SIZE_MAX
            )));
        }
        Ok(RowSize(value))
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// A validated `skew_ms`, constructible only through [`SkewMs::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SkewMs(u64);

impl SkewMs {
    /// Validate and wrap a raw clock-skew tolerance in milliseconds. Fails
    /// `invalid-input` outside `[0, 86_400_000]`.
    pub fn new(value: u64) -> Result<Self> {
        if value > SKEW_MS_MAX {
            return Err(Error::invalid_input(format!(
                "skew_ms {} exceeds max {}",
                value, SKEW_MS_MAX
            )));
        }
        Ok(SkewMs(value))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

/// The parsed header, with validated field wrappers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub row_size: RowSize,
    pub skew_ms: SkewMs,
}

/// Wire-format shape used only for (de)serialization; field order here is
/// the on-disk field order because serde_json emits struct fields in
/// declaration order.
#[derive(Serialize, Deserialize)]
struct HeaderWire {
    sig: String,
    ver: u32,
    row_size: u32,
    skew_ms: u64,
}

impl Header {
    pub fn new(row_size: RowSize, skew_ms: SkewMs) -> Self {
        Header { row_size, skew_ms }
    }

    /// Serialize into the exact 64-byte on-disk representation: JSON (keys
    /// in fixed order) + `\x00` padding + a trailing `\n` at byte 63.
    pub fn to_bytes(&self) -> Result<[u8; HEADER_SIZE]> {
        let wire = HeaderWire {
            sig: SIG.to_string(),
            ver: VERSION,
            row_size: self.row_size.get(),
            skew_ms: self.skew_ms.get(),
        };
        let json = serde_json::to_vec(&wire)
            .map_err(|e| Error::invalid_input(format!("header serialization failed: {e}")))?;
        if json.len() > HEADER_SIZE - 1 {
            return Err(Error::invalid_input(
                "header JSON does not fit in 64 bytes",
            ));
        }
        let mut buf = [0u8; HEADER_SIZE];
        buf[..json.len()].copy_from_slice(&json);
        // buf[json.len()..63] is already zero-initialized.
        buf[HEADER_SIZE - 1] = b'\n';
        Ok(buf)
    }

    /// Parse and validate a 64-byte header buffer. Fails `corrupt-database`
    /// on any deviation from §3.1 (key order, padding, field ranges,
    /// terminator).
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != HEADER_SIZE {
            return Err(Error::corrupt(
                0,
                format!("header must be exactly {HEADER_SIZE} bytes, got {}", buf.len()),
            ));
        }
        if buf[HEADER_SIZE - 1] != b'\n' {
            return Err(Error::corrupt(
                (HEADER_SIZE - 1) as u64,
                "header byte 63 must be '\\n'",
            ));
        }

        let json_end = buf[..HEADER_SIZE - 1]
            .iter()
            .position(|&b| b == 0 || b == b'\n')
            .unwrap_or(HEADER_SIZE - 1);
        let json_bytes = &buf[..json_end];
        let json_str = std::str::from_utf8(json_bytes)
            .map_err(|_| Error::corrupt(0, "header JSON is not valid UTF-8"))?;

        verify_key_order(json_str)?;

        let wire: HeaderWire = serde_json::from_str(json_str)
            .map_err(|e| Error::corrupt(0, format!("header JSON parse failed: {e}")))?;

        if wire.sig != SIG {
            return Err(Error::corrupt(0, format!("bad sig {:?}, want {:?}", wire.sig, SIG)));
        }
        if wire.ver != VERSION {
            return Err(Error::corrupt(0, format!("bad ver {}, want {}", wire.ver, VERSION)));
        }

        // padding bytes between JSON terminator and byte 63 must be \x00.
        for (i, &b) in buf[json_end..HEADER_SIZE - 1].iter().enumerate() {
            if b != 0 {
                return Err(Error::corrupt(
                    (json_end + i) as u64,
                    format!("header padding byte is 0x{:02x}, want 0x00", b),
                ));
            }
        }

        let row_size = RowSize::new(wire.row_size).map_err(|_| {
            Error::corrupt(0, format!("row_size {} out of range", wire.row_size))
        })?;
        let skew_ms = SkewMs::new(wire.skew_ms).map_err(|_| {
            Error::corrupt(0, format!("skew_ms {} out of range", wire.skew_ms))
        })?;

        Ok(Header { row_size, skew_ms })
    }
}

/// Confirm that `sig`, `ver`, `row_size`, `skew_ms` appear as keys in
/// exactly that left-to-right order in the raw JSON text. This is a
/// stream-level check independent of the parsed value, since a
/// `serde_json::Value` map does not preserve source key order by default.
fn verify_key_order(json: &str) -> Result<()> {
    const KEYS: [&str; 4] = ["\"sig\"", "\"ver\"", "\"row_size\"", "\"skew_ms\""];
    let mut cursor = 0usize;
    for key in KEYS {
        match json[cursor..].find(key) {
            Some(pos) => cursor += pos + key.len(),
            None => {
                return Err(Error::corrupt(
                    0,
                    format!("header JSON missing or reorders key {key}"),
                ))
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let h = Header::new(RowSize::new(1024).unwrap(), SkewMs::new(5000).unwrap());
        let bytes = h.to_bytes().unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(bytes[HEADER_SIZE - 1], b'\n');
        let parsed = Header::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, h);
    }

    #[test]
    fn rejects_bad_sig() {
        let mut bytes = Header::new(RowSize::new(128).unwrap(), SkewMs::new(0).unwrap())
            .to_bytes()
            .unwrap();
        // Corrupt the 's' of "sig".
        let pos = bytes.iter().position(|&b| b == b's').unwrap();
        bytes[pos] = b'x';
        assert!(Header::from_bytes(&bytes).is_err());
    }

    #[test]
    fn rejects_reordered_keys() {
        let json = r#"{"ver":1,"sig":"fDB","row_size":128,"skew_ms":0}"#;
        let mut buf = [0u8; HEADER_SIZE];
        buf[..json.len()].copy_from_slice(json.as_bytes());
        buf[HEADER_SIZE - 1] = b'\n';
        assert!(Header::from_bytes(&buf).is_err());
    }

    #[test]
    fn row_size_bounds() {
        assert!(RowSize::new(127).is_err());
        assert!(RowSize::new(128).is_ok());
        assert!(RowSize::new(65536).is_ok());
        assert!(RowSize::new(65537).is_err());
    }

    #[test]
    fn skew_ms_bounds() {
        assert!(SkewMs::new(86_400_000).is_ok());
        assert!(SkewMs::new(86_400_001).is_err());
    }
}
