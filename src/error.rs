//! Error taxonomy for FrozenDB.
//!
//! One variant per error kind named in the specification's error handling
//! design. Every corruption-class error carries the byte offset at which
//! the invariant was violated, per the propagation policy: callers see
//! exactly what failed and where.

use thiserror::Error;

/// The single error type returned by every fallible operation in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed caller argument: bad mode, nil UUID, UUIDv4, nil
    /// destination, out-of-range `row_size`/`skew_ms`, unknown finder
    /// strategy.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Operation is legal in isolation but illegal in the current state:
    /// double-open writer, `Savepoint` from partial-row State 1, a second
    /// concurrent `BeginTx`.
    #[error("invalid action: {0}")]
    InvalidAction(String),

    /// File does not exist, parent directory missing, or permission denied
    /// during open/create.
    #[error("path error: {0}")]
    PathError(String),

    /// Lock contention or I/O failure while appending.
    #[error("write error: {0}")]
    WriteError(String),

    /// I/O failure or an attempt to read past EOF.
    #[error("read error: {0}")]
    ReadError(String),

    /// A format invariant was violated: header, row sentinel, parity, CRC,
    /// transaction nesting, or tail partial-row shape. `offset` is the
    /// absolute byte offset at which the invariant failed.
    #[error("corrupt database at offset {offset}: {detail}")]
    CorruptDatabase {
        /// Absolute byte offset of the offending bytes.
        offset: u64,
        /// Human-readable description of the violated invariant.
        detail: String,
    },

    /// No visible data row exists for the requested key.
    #[error("key not found")]
    KeyNotFound,

    /// Stored JSON bytes could not be parsed into the caller's destination.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Operation attempted on a closed (tombstoned) file manager.
    #[error("tombstoned")]
    Tombstoned,

    /// A transaction-boundary walk reached the live tail without finding a
    /// terminator; the transaction is still open in the file.
    #[error("transaction active")]
    TransactionActive,

    /// Opaque I/O failure not otherwise classified above.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build an [`Error::CorruptDatabase`] with a formatted detail message.
    pub fn corrupt(offset: u64, detail: impl Into<String>) -> Self {
        Error::CorruptDatabase {
            offset,
            detail: detail.into(),
        }
    }

    pub fn invalid_input(detail: impl Into<String>) -> Self {
        Error::InvalidInput(detail.into())
    }

    pub fn invalid_action(detail: impl Into<String>) -> Self {
        Error::InvalidAction(detail.into())
    }
}

/// Crate-wide result alias, mirroring the teacher's `error::Result`.
pub type Result<T> = std::result::Result<T, Error>;
