//! Finders: locate a key's row index, its transaction start, and its
//! transaction end (spec.md §4.6). Three strategies share the same
//! transaction-boundary walk and trait surface; they differ only in how
//! `get_index` locates a key.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::emitter::RowEvent;
use crate::error::{Error, Result};
use crate::filemanager::FileManager;
use crate::header::HEADER_SIZE;
use crate::row::{unmarshal_row, validate_key_uuid, RowUnion};

/// Hard cap on rows in one transaction (spec.md §3.3).
pub const MAX_TX_ROWS: i64 = 100;
/// Resolution assumed between two UUIDv7 timestamps that can still
/// represent adjacent rows; the binary search's local sweep bound is
/// `skew_ms / MIN_CLOCK_QUANTUM_MS` rows (spec.md §4.6.3).
const MIN_CLOCK_QUANTUM_MS: u64 = 1;

/// Common interface implemented by all three finder strategies
/// (spec.md §4.6).
#[async_trait]
pub trait Finder: Send + Sync {
    /// Row-index of the data row containing `uuid`, or `key-not-found`.
    async fn get_index(&self, uuid: Uuid) -> Result<i64>;
    /// Row-index of the `start_control='T'` row beginning the transaction
    /// enclosing `index`.
    async fn get_transaction_start(&self, index: i64) -> Result<i64>;
    /// Row-index of the terminating row of the transaction enclosing
    /// `index`, or `transaction-active` if it has not yet ended.
    async fn get_transaction_end(&self, index: i64) -> Result<i64>;
    /// Update any auxiliary state for a newly-emitted row. Must be
    /// thread-safe; invoked from the Row Emitter's dispatch.
    fn on_row_added(&self, event: &RowEvent) -> Result<()>;
}

fn current_row_count(manager: &FileManager) -> i64 {
    let body = manager.size() - HEADER_SIZE as i64;
    if body <= 0 {
        0
    } else {
        body / manager.row_size() as i64
    }
}

async fn read_row(manager: &FileManager, index: i64) -> Result<RowUnion> {
    let row_size = manager.row_size() as i64;
    let offset = HEADER_SIZE as i64 + index * row_size;
    let bytes = manager.read(offset, row_size).await?;
    unmarshal_row(row_size as usize, &bytes, offset as u64)
}

/// Walk backward from `index`, skipping checksum and null rows, halting at
/// the first row whose `start_control='T'`. Fails `invalid-input` if
/// `index` itself names a checksum or null row.
pub async fn walk_transaction_start(manager: &FileManager, index: i64) -> Result<i64> {
    let row = read_row(manager, index).await?;
    if row.is_checksum() || row.is_null() {
        return Err(Error::invalid_input(
            "get_transaction_start is undefined for checksum/null rows",
        ));
    }

    let mut i = index;
    for steps in 0..=MAX_TX_ROWS {
        let row = read_row(manager, i).await?;
        if row.is_checksum() {
            i -= 1;
            if i < 1 {
                return Err(Error::corrupt(0, "transaction start walk ran off the file"));
            }
            continue;
        }
        if row.start_control() == Some(b'T') {
            return Ok(i);
        }
        if steps == MAX_TX_ROWS {
            return Err(Error::corrupt(
                HEADER_SIZE as u64 + i as u64 * manager.row_size() as u64,
                "transaction start not found within the 100-row cap",
            ));
        }
        i -= 1;
        if i < 1 {
            return Err(Error::corrupt(0, "transaction start walk ran off the file"));
        }
    }
    unreachable!()
}

/// Walk forward from `index`, skipping checksum and null rows, halting at
/// the first row whose `end_control` is a terminator. Returns
/// `transaction-active` if the live tail is reached first. Fails
/// `invalid-input` if `index` itself names a checksum or null row.
pub async fn walk_transaction_end(manager: &FileManager, index: i64) -> Result<i64> {
    let row_count = current_row_count(manager);
    let row = read_row(manager, index).await?;
    if row.is_checksum() || row.is_null() {
        return Err(Error::invalid_input(
            "get_transaction_end is undefined for checksum/null rows",
        ));
    }

    let mut i = index;
    for steps in 0..=MAX_TX_ROWS {
        if i >= row_count {
            return Err(Error::TransactionActive);
        }
        let row = read_row(manager, i).await?;
        if row.is_checksum() {
            i += 1;
            continue;
        }
        if let Some(ec) = row.end_control() {
            if ec.terminates_transaction() {
                return Ok(i);
            }
        }
        if steps == MAX_TX_ROWS {
            return Err(Error::corrupt(
                HEADER_SIZE as u64 + i as u64 * manager.row_size() as u64,
                "transaction end not found within the 100-row cap",
            ));
        }
        i += 1;
    }
    unreachable!()
}

fn uuid7_millis(uuid: &Uuid) -> u64 {
    let b = uuid.as_bytes();
    (b[0] as u64) << 40
        | (b[1] as u64) << 32
        | (b[2] as u64) << 24
        | (b[3] as u64) << 16
        | (b[4] as u64) << 8
        | (b[5] as u64)
}

// ---------------------------------------------------------------------
// Simple finder: O(n) forward scan, no auxiliary state.
// ---------------------------------------------------------------------

/// Scans the file forward from row-index 1 on every lookup. No memory
/// beyond the shared [`FileManager`] handle.
pub struct SimpleFinder {
    manager: Arc<FileManager>,
}

impl SimpleFinder {
    pub fn new(manager: Arc<FileManager>) -> Self {
        SimpleFinder { manager }
    }
}

#[async_trait]
impl Finder for SimpleFinder {
    async fn get_index(&self, uuid: Uuid) -> Result<i64> {
        validate_key_uuid(&uuid)?;
        let row_count = current_row_count(&self.manager);
        for i in 1..row_count {
            let row = read_row(&self.manager, i).await?;
            if let RowUnion::Data(d) = &row {
                if d.uuid == uuid {
                    return Ok(i);
                }
            }
        }
        Err(Error::KeyNotFound)
    }

    async fn get_transaction_start(&self, index: i64) -> Result<i64> {
        walk_transaction_start(&self.manager, index).await
    }

    async fn get_transaction_end(&self, index: i64) -> Result<i64> {
        walk_transaction_end(&self.manager, index).await
    }

    fn on_row_added(&self, _event: &RowEvent) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------
// InMemory finder: O(1) lookup via a full uuid -> row-index map.
// ---------------------------------------------------------------------

/// Maintains `uuid -> row-index` in memory, populated from a startup scan
/// and kept current via [`Finder::on_row_added`]. Checksum and null rows
/// are never inserted.
pub struct InMemoryFinder {
    manager: Arc<FileManager>,
    map: RwLock<HashMap<Uuid, i64>>,
}

impl InMemoryFinder {
    /// Scans the whole file once to build the initial map.
    pub async fn new(manager: Arc<FileManager>) -> Result<Self> {
        let row_count = current_row_count(&manager);
        let mut map = HashMap::new();
        for i in 1..row_count {
            if let RowUnion::Data(d) = read_row(&manager, i).await? {
                map.insert(d.uuid, i);
            }
        }
        Ok(InMemoryFinder {
            manager,
            map: RwLock::new(map),
        })
    }
}

#[async_trait]
impl Finder for InMemoryFinder {
    async fn get_index(&self, uuid: Uuid) -> Result<i64> {
        validate_key_uuid(&uuid)?;
        self.map.read().get(&uuid).copied().ok_or(Error::KeyNotFound)
    }

    async fn get_transaction_start(&self, index: i64) -> Result<i64> {
        walk_transaction_start(&self.manager, index).await
    }

    async fn get_transaction_end(&self, index: i64) -> Result<i64> {
        walk_transaction_end(&self.manager, index).await
    }

    fn on_row_added(&self, event: &RowEvent) -> Result<()> {
        if let RowUnion::Data(d) = &event.row {
            self.map.write().insert(d.uuid, event.index);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
// BinarySearch finder: O(log n), constant memory, UUIDv7 quasi-monotonic.
// ---------------------------------------------------------------------

/// Binary-searches row-index space by UUIDv7 timestamp, tolerating
/// `skew_ms` of clock-skew inversion via a bounded local linear sweep
/// (spec.md §4.6.3). Does not load the file into memory; tracks only the
/// current size and configured tolerance.
pub struct BinarySearchFinder {
    manager: Arc<FileManager>,
    skew_ms: u64,
}

impl BinarySearchFinder {
    pub fn new(manager: Arc<FileManager>, skew_ms: u64) -> Self {
        BinarySearchFinder { manager, skew_ms }
    }

    fn sweep_bound(&self, row_count: i64) -> i64 {
        let bound = (self.skew_ms + MIN_CLOCK_QUANTUM_MS - 1) / MIN_CLOCK_QUANTUM_MS;
        (bound as i64).min(row_count.max(1))
    }

    /// Step away from `mid` to the nearest non-checksum row index within
    /// `[lo, hi)`, preferring the right side first and never crossing the
    /// half's boundary (spec.md §4.6.3 tie-break rule).
    async fn nearest_non_checksum(&self, mid: i64, lo: i64, hi: i64) -> Result<Option<i64>> {
        let mut j = mid;
        while j < hi {
            if !read_row(&self.manager, j).await?.is_checksum() {
                return Ok(Some(j));
            }
            j += 1;
        }
        let mut j = mid - 1;
        while j >= lo {
            if !read_row(&self.manager, j).await?.is_checksum() {
                return Ok(Some(j));
            }
            j -= 1;
        }
        Ok(None)
    }
}

#[async_trait]
impl Finder for BinarySearchFinder {
    async fn get_index(&self, uuid: Uuid) -> Result<i64> {
        validate_key_uuid(&uuid)?;
        let row_count = current_row_count(&self.manager);
        if row_count <= 1 {
            return Err(Error::KeyNotFound);
        }
        let target_ts = uuid7_millis(&uuid);

        let mut lo = 1i64;
        let mut hi = row_count;
        let mut landing = lo;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let Some(probe) = self.nearest_non_checksum(mid, lo, hi).await? else {
                // The entire half is checksum rows: nothing to compare;
                // shrink toward the side we came from.
                hi = mid;
                continue;
            };
            landing = probe;
            let row = read_row(&self.manager, probe).await?;
            let probe_uuid = row.uuid().ok_or_else(|| {
                Error::corrupt(0, "binary search probe landed on a non-keyed row")
            })?;
            let probe_ts = uuid7_millis(&probe_uuid);
            if probe_uuid == uuid {
                return Ok(probe);
            }
            if probe_ts < target_ts {
                lo = probe + 1;
            } else {
                hi = probe;
            }
        }

        // Quasi-monotonicity: the exact row may sit within `skew_ms` of
        // the converged landing spot. Sweep outward, bounded and
        // skipping checksum/null rows.
        let bound = self.sweep_bound(row_count);
        for delta in 0..=bound {
            for candidate in [landing + delta, landing - delta] {
                if candidate < 1 || candidate >= row_count {
                    continue;
                }
                if delta == 0 && candidate != landing {
                    continue;
                }
                let row = read_row(&self.manager, candidate).await?;
                if let RowUnion::Data(d) = row {
                    if d.uuid == uuid {
                        return Ok(candidate);
                    }
                }
            }
        }
        Err(Error::KeyNotFound)
    }

    async fn get_transaction_start(&self, index: i64) -> Result<i64> {
        walk_transaction_start(&self.manager, index).await
    }

    async fn get_transaction_end(&self, index: i64) -> Result<i64> {
        walk_transaction_end(&self.manager, index).await
    }

    fn on_row_added(&self, _event: &RowEvent) -> Result<()> {
        // No auxiliary state: every lookup re-derives its answer from the
        // file directly.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filemanager::Mode;
    use crate::header::{Header, RowSize, SkewMs};
    use crate::row::{marshal_checksum_row, marshal_data_row, ChecksumRow, DataRow, EndControl};
    use crc32fast::Hasher;

    async fn build_fixture(row_size: usize, n: usize) -> (tempfile::TempDir, Arc<FileManager>, Vec<Uuid>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.fdb");
        let header = Header::new(RowSize::new(row_size as u32).unwrap(), SkewMs::new(5000).unwrap());
        let header_bytes = header.to_bytes().unwrap();
        let mut hasher = Hasher::new();
        hasher.update(&header_bytes);
        let initial_checksum = marshal_checksum_row(row_size, ChecksumRow { crc: hasher.finalize() });

        let mut bytes = header_bytes.to_vec();
        bytes.extend(initial_checksum);

        let mut uuids = Vec::new();
        for i in 0..n {
            let uuid = Uuid::now_v7();
            uuids.push(uuid);
            let row = DataRow {
                start_control: b'T',
                uuid,
                json: format!(r#"{{"i":{i}}}"#).into_bytes(),
                end_control: EndControl::Tc,
            };
            bytes.extend(marshal_data_row(row_size, &row).unwrap());
        }
        std::fs::write(&path, &bytes).unwrap();
        let manager = FileManager::open(&path, Mode::Write, row_size).await.unwrap();
        (dir, manager, uuids)
    }

    #[tokio::test]
    async fn simple_finder_locates_every_key() {
        let (_dir, manager, uuids) = build_fixture(256, 20).await;
        let finder = SimpleFinder::new(manager);
        for (i, uuid) in uuids.iter().enumerate() {
            assert_eq!(finder.get_index(*uuid).await.unwrap(), (i as i64) + 1);
        }
    }

    #[tokio::test]
    async fn in_memory_finder_matches_simple() {
        let (_dir, manager, uuids) = build_fixture(256, 20).await;
        let finder = InMemoryFinder::new(manager).await.unwrap();
        for (i, uuid) in uuids.iter().enumerate() {
            assert_eq!(finder.get_index(*uuid).await.unwrap(), (i as i64) + 1);
        }
    }

    #[tokio::test]
    async fn binary_search_finder_matches_simple() {
        let (_dir, manager, uuids) = build_fixture(256, 50).await;
        let finder = BinarySearchFinder::new(manager, 5000);
        for (i, uuid) in uuids.iter().enumerate() {
            assert_eq!(finder.get_index(*uuid).await.unwrap(), (i as i64) + 1);
        }
    }

    #[tokio::test]
    async fn unknown_key_not_found() {
        let (_dir, manager, _uuids) = build_fixture(256, 5).await;
        let finder = SimpleFinder::new(manager);
        assert!(matches!(
            finder.get_index(Uuid::now_v7()).await,
            Err(Error::KeyNotFound)
        ));
    }

    #[tokio::test]
    async fn transaction_start_walk_skips_checksum_rows() {
        let (_dir, manager, uuids) = build_fixture(256, 3).await;
        let start = walk_transaction_start(&manager, 2).await.unwrap();
        assert_eq!(start, 2); // single-row committed transaction starts at itself
        let _ = uuids;
    }
}
