//! End-to-end scenarios exercising the full `FrozenDB` facade against a
//! real file on disk.
//!
//! Every test runs on the multi-thread Tokio flavor: the row emitter
//! bridges the file manager's synchronous append-complete callback back
//! into an async row read via `block_in_place`, which panics on a
//! current-thread runtime (see `src/emitter.rs`).

use frozendb::{FinderStrategy, FrozenDB, Mode};
use uuid::Uuid;

async fn create_and_open(row_size: u32, strategy: FinderStrategy) -> (tempfile::TempDir, std::path::PathBuf, FrozenDB) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scenario.fdb");
    FrozenDB::create(&path, row_size, 5_000).await.unwrap();
    let db = FrozenDB::open(&path, Mode::Write, strategy).await.unwrap();
    (dir, path, db)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn commit_ten_rows_then_get_each_back() {
    let (_dir, _path, db) = create_and_open(256, FinderStrategy::Simple).await;

    db.begin_tx().await.unwrap();
    let mut keys = Vec::new();
    for i in 0..10 {
        let key = Uuid::now_v7();
        keys.push(key);
        db.add_row(key, format!(r#"{{"i":{i}}}"#).into_bytes()).await.unwrap();
    }
    db.commit().await.unwrap();

    for (i, key) in keys.iter().enumerate() {
        let value = db.get(*key).await.unwrap();
        assert_eq!(value, format!(r#"{{"i":{i}}}"#).into_bytes());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn savepoint_then_partial_rollback_hides_rows_after_it() {
    let (_dir, _path, db) = create_and_open(256, FinderStrategy::Simple).await;

    db.begin_tx().await.unwrap();
    let kept = Uuid::now_v7();
    db.add_row(kept, br#"{"kept":true}"#.to_vec()).await.unwrap();
    db.savepoint().await.unwrap();

    let discarded_a = Uuid::now_v7();
    db.add_row(discarded_a, br#"{"discarded":1}"#.to_vec()).await.unwrap();
    let discarded_b = Uuid::now_v7();
    db.add_row(discarded_b, br#"{"discarded":2}"#.to_vec()).await.unwrap();

    db.rollback(1).await.unwrap();

    // The rolled-back rows are never visible, even though their bytes
    // were physically appended before the rollback. The row carrying the
    // savepoint stays visible.
    assert_eq!(db.get(kept).await.unwrap(), br#"{"kept":true}"#.to_vec());
    assert!(db.get(discarded_a).await.is_err());
    assert!(db.get(discarded_b).await.is_err());
    assert!(db.get_active_tx().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_transaction_commits_as_a_null_row() {
    let (_dir, path, db) = create_and_open(256, FinderStrategy::Simple).await;
    db.begin_tx().await.unwrap();
    db.commit().await.unwrap();
    db.close().await;

    let report = FrozenDB::verify(&path).await.unwrap();
    assert_eq!(report.row_count, 2); // initial checksum row + the NullRow
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crash_mid_row_is_recovered_and_can_be_completed() {
    use frozendb::row::PartialDataRow;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("crash.fdb");
    FrozenDB::create(&path, 256, 5_000).await.unwrap();

    // Simulate a crash partway through a transaction's second row: write
    // the first row ended with `RE` (transaction still open), then
    // hand-append a State 2 partial row directly to the file, bypassing
    // the transaction engine, as a crash mid-row would leave it.
    {
        let db = FrozenDB::open(&path, Mode::Write, FinderStrategy::Simple).await.unwrap();
        db.begin_tx().await.unwrap();
        db.add_row(Uuid::now_v7(), br#"{"i":1}"#.to_vec()).await.unwrap();
        db.end_row().await.unwrap();
        db.close().await;
    }

    let mut bytes = std::fs::read(&path).unwrap();
    let partial = PartialDataRow::State2 {
        start_control: b'R',
        uuid: Uuid::now_v7(),
        json: br#"{"i":2}"#.to_vec(),
    };
    bytes.extend(partial.to_full_prefix_bytes(256));
    std::fs::write(&path, &bytes).unwrap();

    let db = FrozenDB::open(&path, Mode::Write, FinderStrategy::Simple).await.unwrap();
    let info = db.get_active_tx().unwrap();
    assert_eq!(info.rows_written, 1); // the RE row from before the crash
    db.commit().await.unwrap();
    db.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn checksum_boundary_at_ten_thousand_rows_stays_searchable() {
    let (_dir, path, db) = create_and_open(192, FinderStrategy::Simple).await;

    let mut keys = Vec::with_capacity(10_000);
    for _ in 0..100 {
        db.begin_tx().await.unwrap();
        for i in 0..100 {
            let key = Uuid::now_v7();
            keys.push(key);
            db.add_row(key, format!(r#"{{"i":{i}}}"#).into_bytes()).await.unwrap();
        }
        db.commit().await.unwrap();
    }
    db.close().await;

    let db = FrozenDB::open(&path, Mode::Read, FinderStrategy::BinarySearch).await.unwrap();
    for key in keys.iter().step_by(997) {
        assert!(db.get(*key).await.is_ok());
    }

    let report = FrozenDB::verify(&path).await.unwrap();
    assert_eq!(report.row_count, 1 + 10_000 + 1); // initial checksum + 10k rows + boundary checksum
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_write_open_fails_on_lock_contention() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("locked.fdb");
    FrozenDB::create(&path, 256, 0).await.unwrap();

    let _first = FrozenDB::open(&path, Mode::Write, FinderStrategy::Simple).await.unwrap();
    let second = FrozenDB::open(&path, Mode::Write, FinderStrategy::Simple).await;
    assert!(second.is_err());

    let reader = FrozenDB::open(&path, Mode::Read, FinderStrategy::Simple).await;
    assert!(reader.is_ok());
}
