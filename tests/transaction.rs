//! Tests for the transaction lifecycle

mod common;

use std::sync::Arc;

use common::{MockHandle, Recorder};
use zero_sqlexec::{
    Context, DefaultBackend, Error, IsolationLevel, Transaction, TransactionBackend, TxOptions,
    TxState,
};

/// Backend without linearizable isolation or explicit access modes.
struct Limited;

impl TransactionBackend for Limited {
    fn supports_isolation_level(&self, level: IsolationLevel) -> bool {
        level != IsolationLevel::Linearizable
    }

    fn supports_read_only(&self, _read_only: bool) -> bool {
        false
    }
}

/// Backend whose closing statements fail.
struct FailingEnd;

impl TransactionBackend for FailingEnd {
    fn commit_sql(&self) -> &'static str {
        "FAIL COMMIT"
    }

    fn rollback_sql(&self) -> &'static str {
        "FAIL ROLLBACK"
    }
}

/// Backend whose START statement fails.
struct FailingStart;

impl TransactionBackend for FailingStart {
    fn start_sql(&self, _read_only: Option<bool>) -> String {
        "FAIL START".to_string()
    }
}

fn setup(backend: Arc<dyn TransactionBackend>) -> (Arc<Recorder>, Arc<MockHandle>, Transaction) {
    let recorder = Arc::new(Recorder::default());
    let handle = MockHandle::new(Arc::clone(&recorder));
    let tx = Transaction::new(&Context::new(), handle.clone(), backend);
    (recorder, handle, tx)
}

#[tokio::test]
async fn test_unsupported_isolation_closes_handle() {
    let (recorder, handle, tx) = setup(Arc::new(Limited));

    let err = tx
        .start(TxOptions::isolation(IsolationLevel::Linearizable))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::UnsupportedIsolationLevel(IsolationLevel::Linearizable)
    ));

    assert_eq!(handle.closes(), 1);
    assert!(tx.is_released());
    assert_eq!(tx.state(), TxState::Created);
    assert!(tx.completion().is_fired());
    assert!(recorder.log().is_empty());

    assert!(matches!(tx.commit().await, Err(Error::TransactionNotStarted)));
    assert!(matches!(tx.rollback().await, Err(Error::TransactionNotStarted)));
    assert!(matches!(
        tx.exec("UPDATE t", ()).await,
        Err(Error::TransactionNotStarted)
    ));
    assert!(matches!(
        tx.start(TxOptions::default()).await,
        Err(Error::InvalidUsage(_))
    ));
    assert_eq!(handle.closes(), 1);
}

#[tokio::test]
async fn test_unsupported_read_only_closes_handle() {
    let (recorder, handle, tx) = setup(Arc::new(Limited));

    let err = tx.start(TxOptions::read_only()).await.unwrap_err();
    assert!(matches!(
        err,
        Error::UnsupportedReadOnlyMode { read_only: true }
    ));
    assert_eq!(handle.closes(), 1);
    assert!(recorder.log().is_empty());
}

#[tokio::test]
async fn test_failed_start_statement_closes_handle() {
    let (recorder, handle, tx) = setup(Arc::new(FailingStart));

    let err = tx.start(TxOptions::default()).await.unwrap_err();
    assert!(err.is_driver_error());
    assert_eq!(handle.closes(), 1);
    assert_eq!(recorder.log(), vec!["FAIL START"]);
    assert!(matches!(tx.commit().await, Err(Error::TransactionNotStarted)));
}

#[tokio::test]
async fn test_start_statements() {
    let (recorder, _handle, tx) = setup(Arc::new(DefaultBackend));

    let options = TxOptions {
        isolation: IsolationLevel::Serializable,
        read_only: Some(false),
    };
    tx.start(options).await.unwrap();

    assert_eq!(tx.state(), TxState::Started);
    assert_eq!(tx.options(), options);
    assert_eq!(
        recorder.log(),
        vec![
            "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE",
            "START TRANSACTION READ WRITE"
        ]
    );
    tx.rollback().await.unwrap();
}

#[tokio::test]
async fn test_commit_releases_handle_once() {
    let (recorder, handle, tx) = setup(Arc::new(DefaultBackend));
    tx.start(TxOptions::read_only()).await.unwrap();

    tx.exec("INSERT INTO t VALUES (1)", ()).await.unwrap();
    let rows: Vec<(i64, String, String)> = tx.query_collect("SELECT * FROM t", ()).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1], (2, "b".to_string(), "B".to_string()));

    tx.commit().await.unwrap();
    assert_eq!(tx.state(), TxState::Committed);
    assert_eq!(handle.closes(), 1);
    assert!(tx.completion().is_fired());

    assert!(matches!(tx.commit().await, Err(Error::TransactionAlreadyClosed)));
    assert!(matches!(tx.rollback().await, Err(Error::TransactionAlreadyClosed)));
    assert!(matches!(
        tx.query_row("SELECT 1", ()).await,
        Err(Error::TransactionAlreadyClosed)
    ));
    assert_eq!(handle.closes(), 1);
    assert_eq!(
        recorder.log(),
        vec![
            "START TRANSACTION READ ONLY",
            "INSERT INTO t VALUES (1)",
            "SELECT * FROM t",
            "COMMIT"
        ]
    );
}

#[tokio::test]
async fn test_failed_commit_still_releases_handle() {
    let (_recorder, handle, tx) = setup(Arc::new(FailingEnd));
    tx.start(TxOptions::default()).await.unwrap();

    assert!(tx.commit().await.unwrap_err().is_driver_error());
    assert_eq!(tx.state(), TxState::Committed);
    assert_eq!(handle.closes(), 1);
    assert!(matches!(tx.rollback().await, Err(Error::TransactionAlreadyClosed)));
    assert_eq!(handle.closes(), 1);
}

#[tokio::test]
async fn test_failed_rollback_still_releases_handle() {
    let (_recorder, handle, tx) = setup(Arc::new(FailingEnd));
    tx.start(TxOptions::default()).await.unwrap();

    assert!(tx.rollback().await.is_err());
    assert_eq!(tx.state(), TxState::RolledBack);
    assert_eq!(handle.closes(), 1);
}

#[tokio::test]
async fn test_nested_transactions_unsupported() {
    let (_recorder, _handle, tx) = setup(Arc::new(DefaultBackend));
    tx.start(TxOptions::default()).await.unwrap();

    assert!(matches!(
        tx.begin_transaction(&Context::new(), TxOptions::default())
            .await,
        Err(Error::NestedTransactionsUnsupported)
    ));
    tx.commit().await.unwrap();
}

#[tokio::test]
async fn test_dropped_transaction_rolls_back() {
    let (recorder, handle, tx) = setup(Arc::new(DefaultBackend));
    tx.start(TxOptions::default()).await.unwrap();
    let completion = tx.completion().clone();

    drop(tx);
    completion.wait().await;

    assert_eq!(handle.closes(), 1);
    assert_eq!(recorder.log(), vec!["START TRANSACTION", "ROLLBACK"]);
}
