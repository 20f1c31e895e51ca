//! Tests for the connection operation queue

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::MockDriver;
use zero_sqlexec::{Conn, Context, Error, TxOptions};

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

fn count_completions(conn: &Conn) -> Arc<AtomicUsize> {
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    conn.completion().on(move |_conn: Conn| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });
    fired
}

#[tokio::test]
async fn test_operations_run_in_order_without_overlap() {
    let driver = MockDriver::new();
    let ctx = Context::new();
    let conn = Conn::new(&ctx, driver.clone());

    let (a, b, c) = tokio::join!(
        conn.exec(&ctx, "SLEEP 1", ()),
        conn.exec(&ctx, "SLEEP 2", (1, "x")),
        conn.query_row(&ctx, "SELECT 3", ()),
    );

    assert_eq!(a.unwrap().rows_affected, 1);
    assert_eq!(b.unwrap().rows_affected, 1);
    let row = c.unwrap().expect("one row");
    assert_eq!(row.try_get::<i64, _>("id").unwrap(), 1);

    assert_eq!(driver.log(), vec!["SLEEP 1", "SLEEP 2", "SELECT 3"]);
    assert_eq!(driver.recorder.max_active(), 1);
}

#[tokio::test]
async fn test_driver_error_does_not_abort_siblings() {
    let driver = MockDriver::new();
    let ctx = Context::new();
    let conn = Conn::new(&ctx, driver.clone());

    let (failed, ok) = tokio::join!(
        conn.exec(&ctx, "FAIL insert", ()),
        conn.exec(&ctx, "UPDATE t", ()),
    );

    assert!(failed.unwrap_err().is_driver_error());
    assert!(ok.is_ok());
    assert_eq!(driver.log(), vec!["FAIL insert", "UPDATE t"]);
}

#[tokio::test]
async fn test_cursor_holds_queue_until_completion() {
    let driver = MockDriver::new();
    driver.recorder.hold_cursors.store(true, Ordering::SeqCst);
    let ctx = Context::new();
    let conn = Conn::new(&ctx, driver.clone());

    let cursor = conn.query_rows(&ctx, "SELECT rows", ()).await.unwrap();

    let pending = {
        let conn = conn.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { conn.exec(&ctx, "UPDATE after", ()).await })
    };
    settle().await;
    assert_eq!(driver.log(), vec!["SELECT rows"]);

    assert!(cursor.next().await.unwrap());
    assert!(cursor.next().await.unwrap());
    driver.recorder.held()[0].end();
    assert!(!cursor.next().await.unwrap());

    pending.await.unwrap().unwrap();
    assert_eq!(driver.log(), vec!["SELECT rows", "UPDATE after"]);
}

#[tokio::test]
async fn test_failed_query_does_not_hold_queue() {
    let driver = MockDriver::new();
    let ctx = Context::new();
    let conn = Conn::new(&ctx, driver.clone());

    assert!(conn.query_rows(&ctx, "FAIL select", ()).await.is_err());
    conn.exec(&ctx, "UPDATE t", ()).await.unwrap();
    assert_eq!(driver.log(), vec!["FAIL select", "UPDATE t"]);
}

#[tokio::test]
async fn test_transaction_holds_queue_until_commit() {
    let driver = MockDriver::new();
    let ctx = Context::new();
    let conn = Conn::new(&ctx, driver.clone());

    let tx = conn
        .begin_transaction(&ctx, TxOptions::default())
        .await
        .unwrap();

    let pending = {
        let conn = conn.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { conn.exec(&ctx, "UPDATE after", ()).await })
    };
    settle().await;
    assert_eq!(driver.log(), vec!["START TRANSACTION"]);

    tx.exec("INSERT INTO t VALUES (?)", (1,)).await.unwrap();
    tx.commit().await.unwrap();

    pending.await.unwrap().unwrap();
    assert_eq!(
        driver.log(),
        vec![
            "START TRANSACTION",
            "INSERT INTO t VALUES (?)",
            "COMMIT",
            "UPDATE after"
        ]
    );
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let driver = MockDriver::new();
    let ctx = Context::new();
    let conn = Conn::new(&ctx, driver.clone());
    let fired = count_completions(&conn);

    conn.exec(&ctx, "UPDATE t", ()).await.unwrap();
    tokio::join!(conn.close(), conn.close());
    conn.close().await;

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(conn.is_closed());
    assert!(!conn.is_canceled());
    assert!(matches!(
        conn.exec(&ctx, "UPDATE t", ()).await,
        Err(Error::ConnectionClosed)
    ));
    assert!(matches!(
        conn.begin_transaction(&ctx, TxOptions::default()).await,
        Err(Error::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_close_waits_for_queued_operations() {
    let driver = MockDriver::new();
    let ctx = Context::new();
    let conn = Conn::new(&ctx, driver.clone());

    let (a, b, ()) = tokio::join!(
        conn.exec(&ctx, "SLEEP 1", ()),
        conn.exec(&ctx, "SLEEP 2", ()),
        conn.close(),
    );
    assert!(a.is_ok());
    assert!(b.is_ok());
    assert_eq!(driver.log(), vec!["SLEEP 1", "SLEEP 2"]);
}

#[tokio::test]
async fn test_root_cancel_rejects_queued_operations() {
    let driver = MockDriver::new();
    let root = Context::new();
    let caller = Context::new();
    let conn = Conn::new(&root, driver.clone());
    let fired = count_completions(&conn);

    let first = {
        let conn = conn.clone();
        let caller = caller.clone();
        tokio::spawn(async move { conn.exec(&caller, "BLOCK", ()).await })
    };
    settle().await;
    let second = {
        let conn = conn.clone();
        let caller = caller.clone();
        tokio::spawn(async move { conn.exec(&caller, "UPDATE queued", ()).await })
    };
    let third = {
        let conn = conn.clone();
        let caller = caller.clone();
        tokio::spawn(async move { conn.query_rows(&caller, "SELECT queued", ()).await })
    };
    settle().await;

    root.cancel();

    assert!(matches!(second.await.unwrap(), Err(Error::ConnectionCanceled)));
    assert!(matches!(third.await.unwrap(), Err(Error::ConnectionCanceled)));
    // The in-flight statement sees its derived context cancelled.
    assert!(matches!(first.await.unwrap(), Err(Error::ConnectionCanceled)));
    assert!(!caller.is_cancelled());

    conn.completion().wait().await;
    assert!(conn.is_closed());
    assert!(conn.is_canceled());
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(driver.log(), vec!["BLOCK"]);

    conn.close().await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_caller_cancel_skips_queued_operation() {
    let driver = MockDriver::new();
    driver.recorder.hold_cursors.store(true, Ordering::SeqCst);
    let ctx = Context::new();
    let conn = Conn::new(&ctx, driver.clone());

    let cursor = conn.query_rows(&ctx, "SELECT rows", ()).await.unwrap();

    let caller = Context::new();
    let pending = {
        let conn = conn.clone();
        let caller = caller.clone();
        tokio::spawn(async move { conn.exec(&caller, "UPDATE skipped", ()).await })
    };
    settle().await;
    caller.cancel();
    assert!(matches!(
        pending.await.unwrap(),
        Err(Error::OperationCanceled)
    ));

    cursor.close().await;
    conn.exec(&ctx, "UPDATE t", ()).await.unwrap();
    assert_eq!(driver.log(), vec!["SELECT rows", "UPDATE t"]);
}

#[tokio::test]
async fn test_caller_cancel_aborts_held_cursor() {
    let driver = MockDriver::new();
    driver.recorder.hold_cursors.store(true, Ordering::SeqCst);
    let ctx = Context::new();
    let conn = Conn::new(&ctx, driver.clone());

    let caller = Context::new();
    let cursor = conn.query_rows(&caller, "SELECT rows", ()).await.unwrap();
    caller.cancel();

    // The queue moves on once the cursor is aborted.
    conn.exec(&ctx, "UPDATE t", ()).await.unwrap();
    assert!(cursor.is_closed());
    // Buffered rows were dropped, so the consumer must not see a clean end.
    assert!(matches!(cursor.next().await, Err(Error::CursorCanceled)));
    assert!(!cursor.next().await.unwrap());
    assert!(driver.recorder.held()[0].is_canceling());
}

#[tokio::test]
async fn test_root_cancel_aborts_held_cursor() {
    let driver = MockDriver::new();
    driver.recorder.hold_cursors.store(true, Ordering::SeqCst);
    let root = Context::new();
    let conn = Conn::new(&root, driver.clone());

    let cursor = conn.query_rows(&root, "SELECT rows", ()).await.unwrap();
    root.cancel();
    conn.completion().wait().await;

    assert!(cursor.is_closed());
    assert!(matches!(cursor.next().await, Err(Error::CursorCanceled)));
    assert!(!cursor.next().await.unwrap());
    assert!(driver.recorder.held()[0].is_canceling());
}

#[tokio::test]
async fn test_dropped_transaction_rolled_back_once() {
    let driver = MockDriver::new();
    let ctx = Context::new();
    let conn = Conn::new(&ctx, driver.clone());

    let caller = Context::new();
    let tx = conn
        .begin_transaction(&caller, TxOptions::default())
        .await
        .unwrap();
    // Both the queue and the dropped transaction try to roll back.
    caller.cancel();
    drop(tx);

    conn.exec(&ctx, "UPDATE t", ()).await.unwrap();
    assert_eq!(
        driver.log(),
        vec!["START TRANSACTION", "ROLLBACK", "UPDATE t"]
    );
    let handles = driver.handles.lock().unwrap().clone();
    assert_eq!(handles[0].closes(), 1);
}
