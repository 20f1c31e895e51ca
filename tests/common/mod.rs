//! In-memory driver used by the integration tests.
//!
//! Statements are matched by prefix:
//! - `FAIL...` fails with a driver error
//! - `SLEEP...` sleeps a few milliseconds before succeeding
//! - `BLOCK...` waits until its context is cancelled
//! - any query returns the `[id, code, label]` rows of [`rows`]
//!
//! Every statement that reaches the driver is recorded in order.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use zero_sqlexec::{
    BoxFuture, ColumnInfo, Completion, Context, Cursor, CursorOpts, DefaultBackend, Driver,
    Error, ExecResult, Executor, Handle, Listener, ListenerId, Producer, Result, Row,
    Transaction, TransactionBackend, TxOptions, Value,
};

pub fn rows() -> Vec<Vec<Value>> {
    vec![
        vec![Value::Int(1), Value::Text("a".into()), Value::Text("A".into())],
        vec![Value::Int(2), Value::Text("b".into()), Value::Text("B".into())],
    ]
}

pub fn columns() -> Vec<ColumnInfo> {
    vec![
        ColumnInfo::new("id", "int"),
        ColumnInfo::new("code", "text"),
        ColumnInfo::new("label", "text"),
    ]
}

/// Shared statement log and behavior switches.
#[derive(Default)]
pub struct Recorder {
    log: Mutex<Vec<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    /// Keep cursors open until the test ends them (or they are cancelled).
    pub hold_cursors: AtomicBool,
    held: Mutex<Vec<Producer>>,
}

impl Recorder {
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Producers of held cursors, oldest first.
    pub fn held(&self) -> Vec<Producer> {
        self.held.lock().unwrap().clone()
    }

    fn enter(&self, sql: &str) {
        self.log.lock().unwrap().push(sql.to_string());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    async fn run(&self, ctx: &Context, sql: &str) -> Result<()> {
        if sql.starts_with("SLEEP") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        if sql.starts_with("BLOCK") {
            ctx.cancelled().await;
            return Err(Error::driver("statement interrupted"));
        }
        if sql.starts_with("FAIL") {
            return Err(Error::driver(format!("failed: {}", sql)));
        }
        Ok(())
    }

    pub async fn exec(&self, ctx: &Context, sql: &str) -> Result<ExecResult> {
        self.enter(sql);
        let result = self.run(ctx, sql).await;
        self.leave();
        result.map(|()| ExecResult::new(1))
    }

    pub async fn query_row(&self, ctx: &Context, sql: &str) -> Result<Option<Row>> {
        let cursor = self.query(ctx, sql).await?;
        let row = if cursor.next().await? {
            Some(cursor.row()?)
        } else {
            None
        };
        cursor.close().await;
        Ok(row)
    }

    pub async fn query(&self, ctx: &Context, sql: &str) -> Result<Cursor> {
        self.enter(sql);
        let result = self.run(ctx, sql).await;
        self.leave();
        result?;

        let (cursor, producer) = Cursor::new(ctx, CursorOpts::default());
        producer.set_columns(columns())?;
        for row in rows() {
            producer.push(row)?;
        }
        if self.hold_cursors.load(Ordering::SeqCst) {
            let p = producer.clone();
            producer.on_cancel(move || p.end());
            self.held.lock().unwrap().push(producer);
        } else {
            producer.end();
        }
        Ok(cursor)
    }
}

/// Driver over a [`Recorder`]. Transactions run on a fresh [`MockHandle`].
pub struct MockDriver {
    pub recorder: Arc<Recorder>,
    pub backend: Arc<dyn TransactionBackend>,
    pub handles: Mutex<Vec<Arc<MockHandle>>>,
}

impl MockDriver {
    pub fn new() -> Arc<Self> {
        Self::with_backend(Arc::new(DefaultBackend))
    }

    pub fn with_backend(backend: Arc<dyn TransactionBackend>) -> Arc<Self> {
        Arc::new(Self::build(Arc::new(Recorder::default()), backend))
    }

    pub fn build(recorder: Arc<Recorder>, backend: Arc<dyn TransactionBackend>) -> Self {
        Self {
            recorder,
            backend,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn log(&self) -> Vec<String> {
        self.recorder.log()
    }
}

impl Executor for MockDriver {
    fn exec<'a>(
        &'a self,
        ctx: &'a Context,
        sql: &'a str,
        _params: Vec<Value>,
    ) -> BoxFuture<'a, Result<ExecResult>> {
        Box::pin(self.recorder.exec(ctx, sql))
    }

    fn query_row<'a>(
        &'a self,
        ctx: &'a Context,
        sql: &'a str,
        _params: Vec<Value>,
    ) -> BoxFuture<'a, Result<Option<Row>>> {
        Box::pin(self.recorder.query_row(ctx, sql))
    }

    fn query<'a>(
        &'a self,
        ctx: &'a Context,
        sql: &'a str,
        _params: Vec<Value>,
    ) -> BoxFuture<'a, Result<Cursor>> {
        Box::pin(self.recorder.query(ctx, sql))
    }
}

impl Driver for MockDriver {
    fn begin_transaction<'a>(
        &'a self,
        ctx: &'a Context,
        options: TxOptions,
    ) -> BoxFuture<'a, Result<Transaction>> {
        Box::pin(async move {
            let handle = MockHandle::new(Arc::clone(&self.recorder));
            self.handles.lock().unwrap().push(Arc::clone(&handle));
            Transaction::begin(ctx, handle, Arc::clone(&self.backend), options).await
        })
    }
}

/// Dedicated connection handle owned by a transaction.
pub struct MockHandle {
    recorder: Arc<Recorder>,
    closes: AtomicUsize,
    completion: Completion<()>,
}

impl MockHandle {
    pub fn new(recorder: Arc<Recorder>) -> Arc<Self> {
        Arc::new(Self {
            recorder,
            closes: AtomicUsize::new(0),
            completion: Completion::new(),
        })
    }

    /// Number of `close` calls received.
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Executor for MockHandle {
    fn exec<'a>(
        &'a self,
        ctx: &'a Context,
        sql: &'a str,
        _params: Vec<Value>,
    ) -> BoxFuture<'a, Result<ExecResult>> {
        Box::pin(self.recorder.exec(ctx, sql))
    }

    fn query_row<'a>(
        &'a self,
        ctx: &'a Context,
        sql: &'a str,
        _params: Vec<Value>,
    ) -> BoxFuture<'a, Result<Option<Row>>> {
        Box::pin(self.recorder.query_row(ctx, sql))
    }

    fn query<'a>(
        &'a self,
        ctx: &'a Context,
        sql: &'a str,
        _params: Vec<Value>,
    ) -> BoxFuture<'a, Result<Cursor>> {
        Box::pin(self.recorder.query(ctx, sql))
    }
}

impl Handle for MockHandle {
    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.completion.fire(()).await;
        })
    }

    fn on_completion(&self, listener: Listener<()>) -> ListenerId {
        self.completion.on(move |()| listener(()))
    }

    fn off_completion(&self, id: ListenerId) -> bool {
        self.completion.off(id)
    }
}
