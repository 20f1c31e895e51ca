//! Connection operation queue.
//!
//! A [`Conn`] serializes every operation issued on one logical connection.
//! Operations run strictly in submission order and never overlap. A cursor
//! or transaction returned by an operation holds the connection until its
//! completion fires; only then does the next queued operation reach the
//! driver.
//!
//! Cancelling the connection's root context closes the connection: queued
//! operations are rejected with [`Error::ConnectionCanceled`], the operation
//! in flight sees its context cancelled, and completion fires once the queue
//! has drained.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::oneshot;

use crate::context::{CallbackGuard, Context};
use crate::conversion::{FromRow, ToParams};
use crate::cursor::Cursor;
use crate::driver::{Driver, Executor, Handle};
use crate::emitter::{BoxFuture, Completion, Listener, ListenerId};
use crate::error::{Error, Result};
use crate::row::Row;
use crate::transaction::{Transaction, TxOptions};
use crate::value::{ExecResult, Value};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

enum Request {
    Exec {
        sql: String,
        params: Vec<Value>,
        reply: oneshot::Sender<Result<ExecResult>>,
    },
    QueryRow {
        sql: String,
        params: Vec<Value>,
        reply: oneshot::Sender<Result<Option<Row>>>,
    },
    QueryRows {
        sql: String,
        params: Vec<Value>,
        reply: oneshot::Sender<Result<Cursor>>,
    },
    BeginTransaction {
        options: TxOptions,
        reply: oneshot::Sender<Result<Transaction>>,
    },
}

/// One queued request plus the context of the caller that issued it.
pub(crate) struct Operation {
    seq: u64,
    ctx: Context,
    request: Request,
}

impl Operation {
    fn kind(&self) -> &'static str {
        match self.request {
            Request::Exec { .. } => "exec",
            Request::QueryRow { .. } => "query_row",
            Request::QueryRows { .. } => "query_rows",
            Request::BeginTransaction { .. } => "begin_transaction",
        }
    }

    /// Settle the caller's future with an error.
    fn reject(self, err: Error) {
        // The caller may have stopped waiting; a closed reply channel is fine.
        match self.request {
            Request::Exec { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Request::QueryRow { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Request::QueryRows { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Request::BeginTransaction { reply, .. } => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

#[derive(Default)]
struct QueueState {
    closed: bool,
    busy: bool,
    canceled: bool,
    next_seq: u64,
    queue: VecDeque<Operation>,
}

struct ConnInner {
    id: u64,
    driver: Arc<dyn Driver>,
    root: Context,
    state: Mutex<QueueState>,
    completion: Completion<Conn>,
    root_guard: Mutex<Option<CallbackGuard>>,
}

impl ConnInner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn canceled_error(&self) -> Error {
        if self.root.is_cancelled() {
            Error::ConnectionCanceled
        } else {
            Error::OperationCanceled
        }
    }

    /// A driver failure under a cancelled operation context is reported as
    /// the cancellation that caused it.
    fn interrupted<T>(&self, ctx: &Context, result: Result<T>) -> Result<T> {
        match result {
            Err(e) if ctx.is_cancelled() => {
                tracing::debug!("conn {}: operation interrupted: {}", self.id, e);
                Err(self.canceled_error())
            }
            other => other,
        }
    }

    fn enqueue(self: &Arc<Self>, ctx: &Context, request: Request) -> Result<()> {
        let spawn = {
            let mut state = self.lock();
            if state.closed {
                return Err(Error::ConnectionClosed);
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            let op = Operation {
                seq,
                ctx: ctx.clone(),
                request,
            };
            tracing::trace!("conn {}: enqueue {} #{}", self.id, op.kind(), seq);
            state.queue.push_back(op);
            !std::mem::replace(&mut state.busy, true)
        };
        if spawn {
            self.spawn_scheduler();
        }
        Ok(())
    }

    /// Start the scheduler unless it already runs.
    fn schedule(self: &Arc<Self>) {
        let spawn = !std::mem::replace(&mut self.lock().busy, true);
        if spawn {
            self.spawn_scheduler();
        }
    }

    fn spawn_scheduler(self: &Arc<Self>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("conn {}: no tokio runtime, scheduler not started", self.id);
            self.lock().busy = false;
            return;
        };
        handle.spawn(Arc::clone(self).run());
    }

    async fn run(self: Arc<Self>) {
        loop {
            let op = {
                let mut state = self.lock();
                match state.queue.pop_front() {
                    Some(op) => op,
                    None if state.closed => break,
                    None => {
                        state.busy = false;
                        return;
                    }
                }
            };
            self.dispatch(op).await;
            tokio::task::yield_now().await;
        }

        self.finish().await;
    }

    async fn finish(self: &Arc<Self>) {
        let guard = match self.root_guard.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(guard);

        let conn = Conn {
            inner: Arc::clone(self),
        };
        if self.completion.fire(conn).await {
            tracing::debug!("conn {}: closed", self.id);
        }
        self.lock().busy = false;
    }

    /// Derive the context an operation runs under.
    ///
    /// The returned guard detaches the root's cancellation from the derived
    /// context and must live until the operation has finished.
    fn derive_context(&self, caller: &Context) -> (Context, Option<CallbackGuard>) {
        if caller.same_source(&self.root) {
            return (caller.clone(), None);
        }
        let ctx = caller.child();
        let target = ctx.clone();
        let guard = self.root.on_cancel(move || target.cancel());
        (ctx, Some(guard))
    }

    async fn dispatch(&self, op: Operation) {
        if op.ctx.is_cancelled() {
            tracing::debug!(
                "conn {}: skipping canceled {} #{}",
                self.id,
                op.kind(),
                op.seq
            );
            op.reject(self.canceled_error());
            return;
        }

        let seq = op.seq;
        let kind = op.kind();
        tracing::trace!("conn {}: dispatch {} #{}", self.id, kind, seq);
        let (ctx, _link) = self.derive_context(&op.ctx);

        match op.request {
            Request::Exec { sql, params, reply } => {
                let result = self.driver.exec(&ctx, &sql, params).await;
                let _ = reply.send(self.interrupted(&ctx, result));
            }
            Request::QueryRow { sql, params, reply } => {
                let result = self.driver.query_row(&ctx, &sql, params).await;
                let _ = reply.send(self.interrupted(&ctx, result));
            }
            Request::QueryRows { sql, params, reply } => {
                let result = self.driver.query(&ctx, &sql, params).await;
                match self.interrupted(&ctx, result) {
                    Ok(cursor) => {
                        let watch = cursor.watch();
                        // A caller that gave up drops the cursor, which cancels it.
                        let _ = reply.send(Ok(cursor));
                        if hold(&ctx, watch.completion()).await {
                            tracing::debug!("conn {}: canceling cursor of #{}", self.id, seq);
                            watch.abort();
                        }
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Request::BeginTransaction { options, reply } => {
                let result = self.driver.begin_transaction(&ctx, options).await;
                match self.interrupted(&ctx, result) {
                    Ok(tx) => {
                        let watch = tx.watch();
                        let _ = reply.send(Ok(tx));
                        if hold(&ctx, watch.completion()).await {
                            tracing::debug!(
                                "conn {}: rolling back transaction of #{}",
                                self.id,
                                seq
                            );
                            watch.abort().await;
                        }
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
        }
        tracing::trace!("conn {}: finished {} #{}", self.id, kind, seq);
    }

    fn on_root_cancel(self: &Arc<Self>) {
        let drained = {
            let mut state = self.lock();
            state.closed = true;
            state.canceled = true;
            std::mem::take(&mut state.queue)
        };
        tracing::debug!(
            "conn {}: root context canceled, rejecting {} queued operation(s)",
            self.id,
            drained.len()
        );
        for op in drained {
            op.reject(Error::ConnectionCanceled);
        }
        self.schedule();
    }
}

/// Wait for a held cursor or transaction to complete.
///
/// Returns true if the operation's context was cancelled first.
async fn hold(ctx: &Context, completion: &Completion<()>) -> bool {
    tokio::select! {
        biased;
        _ = completion.wait() => false,
        _ = ctx.cancelled() => true,
    }
}

/// A logical connection that serializes its operations.
///
/// Cloning is cheap and shares the same queue.
#[derive(Clone)]
pub struct Conn {
    inner: Arc<ConnInner>,
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("Conn")
            .field("id", &self.inner.id)
            .field("closed", &state.closed)
            .field("canceled", &state.canceled)
            .field("busy", &state.busy)
            .field("queued", &state.queue.len())
            .finish()
    }
}

impl Conn {
    /// Wrap a driver connection.
    ///
    /// Cancelling `root` closes the connection.
    pub fn new(root: &Context, driver: Arc<dyn Driver>) -> Self {
        let inner = Arc::new(ConnInner {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            driver,
            root: root.clone(),
            state: Mutex::new(QueueState::default()),
            completion: Completion::new(),
            root_guard: Mutex::new(None),
        });

        let weak: Weak<ConnInner> = Arc::downgrade(&inner);
        let guard = root.on_cancel(move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_root_cancel();
            }
        });
        match inner.root_guard.lock() {
            Ok(mut slot) => *slot = Some(guard),
            Err(poisoned) => *poisoned.into_inner() = Some(guard),
        }
        tracing::debug!("conn {}: opened", inner.id);

        Self { inner }
    }

    /// Process-unique identifier, used in logs.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Root context of the connection.
    pub fn context(&self) -> &Context {
        &self.inner.root
    }

    /// Returns true once the connection no longer accepts operations.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Returns true if the connection was closed by root cancellation.
    pub fn is_canceled(&self) -> bool {
        self.inner.lock().canceled
    }

    /// Completion event, fired once with the connection after close.
    pub fn completion(&self) -> &Completion<Conn> {
        &self.inner.completion
    }

    async fn wait_reply<T>(
        &self,
        ctx: &Context,
        reply: oneshot::Receiver<Result<T>>,
    ) -> Result<T> {
        tokio::select! {
            biased;
            result = reply => result.unwrap_or(Err(Error::ConnectionClosed)),
            _ = ctx.cancelled() => Err(self.inner.canceled_error()),
        }
    }

    /// Run a statement that does not return rows.
    pub async fn exec<P: ToParams>(&self, ctx: &Context, sql: &str, params: P) -> Result<ExecResult> {
        let (reply, rx) = oneshot::channel();
        self.inner.enqueue(
            ctx,
            Request::Exec {
                sql: sql.to_string(),
                params: params.to_params(),
                reply,
            },
        )?;
        self.wait_reply(ctx, rx).await
    }

    /// Return the first row of a query.
    pub async fn query_row<P: ToParams>(
        &self,
        ctx: &Context,
        sql: &str,
        params: P,
    ) -> Result<Option<Row>> {
        let (reply, rx) = oneshot::channel();
        self.inner.enqueue(
            ctx,
            Request::QueryRow {
                sql: sql.to_string(),
                params: params.to_params(),
                reply,
            },
        )?;
        self.wait_reply(ctx, rx).await
    }

    /// Stream the rows of a query.
    ///
    /// Resolves as soon as the cursor exists. Later operations on this
    /// connection wait until the cursor completes.
    pub async fn query_rows<P: ToParams>(&self, ctx: &Context, sql: &str, params: P) -> Result<Cursor> {
        let (reply, rx) = oneshot::channel();
        self.inner.enqueue(
            ctx,
            Request::QueryRows {
                sql: sql.to_string(),
                params: params.to_params(),
                reply,
            },
        )?;
        self.wait_reply(ctx, rx).await
    }

    /// Open a transaction.
    ///
    /// Resolves once the transaction has started. Later operations on this
    /// connection wait until the transaction completes.
    pub async fn begin_transaction(&self, ctx: &Context, options: TxOptions) -> Result<Transaction> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .enqueue(ctx, Request::BeginTransaction { options, reply })?;
        self.wait_reply(ctx, rx).await
    }

    /// Decode the first row of a query.
    pub async fn query_first<T: FromRow, P: ToParams>(
        &self,
        ctx: &Context,
        sql: &str,
        params: P,
    ) -> Result<Option<T>> {
        match self.query_row(ctx, sql, params).await? {
            Some(row) => row.decode().map(Some),
            None => Ok(None),
        }
    }

    /// Decode every row of a query. The cursor is closed on every path.
    pub async fn query_collect<T: FromRow, P: ToParams>(
        &self,
        ctx: &Context,
        sql: &str,
        params: P,
    ) -> Result<Vec<T>> {
        self.query_rows(ctx, sql, params).await?.collect().await
    }

    /// Stop accepting operations and resolve once the queue has drained and
    /// completion has fired. Repeated calls resolve together.
    pub async fn close(&self) {
        {
            let mut state = self.inner.lock();
            if !state.closed {
                tracing::debug!("conn {}: closing", self.inner.id);
                state.closed = true;
            }
        }
        self.inner.schedule();
        self.inner.completion.wait().await;
    }
}

impl Executor for Conn {
    fn exec<'a>(
        &'a self,
        ctx: &'a Context,
        sql: &'a str,
        params: Vec<Value>,
    ) -> BoxFuture<'a, Result<ExecResult>> {
        Box::pin(Conn::exec(self, ctx, sql, params))
    }

    fn query_row<'a>(
        &'a self,
        ctx: &'a Context,
        sql: &'a str,
        params: Vec<Value>,
    ) -> BoxFuture<'a, Result<Option<Row>>> {
        Box::pin(Conn::query_row(self, ctx, sql, params))
    }

    fn query<'a>(
        &'a self,
        ctx: &'a Context,
        sql: &'a str,
        params: Vec<Value>,
    ) -> BoxFuture<'a, Result<Cursor>> {
        Box::pin(Conn::query_rows(self, ctx, sql, params))
    }
}

impl Driver for Conn {
    fn begin_transaction<'a>(
        &'a self,
        ctx: &'a Context,
        options: TxOptions,
    ) -> BoxFuture<'a, Result<Transaction>> {
        Box::pin(Conn::begin_transaction(self, ctx, options))
    }
}

impl Handle for Conn {
    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(Conn::close(self))
    }

    fn on_completion(&self, listener: Listener<()>) -> ListenerId {
        self.inner.completion.on(move |_conn| listener(()))
    }

    fn off_completion(&self, id: ListenerId) -> bool {
        self.inner.completion.off(id)
    }
}
