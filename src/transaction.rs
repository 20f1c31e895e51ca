//! Transaction lifecycle.
//!
//! A [`Transaction`] owns a dedicated connection-like [`Handle`] for its whole
//! lifetime. `start` issues the statements that open the transaction,
//! `commit`/`rollback` issue the closing statement and release the handle
//! concurrently. The handle is released exactly once on every exit path.
//!
//! # Example
//!
//! ```ignore
//! let tx = conn.begin_transaction(&ctx, TxOptions::default()).await?;
//! tx.exec("INSERT INTO t (a) VALUES (?)", (1,)).await?;
//! tx.commit().await?;
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::context::Context;
use crate::conversion::{FromRow, ToParams};
use crate::cursor::Cursor;
use crate::driver::{Executor, Handle};
use crate::emitter::{BoxFuture, Completion, ListenerId};
use crate::error::{Error, Result};
use crate::row::Row;
use crate::value::{ExecResult, Value};

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IsolationLevel {
    /// Use the backend's default; no statement is issued.
    #[default]
    Default,
    ReadUncommitted,
    ReadCommitted,
    WriteCommitted,
    RepeatableRead,
    Snapshot,
    Serializable,
    Linearizable,
}

impl IsolationLevel {
    /// SQL keyword used in `SET TRANSACTION ISOLATION LEVEL`.
    pub fn keyword(self) -> &'static str {
        match self {
            IsolationLevel::Default => "DEFAULT",
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::WriteCommitted => "WRITE COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Snapshot => "SNAPSHOT",
            IsolationLevel::Serializable => "SERIALIZABLE",
            IsolationLevel::Linearizable => "LINEARIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// Options for opening a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxOptions {
    /// Isolation level.
    ///
    /// Default: `IsolationLevel::Default`
    pub isolation: IsolationLevel,

    /// Explicit access mode: `Some(true)` read only, `Some(false)` read write.
    ///
    /// Default: `None`
    pub read_only: Option<bool>,
}

impl TxOptions {
    /// Options with an isolation level.
    pub fn isolation(level: IsolationLevel) -> Self {
        Self {
            isolation: level,
            read_only: None,
        }
    }

    /// Options for a read-only transaction.
    pub fn read_only() -> Self {
        Self {
            isolation: IsolationLevel::Default,
            read_only: Some(true),
        }
    }
}

/// Backend-declared transaction policy.
///
/// Every method has a default; a backend overrides only what differs. The
/// defaults support every isolation level and access mode and reject nested
/// transactions.
pub trait TransactionBackend: Send + Sync + 'static {
    /// Whether `level` can be requested.
    fn supports_isolation_level(&self, level: IsolationLevel) -> bool {
        let _ = level;
        true
    }

    /// Whether an explicit read-only (`true`) or read-write (`false`) mode can be requested.
    fn supports_read_only(&self, read_only: bool) -> bool {
        let _ = read_only;
        true
    }

    /// Keyword for an isolation level.
    fn isolation_keyword(&self, level: IsolationLevel) -> &'static str {
        level.keyword()
    }

    /// Statement that sets the isolation level of the next transaction.
    fn set_isolation_sql(&self, level: IsolationLevel) -> String {
        format!(
            "SET TRANSACTION ISOLATION LEVEL {}",
            self.isolation_keyword(level)
        )
    }

    /// Statement that opens the transaction.
    fn start_sql(&self, read_only: Option<bool>) -> String {
        match read_only {
            Some(true) => "START TRANSACTION READ ONLY".to_string(),
            Some(false) => "START TRANSACTION READ WRITE".to_string(),
            None => "START TRANSACTION".to_string(),
        }
    }

    /// Statement that commits.
    fn commit_sql(&self) -> &'static str {
        "COMMIT"
    }

    /// Statement that rolls back.
    fn rollback_sql(&self) -> &'static str {
        "ROLLBACK"
    }

    /// Open a transaction nested in `parent`.
    fn begin_nested<'a>(
        &'a self,
        parent: &'a Transaction,
        ctx: &'a Context,
        options: TxOptions,
    ) -> BoxFuture<'a, Result<Transaction>> {
        let _ = (parent, ctx, options);
        Box::pin(std::future::ready(Err(Error::NestedTransactionsUnsupported)))
    }
}

/// Backend with every default.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultBackend;

impl TransactionBackend for DefaultBackend {}

/// Transaction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Created,
    Started,
    Committed,
    RolledBack,
}

impl TxState {
    /// Committed or rolled back.
    pub fn is_terminal(self) -> bool {
        matches!(self, TxState::Committed | TxState::RolledBack)
    }
}

struct TxInner {
    ctx: Context,
    handle: Arc<dyn Handle>,
    backend: Arc<dyn TransactionBackend>,
    state: Mutex<TxState>,
    options: Mutex<TxOptions>,
    released: AtomicBool,
    completion: Completion<()>,
    forward: ListenerId,
}

impl TxInner {
    fn lock_state(&self) -> MutexGuard<'_, TxState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn check_started(&self) -> Result<()> {
        match *self.lock_state() {
            TxState::Started => Ok(()),
            TxState::Created => Err(Error::TransactionNotStarted),
            TxState::Committed | TxState::RolledBack => Err(Error::TransactionAlreadyClosed),
        }
    }

    /// Move from `Started` to `target` before any I/O happens.
    fn finish_state(&self, target: TxState) -> Result<()> {
        let mut state = self.lock_state();
        match *state {
            TxState::Started => {
                *state = target;
                Ok(())
            }
            TxState::Created => Err(Error::TransactionNotStarted),
            TxState::Committed | TxState::RolledBack => Err(Error::TransactionAlreadyClosed),
        }
    }

    /// Close the inner handle once.
    async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.handle.close().await;
    }

    async fn end(&self, target: TxState) -> Result<()> {
        self.finish_state(target)?;
        let sql = match target {
            TxState::Committed => self.backend.commit_sql(),
            _ => self.backend.rollback_sql(),
        };
        tracing::debug!("transaction {}", sql);
        let (result, ()) = tokio::join!(
            self.handle.exec(&self.ctx, sql, Vec::new()),
            self.release()
        );
        result.map(|_| ())
    }
}

/// A transaction over an exclusively owned handle.
///
/// Dropping a started transaction rolls it back in the background.
pub struct Transaction {
    inner: Arc<TxInner>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("state", &self.state())
            .field("options", &self.options())
            .finish()
    }
}

impl Transaction {
    /// Wrap a handle. The transaction is `Created` until [`start`](Self::start) succeeds.
    ///
    /// The transaction's completion fires when the handle's completion fires.
    pub fn new(
        ctx: &Context,
        handle: Arc<dyn Handle>,
        backend: Arc<dyn TransactionBackend>,
    ) -> Self {
        let completion = Completion::new();
        let forwarded = completion.clone();
        let forward = handle.on_completion(Arc::new(move |()| -> BoxFuture<'static, Result<()>> {
            let forwarded = forwarded.clone();
            Box::pin(async move {
                forwarded.fire(()).await;
                Ok(())
            })
        }));
        Self {
            inner: Arc::new(TxInner {
                ctx: ctx.clone(),
                handle,
                backend,
                state: Mutex::new(TxState::Created),
                options: Mutex::new(TxOptions::default()),
                released: AtomicBool::new(false),
                completion,
                forward,
            }),
        }
    }

    /// Wrap a handle and start the transaction.
    pub async fn begin(
        ctx: &Context,
        handle: Arc<dyn Handle>,
        backend: Arc<dyn TransactionBackend>,
        options: TxOptions,
    ) -> Result<Self> {
        let tx = Self::new(ctx, handle, backend);
        tx.start(options).await?;
        Ok(tx)
    }

    /// Open the transaction.
    ///
    /// On any failure the inner handle is closed before the error is returned
    /// and the transaction stays unusable.
    pub async fn start(&self, options: TxOptions) -> Result<()> {
        if *self.inner.lock_state() != TxState::Created || self.is_released() {
            return Err(Error::InvalidUsage(
                "transaction can only be started once".into(),
            ));
        }
        if let Err(e) = self.start_inner(options).await {
            tracing::debug!("transaction start failed: {}", e);
            self.inner.release().await;
            return Err(e);
        }
        *self.inner.lock_state() = TxState::Started;
        match self.inner.options.lock() {
            Ok(mut opts) => *opts = options,
            Err(poisoned) => *poisoned.into_inner() = options,
        }
        tracing::debug!("transaction started");
        Ok(())
    }

    async fn start_inner(&self, options: TxOptions) -> Result<()> {
        let backend = &self.inner.backend;
        let handle = &self.inner.handle;
        let ctx = &self.inner.ctx;

        if options.isolation != IsolationLevel::Default {
            if !backend.supports_isolation_level(options.isolation) {
                return Err(Error::UnsupportedIsolationLevel(options.isolation));
            }
            let sql = backend.set_isolation_sql(options.isolation);
            handle.exec(ctx, &sql, Vec::new()).await?;
        }

        if let Some(read_only) = options.read_only {
            if !backend.supports_read_only(read_only) {
                return Err(Error::UnsupportedReadOnlyMode { read_only });
            }
        }
        let sql = backend.start_sql(options.read_only);
        handle.exec(ctx, &sql, Vec::new()).await?;
        Ok(())
    }

    /// Commit. The inner handle is released whether or not COMMIT succeeds.
    pub async fn commit(&self) -> Result<()> {
        self.inner.end(TxState::Committed).await
    }

    /// Roll back. The inner handle is released whether or not ROLLBACK succeeds.
    pub async fn rollback(&self) -> Result<()> {
        self.inner.end(TxState::RolledBack).await
    }

    /// Run a statement inside the transaction.
    pub async fn exec<P: ToParams>(&self, sql: &str, params: P) -> Result<ExecResult> {
        self.inner.check_started()?;
        self.inner
            .handle
            .exec(&self.inner.ctx, sql, params.to_params())
            .await
    }

    /// Return the first row of a query.
    pub async fn query_row<P: ToParams>(&self, sql: &str, params: P) -> Result<Option<Row>> {
        self.inner.check_started()?;
        self.inner
            .handle
            .query_row(&self.inner.ctx, sql, params.to_params())
            .await
    }

    /// Stream the rows of a query.
    pub async fn query_rows<P: ToParams>(&self, sql: &str, params: P) -> Result<Cursor> {
        self.inner.check_started()?;
        self.inner
            .handle
            .query(&self.inner.ctx, sql, params.to_params())
            .await
    }

    /// Decode the first row of a query.
    pub async fn query_first<T: FromRow, P: ToParams>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Option<T>> {
        match self.query_row(sql, params).await? {
            Some(row) => row.decode().map(Some),
            None => Ok(None),
        }
    }

    /// Decode every row of a query.
    pub async fn query_collect<T: FromRow, P: ToParams>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Vec<T>> {
        self.query_rows(sql, params).await?.collect().await
    }

    /// Open a nested transaction, if the backend supports it.
    pub async fn begin_transaction(&self, ctx: &Context, options: TxOptions) -> Result<Transaction> {
        self.inner.check_started()?;
        self.inner.backend.begin_nested(self, ctx, options).await
    }

    /// Current state.
    pub fn state(&self) -> TxState {
        *self.inner.lock_state()
    }

    /// Options the transaction was started with.
    pub fn options(&self) -> TxOptions {
        match self.inner.options.lock() {
            Ok(opts) => *opts,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// The context the transaction runs under.
    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }

    /// Whether the inner handle has been released.
    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// Completion event, forwarded from the inner handle.
    pub fn completion(&self) -> &Completion<()> {
        &self.inner.completion
    }

    pub(crate) fn watch(&self) -> TxWatch {
        TxWatch {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        let state = self.state();
        if state == TxState::Started || (state == TxState::Created && !self.is_released()) {
            let inner = Arc::clone(&self.inner);
            let Ok(handle) = tokio::runtime::Handle::try_current() else {
                tracing::warn!("transaction dropped outside a tokio runtime; handle not released");
                return;
            };
            handle.spawn(async move {
                if state == TxState::Started {
                    tracing::debug!("rolling back dropped transaction");
                    match inner.end(TxState::RolledBack).await {
                        Ok(()) => {}
                        // The connection queue rolled it back first.
                        Err(Error::TransactionAlreadyClosed) => {
                            tracing::debug!("dropped transaction was already closed");
                        }
                        Err(e) => tracing::warn!("rollback of dropped transaction failed: {}", e),
                    }
                } else {
                    inner.release().await;
                }
            });
        }
    }
}

impl Drop for TxInner {
    fn drop(&mut self) {
        self.handle.off_completion(self.forward);
    }
}

/// Handle kept by the connection queue while a transaction holds the connection.
pub(crate) struct TxWatch {
    inner: Arc<TxInner>,
}

impl TxWatch {
    pub(crate) fn completion(&self) -> &Completion<()> {
        &self.inner.completion
    }

    /// Roll back if still active; release the handle otherwise.
    pub(crate) async fn abort(&self) {
        if self.inner.end(TxState::RolledBack).await.is_err() {
            self.inner.release().await;
        }
    }
}

impl Executor for Transaction {
    fn exec<'a>(
        &'a self,
        _ctx: &'a Context,
        sql: &'a str,
        params: Vec<Value>,
    ) -> BoxFuture<'a, Result<ExecResult>> {
        Box::pin(Transaction::exec(self, sql, params))
    }

    fn query_row<'a>(
        &'a self,
        _ctx: &'a Context,
        sql: &'a str,
        params: Vec<Value>,
    ) -> BoxFuture<'a, Result<Option<Row>>> {
        Box::pin(Transaction::query_row(self, sql, params))
    }

    fn query<'a>(
        &'a self,
        _ctx: &'a Context,
        sql: &'a str,
        params: Vec<Value>,
    ) -> BoxFuture<'a, Result<Cursor>> {
        Box::pin(Transaction::query_rows(self, sql, params))
    }
}
