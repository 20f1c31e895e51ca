//! Boundary traits implemented by driver adapters.
//!
//! A driver adapter owns the physical connection and its wire protocol. This
//! crate only needs the four operations below; everything else (parameter
//! binding, SQL dialect, network framing) stays on the adapter's side.

use crate::context::Context;
use crate::cursor::Cursor;
use crate::emitter::{BoxFuture, Listener, ListenerId};
use crate::error::Result;
use crate::row::Row;
use crate::transaction::{Transaction, TxOptions};
use crate::value::{ExecResult, Value};

/// Statement execution against one logical connection.
pub trait Executor: Send + Sync + 'static {
    /// Run a statement that does not return rows.
    fn exec<'a>(
        &'a self,
        ctx: &'a Context,
        sql: &'a str,
        params: Vec<Value>,
    ) -> BoxFuture<'a, Result<ExecResult>>;

    /// Run a query and return its first row, if any.
    fn query_row<'a>(
        &'a self,
        ctx: &'a Context,
        sql: &'a str,
        params: Vec<Value>,
    ) -> BoxFuture<'a, Result<Option<Row>>>;

    /// Run a query and stream its rows through a cursor.
    ///
    /// The future resolves once the cursor exists, not once it is drained.
    fn query<'a>(
        &'a self,
        ctx: &'a Context,
        sql: &'a str,
        params: Vec<Value>,
    ) -> BoxFuture<'a, Result<Cursor>>;
}

/// A driver adapter's logical connection, as seen by [`Conn`](crate::Conn).
pub trait Driver: Executor {
    /// Open a transaction.
    ///
    /// The returned transaction must already be started; see
    /// [`Transaction::begin`].
    fn begin_transaction<'a>(
        &'a self,
        ctx: &'a Context,
        options: TxOptions,
    ) -> BoxFuture<'a, Result<Transaction>>;
}

/// A connection-like handle that a [`Transaction`] can own exclusively.
pub trait Handle: Executor {
    /// Release the handle. Never fails; repeated calls are no-ops.
    fn close(&self) -> BoxFuture<'_, ()>;

    /// Subscribe to the handle's completion event.
    fn on_completion(&self, listener: Listener<()>) -> ListenerId;

    /// Remove a completion listener.
    fn off_completion(&self, id: ListenerId) -> bool;
}
