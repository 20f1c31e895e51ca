//! A cancellation-aware execution layer between application code and SQL
//! driver adapters.
//!
//! # Features
//!
//! - **Operation queue**: every operation on a [`Conn`] runs in submission order,
//!   and a cursor or transaction holds the connection until it completes
//! - **Cancellation cascade**: cancelling a connection's root [`Context`] rejects
//!   queued work and reaches the operation in flight
//! - **Transactions**: a small state machine that always releases its handle
//! - **Cursors**: buffered row streams with pause/resume backpressure
//!
//! The crate does not talk to a database. A driver adapter implements
//! [`Driver`] (and [`Handle`] for connections a transaction can own), and feeds
//! result sets through a [`Producer`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use zero_sqlexec::{Conn, Context, Driver};
//!
//! async fn run(driver: Arc<dyn Driver>) -> zero_sqlexec::Result<()> {
//!     let ctx = Context::new();
//!     let conn = Conn::new(&ctx, driver);
//!
//!     conn.exec(&ctx, "INSERT INTO t (a, b) VALUES (?, ?)", (1, "x")).await?;
//!     let rows: Vec<(i64, String)> = conn.query_collect(&ctx, "SELECT a, b FROM t", ()).await?;
//!     println!("Rows: {:?}", rows);
//!
//!     conn.close().await;
//!     Ok(())
//! }
//! ```

pub mod conn;
pub mod context;
pub mod conversion;
pub mod cursor;
pub mod driver;
pub mod emitter;
pub mod error;
pub mod opts;
pub mod pool;
pub mod row;
pub mod transaction;
pub mod value;

pub use conn::Conn;
pub use context::{CallbackGuard, CallbackId, Context};
pub use conversion::{FromRow, FromValue, ToParams};
pub use cursor::{Cursor, CursorOpts, Producer};
pub use driver::{Driver, Executor, Handle};
pub use emitter::{BoxFuture, Completion, EmitOptions, Emitter, Listener, ListenerId};
pub use error::{DriverError, Error, Result};
pub use opts::Opts;
pub use pool::{Manager, Pool};
pub use row::{ColumnIndex, ColumnInfo, Columns, Row};
pub use transaction::{
    DefaultBackend, IsolationLevel, Transaction, TransactionBackend, TxOptions, TxState,
};
pub use value::{ExecResult, Value};
