//! Error types for zero-sqlexec.

use std::sync::Arc;

use thiserror::Error;

use crate::transaction::IsolationLevel;

/// Result type for zero-sqlexec operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Boxed error reported by a driver adapter.
pub type DriverError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Error type for zero-sqlexec.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The connection no longer accepts operations
    #[error("connection closed")]
    ConnectionClosed,

    /// The connection's root context was cancelled before the operation started
    #[error("connection was canceled")]
    ConnectionCanceled,

    /// The caller's own context was cancelled while the operation was pending
    #[error("operation canceled")]
    OperationCanceled,

    /// Transaction method called before a successful start
    #[error("transaction not started")]
    TransactionNotStarted,

    /// Transaction method called after commit or rollback
    #[error("transaction already closed")]
    TransactionAlreadyClosed,

    /// The backend does not support the requested isolation level
    #[error("unsupported isolation level: {0}")]
    UnsupportedIsolationLevel(IsolationLevel),

    /// The backend does not support an explicit read-only / read-write mode
    #[error("unsupported transaction access mode (read_only = {read_only})")]
    UnsupportedReadOnlyMode { read_only: bool },

    /// Nested transactions are not supported by this backend
    #[error("nested transactions not supported")]
    NestedTransactionsUnsupported,

    /// Column metadata has not been announced yet
    #[error("column information not yet available")]
    CursorColumnsUnavailable,

    /// No row has been loaded by `next()` yet
    #[error("no row loaded")]
    CursorRowUnavailable,

    /// `next()` called while a previous `next()` is still pending
    #[error("concurrent next() calls on the same cursor")]
    CursorConcurrentAdvance,

    /// The producer feeding the cursor reported an error
    #[error("cursor error: {0}")]
    CursorProducer(DriverError),

    /// The cursor's context was cancelled while waiting for rows
    #[error("cursor canceled")]
    CursorCanceled,

    /// Error reported by the driver adapter, surfaced verbatim
    #[error("{0}")]
    Driver(DriverError),

    /// Invalid usage (e.g., announcing columns twice)
    #[error("Invalid usage: {0}")]
    InvalidUsage(String),

    /// Value conversion error
    #[error("Decode error: {0}")]
    Decode(String),
}

impl Error {
    /// Wrap any driver error.
    pub fn driver<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    {
        Error::Driver(Arc::from(err.into()))
    }

    /// Wrap an error reported by a cursor producer.
    pub fn producer<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    {
        Error::CursorProducer(Arc::from(err.into()))
    }

    /// Returns true for the cancellation kinds.
    pub fn is_canceled(&self) -> bool {
        matches!(
            self,
            Error::ConnectionCanceled | Error::OperationCanceled | Error::CursorCanceled
        )
    }

    /// Returns true if the error was reported by the driver or cursor producer.
    pub fn is_driver_error(&self) -> bool {
        matches!(self, Error::Driver(_) | Error::CursorProducer(_))
    }
}
