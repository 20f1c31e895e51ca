//! Connection pool.
//!
//! The pool hands out [`Conn`] queues over physical connections created by a
//! [`Manager`]. A physical connection returns to the idle queue only after
//! the `Conn` wrapping it has fired its completion, i.e. after it was closed
//! and every cursor or transaction on it has finished.

use std::sync::{Arc, Mutex, Weak};

use crossbeam_queue::ArrayQueue;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::conn::Conn;
use crate::context::Context;
use crate::driver::Driver;
use crate::emitter::BoxFuture;
use crate::error::{Error, Result};
use crate::opts::Opts;

/// Creates and recycles physical connections.
pub trait Manager: Send + Sync + 'static {
    /// The driver connection type.
    type Connection: Driver;

    /// Open a new physical connection.
    fn connect<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<Self::Connection>>;

    /// Prepare a released connection for reuse. A failure discards it.
    fn reset<'a>(&'a self, conn: &'a Self::Connection) -> BoxFuture<'a, Result<()>> {
        let _ = conn;
        Box::pin(std::future::ready(Ok(())))
    }

    /// Returns true if the connection must not be reused.
    fn is_broken(&self, conn: &Self::Connection) -> bool {
        let _ = conn;
        false
    }
}

struct PoolInner<M: Manager> {
    manager: M,
    opts: Opts,
    ctx: Context,
    conns: ArrayQueue<Arc<M::Connection>>,
    semaphore: Option<Arc<Semaphore>>,
}

impl<M: Manager> PoolInner<M> {
    async fn check_in(&self, conn: Arc<M::Connection>) {
        if self.ctx.is_cancelled() || self.opts.pool_max_idle_conn == 0 {
            return;
        }
        if self.manager.is_broken(&conn) {
            tracing::debug!("pool: discarding broken connection");
            return;
        }
        if let Err(e) = self.manager.reset(&conn).await {
            tracing::debug!("pool: discarding connection after failed reset: {}", e);
            return;
        }
        if self.conns.push(conn).is_err() {
            tracing::trace!("pool: idle queue full, dropping connection");
        }
    }

    async fn acquire_permit(&self, ctx: &Context) -> Result<Option<OwnedSemaphorePermit>> {
        let Some(sem) = &self.semaphore else {
            return Ok(None);
        };
        tokio::select! {
            biased;
            permit = Arc::clone(sem).acquire_owned() => {
                permit.map(Some).map_err(|_| Error::ConnectionClosed)
            }
            _ = ctx.cancelled() => Err(Error::OperationCanceled),
            _ = self.ctx.cancelled() => Err(Error::ConnectionClosed),
        }
    }
}

/// Connection pool.
///
/// Cloning is cheap and shares the same pool.
pub struct Pool<M: Manager> {
    inner: Arc<PoolInner<M>>,
}

impl<M: Manager> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: Manager> std::fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("idle", &self.inner.conns.len())
            .field("closed", &self.inner.ctx.is_cancelled())
            .finish()
    }
}

impl<M: Manager> Pool<M> {
    /// Create an empty pool.
    pub fn new(manager: M, opts: Opts) -> Self {
        let semaphore = opts
            .pool_max_concurrency
            .map(|n| Arc::new(Semaphore::new(n)));
        Self {
            inner: Arc::new(PoolInner {
                manager,
                conns: ArrayQueue::new(opts.pool_max_idle_conn.max(1)),
                opts,
                ctx: Context::new(),
                semaphore,
            }),
        }
    }

    /// Options the pool was created with.
    pub fn opts(&self) -> &Opts {
        &self.inner.opts
    }

    /// Number of idle physical connections.
    pub fn idle(&self) -> usize {
        self.inner.conns.len()
    }

    /// Returns true once [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.inner.ctx.is_cancelled()
    }

    /// Check out a connection.
    ///
    /// Waits for a slot when `pool_max_concurrency` is reached. The slot and
    /// the physical connection are released when the returned `Conn`
    /// completes (or is dropped).
    pub async fn get(&self, ctx: &Context) -> Result<Conn> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let permit = self.inner.acquire_permit(ctx).await?;

        let physical = loop {
            match self.inner.conns.pop() {
                Some(c) => {
                    if !self.inner.manager.is_broken(&c) {
                        break c;
                    }
                    // Connection dead, try next one
                }
                None => break Arc::new(self.inner.manager.connect(ctx).await?),
            }
        };

        let root = self.inner.ctx.child();
        let driver: Arc<dyn Driver> = physical.clone();
        let conn = Conn::new(&root, driver);

        let slot = Mutex::new(Some((physical, permit)));
        let pool: Weak<PoolInner<M>> = Arc::downgrade(&self.inner);
        conn.completion().on(move |conn: Conn| {
            let taken = match slot.lock() {
                Ok(mut slot) => slot.take(),
                Err(poisoned) => poisoned.into_inner().take(),
            };
            let pool = pool.upgrade();
            async move {
                let (Some((physical, _permit)), Some(pool)) = (taken, pool) else {
                    return Ok(());
                };
                if conn.is_canceled() {
                    tracing::debug!("pool: discarding canceled conn {}", conn.id());
                    return Ok(());
                }
                pool.check_in(physical).await;
                Ok(())
            }
        });
        Ok(conn)
    }

    /// Close the pool.
    ///
    /// Cancels every connection handed out by the pool and drops the idle ones.
    pub fn close(&self) {
        tracing::debug!("pool: closing");
        self.inner.ctx.cancel();
        if let Some(sem) = &self.inner.semaphore {
            sem.close();
        }
        while self.inner.conns.pop().is_some() {}
    }
}
