//! Streaming row cursor with backpressure.
//!
//! A cursor is created as a pair: the [`Cursor`] handed to the caller and a
//! [`Producer`] kept by the driver adapter. The producer announces columns,
//! pushes rows and finally signals end or error; the consumer advances with
//! [`Cursor::next`]. Rows produced faster than they are consumed are buffered.
//! When the buffer reaches `pause_count` the pause event fires once; when it
//! drains back to `resume_count` the resume event fires once.
//!
//! # Example
//!
//! ```ignore
//! let (cursor, producer) = Cursor::new(&ctx, CursorOpts::default());
//! producer.set_columns(vec![ColumnInfo::named("id")])?;
//! producer.push(vec![Value::Int(1)])?;
//! producer.end();
//!
//! while cursor.next().await? {
//!     let id: i64 = cursor.row()?.try_get(0)?;
//! }
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Notify, mpsc};

use crate::context::Context;
use crate::conversion::FromRow;
use crate::emitter::{Completion, EmitOptions, Emitter, ListenerId};
use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::row::{ColumnInfo, Columns, Row};
use crate::value::Value;

/// Backpressure thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorOpts {
    /// Buffer size at which the pause event fires.
    ///
    /// Default: `128`
    pub pause_count: usize,

    /// Buffer size at which the resume event fires after a pause.
    ///
    /// Default: `32`
    pub resume_count: usize,
}

impl Default for CursorOpts {
    fn default() -> Self {
        Self {
            pause_count: 128,
            resume_count: 32,
        }
    }
}

impl CursorOpts {
    /// Thresholds with validation (`1 <= pause_count`, `resume_count <= pause_count`).
    pub fn new(pause_count: usize, resume_count: usize) -> Result<Self> {
        if pause_count == 0 {
            return Err(Error::InvalidUsage("pause_count must be at least 1".into()));
        }
        if resume_count > pause_count {
            return Err(Error::InvalidUsage(format!(
                "resume_count ({}) must not exceed pause_count ({})",
                resume_count, pause_count
            )));
        }
        Ok(Self {
            pause_count,
            resume_count,
        })
    }

    /// Never pause.
    pub fn unbounded() -> Self {
        Self {
            pause_count: usize::MAX,
            resume_count: 0,
        }
    }
}

impl From<&Opts> for CursorOpts {
    fn from(opts: &Opts) -> Self {
        Self {
            pause_count: opts.cursor_pause_count,
            resume_count: opts.cursor_resume_count,
        }
    }
}

type CancelHook = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backpressure {
    Pause,
    Resume,
}

struct Signals {
    pause: Emitter<()>,
    resume: Emitter<()>,
}

impl Signals {
    async fn deliver(&self, signal: Backpressure) {
        let emitter = match signal {
            Backpressure::Pause => &self.pause,
            Backpressure::Resume => &self.resume,
        };
        let options = EmitOptions {
            concurrent: false,
            swallow_errors: true,
        };
        let _ = emitter.emit_with((), options).await;
    }
}

#[derive(Default)]
struct CursorState {
    columns: Option<Arc<Columns>>,
    buffer: VecDeque<Vec<Value>>,
    current: Option<Row>,
    last_error: Option<Error>,
    /// Reported once by the next `next()` after the queue aborted the cursor
    aborted: Option<Error>,
    /// Producer signalled end or error
    done: bool,
    /// Consumer side finished (exhausted, closed, canceled or dropped)
    closed: bool,
    /// Producer-side cancellation requested
    canceling: bool,
    advancing: bool,
    paused: bool,
    cancel_hook: Option<CancelHook>,
    /// Feeds the task delivering pause/resume events in order
    signals: Option<mpsc::UnboundedSender<Backpressure>>,
}

enum Step {
    Row,
    End(Option<Error>),
    /// Closed from elsewhere while waiting; whoever closed it fires completion.
    Closed(Option<Error>),
    Wait,
}

struct Shared {
    state: Mutex<CursorState>,
    changed: Notify,
    opts: CursorOpts,
    ctx: Context,
    completion: Completion<()>,
    signals: Arc<Signals>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, CursorState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Queue a backpressure event. Called with the state locked, so events
    /// reach the listeners in the order the buffer crossed its thresholds.
    fn signal(&self, state: &mut CursorState, signal: Backpressure) {
        if self.signals.pause.is_empty() && self.signals.resume.is_empty() {
            return;
        }
        if state.signals.is_none() {
            let Ok(handle) = tokio::runtime::Handle::try_current() else {
                tracing::warn!("dropping cursor {:?} event: no tokio runtime", signal);
                return;
            };
            let (tx, mut rx) = mpsc::unbounded_channel();
            let signals = Arc::clone(&self.signals);
            handle.spawn(async move {
                while let Some(event) = rx.recv().await {
                    signals.deliver(event).await;
                }
            });
            state.signals = Some(tx);
        }
        if let Some(tx) = &state.signals {
            let _ = tx.send(signal);
        }
    }

    fn try_advance(&self) -> Step {
        let mut state = self.lock();
        if state.closed {
            state.current = None;
            return Step::Closed(state.aborted.take());
        }
        if let Some(values) = state.buffer.pop_front() {
            let Some(columns) = state.columns.clone() else {
                // push() refuses rows before columns, so this cannot happen.
                return Step::End(Some(Error::CursorColumnsUnavailable));
            };
            state.current = Some(Row::new(columns, values));
            let resume = state.paused && state.buffer.len() <= self.opts.resume_count;
            if resume {
                state.paused = false;
                tracing::trace!("cursor buffer drained, resuming producer");
                self.signal(&mut state, Backpressure::Resume);
            }
            drop(state);
            if resume {
                self.changed.notify_waiters();
            }
            return Step::Row;
        }
        if state.done {
            state.current = None;
            state.closed = true;
            return Step::End(state.last_error.clone());
        }
        Step::Wait
    }

    /// Ask the producer to stop. No-op once it has finished or was already asked.
    fn request_cancel(&self) {
        let hook = {
            let mut state = self.lock();
            if state.done || state.canceling {
                return;
            }
            state.canceling = true;
            state.cancel_hook.take()
        };
        tracing::debug!("requesting cursor cancellation");
        self.changed.notify_waiters();
        if let Some(hook) = hook {
            hook();
        }
    }

    fn release_buffer(state: &mut CursorState) {
        state.closed = true;
        state.current = None;
        state.buffer.clear();
    }

    /// Close the consumer side right away and fire completion.
    ///
    /// `reason` is kept for the consumer when rows were still outstanding.
    fn abort(&self, reason: Option<Error>) {
        {
            let mut state = self.lock();
            let truncated = !state.done || !state.buffer.is_empty();
            if !state.closed && truncated {
                state.aborted = reason;
            }
            Self::release_buffer(&mut state);
        }
        self.changed.notify_waiters();
        self.request_cancel();
        self.completion.fire_detached(());
    }

    fn finish(&self, error: Option<Error>) {
        let closed = {
            let mut state = self.lock();
            if state.done {
                return;
            }
            state.done = true;
            if state.last_error.is_none() {
                state.last_error = error;
            }
            state.closed
        };
        self.changed.notify_waiters();
        if closed {
            self.completion.fire_detached(());
        }
    }

    async fn wait_done(&self) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.lock().done {
                return;
            }
            notified.await;
        }
    }
}

struct AdvanceGuard<'a> {
    shared: &'a Shared,
}

impl Drop for AdvanceGuard<'_> {
    fn drop(&mut self) {
        self.shared.lock().advancing = false;
    }
}

/// Consumer side of a streamed result set.
///
/// Dropping an unclosed cursor requests producer cancellation; its completion
/// fires once the producer stops.
pub struct Cursor {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("Cursor")
            .field("ready", &(state.columns.is_some() || state.done))
            .field("done", &state.done)
            .field("closed", &state.closed)
            .field("buffered", &state.buffer.len())
            .finish()
    }
}

impl Cursor {
    /// Create a cursor and the producer that feeds it.
    ///
    /// `ctx` is the owning context: cancelling it rejects a pending `next()`.
    pub fn new(ctx: &Context, opts: CursorOpts) -> (Cursor, Producer) {
        let shared = Arc::new(Shared {
            state: Mutex::new(CursorState::default()),
            changed: Notify::new(),
            opts,
            ctx: ctx.clone(),
            completion: Completion::new(),
            signals: Arc::new(Signals {
                pause: Emitter::new(),
                resume: Emitter::new(),
            }),
        });
        let producer = Producer {
            inner: Arc::new(ProducerInner {
                shared: Arc::clone(&shared),
            }),
        };
        (Cursor { shared }, producer)
    }

    /// Advance to the next row.
    ///
    /// Resolves `true` when a row became current and `false` once the producer
    /// has ended and the buffer is exhausted; in that case the cursor closes
    /// and fires completion before returning. A producer error is returned
    /// after the rows buffered ahead of it. A cursor aborted by its connection
    /// returns [`Error::CursorCanceled`] once, then `false`.
    pub async fn next(&self) -> Result<bool> {
        {
            let mut state = self.shared.lock();
            if state.advancing {
                return Err(Error::CursorConcurrentAdvance);
            }
            if state.closed {
                state.current = None;
                return match state.aborted.take() {
                    Some(e) => Err(e),
                    None => Ok(false),
                };
            }
            state.advancing = true;
        }
        let _advancing = AdvanceGuard {
            shared: &self.shared,
        };

        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.shared.try_advance() {
                Step::Row => return Ok(true),
                Step::End(error) => {
                    self.shared.completion.fire(()).await;
                    return match error {
                        Some(e) => Err(e),
                        None => Ok(false),
                    };
                }
                Step::Closed(aborted) => {
                    return match aborted {
                        Some(e) => Err(e),
                        None => Ok(false),
                    };
                }
                Step::Wait => {}
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.shared.ctx.cancelled() => {
                    tracing::debug!("cursor context canceled while waiting for rows");
                    self.shared.abort(Some(Error::CursorCanceled));
                }
            }
        }
    }

    /// The current row.
    pub fn row(&self) -> Result<Row> {
        self.shared
            .lock()
            .current
            .clone()
            .ok_or(Error::CursorRowUnavailable)
    }

    /// Decode the current row.
    pub fn decode<T: FromRow>(&self) -> Result<T> {
        self.row()?.decode()
    }

    /// Column names.
    pub fn columns(&self) -> Result<Vec<String>> {
        let state = self.shared.lock();
        let columns = state
            .columns
            .as_ref()
            .ok_or(Error::CursorColumnsUnavailable)?;
        Ok(columns.infos().iter().map(|c| c.name.clone()).collect())
    }

    /// Column metadata.
    pub fn column_types(&self) -> Result<Vec<ColumnInfo>> {
        let state = self.shared.lock();
        let columns = state
            .columns
            .as_ref()
            .ok_or(Error::CursorColumnsUnavailable)?;
        Ok(columns.infos().to_vec())
    }

    /// Error reported by the producer, if any.
    pub fn err(&self) -> Option<Error> {
        self.shared.lock().last_error.clone()
    }

    /// Columns are known or the producer has already finished.
    pub fn is_ready(&self) -> bool {
        let state = self.shared.lock();
        state.columns.is_some() || state.done
    }

    /// The producer has signalled end or error.
    pub fn is_done(&self) -> bool {
        self.shared.lock().done
    }

    /// The consumer side is closed.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Wait until the cursor is ready.
    pub async fn wait_ready(&self) -> Result<()> {
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_ready() {
                return Ok(());
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = self.shared.ctx.cancelled() => {
                    self.shared.abort(None);
                    return Err(Error::CursorCanceled);
                }
            }
        }
    }

    /// Close the cursor.
    ///
    /// Requests producer cancellation and resolves once the producer has
    /// actually signalled end or error. Never fails; repeated calls are no-ops
    /// after the first completion.
    pub async fn close(&self) {
        {
            let mut state = self.shared.lock();
            Shared::release_buffer(&mut state);
        }
        self.shared.request_cancel();
        self.shared.wait_done().await;
        if self.shared.completion.fire(()).await {
            tracing::debug!("cursor closed");
        }
        // Completion may have been fired by the producer side; wait for its listeners.
        self.shared.completion.wait().await;
    }

    /// Completion event: fires once the cursor is closed and the producer done.
    pub fn completion(&self) -> &Completion<()> {
        &self.shared.completion
    }

    /// Run `f` for every row, then close the cursor.
    ///
    /// The cursor is closed on every exit path: exhaustion, `Break` and errors
    /// returned by `f` or by the producer.
    pub async fn for_each<F, Fut>(self, mut f: F) -> Result<()>
    where
        F: FnMut(Row) -> Fut,
        Fut: Future<Output = Result<ControlFlow<()>>>,
    {
        let result = async {
            while self.next().await? {
                if f(self.row()?).await?.is_break() {
                    break;
                }
            }
            Ok(())
        }
        .await;
        self.close().await;
        result
    }

    /// Decode every remaining row, then close the cursor.
    pub async fn collect<T: FromRow>(self) -> Result<Vec<T>> {
        let mut rows = Vec::new();
        self.for_each(|row| {
            let decoded = row.decode::<T>();
            let pushed = decoded.map(|value| {
                rows.push(value);
                ControlFlow::Continue(())
            });
            std::future::ready(pushed)
        })
        .await?;
        Ok(rows)
    }

    pub(crate) fn watch(&self) -> CursorWatch {
        CursorWatch {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        let done = {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            Shared::release_buffer(&mut state);
            state.done
        };
        if done {
            self.shared.completion.fire_detached(());
        } else {
            self.shared.request_cancel();
        }
    }
}

/// Handle kept by the connection queue while a cursor holds the connection.
pub(crate) struct CursorWatch {
    shared: Arc<Shared>,
}

impl CursorWatch {
    pub(crate) fn completion(&self) -> &Completion<()> {
        &self.shared.completion
    }

    pub(crate) fn abort(&self) {
        self.shared.abort(Some(Error::CursorCanceled));
    }
}

struct ProducerInner {
    shared: Arc<Shared>,
}

impl Drop for ProducerInner {
    fn drop(&mut self) {
        if !self.shared.lock().done {
            tracing::warn!("cursor producer dropped without signalling end");
            self.shared.finish(Some(Error::producer(
                "producer dropped without signalling end",
            )));
        }
    }
}

/// Driver-facing side of a cursor.
///
/// Cloning shares the same cursor. When the last clone is dropped without
/// [`end`](Self::end) or [`fail`](Self::fail), the cursor fails.
#[derive(Clone)]
pub struct Producer {
    inner: Arc<ProducerInner>,
}

impl Producer {
    fn shared(&self) -> &Shared {
        &self.inner.shared
    }

    /// Announce column metadata. Must happen exactly once, before any row.
    pub fn set_columns(&self, columns: Vec<ColumnInfo>) -> Result<()> {
        {
            let mut state = self.shared().lock();
            if state.canceling {
                return Ok(());
            }
            if state.columns.is_some() {
                return Err(Error::InvalidUsage("column metadata already announced".into()));
            }
            state.columns = Some(Arc::new(Columns::new(columns)));
        }
        self.shared().changed.notify_waiters();
        Ok(())
    }

    /// Push one row. Silently discarded once cancellation was requested.
    pub fn push(&self, values: Vec<Value>) -> Result<()> {
        {
            let mut state = self.shared().lock();
            if state.canceling {
                return Ok(());
            }
            if state.done {
                return Err(Error::InvalidUsage("row pushed after end of data".into()));
            }
            if state.columns.is_none() {
                return Err(Error::CursorColumnsUnavailable);
            }
            state.buffer.push_back(values);
            if !state.paused && state.buffer.len() >= self.shared().opts.pause_count {
                state.paused = true;
                tracing::trace!("cursor buffer full, pausing producer");
                self.shared().signal(&mut state, Backpressure::Pause);
            }
        }
        self.shared().changed.notify_waiters();
        Ok(())
    }

    /// Signal the normal end of data.
    pub fn end(&self) {
        self.shared().finish(None);
    }

    /// Signal an error. Rows already buffered are still delivered first.
    pub fn fail<E>(&self, error: E)
    where
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    {
        self.shared().finish(Some(Error::producer(error)));
    }

    /// Signal an error without details.
    pub fn fail_unknown(&self) {
        self.fail("unknown cursor error");
    }

    /// Register the callback that stops the producer.
    ///
    /// Runs immediately if cancellation was already requested.
    pub fn on_cancel<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.shared().lock();
            if !state.canceling {
                state.cancel_hook = Some(Box::new(hook));
                return;
            }
        }
        hook();
    }

    /// Register a pause listener.
    pub fn on_pause<F, Fut>(&self, listener: F) -> ListenerId
    where
        F: Fn(()) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.shared().signals.pause.on(listener)
    }

    /// Register a resume listener.
    pub fn on_resume<F, Fut>(&self, listener: F) -> ListenerId
    where
        F: Fn(()) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.shared().signals.resume.on(listener)
    }

    /// Cancellation was requested by the consumer.
    pub fn is_canceling(&self) -> bool {
        self.shared().lock().canceling
    }

    /// The buffer reached the pause threshold and has not drained yet.
    pub fn is_paused(&self) -> bool {
        self.shared().lock().paused
    }

    /// Number of buffered rows.
    pub fn buffered(&self) -> usize {
        self.shared().lock().buffer.len()
    }

    /// Wait until the producer may push again (not paused, or canceling).
    pub async fn resumed(&self) {
        loop {
            let notified = self.shared().changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.shared().lock();
                if !state.paused || state.canceling {
                    return;
                }
            }
            notified.await;
        }
    }
}
