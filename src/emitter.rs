//! Typed event listeners and the fire-once completion latch.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::error::Result;

/// Boxed future returned by listeners and driver adapters.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A registered event listener.
pub type Listener<T> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Identifier returned by [`Emitter::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// How [`Emitter::emit_with`] runs its listeners.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmitOptions {
    /// Start every listener before awaiting any of them.
    pub concurrent: bool,
    /// Log listener errors instead of returning the first one.
    pub swallow_errors: bool,
}

/// Registry of listeners for a single event kind.
pub struct Emitter<T> {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, Listener<T>)>>,
}

impl<T> Default for Emitter<T> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(Vec::new()),
        }
    }
}

impl<T> std::fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("listeners", &self.len())
            .finish()
    }
}

impl<T> Emitter<T> {
    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(ListenerId, Listener<T>)>> {
        match self.listeners.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<T: Clone + Send + 'static> Emitter<T> {
    /// Create an emitter with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async listener.
    pub fn on<F, Fut>(&self, listener: F) -> ListenerId
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_boxed(Arc::new(move |value| Box::pin(listener(value))))
    }

    /// Register an already boxed listener.
    pub fn on_boxed(&self, listener: Listener<T>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, listener));
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Run every listener in registration order, returning the first error.
    pub async fn emit(&self, value: T) -> Result<()> {
        self.emit_with(value, EmitOptions::default()).await
    }

    /// Run every listener with the given options.
    pub async fn emit_with(&self, value: T, options: EmitOptions) -> Result<()> {
        let listeners = self.snapshot();
        if listeners.is_empty() {
            return Ok(());
        }

        let mut first_error = None;
        if options.concurrent {
            let mut set = JoinSet::new();
            for listener in listeners {
                set.spawn(listener(value.clone()));
            }
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => record_error(&mut first_error, e, options.swallow_errors),
                    Err(join_err) => {
                        tracing::warn!("event listener panicked: {}", join_err);
                    }
                }
            }
        } else {
            for listener in listeners {
                if let Err(e) = listener(value.clone()).await {
                    if !options.swallow_errors {
                        return Err(e);
                    }
                    tracing::warn!("event listener failed: {}", e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Run the listeners on the current Tokio runtime without waiting.
    ///
    /// Used from synchronous call sites. Errors are logged.
    pub fn emit_detached(&self, value: T) {
        let listeners = self.snapshot();
        if listeners.is_empty() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                "dropping event for {} listener(s): no tokio runtime",
                listeners.len()
            );
            return;
        };
        handle.spawn(async move {
            for listener in listeners {
                if let Err(e) = listener(value.clone()).await {
                    tracing::warn!("event listener failed: {}", e);
                }
            }
        });
    }

    fn snapshot(&self) -> Vec<Listener<T>> {
        self.lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }
}

fn record_error(slot: &mut Option<crate::Error>, err: crate::Error, swallow: bool) {
    if swallow {
        tracing::warn!("event listener failed: {}", err);
    } else if slot.is_none() {
        *slot = Some(err);
    }
}

struct CompletionInner<T> {
    emitter: Emitter<T>,
    latched: AtomicBool,
    fired: watch::Sender<bool>,
}

/// Releases waiters when dropped, so an interrupted `fire` cannot strand them.
struct Release<'a>(&'a watch::Sender<bool>);

impl Drop for Release<'_> {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

const SWALLOW: EmitOptions = EmitOptions {
    concurrent: false,
    swallow_errors: true,
};

/// Completion event: fires at most once, remembers that it fired.
///
/// Listeners run before waiters are released. Cloning shares the same latch.
pub struct Completion<T> {
    inner: Arc<CompletionInner<T>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("fired", &self.inner.latched.load(Ordering::SeqCst))
            .finish()
    }
}

impl<T: Clone + Send + 'static> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Completion<T> {
    /// Create an unfired completion.
    pub fn new() -> Self {
        let (fired, _) = watch::channel(false);
        Self {
            inner: Arc::new(CompletionInner {
                emitter: Emitter::new(),
                latched: AtomicBool::new(false),
                fired,
            }),
        }
    }

    /// Register a listener for the completion event.
    pub fn on<F, Fut>(&self, listener: F) -> ListenerId
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.inner.emitter.on(listener)
    }

    /// Remove a completion listener.
    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.emitter.off(id)
    }

    /// Returns true once the event has fired.
    pub fn is_fired(&self) -> bool {
        self.inner.latched.load(Ordering::SeqCst)
    }

    /// Set the latch. Returns false if it was already set.
    fn latch(&self) -> bool {
        !self.inner.latched.swap(true, Ordering::SeqCst)
    }

    /// Fire the event and await its listeners. Listener errors are logged.
    ///
    /// Returns false if the event had already fired.
    pub async fn fire(&self, value: T) -> bool {
        if !self.latch() {
            return false;
        }
        let _release = Release(&self.inner.fired);
        let _ = self.inner.emitter.emit_with(value, SWALLOW).await;
        true
    }

    /// Fire the event from a synchronous call site.
    ///
    /// Listeners run on the current runtime; waiters are released after them.
    pub fn fire_detached(&self, value: T) -> bool {
        if !self.latch() {
            return false;
        }
        if self.inner.emitter.is_empty() {
            self.inner.fired.send_replace(true);
            return true;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("completion listeners skipped: no tokio runtime");
            self.inner.fired.send_replace(true);
            return true;
        };
        let inner = Arc::clone(&self.inner);
        handle.spawn(async move {
            let _release = Release(&inner.fired);
            let _ = inner.emitter.emit_with(value, SWALLOW).await;
        });
        true
    }

    /// Resolve once the event has fired and its listeners have run.
    pub async fn wait(&self) {
        let mut rx = self.inner.fired.subscribe();
        // The sender lives in `inner`, so the channel cannot close while we hold `self`.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}
