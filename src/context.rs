//! Cancellation context.
//!
//! A [`Context`] carries a cancellation signal plus a registry of callbacks
//! that run when the signal fires. Children created with [`Context::child`]
//! are cancelled together with their parent; the link is removed again when
//! the last clone of the child is dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::Notify;

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Identifier of a registered cancellation callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

struct ContextInner {
    cancelled: AtomicBool,
    notify: Notify,
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(u64, Callback)>>,
    // Registration on the parent, released when this context is dropped.
    parent_link: Mutex<Option<CallbackGuard>>,
}

/// Cancellable context.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Create a new root context.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ContextInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
                next_id: AtomicU64::new(1),
                callbacks: Mutex::new(Vec::new()),
                parent_link: Mutex::new(None),
            }),
        }
    }

    /// Create a child context that is cancelled when `self` is cancelled.
    ///
    /// Cancelling the child does not affect the parent.
    pub fn child(&self) -> Context {
        let child = Context::new();
        let weak: Weak<ContextInner> = Arc::downgrade(&child.inner);
        let guard = self.on_cancel(move || {
            if let Some(inner) = weak.upgrade() {
                Context { inner }.cancel();
            }
        });
        if let Ok(mut link) = child.inner.parent_link.lock() {
            *link = Some(guard);
        }
        child
    }

    /// Returns true if both contexts share the same cancellation source.
    pub fn same_source(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Returns true if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Request cancellation and run every registered callback once.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.notify.notify_waiters();
        let callbacks = match self.inner.callbacks.lock() {
            Ok(mut callbacks) => std::mem::take(&mut *callbacks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for (_, callback) in callbacks {
            callback();
        }
    }

    /// Resolve once the context is cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }

    /// Register a callback to run on cancellation.
    ///
    /// If the context is already cancelled the callback runs immediately.
    pub fn register_callback<F>(&self, callback: F) -> CallbackId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut callbacks = match self.inner.callbacks.lock() {
            Ok(callbacks) => callbacks,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Checked under the lock so `cancel` cannot drain between the check and the push.
        if self.is_cancelled() {
            drop(callbacks);
            callback();
        } else {
            callbacks.push((id, Box::new(callback)));
        }
        CallbackId(id)
    }

    /// Remove a previously registered callback.
    ///
    /// Returns false if the callback already ran or was never registered.
    pub fn deregister_callback(&self, id: CallbackId) -> bool {
        let mut callbacks = match self.inner.callbacks.lock() {
            Ok(callbacks) => callbacks,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = callbacks.len();
        callbacks.retain(|(cb_id, _)| *cb_id != id.0);
        callbacks.len() != before
    }

    /// Register a callback that is deregistered when the guard drops.
    pub fn on_cancel<F>(&self, callback: F) -> CallbackGuard
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.register_callback(callback);
        CallbackGuard {
            context: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Number of callbacks still waiting for cancellation.
    pub fn callback_count(&self) -> usize {
        match self.inner.callbacks.lock() {
            Ok(callbacks) => callbacks.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

/// Deregisters a cancellation callback on drop.
pub struct CallbackGuard {
    context: Weak<ContextInner>,
    id: CallbackId,
}

impl CallbackGuard {
    /// The id of the guarded callback.
    pub fn id(&self) -> CallbackId {
        self.id
    }
}

impl Drop for CallbackGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.context.upgrade() {
            Context { inner }.deregister_callback(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_cancel_runs_callbacks_once() {
        let ctx = Context::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        ctx.register_callback(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        ctx.cancel();
        ctx.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_register_after_cancel_runs_immediately() {
        let ctx = Context::new();
        ctx.cancel();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        ctx.register_callback(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.callback_count(), 0);
    }

    #[test]
    fn test_deregister() {
        let ctx = Context::new();
        let id = ctx.register_callback(|| panic!("must not run"));
        assert!(ctx.deregister_callback(id));
        assert!(!ctx.deregister_callback(id));
        ctx.cancel();
    }

    #[test]
    fn test_child_follows_parent() {
        let parent = Context::new();
        let child = parent.child();
        assert!(!child.same_source(&parent));
        assert!(child.same_source(&child.clone()));
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_child_cancel_does_not_touch_parent() {
        let parent = Context::new();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn test_dropped_child_detaches() {
        let parent = Context::new();
        let child = parent.child();
        assert_eq!(parent.callback_count(), 1);
        drop(child);
        assert_eq!(parent.callback_count(), 0);
    }

    #[test]
    fn test_guard_detaches() {
        let ctx = Context::new();
        let guard = ctx.on_cancel(|| {});
        assert_eq!(ctx.callback_count(), 1);
        drop(guard);
        assert_eq!(ctx.callback_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_future() {
        let ctx = Context::new();
        let waiter = ctx.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });
        tokio::task::yield_now().await;
        ctx.cancel();
        task.await.unwrap();
    }
}
