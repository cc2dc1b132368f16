//! Cancellation scopes for render loops.
//!
//! A [`Scope`] is the abort signal of one component instance or one nested
//! renderable. Aborting a scope aborts every child scope created from it, and
//! wakes any loop currently waiting on it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

/// Handle for cooperative cancellation of render loops.
///
/// `Scope` can be cloned and shared across tasks; any clone can trigger the
/// abort, which is visible to all other clones.
///
/// # Example
///
/// ```
/// use awaitful_core::Scope;
///
/// let scope = Scope::new();
/// let child = scope.child();
///
/// assert!(!child.is_aborted());
/// scope.abort();
/// assert!(child.is_aborted());
/// ```
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

struct ScopeInner {
    /// Shared abort flag.
    aborted: AtomicBool,
    /// Wakes waiters when the flag flips.
    signal: watch::Sender<bool>,
    /// Scopes that end with this one.
    children: Mutex<Vec<Scope>>,
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl Scope {
    /// Create a new root scope.
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            inner: Arc::new(ScopeInner {
                aborted: AtomicBool::new(false),
                signal,
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create a scope that is aborted together with this one.
    ///
    /// A child of an already aborted scope starts out aborted.
    pub fn child(&self) -> Scope {
        let child = Scope::new();
        let mut children = self
            .inner
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        children.retain(|c| !c.is_aborted());
        if self.is_aborted() {
            child.abort();
        } else {
            children.push(child.clone());
        }
        child
    }

    /// Check if abort has been requested.
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::Acquire)
    }

    /// Abort this scope and all of its descendants.
    pub fn abort(&self) {
        if self.inner.aborted.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.signal.send_replace(true);

        let children = std::mem::take(
            &mut *self
                .inner
                .children
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for child in children {
            child.abort();
        }
    }

    /// Resolve once the scope is aborted.
    pub async fn aborted(&self) {
        let mut rx = self.inner.signal.subscribe();
        // The sender lives as long as `self`, so the wait cannot fail.
        let _ = rx.wait_for(|aborted| *aborted).await;
    }

    /// Number of live child scopes.
    pub fn live_children(&self) -> usize {
        self.inner
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|c| !c.is_aborted())
            .count()
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("aborted", &self.is_aborted())
            .finish()
    }
}
