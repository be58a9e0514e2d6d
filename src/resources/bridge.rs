//! Lifecycle-Safe Callback Bridge
//!
//! Fetch tasks and async provider callbacks outlive any single call into the
//! engine. They reach the engine through a [`LifecycleBridge`], never through a
//! strong reference:
//!
//! ```text
//!   worker thread                      owner thread
//!   ─────────────                      ────────────
//!   bridge.with(|core| ..)             bridge.retire()
//!     read lock ─┐                       write lock (waits for readers)
//!     alive?     │                       alive = false
//!     upgrade    │
//!     callback   │
//!     unlock ────┘
//! ```
//!
//! Once `retire` returns, no callback is running and none will start.

use std::sync::{Arc, Weak};

use parking_lot::RwLock;

struct BridgeInner<T: ?Sized> {
    alive: RwLock<bool>,
    target: Weak<T>,
}

/// Weak, retirable handle to `T` for asynchronous callbacks.
pub struct LifecycleBridge<T: ?Sized> {
    inner: Arc<BridgeInner<T>>,
}

impl<T: ?Sized> Clone for LifecycleBridge<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: ?Sized> LifecycleBridge<T> {
    pub fn new(target: &Arc<T>) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                alive: RwLock::new(true),
                target: Arc::downgrade(target),
            }),
        }
    }

    /// Run `f` against the target if it has not been retired.
    ///
    /// Nested calls from inside `f` are allowed. Calling [`retire`](Self::retire)
    /// from inside `f` deadlocks.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let alive = self.inner.alive.read_recursive();
        if !*alive {
            return None;
        }
        let target = self.inner.target.upgrade()?;
        Some(f(&target))
    }

    /// Stop all future callbacks, waiting for running ones to return
    pub fn retire(&self) {
        *self.inner.alive.write() = false;
    }

    pub fn is_alive(&self) -> bool {
        *self.inner.alive.read_recursive() && self.inner.target.strong_count() > 0
    }
}
