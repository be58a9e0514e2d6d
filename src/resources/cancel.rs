//! Cooperative Task Cancellation
//!
//! A [`TaskHandle`] is shared between the fetch task and whoever may want to
//! stop it. Cancelling only flips a flag; the running fetch observes it at its
//! checkpoints and the state machine decides who finalizes the entry.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct TaskInner {
    id: u64,
    cancel_requested: AtomicBool,
}

/// Handle to one fetch task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    inner: Arc<TaskInner>,
}

impl Default for TaskHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskHandle {
    /// Create a handle with a fresh process-wide id
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TaskInner {
                id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
                cancel_requested: AtomicBool::new(false),
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Ask the task to stop. Idempotent.
    pub fn request_cancel(&self) {
        self.inner.cancel_requested.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_cancel_requested(&self) -> bool {
        self.inner.cancel_requested.load(Ordering::Acquire)
    }

    /// Whether two handles refer to the same task
    pub fn same_task(&self, other: &TaskHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
