//! Cross-thread termination control.
//!
//! A worker's engine polls an interrupt flag at safe points (loop back-edges
//! and calls). [`TerminationHandle`] sets that flag from any thread, but only
//! while the worker is actually executing, so a request never leaks into the
//! next `load`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug, Default)]
struct Control {
    /// Number of worker calls currently on the stack.
    depth: usize,
    /// A termination was requested for the current execution.
    requested: bool,
}

#[derive(Debug, Default)]
struct Shared {
    interrupt: AtomicBool,
    control: Mutex<Control>,
}

/// Thread-safe handle that interrupts a worker's running script.
#[derive(Debug, Clone, Default)]
pub struct TerminationHandle {
    shared: Arc<Shared>,
}

impl TerminationHandle {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Requests termination of the script currently executing on the worker.
    ///
    /// Returns `true` if this call scheduled an interruption. Calling it while
    /// the worker is idle, or again before the interrupted call has returned,
    /// does nothing and returns `false`.
    pub fn terminate_execution(&self) -> bool {
        let mut control = self.shared.control.lock();
        if control.depth == 0 || control.requested {
            return false;
        }
        control.requested = true;
        self.shared.interrupt.store(true, Ordering::SeqCst);
        tracing::debug!("[terminate_execution] Interrupt requested");
        true
    }

    /// Whether the worker is inside a `load`, `load_module` or `send_bytes` call.
    pub fn is_executing(&self) -> bool {
        self.shared.control.lock().depth > 0
    }

    /// Whether a termination request is pending for the current execution.
    pub fn is_requested(&self) -> bool {
        self.shared.interrupt.load(Ordering::SeqCst)
    }

    /// Marks the worker as executing until the guard is dropped.
    pub(crate) fn enter(&self) -> ExecutionGuard {
        self.shared.control.lock().depth += 1;
        ExecutionGuard {
            handle: self.clone(),
        }
    }

    /// Interrupt callback for the engine; returns `true` to abort execution.
    pub(crate) fn interrupt_handler(&self) -> Box<dyn FnMut() -> bool + 'static> {
        let shared = self.shared.clone();
        Box::new(move || shared.interrupt.load(Ordering::Relaxed))
    }
}

/// Keeps a [`TerminationHandle`] in the executing state.
pub(crate) struct ExecutionGuard {
    handle: TerminationHandle,
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        let mut control = self.handle.shared.control.lock();
        control.depth = control.depth.saturating_sub(1);
        if control.depth == 0 && control.requested {
            control.requested = false;
            self.handle.shared.interrupt.store(false, Ordering::SeqCst);
            tracing::debug!("[terminate_execution] Interrupt cleared");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_terminate_is_noop() {
        let handle = TerminationHandle::new();
        assert!(!handle.is_executing());
        assert!(!handle.terminate_execution());
        assert!(!handle.is_requested());
    }

    #[test]
    fn test_terminate_once_per_execution() {
        let handle = TerminationHandle::new();
        let guard = handle.enter();
        assert!(handle.is_executing());
        assert!(handle.terminate_execution());
        assert!(!handle.terminate_execution());
        assert!(handle.is_requested());

        drop(guard);
        assert!(!handle.is_executing());
        assert!(!handle.is_requested());
    }

    #[test]
    fn test_nested_guards_clear_at_outermost() {
        let handle = TerminationHandle::new();
        let outer = handle.enter();
        let inner = handle.enter();
        assert!(handle.terminate_execution());

        drop(inner);
        assert!(handle.is_requested());
        drop(outer);
        assert!(!handle.is_requested());
    }

    #[test]
    fn test_interrupt_handler_follows_flag() {
        let handle = TerminationHandle::new();
        let mut poll = handle.interrupt_handler();
        assert!(!poll());

        let _guard = handle.enter();
        handle.terminate_execution();
        assert!(poll());
    }

    #[test]
    fn test_terminate_from_other_thread() {
        let handle = TerminationHandle::new();
        let _guard = handle.enter();
        let remote = handle.clone();
        let scheduled = std::thread::spawn(move || remote.terminate_execution())
            .join()
            .unwrap();
        assert!(scheduled);
        assert!(handle.is_requested());
    }
}
