//! Cancellation Tokens
//!
//! Every long-running component in Perch owns a `CancelToken`. Cancelling a
//! token records a cause string that stays retrievable after the fact, so a
//! postmortem can tell *why* a stream reader or the fleet wound down.
//!
//! Tokens form a hierarchy: cancelling a parent cancels all children (the
//! children inherit the parent's cause); cancelling a child leaves the
//! parent running.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

struct TokenInner {
    cancelled: AtomicBool,
    cause: Mutex<Option<String>>,
    cond: Condvar,
    children: Mutex<Vec<Arc<TokenInner>>>,
}

impl TokenInner {
    fn cancel(&self, cause: &str) {
        {
            let mut slot = self.cause.lock();
            if self.cancelled.swap(true, Ordering::SeqCst) {
                // First cancel wins; keep the original cause.
                return;
            }
            *slot = Some(cause.to_string());
        }
        self.cond.notify_all();

        let children = self.children.lock();
        for child in children.iter() {
            child.cancel(cause);
        }
    }
}

/// Clonable cancellation handle with a recorded cause
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    /// Create a root token (not yet cancelled)
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                cause: Mutex::new(None),
                cond: Condvar::new(),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create a child token
    ///
    /// The child is cancelled when this token is cancelled. If this token is
    /// already cancelled, the child starts out cancelled with the same cause.
    pub fn child(&self) -> CancelToken {
        let child = CancelToken::new();
        self.adopt_child(&child);
        child
    }

    /// Link an existing token as a child of this one.
    ///
    /// Used when a component creates its token at construction but only
    /// learns its parent when it starts running.
    pub fn adopt_child(&self, child: &CancelToken) {
        {
            let mut children = self.inner.children.lock();
            children.push(Arc::clone(&child.inner));
        }
        // Parent may have been cancelled while we were registering.
        if self.is_cancelled() {
            if let Some(cause) = self.cause() {
                child.inner.cancel(&cause);
            }
        }
    }

    /// Cancel with a cause. The first caller wins; later calls are no-ops.
    pub fn cancel(&self, cause: impl AsRef<str>) {
        self.inner.cancel(cause.as_ref());
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// The cause recorded by the winning `cancel` call, if any
    pub fn cause(&self) -> Option<String> {
        self.inner.cause.lock().clone()
    }

    /// Sleep for `dur`, waking early on cancellation.
    ///
    /// Returns `true` if the token was cancelled (before or during the wait).
    pub fn wait_timeout(&self, dur: Duration) -> bool {
        let deadline = Instant::now() + dur;
        let mut guard = self.inner.cause.lock();
        loop {
            if self.inner.cancelled.load(Ordering::SeqCst) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let result = self.inner.cond.wait_for(&mut guard, deadline - now);
            if result.timed_out() && !self.inner.cancelled.load(Ordering::SeqCst) {
                return false;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .field("cause", &self.cause())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_fresh_token_not_cancelled() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.cause().is_none());
    }

    #[test]
    fn test_cancel_records_cause() {
        let token = CancelToken::new();
        token.cancel("reader exiting");
        assert!(token.is_cancelled());
        assert_eq!(token.cause().as_deref(), Some("reader exiting"));
    }

    #[test]
    fn test_first_cancel_wins() {
        let token = CancelToken::new();
        token.cancel("first");
        token.cancel("second");
        assert_eq!(token.cause().as_deref(), Some("first"));
    }

    #[test]
    fn test_parent_cancels_child() {
        let parent = CancelToken::new();
        let child = parent.child();
        parent.cancel("fleet shutdown");
        assert!(child.is_cancelled());
        assert_eq!(child.cause().as_deref(), Some("fleet shutdown"));
    }

    #[test]
    fn test_child_does_not_cancel_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        child.cancel("stream stopped");
        assert!(!parent.is_cancelled());
        assert!(parent.cause().is_none());
    }

    #[test]
    fn test_child_of_cancelled_parent_starts_cancelled() {
        let parent = CancelToken::new();
        parent.cancel("gone");
        let child = parent.child();
        assert!(child.is_cancelled());
        assert_eq!(child.cause().as_deref(), Some("gone"));
    }

    #[test]
    fn test_wait_timeout_expires() {
        let token = CancelToken::new();
        let start = Instant::now();
        let cancelled = token.wait_timeout(Duration::from_millis(50));
        assert!(!cancelled);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_wait_timeout_wakes_on_cancel() {
        let token = CancelToken::new();
        let waiter = token.clone();

        let handle = thread::spawn(move || waiter.wait_timeout(Duration::from_secs(10)));

        thread::sleep(Duration::from_millis(20));
        token.cancel("wake up");

        let cancelled = handle.join().unwrap();
        assert!(cancelled);
    }

    #[test]
    fn test_wait_on_cancelled_token_returns_immediately() {
        let token = CancelToken::new();
        token.cancel("done");
        let start = Instant::now();
        assert!(token.wait_timeout(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_concurrent_cancel_single_cause() {
        let token = CancelToken::new();
        let mut handles = Vec::new();
        for i in 0..8 {
            let t = token.clone();
            handles.push(thread::spawn(move || t.cancel(format!("caller {}", i))));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(token.is_cancelled());
        // Exactly one cause survives, whichever caller won.
        let cause = token.cause().unwrap();
        assert!(cause.starts_with("caller "));
    }
}
