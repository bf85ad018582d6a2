//! Caller-side cancellation and deadlines.
//!
//! [`CallContext`] carries a cancellation token and an optional deadline.
//! Derived contexts inherit both: cancelling a parent cancels every child,
//! and a child's deadline is never later than its parent's.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use wasm_calc_common::BindingError;

/// Cancellation signal and deadline for one or more calls.
///
/// Cloning shares the same token; use [`CallContext::with_cancel`] to get an
/// independently cancellable child.
#[derive(Debug, Clone)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for CallContext {
    fn default() -> Self {
        Self::background()
    }
}

impl CallContext {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// A child context that can be cancelled on its own.
    pub fn with_cancel(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// A child context that expires after `timeout`.
    ///
    /// # Panics
    ///
    /// Waiting on the returned context (directly through
    /// [`CallContext::done`] or through a submission) panics if the caller's
    /// Tokio runtime was built without the time driver (`enable_time`).
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// A child context that expires at `deadline`, or earlier if the parent does.
    ///
    /// # Panics
    ///
    /// Same as [`CallContext::with_timeout`]: the deadline is awaited on the
    /// caller's runtime, which needs the time driver.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(parent) => parent.min(deadline),
            None => deadline,
        };

        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Cancel this context and all of its children.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The effective deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Why the context is done, or `None` while it is still live.
    ///
    /// Explicit cancellation takes precedence over an expired deadline.
    pub fn err(&self) -> Option<BindingError> {
        if self.token.is_cancelled() {
            return Some(BindingError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(BindingError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Returns `true` once the context is cancelled or past its deadline.
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Wait until the context is done and return the reason.
    ///
    /// # Panics
    ///
    /// Panics if the context has a deadline that has not yet passed and the
    /// current runtime has no time driver.
    pub async fn done(&self) -> BindingError {
        if let Some(err) = self.err() {
            return err;
        }

        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    () = self.token.cancelled() => BindingError::Cancelled,
                    () = tokio::time::sleep_until(deadline) => {
                        self.err().unwrap_or(BindingError::DeadlineExceeded)
                    }
                }
            }
            None => {
                self.token.cancelled().await;
                BindingError::Cancelled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_background_is_live() {
        let ctx = CallContext::background();
        assert!(ctx.err().is_none());
        assert!(!ctx.is_done());
        assert!(ctx.deadline().is_none());
    }

    #[test]
    fn test_cancel_propagates_to_children() {
        let parent = CallContext::background();
        let child = parent.with_cancel();
        let grandchild = child.with_timeout(Duration::from_secs(60));

        parent.cancel();

        assert!(matches!(child.err(), Some(BindingError::Cancelled)));
        assert!(matches!(grandchild.err(), Some(BindingError::Cancelled)));
    }

    #[test]
    fn test_child_cancel_leaves_parent_live() {
        let parent = CallContext::background();
        let child = parent.with_cancel();

        child.cancel();

        assert!(child.is_done());
        assert!(!parent.is_done());
    }

    #[tokio::test]
    async fn test_expired_deadline() {
        let ctx = CallContext::background().with_deadline(Instant::now());
        assert!(matches!(ctx.err(), Some(BindingError::DeadlineExceeded)));
        assert!(matches!(ctx.done().await, BindingError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_child_deadline_capped_by_parent() {
        let parent = CallContext::background().with_timeout(Duration::from_millis(10));
        let child = parent.with_timeout(Duration::from_secs(60));

        assert_eq!(child.deadline(), parent.deadline());
    }

    #[tokio::test(start_paused = true)]
    async fn test_done_waits_for_deadline() {
        let ctx = CallContext::background().with_timeout(Duration::from_millis(50));

        let mut done = task::spawn(ctx.done());
        assert_pending!(done.poll());

        tokio::time::advance(Duration::from_millis(60)).await;

        let err = assert_ready!(done.poll());
        assert!(matches!(err, BindingError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_done_wakes_on_cancel() {
        let ctx = CallContext::background();

        let mut done = task::spawn(ctx.done());
        assert_pending!(done.poll());

        ctx.cancel();
        assert!(done.is_woken());

        let err = assert_ready!(done.poll());
        assert!(matches!(err, BindingError::Cancelled));
    }

    #[test]
    #[should_panic(expected = "timers are disabled")]
    fn test_deadline_requires_time_driver() {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let ctx = CallContext::background().with_timeout(Duration::from_secs(60));

        runtime.block_on(ctx.done());
    }

    #[test]
    fn test_cancel_only_context_without_time_driver() {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let ctx = CallContext::background().with_cancel();
        ctx.cancel();

        let err = runtime.block_on(ctx.done());
        assert!(matches!(err, BindingError::Cancelled));
    }
}
