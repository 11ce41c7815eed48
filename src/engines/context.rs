//! Deadline- and cancellation-bearing context for engine calls.
//!
//! Every call a manager issues against its engine goes through
//! [`OpContext::run`].  Cancelling the context or passing its deadline
//! drops the in-flight future, so no state after the await point runs and
//! no flag is flipped.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::DbError;

/// Internal bound applied by probe-style calls regardless of the caller.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Caller-supplied deadline plus cancellation handle.
#[derive(Debug, Clone)]
pub struct OpContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl Default for OpContext {
    fn default() -> Self {
        Self::background()
    }
}

impl OpContext {
    /// No deadline, never cancelled unless [`cancel`](Self::cancel) is called.
    pub fn background() -> Self {
        Self {
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancel: CancellationToken::new(),
        }
    }

    /// Derive a context whose deadline is the earlier of ours and
    /// `now + timeout`.  Cancelling the parent cancels the child.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let bound = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(d) if d < bound => d,
            _ => bound,
        };
        Self {
            deadline: Some(deadline),
            cancel: self.cancel.child_token(),
        }
    }

    /// Context tied to an external cancellation token (e.g. process shutdown).
    pub fn with_token(cancel: CancellationToken) -> Self {
        Self {
            deadline: None,
            cancel,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the deadline has already passed.
    pub fn is_expired(&self) -> bool {
        self.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }

    /// Drive `fut` under this context's deadline and cancellation.
    pub async fn run<T, F>(&self, operation: &'static str, fut: F) -> Result<T, DbError>
    where
        F: Future<Output = Result<T, DbError>>,
    {
        if self.cancel.is_cancelled() {
            return Err(DbError::Cancelled { operation });
        }
        let bounded = async {
            match self.deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, fut)
                    .await
                    .map_err(|_| DbError::DeadlineExceeded { operation })?,
                None => fut.await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(DbError::Cancelled { operation }),
            result = bounded => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_passes_through() {
        let ctx = OpContext::background();
        let v = ctx.run("noop", async { Ok::<_, DbError>(7) }).await.unwrap();
        assert_eq!(v, 7);
    }

    #[tokio::test]
    async fn test_deadline_exceeded() {
        let ctx = OpContext::with_timeout(Duration::from_millis(20));
        let err = ctx
            .run("sleep", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, DbError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::DeadlineExceeded { operation: "sleep" }));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let ctx = OpContext::background();
        ctx.cancel();
        let err = ctx.run("op", async { Ok::<_, DbError>(()) }).await.unwrap_err();
        assert!(matches!(err, DbError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_child_inherits_earlier_deadline_and_cancellation() {
        let parent = OpContext::with_timeout(Duration::from_millis(10));
        let child = parent.child_with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());

        let parent = OpContext::background();
        let child = parent.child_with_timeout(Duration::from_secs(60));
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_in_flight() {
        let ctx = OpContext::background();
        let handle = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.cancel();
        });
        let err = ctx
            .run("wait", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, DbError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Cancelled { .. }));
    }
}
