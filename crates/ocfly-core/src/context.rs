// ── Operation context ──
//
// Cancellation plus an optional deadline, passed to every suspending
// operation. Children inherit the parent's cancellation and never outlive
// its deadline.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::CoreError;

#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A root context: never cancelled unless asked, no deadline.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Root context that expires after `timeout`.
    pub fn timeout(timeout: Duration) -> Self {
        Self::background().with_timeout(timeout)
    }

    /// Child that can be cancelled on its own.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Child whose deadline is `timeout` from now, capped by ours.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(ours) => ours.min(deadline),
            None => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Why this context is done, or `None` while it is live.
    pub fn err(&self) -> Option<CoreError> {
        if self.token.is_cancelled() {
            Some(CoreError::Canceled)
        } else if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Some(CoreError::DeadlineExceeded)
        } else {
            None
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolves once cancelled or past the deadline; yields the reason.
    pub async fn done(&self) -> CoreError {
        tokio::select! {
            biased;
            () = self.token.cancelled() => CoreError::Canceled,
            () = deadline_elapsed(self.deadline) => CoreError::DeadlineExceeded,
        }
    }

    /// Run `fut` unless the context ends first; the loser is dropped.
    pub async fn run<T, F>(&self, fut: F) -> Result<T, CoreError>
    where
        F: Future<Output = Result<T, CoreError>>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            result = fut => result,
        }
    }

    /// Sleep until `when`, returning early with the reason if the context
    /// ends first.
    pub async fn sleep_until(&self, when: Instant) -> Result<(), CoreError> {
        self.run(async {
            tokio::time::sleep_until(when).await;
            Ok(())
        })
        .await
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn child_deadline_is_capped_by_parent() {
        let parent = Context::timeout(Duration::from_secs(1));
        let child = parent.with_timeout(Duration::from_secs(10));
        assert_eq!(child.deadline(), parent.deadline());
    }

    #[tokio::test(start_paused = true)]
    async fn run_reports_deadline() {
        let ctx = Context::timeout(Duration::from_millis(50));
        let err = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(err.is_deadline_exceeded());
        assert!(ctx.is_done());
    }

    #[tokio::test]
    async fn parent_cancel_reaches_children() {
        let parent = Context::background();
        let child = parent.with_timeout(Duration::from_secs(60));
        parent.cancel();
        assert!(child.err().unwrap().is_canceled());
        assert!(child.sleep_until(Instant::now() + Duration::from_secs(60)).await.is_err());
    }

    #[tokio::test]
    async fn cancelling_child_leaves_parent_live() {
        let parent = Context::background();
        let child = parent.child();
        child.cancel();
        assert!(parent.err().is_none());
    }
}
