//! Cancellation and deadline propagation.
//!
//! Every suspension point in the core (repository calls, owner queue
//! enqueues, outbound routing) runs under a [`Context`]. Cancelling the
//! context, or reaching its deadline, aborts the pending operation with
//! [`XmppError::Canceled`] or [`XmppError::Timeout`].

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::XmppError;

#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// A root context with no deadline.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// A child context cancelled together with `self`.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// A child context whose deadline is at most `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the context is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Run `fut` until completion, cancellation, or deadline.
    pub async fn run<T, F>(&self, fut: F) -> Result<T, XmppError>
    where
        F: Future<Output = Result<T, XmppError>>,
    {
        if self.token.is_cancelled() {
            return Err(XmppError::Canceled);
        }
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => Err(XmppError::Canceled),
                    res = tokio::time::timeout_at(deadline, fut) => match res {
                        Ok(inner) => inner,
                        Err(_) => Err(XmppError::timeout("context deadline exceeded")),
                    },
                }
            }
            None => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => Err(XmppError::Canceled),
                    res = fut => res,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_completes() {
        let ctx = Context::background();
        let value = ctx.run(async { Ok::<_, XmppError>(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_cancel_aborts_pending_operation() {
        let ctx = Context::background();
        let child = ctx.child();
        ctx.cancel();

        let res = child
            .run(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, XmppError>(())
            })
            .await;
        assert!(matches!(res, Err(XmppError::Canceled)));
    }

    #[tokio::test]
    async fn test_deadline_expires() {
        let ctx = Context::background().with_timeout(Duration::from_millis(50));
        let res = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<_, XmppError>(())
            })
            .await;
        assert!(matches!(res, Err(XmppError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_child_keeps_earlier_deadline() {
        let parent = Context::background().with_timeout(Duration::from_millis(10));
        let child = parent.with_timeout(Duration::from_secs(10));
        assert_eq!(child.deadline(), parent.deadline());
    }
}
