//! Per-call cancellation and deadline.
//!
//! A [`Context`] pairs an optional deadline with a [`CancellationToken`].
//! Every blocking step of a database call (pool acquire, driver I/O, retry
//! sleep) is raced against it through [`Context::run`].

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::DbError;

#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    /// A context cancelled through `token`.
    #[must_use]
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            deadline: None,
            cancel: token,
        }
    }

    /// Derive a context expiring after `timeout`, keeping an earlier existing deadline.
    ///
    /// A timeout too large to express as an instant adds no deadline.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self.clone(),
        }
    }

    /// Derive a context expiring at `deadline`, keeping an earlier existing deadline.
    #[must_use]
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) if current <= deadline => current,
            _ => deadline,
        };
        Self {
            deadline: Some(deadline),
            cancel: self.cancel.clone(),
        }
    }

    /// Derive a context that is cancelled with this one but can also be cancelled on its own.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            deadline: self.deadline,
            cancel: self.cancel.child_token(),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Why the context is done, or `None` while it is still live.
    #[must_use]
    pub fn err(&self) -> Option<DbError> {
        if self.cancel.is_cancelled() {
            return Some(DbError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(DbError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Drive `fut` to completion unless the context finishes first.
    ///
    /// # Errors
    /// Returns `DbError::Cancelled` or `DbError::DeadlineExceeded` when the
    /// context ends before `fut`, otherwise whatever `fut` returns.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, DbError>
    where
        F: Future<Output = Result<T, DbError>>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(DbError::Cancelled),
            () = expire(self.deadline) => Err(DbError::DeadlineExceeded),
            result = fut => result,
        }
    }

    /// Sleep for `duration`, waking early if the context finishes.
    ///
    /// # Errors
    /// Returns the context's error if it ends during the sleep.
    pub async fn sleep(&self, duration: Duration) -> Result<(), DbError> {
        self.run(async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_timeout_never_extends_an_existing_deadline() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let short = Context::background().with_timeout(Duration::from_millis(10));
            let longer = short.with_timeout(Duration::from_secs(60));
            assert_eq!(short.deadline(), longer.deadline());
        });
    }

    #[tokio::test]
    async fn unrepresentable_timeout_adds_no_deadline() {
        let ctx = Context::background().with_timeout(Duration::MAX);
        assert!(ctx.deadline().is_none());
        assert!(ctx.err().is_none());

        let bounded = Context::background().with_timeout(Duration::from_secs(1));
        assert_eq!(bounded.with_timeout(Duration::MAX).deadline(), bounded.deadline());
    }

    #[tokio::test]
    async fn run_reports_cancellation() {
        let ctx = Context::background();
        ctx.cancel();
        let res = ctx.run(async { Ok::<_, DbError>(1) }).await;
        assert!(matches!(res, Err(DbError::Cancelled)));
    }

    #[tokio::test]
    async fn run_reports_deadline() {
        let ctx = Context::background().with_timeout(Duration::from_millis(5));
        let res = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, DbError>(())
            })
            .await;
        assert!(matches!(res, Err(DbError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn child_cancellation_does_not_reach_parent() {
        let parent = Context::background();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
        assert!(parent.err().is_none());
    }
}
