//! Hierarchical cancellation handle (Design Notes §9).
//!
//! A `Cancellation` is a value, not an ambient context: every blocking
//! operation (enqueue wait, consume wait, retry timer) takes one
//! explicitly and races it against its own timeout. Child handles derive
//! from a parent (process root -> domain -> queue -> operation); tripping
//! the parent trips every descendant.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::CoreError;

#[derive(Debug, Clone)]
pub struct Cancellation(CancellationToken);

impl Cancellation {
    pub fn root() -> Self {
        Self(CancellationToken::new())
    }

    pub fn child(&self) -> Self {
        Self(self.0.child_token())
    }

    pub fn cancel(&self) {
        self.0.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.0.is_cancelled()
    }

    /// Resolves once this token (or an ancestor) is canceled. Actor loops
    /// select on this directly rather than going through `guard`, which is
    /// meant for wrapping a single caller-facing operation.
    pub async fn cancelled(&self) {
        self.0.cancelled().await
    }

    /// Race `fut` against cancellation, returning `Canceled` if the token
    /// trips first.
    pub async fn guard<F, T>(&self, fut: F) -> Result<T, CoreError>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::select! {
            biased;
            _ = self.0.cancelled() => Err(CoreError::Canceled),
            out = fut => Ok(out),
        }
    }

    /// Race `fut` against cancellation and a bounded timeout, mapping the
    /// timeout branch to `on_timeout`.
    pub async fn guard_timeout<F, T>(
        &self,
        duration: Duration,
        fut: F,
        on_timeout: CoreError,
    ) -> Result<T, CoreError>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::select! {
            biased;
            _ = self.0.cancelled() => Err(CoreError::Canceled),
            _ = tokio::time::sleep(duration) => Err(on_timeout),
            out = fut => Ok(out),
        }
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::root()
    }
}
