//! Cancellation token shared by downloads, backend startup and the P2P loops.
//!
//! Tokens form a tree: cancelling a parent cancels every child, while a child
//! can be cancelled on its own without touching its parent. The root token is
//! owned by the application and cancelled on shutdown.

use std::future::Future;
use std::time::Duration;

/// A cancellation token for cooperative cancellation of async operations.
///
/// # Example
///
/// ```
/// use localai_core::cancel::CancellationToken;
///
/// let root = CancellationToken::new();
/// let op = root.child_token();
///
/// op.cancel();
/// assert!(op.is_cancelled());
/// assert!(!root.is_cancelled());
///
/// let other = root.child_token();
/// root.cancel();
/// assert!(other.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: tokio_util::sync::CancellationToken,
}

impl CancellationToken {
    /// Create a new root token.
    pub fn new() -> Self {
        Self {
            inner: tokio_util::sync::CancellationToken::new(),
        }
    }

    /// Request cancellation of this token and all of its children.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Create a child token that is cancelled together with this one.
    pub fn child_token(&self) -> Self {
        Self {
            inner: self.inner.child_token(),
        }
    }

    /// Resolve once the token is cancelled.
    pub async fn cancelled(&self) {
        self.inner.cancelled().await
    }

    /// Check cancellation and return an error if cancelled.
    pub fn check(&self) -> Result<(), CancelledError> {
        if self.is_cancelled() {
            Err(CancelledError)
        } else {
            Ok(())
        }
    }

    /// Run `fut` until it completes or the token is cancelled.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, CancelledError>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            biased;
            _ = self.inner.cancelled() => Err(CancelledError),
            value = fut => Ok(value),
        }
    }

    /// Create a child token that cancels itself after `timeout`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn child_with_deadline(&self, timeout: Duration) -> Self {
        let child = self.child_token();
        let timer = child.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(timeout) => timer.cancel(),
            }
        });
        child
    }
}

/// Error returned when an operation is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelledError;

impl std::fmt::Display for CancelledError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Operation was cancelled")
    }
}

impl std::error::Error for CancelledError {}

impl From<CancelledError> for crate::error::LocalAiError {
    fn from(_: CancelledError) -> Self {
        crate::error::LocalAiError::Cancelled
    }
}
