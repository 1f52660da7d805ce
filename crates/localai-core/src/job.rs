//! One-shot asynchronous hand-off between a producer and any number of waiters.
//!
//! The runtime uses it for single-flight backend startup: the first caller
//! creates the job and publishes the outcome, later callers wait on it.

use crate::cancel::{CancellationToken, CancelledError};
use tokio::sync::watch;

/// Returned by [`JobResult::set_result`] when a result was already published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("job result already set")]
pub struct AlreadySet;

/// A request paired with a result that is published exactly once.
#[derive(Debug)]
pub struct JobResult<Req, Res> {
    request: Req,
    tx: watch::Sender<Option<Res>>,
}

impl<Req, Res: Clone> JobResult<Req, Res> {
    pub fn new(request: Req) -> Self {
        let (tx, _) = watch::channel(None);
        Self { request, tx }
    }

    pub fn request(&self) -> &Req {
        &self.request
    }

    /// Publish the result and wake every waiter.
    pub fn set_result(&self, result: Res) -> Result<(), AlreadySet> {
        let mut result = Some(result);
        let published = self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = result.take();
            true
        });
        if published {
            Ok(())
        } else {
            Err(AlreadySet)
        }
    }

    pub fn is_done(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Wait for the result, or return early when `cancel` fires.
    ///
    /// Cancelling a waiter does not cancel the producer.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<Res, CancelledError> {
        let mut rx = self.tx.subscribe();
        tokio::select! {
            biased;
            result = rx.wait_for(Option::is_some) => match result {
                Ok(value) => value.clone().ok_or(CancelledError),
                Err(_) => Err(CancelledError),
            },
            _ = cancel.cancelled() => Err(CancelledError),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_returns_value() {
        let job = Arc::new(JobResult::<&str, u32>::new("req"));
        let producer = job.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.set_result(5).unwrap();
        });

        let value = job.wait(&CancellationToken::new()).await;
        assert_eq!(value, Ok(5));
        assert_eq!(*job.request(), "req");
    }

    #[tokio::test]
    async fn test_wait_cancelled_before_result() {
        let job = JobResult::<(), u32>::new(());
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(job.wait(&cancel).await, Err(CancelledError));
        assert!(!job.is_done());
    }

    #[tokio::test]
    async fn test_result_wins_over_cancelled_token() {
        let job = JobResult::<(), u32>::new(());
        job.set_result(1).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(job.wait(&cancel).await, Ok(1));
    }

    #[test]
    fn test_set_result_once() {
        let job = JobResult::<(), u32>::new(());
        assert!(job.set_result(1).is_ok());
        assert_eq!(job.set_result(2), Err(AlreadySet));
        assert!(job.is_done());
    }

    #[tokio::test]
    async fn test_many_waiters() {
        let job = Arc::new(JobResult::<(), String>::new(()));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let job = job.clone();
            handles.push(tokio::spawn(async move {
                job.wait(&CancellationToken::new()).await
            }));
        }
        job.set_result("ok".into()).unwrap();
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok("ok".to_string()));
        }
    }
}
