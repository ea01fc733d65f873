//! Completion handle for an enqueued write

use quill_common::{Error, Result};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Resolves once the batch holding the write is durable, or with the
/// reason it failed. Dropping it does not cancel the write.
#[derive(Debug)]
#[must_use = "a write is only known to be durable once its PendingWrite resolves"]
pub struct PendingWrite {
    rx: oneshot::Receiver<Result<()>>,
}

impl PendingWrite {
    pub(crate) fn channel() -> (oneshot::Sender<Result<()>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// Block the current thread until the write resolves.
    ///
    /// Must not be called from inside an async runtime; await the handle
    /// there instead.
    pub fn wait(self) -> Result<()> {
        self.rx.blocking_recv().unwrap_or(Err(Error::Closed))
    }

    /// Non-blocking check; `None` while the write is still in flight
    pub fn try_result(&mut self) -> Option<Result<()>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(Error::Closed)),
        }
    }
}

impl Future for PendingWrite {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(Error::Closed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_receives_result() {
        let (tx, pending) = PendingWrite::channel();
        tx.send(Ok(())).unwrap();
        assert!(pending.wait().is_ok());
    }

    #[test]
    fn test_dropped_sender_is_closed() {
        let (tx, mut pending) = PendingWrite::channel();
        assert!(pending.try_result().is_none());
        drop(tx);
        assert!(matches!(pending.try_result(), Some(Err(Error::Closed))));
    }

    #[tokio::test]
    async fn test_await_failure() {
        let (tx, pending) = PendingWrite::channel();
        tx.send(Err(Error::FlushFailed("disk gone".into()))).unwrap();
        assert!(matches!(pending.await, Err(Error::FlushFailed(_))));
    }
}
