//! Completion handles for queued table requests.

use std::time::Duration;

use probe_core::{StationError, StationResult};
use tokio::sync::oneshot;

/// One-shot reply channel carried inside a queued request.
pub(crate) type Reply<T> = oneshot::Sender<StationResult<T>>;

/// Awaitable completion handle returned by every queue operation.
///
/// Enqueueing never blocks; the handle is how the requester later blocks on
/// the result, always with an explicit timeout. An elapsed timeout becomes a
/// typed [`StationError::Timeout`] rather than a hang, and a vanished worker
/// becomes an instrument error rather than a panic.
#[derive(Debug)]
pub struct RequestHandle<T> {
    rx: oneshot::Receiver<StationResult<T>>,
    operation: &'static str,
}

impl<T> RequestHandle<T> {
    pub(crate) fn new(operation: &'static str) -> (Reply<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx, operation })
    }

    /// Wait for the request to complete, bounded by `timeout`.
    pub async fn wait(self, timeout: Duration) -> StationResult<T> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(StationError::Instrument(
                "table worker terminated before replying".into(),
            )),
            Err(_) => Err(StationError::timeout(self.operation, timeout)),
        }
    }

    pub(crate) fn operation(&self) -> &'static str {
        self.operation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_with_sent_result() {
        let (reply, handle) = RequestHandle::<u32>::new("Test request");
        reply.send(Ok(7)).ok();
        assert_eq!(handle.wait(Duration::from_secs(1)).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn maps_elapsed_timeout_to_typed_error() {
        let (_reply, handle) = RequestHandle::<u32>::new("Test request");
        let err = handle.wait(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, StationError::Timeout { .. }));
        assert!(err.to_string().contains("Test request"));
    }

    #[tokio::test]
    async fn dropped_worker_is_an_error_not_a_panic() {
        let (reply, handle) = RequestHandle::<u32>::new("Test request");
        drop(reply);
        let err = handle.wait(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, StationError::Instrument(_)));
    }
}
