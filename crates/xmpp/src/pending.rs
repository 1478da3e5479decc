//! Single-resolution handles for connect, login and disconnect.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::client::XmppClient;
use crate::error::ClientError;

pub type Outcome = Result<XmppClient, ClientError>;

/// A lifecycle operation that completes later.
///
/// Clones observe the same outcome, which lets a repeated `disconnect()`
/// hand back the operation already in flight.
#[derive(Clone)]
#[must_use = "a pending operation does nothing unless awaited or dropped deliberately"]
pub struct PendingOperation {
    inner: Shared<BoxFuture<'static, Outcome>>,
}

impl PendingOperation {
    pub fn new() -> (Self, Completer) {
        let (tx, rx) = oneshot::channel();
        let inner = async move {
            rx.await.unwrap_or_else(|_| {
                Err(ClientError::Cancelled(
                    "operation abandoned before completion".to_string(),
                ))
            })
        }
        .boxed()
        .shared();

        let completer = Completer {
            sender: Arc::new(Mutex::new(Some(tx))),
        };
        (Self { inner }, completer)
    }

    /// An operation that has already finished.
    pub fn ready(outcome: Outcome) -> Self {
        Self {
            inner: futures::future::ready(outcome).boxed().shared(),
        }
    }

    /// The outcome, if the operation has finished and been polled since.
    pub fn peek(&self) -> Option<&Outcome> {
        self.inner.peek()
    }
}

impl Future for PendingOperation {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}

impl std::fmt::Debug for PendingOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingOperation")
            .field("resolved", &self.peek().is_some())
            .finish()
    }
}

/// Resolves a [`PendingOperation`]. Only the first call has an effect.
#[derive(Clone)]
pub struct Completer {
    sender: Arc<Mutex<Option<oneshot::Sender<Outcome>>>>,
}

impl Completer {
    /// Returns `false` if the operation was already resolved.
    pub fn complete(&self, outcome: Outcome) -> bool {
        match self.sender.lock().take() {
            // A dropped receiver means nobody is waiting; the resolution still counts.
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    pub fn fail(&self, error: ClientError) -> bool {
        self.complete(Err(error))
    }

    pub fn is_completed(&self) -> bool {
        self.sender.lock().is_none()
    }
}

impl std::fmt::Debug for Completer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completer")
            .field("completed", &self.is_completed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn stays_pending_until_completed() {
        let (op, completer) = PendingOperation::new();
        let mut waiting = task::spawn(op);
        assert_pending!(waiting.poll());

        completer.fail(ClientError::Timeout);
        assert!(waiting.is_woken());
        let outcome = assert_ready!(waiting.poll());
        assert_eq!(outcome.unwrap_err(), ClientError::Timeout);
    }

    #[tokio::test]
    async fn first_resolution_wins() {
        let (op, completer) = PendingOperation::new();
        assert!(completer.fail(ClientError::Authentication("first".into())));
        assert!(!completer.fail(ClientError::Authentication("second".into())));
        assert!(completer.is_completed());

        let err = op.await.unwrap_err();
        assert_eq!(err, ClientError::Authentication("first".into()));
    }

    #[tokio::test]
    async fn clones_share_the_outcome() {
        let (op, completer) = PendingOperation::new();
        let other = op.clone();
        completer.fail(ClientError::TransportUnavailable);

        assert_eq!(op.await.unwrap_err(), ClientError::TransportUnavailable);
        assert_eq!(other.await.unwrap_err(), ClientError::TransportUnavailable);
    }

    #[tokio::test]
    async fn dropped_completer_cancels() {
        let (op, completer) = PendingOperation::new();
        drop(completer);
        assert!(matches!(op.await, Err(ClientError::Cancelled(_))));
    }

    #[tokio::test]
    async fn ready_operation_is_immediately_available() {
        let op = PendingOperation::ready(Err(ClientError::Timeout));
        assert_eq!(op.clone().await.unwrap_err(), ClientError::Timeout);
        assert!(op.peek().is_some());
    }
}
