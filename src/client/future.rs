use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use pin_project::{pin_project, pinned_drop};
use tokio::sync::oneshot;

use crate::error::Error;

/// Something which can be asked to abandon its request.
pub(crate) trait Cancel: Send + Sync + 'static {
    fn cancel(&self);
}

/// A future that resolves to the output of a request.
///
/// Dropping the future before it resolves cancels the request.
#[pin_project(PinnedDrop)]
pub struct ResponseFuture<T> {
    #[pin]
    rx: oneshot::Receiver<Result<T, Error>>,
    cancel: Option<Arc<dyn Cancel>>,
    resolved: bool,
}

impl<T> fmt::Debug for ResponseFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseFuture")
            .field("resolved", &self.resolved)
            .finish()
    }
}

impl<T> ResponseFuture<T> {
    pub(crate) fn new(rx: oneshot::Receiver<Result<T, Error>>, cancel: Option<Arc<dyn Cancel>>) -> Self {
        Self {
            rx,
            cancel,
            resolved: false,
        }
    }

    pub(crate) fn ready(result: Result<T, Error>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self::new(rx, None)
    }

    /// Cancel the request.
    ///
    /// The future still has to be polled, and resolves with [`Error::Cancelled`] unless the request
    /// finished first.
    pub fn cancel(&self) {
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }
    }
}

impl<T> Future for ResponseFuture<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let result = ready!(this.rx.poll(cx));
        *this.resolved = true;
        Poll::Ready(result.unwrap_or(Err(Error::Cancelled)))
    }
}

#[pinned_drop]
impl<T> PinnedDrop for ResponseFuture<T> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if !*this.resolved {
            if let Some(cancel) = this.cancel.take() {
                cancel.cancel();
            }
        }
    }
}
