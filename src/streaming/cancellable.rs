use futures::Stream;
use pin_project::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Ends the wrapped stream as soon as the token is cancelled, dropping the
/// inner stream's pending read on the next poll.
#[pin_project]
pub struct CancellableStream<S> {
    #[pin]
    inner: S,
    #[pin]
    cancelled: WaitForCancellationFutureOwned,
    finished: bool,
}

impl<S> CancellableStream<S> {
    pub fn new(inner: S, token: CancellationToken) -> Self {
        Self {
            inner,
            cancelled: token.cancelled_owned(),
            finished: false,
        }
    }
}

impl<S: Stream> Stream for CancellableStream<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        if *this.finished {
            return Poll::Ready(None);
        }

        if this.cancelled.poll(cx).is_ready() {
            tracing::debug!("Stream cancelled by caller");
            *this.finished = true;
            return Poll::Ready(None);
        }

        match this.inner.poll_next(cx) {
            Poll::Ready(None) => {
                *this.finished = true;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}
