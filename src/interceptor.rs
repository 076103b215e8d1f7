use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};

/// One-shot callback handed the full buffered body on clean end-of-stream.
pub type OnCompletion = Box<dyn FnOnce(Bytes) + Send + 'static>;

/// Pass-through byte stream that buffers a copy of every chunk and fires a
/// completion callback exactly once when the wrapped stream ends cleanly.
///
/// The callback runs on a detached task so the client flush path is never
/// blocked. A stream error or a drop before end-of-stream leaves the
/// callback uninvoked: an aborted stream is not complete.
pub struct StreamInterceptor<S> {
    inner: S,
    buffer: BytesMut,
    on_completion: Option<OnCompletion>,
    failed: bool,
}

impl<S> StreamInterceptor<S> {
    pub fn new(inner: S, on_completion: OnCompletion) -> Self {
        Self {
            inner,
            buffer: BytesMut::new(),
            on_completion: Some(on_completion),
            failed: false,
        }
    }
}

impl<S, E> Stream for StreamInterceptor<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    Self: Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.buffer.extend_from_slice(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.failed = true;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                if !this.failed {
                    if let Some(callback) = this.on_completion.take() {
                        let body = this.buffer.split().freeze();
                        tokio::spawn(async move { callback(body) });
                    }
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
