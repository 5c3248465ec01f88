use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Bytes;
use futures::Stream;

type OnComplete = Box<dyn FnOnce(Bytes) + Send>;

/// passes a segment body through chunk by chunk while keeping a copy. once the upstream body
/// ends with exactly `expected_len` bytes the copy is handed to `on_complete`. a short body, an
/// upstream error or the viewer hanging up (the stream gets dropped) means nothing is handed over
pub struct CachingStream<S> {
    inner: S,
    buffer: Option<Vec<u8>>,
    expected_len: usize,
    on_complete: Option<OnComplete>,
}

impl<S> CachingStream<S> {
    pub fn new(inner: S, expected_len: usize, on_complete: OnComplete) -> Self {
        Self {
            inner,
            // grows with the body, the advertised length is only trusted once it all arrived
            buffer: Some(Vec::new()),
            expected_len,
            on_complete: Some(on_complete),
        }
    }
}

impl<S, E> Stream for CachingStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some(buffer) = this.buffer.as_mut() {
                    if buffer.len() + chunk.len() > this.expected_len {
                        // upstream lied about the length, don't cache it
                        this.buffer = None;
                    } else {
                        buffer.extend_from_slice(&chunk);
                    }
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.buffer = None;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                if let (Some(buffer), Some(on_complete)) =
                    (this.buffer.take(), this.on_complete.take())
                {
                    if buffer.len() == this.expected_len {
                        on_complete(Bytes::from(buffer));
                    }
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
