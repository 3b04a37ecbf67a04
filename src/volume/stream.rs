//! Byte-counting stream wrapper used by `StoragePool::write` to learn the final
//! `file_size` without materializing the whole body: wraps an inner stream to
//! observe every chunk in flight rather than buffering it.

use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_core::{ready, Stream};
use pin_project_lite::pin_project;

pin_project! {
    pub struct CountingStream<S> {
        #[pin]
        inner: S,
        counter: Arc<AtomicI64>,
    }
}

impl<S> CountingStream<S> {
    pub fn new(inner: S) -> (Self, Arc<AtomicI64>) {
        let counter = Arc::new(AtomicI64::new(0));
        (
            CountingStream {
                inner,
                counter: counter.clone(),
            },
            counter,
        )
    }
}

impl<S, E> Stream for CountingStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    type Item = Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match ready!(this.inner.poll_next(cx)) {
            Some(Ok(bytes)) => {
                this.counter.fetch_add(bytes.len() as i64, Ordering::Relaxed);
                Poll::Ready(Some(Ok(bytes)))
            }
            other => Poll::Ready(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use futures::StreamExt;

    #[tokio::test]
    async fn counts_all_bytes_observed() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"hello")),
            Ok(Bytes::from_static(b" world")),
        ];
        let (mut counting, counter) = CountingStream::new(stream::iter(chunks));
        while counting.next().await.is_some() {}
        assert_eq!(counter.load(Ordering::Relaxed), 11);
    }
}
