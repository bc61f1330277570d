//! Byte-counting stream wrapper for uploads.

use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::time::{Duration, Instant};

/// Called with the running byte total
pub type ProgressCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Counts bytes flowing through `inner` into a shared counter and calls the
/// callback at most every `interval` plus once at end of stream.
pub struct ProgressStream<S> {
    inner: S,
    counter: Arc<AtomicU64>,
    last_update: Instant,
    interval: Duration,
    callback: Option<ProgressCallback>,
}

impl<S> ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>>,
{
    pub fn new(inner: S, counter: Arc<AtomicU64>) -> Self {
        Self {
            inner,
            counter,
            last_update: Instant::now(),
            interval: Duration::from_millis(250),
            callback: None,
        }
    }

    pub fn with_callback(mut self, callback: ProgressCallback) -> Self {
        self.callback = Some(callback);
        self
    }
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin,
{
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                let total = self.counter.fetch_add(chunk.len() as u64, Ordering::Relaxed) + chunk.len() as u64;
                let now = Instant::now();
                if now.duration_since(self.last_update) >= self.interval {
                    if let Some(callback) = &self.callback {
                        callback(total);
                    }
                    self.last_update = now;
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(None) => {
                if let Some(callback) = &self.callback {
                    callback(self.counter.load(Ordering::Relaxed));
                }
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{stream, StreamExt};
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_counts_bytes_and_reports_final_total() {
        let chunks = vec![
            Ok(Bytes::from_static(b"hello")),
            Ok(Bytes::from_static(b" world")),
        ];
        let counter = Arc::new(AtomicU64::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);

        let mut stream = ProgressStream::new(stream::iter(chunks), Arc::clone(&counter))
            .with_callback(Arc::new(move |n| seen_cb.lock().unwrap().push(n)));

        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }

        assert_eq!(collected, b"hello world");
        assert_eq!(counter.load(Ordering::Relaxed), 11);
        assert_eq!(seen.lock().unwrap().last().copied(), Some(11));
    }
}
