use super::{ReadOutcome, ReadableInner};
use crate::errors::{StreamError, StreamResult};
use futures::Stream;
use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Single-owner reader handle. Proxies reads and cancellation to the owning
/// stream; once released (explicitly or by drop) every operation fails with
/// [`StreamError::Released`].
pub struct StreamReader<T> {
    pub(crate) inner: Arc<ReadableInner<T>>,
    released: AtomicBool,
    /// Tail of a chunk a byte-mode `read_into` could not fully consume.
    /// Held here rather than in the shared queue so a deferred close can
    /// finalize without stranding bytes.
    pub(super) leftover: Mutex<Option<T>>,
    epoch: u64,
}

impl<T: Send + 'static> StreamReader<T> {
    pub(crate) fn new(inner: Arc<ReadableInner<T>>, epoch: u64) -> Self {
        Self {
            inner,
            released: AtomicBool::new(false),
            leftover: Mutex::new(None),
            epoch,
        }
    }

    pub(super) fn check_released(&self) -> StreamResult<()> {
        if self.released.load(Ordering::Acquire) {
            Err(StreamError::Released)
        } else {
            Ok(())
        }
    }

    /// Next chunk, or `None` once the stream has closed. Suspends while the
    /// queue is empty.
    pub async fn read(&self) -> StreamResult<Option<T>> {
        self.check_released()?;
        if let Some(chunk) = self.leftover.lock().unwrap().take() {
            return Ok(Some(chunk));
        }
        let outcome = self.inner.begin_read(None);
        self.inner.maybe_pull();
        match outcome {
            ReadOutcome::Ready(res) => res,
            ReadOutcome::Pending(rx) => rx.await.map_err(|_| StreamError::Closed)?,
        }
    }

    /// Cancel the owning stream; resolves once the source's `cancel` settles.
    pub async fn cancel(&self, reason: Option<StreamError>) -> StreamResult<()> {
        self.check_released()?;
        self.inner.clone().cancel(reason).await
    }

    /// Resolves once the stream closes, or with the cause once it errors.
    pub async fn closed(&self) -> StreamResult<()> {
        self.inner.closed_settled().await
    }

    /// Release the stream's lock. Idempotent; also performed on drop.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.inner.release_handle(self.epoch);
        }
    }

    /// Adapt this reader into a `futures::Stream` of chunks. The stream ends
    /// after the "done" signal; an error is yielded once, then the stream
    /// ends.
    pub fn into_stream(self) -> IntoStream<T> {
        IntoStream {
            reader: self,
            pending: None,
            done: false,
        }
    }
}

impl<T> Drop for StreamReader<T> {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.inner.release_handle(self.epoch);
        }
    }
}

pin_project! {
    /// `futures::Stream` adapter over a [`StreamReader`]. Holds the stream's
    /// lock until dropped.
    pub struct IntoStream<T> {
        reader: StreamReader<T>,
        #[pin]
        pending: Option<oneshot::Receiver<StreamResult<Option<T>>>>,
        done: bool,
    }
}

impl<T: Send + 'static> Stream for IntoStream<T> {
    type Item = StreamResult<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        if *this.done {
            return Poll::Ready(None);
        }
        if let Some(chunk) = this.reader.leftover.lock().unwrap().take() {
            return Poll::Ready(Some(Ok(chunk)));
        }
        loop {
            if this.pending.as_mut().as_pin_mut().is_none() {
                match this.reader.inner.begin_read(None) {
                    ReadOutcome::Ready(res) => {
                        this.reader.inner.maybe_pull();
                        return Poll::Ready(finish(this.done, res));
                    }
                    ReadOutcome::Pending(rx) => {
                        this.reader.inner.maybe_pull();
                        this.pending.set(Some(rx));
                    }
                }
            }
            let rx = this.pending.as_mut().as_pin_mut().unwrap();
            match rx.poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(res) => {
                    this.pending.set(None);
                    let res = res.unwrap_or(Ok(None));
                    return Poll::Ready(finish(this.done, res));
                }
            }
        }
    }
}

fn finish<T>(done: &mut bool, res: StreamResult<Option<T>>) -> Option<StreamResult<T>> {
    match res {
        Ok(Some(v)) => Some(Ok(v)),
        Ok(None) => {
            *done = true;
            None
        }
        Err(e) => {
            *done = true;
            Some(Err(e))
        }
    }
}
