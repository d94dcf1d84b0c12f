use super::{ReadyGate, WritableInner};
use crate::errors::{StreamError, StreamResult};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{oneshot, watch};

/// Completion handle for an accepted write (or close) request. Settles once
/// the corresponding sink call does.
pub struct WriteAck {
    rx: oneshot::Receiver<StreamResult<()>>,
}

impl WriteAck {
    pub(super) fn new(rx: oneshot::Receiver<StreamResult<()>>) -> Self {
        Self { rx }
    }
}

impl Future for WriteAck {
    type Output = StreamResult<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(StreamError::Closed)))
    }
}

/// Single-owner writer handle. Submissions return immediately with an ack
/// future; the `ready()` gate is the advisory backpressure signal. Once
/// released (explicitly or by drop) every operation fails with
/// [`StreamError::Released`], and pending `ready`/`closed` waiters are woken
/// with that error.
pub struct StreamWriter<T> {
    pub(crate) inner: Arc<WritableInner<T>>,
    released: watch::Sender<bool>,
}

impl<T: Send + 'static> StreamWriter<T> {
    pub(crate) fn new(inner: Arc<WritableInner<T>>) -> Self {
        let (released, _) = watch::channel(false);
        Self { inner, released }
    }

    fn check_released(&self) -> StreamResult<()> {
        if *self.released.borrow() {
            Err(StreamError::Released)
        } else {
            Ok(())
        }
    }

    /// Submit a chunk. The chunk is accepted into the queue immediately; the
    /// returned ack settles when the sink call for it does.
    pub fn write(&self, chunk: T) -> StreamResult<WriteAck> {
        self.check_released()?;
        Ok(WriteAck::new(self.inner.write(chunk)?))
    }

    /// Request a close. The returned ack settles once the queue has drained
    /// and the sink's `close` has run.
    pub fn close(&self) -> StreamResult<WriteAck> {
        self.check_released()?;
        Ok(WriteAck::new(self.inner.close()?))
    }

    /// Abort the stream, short-circuiting queued writes.
    pub async fn abort(&self, reason: Option<StreamError>) -> StreamResult<()> {
        self.check_released()?;
        self.inner.clone().abort(reason).await
    }

    /// Resolves when the stream can absorb another chunk without crossing
    /// the high-water mark. Rejected once the stream errors or this writer
    /// is released.
    pub async fn ready(&self) -> StreamResult<()> {
        let mut released = self.released.subscribe();
        let mut gate = self.inner.ready.subscribe();
        loop {
            if *released.borrow() {
                return Err(StreamError::Released);
            }
            match gate.borrow_and_update().clone() {
                ReadyGate::Ready => return Ok(()),
                ReadyGate::Rejected(e) => return Err(e),
                ReadyGate::Pending => {}
            }
            tokio::select! {
                res = gate.changed() => {
                    if res.is_err() {
                        return Err(StreamError::Closed);
                    }
                }
                _ = released.changed() => {}
            }
        }
    }

    /// Resolves once the stream closes, or with the cause once it errors or
    /// this writer is released.
    pub async fn closed(&self) -> StreamResult<()> {
        let mut released = self.released.subscribe();
        let mut closed = self.inner.closed.subscribe();
        loop {
            if *released.borrow() {
                return Err(StreamError::Released);
            }
            if let Some(settled) = closed.borrow_and_update().clone() {
                return settled;
            }
            tokio::select! {
                res = closed.changed() => {
                    if res.is_err() {
                        return Err(StreamError::Closed);
                    }
                }
                _ = released.changed() => {}
            }
        }
    }

    pub fn desired_size(&self) -> Option<f64> {
        self.inner.desired_size()
    }

    /// Release the stream's lock, waking pending `ready`/`closed` waiters
    /// with [`StreamError::Released`]. Idempotent; also performed on drop.
    pub fn release(&self) {
        if !self.released.send_replace(true) {
            self.inner.release_handle();
        }
    }
}

impl<T> Drop for StreamWriter<T> {
    fn drop(&mut self) {
        if !self.released.send_replace(true) {
            self.inner.release_handle();
        }
    }
}
