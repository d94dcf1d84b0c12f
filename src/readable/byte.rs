//! Byte-oriented extras for `ReadableStream<Bytes>`: `read_into` and the
//! summarized BYOB request. Same state machine as the default mode; only the
//! buffer handling differs.

use super::reader::StreamReader;
use super::{PullState, ReadableInner, StreamPhase};
use crate::errors::{StreamError, StreamResult};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tracing::trace;

pub(crate) enum ByteReadOutcome {
    Ready(StreamResult<usize>),
    Pending(tokio::sync::oneshot::Receiver<StreamResult<Option<Bytes>>>),
}

impl ReadableInner<Bytes> {
    /// Synchronous half of `read_into`: copy queued bytes, re-queueing any
    /// leftover at the front, or register a buffer-capacity waiter.
    pub(super) fn begin_read_into(&self, buf: &mut [u8]) -> ByteReadOutcome {
        let mut s = self.state.lock().unwrap();
        match &s.phase {
            StreamPhase::Errored(e) => ByteReadOutcome::Ready(Err(e.clone())),
            StreamPhase::Closed => ByteReadOutcome::Ready(Ok(0)),
            StreamPhase::Readable => {
                if let Some((chunk, _size)) = s.queue.pop() {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        let rest = chunk.slice(n..);
                        let size = self.strategy.size(&rest);
                        s.queue.push_front(rest, size);
                    }
                    self.queue_total.store(s.queue.total());
                    if s.queue.is_empty() && s.pull == PullState::Closing {
                        self.finalize_closed(&mut s);
                    }
                    ByteReadOutcome::Ready(Ok(n))
                } else {
                    let (tx, rx) = tokio::sync::oneshot::channel();
                    s.waiters.push_back(super::ReadWaiter {
                        tx,
                        byob_capacity: Some(buf.len()),
                    });
                    ByteReadOutcome::Pending(rx)
                }
            }
        }
    }

}

impl StreamReader<Bytes> {
    /// Fill `buf` with the next queued bytes. Returns the number copied, or
    /// `0` once the stream has closed. Bytes beyond `buf`'s capacity stay
    /// queued for the next read.
    pub async fn read_into(&self, buf: &mut [u8]) -> StreamResult<usize> {
        self.check_released()?;
        if buf.is_empty() {
            return Ok(0);
        }
        // Tail left behind by an earlier read_into comes first.
        {
            let mut slot = self.leftover.lock().unwrap();
            if let Some(chunk) = slot.take() {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    *slot = Some(chunk.slice(n..));
                }
                return Ok(n);
            }
        }
        let outcome = self.inner.begin_read_into(buf);
        self.inner.maybe_pull();
        let rx = match outcome {
            ByteReadOutcome::Ready(res) => return res,
            ByteReadOutcome::Pending(rx) => rx,
        };
        match rx.await.map_err(|_| StreamError::Closed)?? {
            None => Ok(0),
            Some(chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    trace!("holding {} leftover bytes on the reader", chunk.len() - n);
                    *self.leftover.lock().unwrap() = Some(chunk.slice(n..));
                }
                Ok(n)
            }
        }
    }
}

/// View of the oldest waiting `read_into` caller, exposed to byte-mode
/// sources via `ReadableController::byob_request`. The source fills
/// [`buffer`](Self::buffer) and calls [`respond`](Self::respond); the bytes
/// go straight to the waiter instead of through the chunk queue.
pub struct ByobRequest {
    inner: Arc<ReadableInner<Bytes>>,
    buf: BytesMut,
}

impl ByobRequest {
    pub(super) fn for_front_waiter(inner: &Arc<ReadableInner<Bytes>>) -> Option<Self> {
        let s = inner.state.lock().unwrap();
        let cap = s.waiters.front()?.byob_capacity?;
        drop(s);
        Some(Self {
            inner: inner.clone(),
            buf: BytesMut::zeroed(cap),
        })
    }

    /// The waiter's requested capacity, writable by the source.
    pub fn buffer(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Hand the first `n` filled bytes to the waiter. Falls back to the
    /// chunk queue if the waiter gave up in the meantime. `n` must be at
    /// least 1: an empty delivery would read as end-of-stream, which sources
    /// signal through the controller's `close` instead.
    pub fn respond(mut self, n: usize) -> StreamResult<()> {
        if n == 0 {
            return Err(StreamError::from("byob respond requires at least one byte"));
        }
        let n = n.min(self.buf.len());
        let chunk = self.buf.split_to(n).freeze();
        let mut s = self.inner.state.lock().unwrap();
        match &s.phase {
            StreamPhase::Errored(e) => return Err(e.clone()),
            StreamPhase::Closed => return Err(StreamError::Closed),
            StreamPhase::Readable => {}
        }
        match s.waiters.pop_front() {
            Some(w) => {
                let _ = w.tx.send(Ok(Some(chunk)));
                Ok(())
            }
            None => {
                drop(s);
                self.inner.enqueue(chunk)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readable::{ReadableController, ReadableStream, Source};
    use crate::strategy::ByteLengthQueuingStrategy;
    use async_trait::async_trait;

    struct StaticBytes(Vec<Bytes>);

    #[async_trait]
    impl Source<Bytes> for StaticBytes {
        async fn start(&mut self, ctrl: &ReadableController<Bytes>) -> StreamResult<()> {
            for chunk in self.0.drain(..) {
                ctrl.enqueue(chunk)?;
            }
            ctrl.close()?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_read_into_requeues_leftover() {
        let stream = ReadableStream::builder(StaticBytes(vec![Bytes::from_static(b"hello")]))
            .strategy(ByteLengthQueuingStrategy::new(16.0))
            .byte_mode()
            .build();
        let reader = stream.reader().unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(reader.read_into(&mut buf).await.unwrap(), 3);
        assert_eq!(&buf, b"hel");
        assert_eq!(reader.read_into(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"lo");
        // queue drained and source closed
        assert_eq!(reader.read_into(&mut buf).await.unwrap(), 0);
    }

    struct ByobSource;

    #[async_trait]
    impl Source<Bytes> for ByobSource {
        async fn pull(&mut self, ctrl: &ReadableController<Bytes>) -> StreamResult<()> {
            match ctrl.byob_request() {
                Some(mut req) => {
                    let len = req.buffer().len().min(4);
                    req.buffer()[..len].copy_from_slice(&b"data"[..len]);
                    req.respond(len)
                }
                None => ctrl.enqueue(Bytes::from_static(b"queued")),
            }
        }
    }

    #[tokio::test]
    async fn test_byob_request_fills_waiting_buffer() {
        // hwm 0: pulls fire only for a waiting read, so the BYOB request is
        // guaranteed to be present when pull runs.
        let stream = ReadableStream::builder(ByobSource)
            .strategy(crate::strategy::CountQueuingStrategy::new(0.0))
            .byte_mode()
            .build();
        let reader = stream.reader().unwrap();
        let mut buf = [0u8; 4];
        let n = reader.read_into(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &b"data"[..n]);
    }

    #[tokio::test]
    async fn test_byob_respond_zero_is_rejected() {
        struct ZeroResponder;

        #[async_trait]
        impl Source<Bytes> for ZeroResponder {
            async fn pull(&mut self, ctrl: &ReadableController<Bytes>) -> StreamResult<()> {
                if let Some(req) = ctrl.byob_request() {
                    assert!(req.respond(0).is_err());
                    ctrl.enqueue(Bytes::from_static(b"x"))?;
                }
                Ok(())
            }
        }

        let stream = ReadableStream::builder(ZeroResponder)
            .strategy(crate::strategy::CountQueuingStrategy::new(0.0))
            .byte_mode()
            .build();
        let reader = stream.reader().unwrap();
        let mut buf = [0u8; 4];
        // a zero-byte response must not read as end-of-stream
        assert_eq!(reader.read_into(&mut buf).await.unwrap(), 1);
        assert_eq!(&buf[..1], b"x");
    }

    #[tokio::test]
    async fn test_default_mode_has_no_byob_request() {
        let stream = ReadableStream::new(StaticBytes(vec![]));
        let ctrl = stream.controller();
        assert!(ctrl.byob_request().is_none());
    }
}
