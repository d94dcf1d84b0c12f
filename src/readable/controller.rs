use super::byte::ByobRequest;
use super::{ReadableInner, StreamMode};
use crate::errors::{StreamError, StreamResult};
use bytes::Bytes;
use std::sync::{Arc, Weak};

/// Capability view handed to the user [`Source`](super::Source). Carries no
/// state of its own and forwards to the owning stream's internal operations;
/// it goes inert (every call fails with [`StreamError::Closed`]) once the
/// stream is gone or terminal.
pub struct ReadableController<T> {
    inner: Weak<ReadableInner<T>>,
}

impl<T> Clone for ReadableController<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> ReadableController<T> {
    pub(crate) fn new(inner: &Arc<ReadableInner<T>>) -> Self {
        Self {
            inner: Arc::downgrade(inner),
        }
    }

    fn upgrade(&self) -> StreamResult<Arc<ReadableInner<T>>> {
        self.inner.upgrade().ok_or(StreamError::Closed)
    }

    /// Push a chunk towards the reader. Fails unless the stream is readable
    /// and the source has not signalled closing.
    pub fn enqueue(&self, chunk: T) -> StreamResult<()> {
        self.upgrade()?.enqueue(chunk)
    }

    /// Signal that no more chunks will be produced. Queued chunks still
    /// drain; the stream finalizes once they do.
    pub fn close(&self) -> StreamResult<()> {
        self.upgrade()?.close()
    }

    /// Move the stream to its errored terminal state. Idempotent.
    pub fn error(&self, cause: StreamError) {
        if let Ok(inner) = self.upgrade() {
            inner.error(cause);
        }
    }

    /// Remaining queue room; `None` means errored, stop producing.
    pub fn desired_size(&self) -> Option<f64> {
        self.inner.upgrade().and_then(|inner| inner.desired_size())
    }
}

impl ReadableController<Bytes> {
    /// Byte-mode only: a view of the oldest waiting `read_into` caller, if
    /// any, letting the source fill the caller's buffer without the
    /// intermediate queue.
    pub fn byob_request(&self) -> Option<ByobRequest> {
        let inner = self.inner.upgrade()?;
        if inner.mode != StreamMode::Byte {
            return None;
        }
        ByobRequest::for_front_waiter(&inner)
    }
}
