use super::WritableInner;
use crate::errors::StreamError;
use std::sync::{Arc, Mutex, Weak};
use tokio_util::sync::CancellationToken;

/// Capability view handed to the user [`Sink`](super::Sink). Type-erased so
/// sinks do not carry the stream's chunk type; it goes inert once the stream
/// is gone or terminal.
#[derive(Clone)]
pub struct WritableController {
    error_fn: Arc<dyn Fn(StreamError) + Send + Sync>,
    token: CancellationToken,
    reason: Arc<Mutex<Option<StreamError>>>,
}

impl WritableController {
    pub(super) fn new<T: Send + 'static>(inner: &Arc<WritableInner<T>>) -> Self {
        let weak: Weak<WritableInner<T>> = Arc::downgrade(inner);
        Self {
            error_fn: Arc::new(move |cause| {
                if let Some(inner) = weak.upgrade() {
                    inner.error(cause);
                }
            }),
            token: inner.abort_token.clone(),
            reason: inner.abort_reason.clone(),
        }
    }

    /// Move the stream onto the erroring path. Idempotent.
    pub fn error(&self, cause: StreamError) {
        (self.error_fn)(cause)
    }

    /// Cancellation token fired when the stream is aborted, so a sink can
    /// bail out of a long-running write.
    pub fn signal(&self) -> CancellationToken {
        self.token.clone()
    }

    /// The abort cause, present once [`signal`](Self::signal) has fired.
    pub fn abort_reason(&self) -> Option<StreamError> {
        self.reason.lock().unwrap().clone()
    }
}
