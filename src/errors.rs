use std::io::Error as IoError;
use std::sync::Arc;
use thiserror::Error;

/// Result alias used across the crate.
pub type StreamResult<T> = Result<T, StreamError>;

/// Errors produced by stream operations.
///
/// The first four variants are protocol violations: they are returned
/// synchronously by the call that broke the protocol and never change the
/// stream's state. The remaining variants are terminal causes; once a stream
/// errors, the recorded cause is handed back verbatim to every pending and
/// future observer, which is why the type is `Clone`.
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    /// The stream already has a live reader or writer handle.
    #[error("stream is locked to another reader or writer")]
    Locked,

    /// The reader/writer handle was released; all of its operations fail.
    #[error("handle has been released")]
    Released,

    /// A close has been requested (or the source signalled closing) and the
    /// attempted operation is no longer allowed.
    #[error("stream is closing")]
    Closing,

    /// The stream has reached its `Closed` terminal state.
    #[error("stream is closed")]
    Closed,

    /// The readable side was cancelled, with the caller-supplied reason.
    #[error("stream cancelled{}", display_reason(.0))]
    Cancelled(Option<Arc<StreamError>>),

    /// The writable side was aborted, with the caller-supplied reason.
    #[error("stream aborted{}", display_reason(.0))]
    Aborted(Option<Arc<StreamError>>),

    /// Two reasons combined into one, as produced when both branches of a
    /// tee cancel with their own reasons.
    #[error("{0}; {1}")]
    Composite(Arc<StreamError>, Arc<StreamError>),

    /// A user-supplied reason or failure message.
    #[error("{0}")]
    Custom(Arc<str>),

    /// An I/O failure from one of the `AsyncRead`/`AsyncWrite` adapters.
    #[error("i/o error: {0}")]
    Io(Arc<IoError>),
}

fn display_reason(reason: &Option<Arc<StreamError>>) -> String {
    match reason {
        Some(inner) => format!(": {}", inner),
        None => String::new(),
    }
}

impl StreamError {
    /// Wrap an optional reason as a cancellation cause.
    pub fn cancelled(reason: Option<StreamError>) -> Self {
        StreamError::Cancelled(reason.map(Arc::new))
    }

    /// Wrap an optional reason as an abort cause.
    pub fn aborted(reason: Option<StreamError>) -> Self {
        StreamError::Aborted(reason.map(Arc::new))
    }

    /// Combine two optional cancel reasons the way `tee` does: both present
    /// yields a composite, otherwise whichever is present.
    pub fn composite(a: Option<StreamError>, b: Option<StreamError>) -> Option<StreamError> {
        match (a, b) {
            (Some(a), Some(b)) => Some(StreamError::Composite(Arc::new(a), Arc::new(b))),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }
}

impl From<&str> for StreamError {
    fn from(msg: &str) -> Self {
        StreamError::Custom(Arc::from(msg))
    }
}

impl From<String> for StreamError {
    fn from(msg: String) -> Self {
        StreamError::Custom(Arc::from(msg.as_str()))
    }
}

impl From<IoError> for StreamError {
    fn from(e: IoError) -> Self {
        StreamError::Io(Arc::new(e))
    }
}

impl PartialEq for StreamError {
    fn eq(&self, other: &Self) -> bool {
        use StreamError::*;
        match (self, other) {
            (Locked, Locked) | (Released, Released) | (Closing, Closing) | (Closed, Closed) => {
                true
            }
            (Cancelled(a), Cancelled(b)) | (Aborted(a), Aborted(b)) => a == b,
            (Composite(a1, a2), Composite(b1, b2)) => a1 == b1 && a2 == b2,
            (Custom(a), Custom(b)) => a == b,
            (Io(a), Io(b)) => a.kind() == b.kind(),
            _ => false,
        }
    }
}
