//! Readable → writable transfer with backpressure propagation, abort-signal
//! handling, and three-way shutdown.

use crate::errors::{StreamError, StreamResult};
use crate::readable::{ReadableStream, StreamReader};
use crate::writable::{StreamWriter, WritableStream, WriteAck};
use futures::FutureExt;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// The terminal condition that won the race, checked in fixed priority
/// order after every transfer step.
enum Shutdown {
    SourceErrored(StreamError),
    DestErrored(StreamError),
    SourceClosed,
    DestClosed,
    Aborted,
}

/// Builder-style pipe between one readable and one writable stream.
///
/// Holds both the reader and the writer for the duration of the transfer;
/// both locks are released when the pipe settles. `execute` resolves `Ok` on
/// clean completion and otherwise rejects with the error of whichever
/// endpoint failed first, the other endpoint receiving a derived
/// abort/cancel reason unless suppressed by the `prevent_*` flags.
pub struct PipeOperation<T> {
    reader: StreamReader<T>,
    writer: StreamWriter<T>,
    prevent_close: bool,
    prevent_abort: bool,
    prevent_cancel: bool,
    signal: Option<CancellationToken>,
}

impl<T: Send + 'static> PipeOperation<T> {
    /// Lock both endpoints. Fails if either is already locked.
    pub fn new(source: &ReadableStream<T>, dest: &WritableStream<T>) -> StreamResult<Self> {
        let reader = source.reader()?;
        let writer = dest.writer()?;
        Ok(Self {
            reader,
            writer,
            prevent_close: false,
            prevent_abort: false,
            prevent_cancel: false,
            signal: None,
        })
    }

    /// Leave the destination open when the source closes.
    pub fn prevent_close(mut self) -> Self {
        self.prevent_close = true;
        self
    }

    /// Leave the destination alone when the source errors.
    pub fn prevent_abort(mut self) -> Self {
        self.prevent_abort = true;
        self
    }

    /// Leave the source alone when the destination errors or closes.
    pub fn prevent_cancel(mut self) -> Self {
        self.prevent_cancel = true;
        self
    }

    /// Cancellation token that aborts the transfer; races the loop, and an
    /// already-cancelled token shuts down before any chunk moves.
    pub fn abort_signal(mut self, token: CancellationToken) -> Self {
        self.signal = Some(token);
        self
    }

    /// Run the transfer loop until a terminal condition fires, then perform
    /// the applicable shutdown exactly once.
    pub async fn execute(self) -> StreamResult<()> {
        let signal = self.signal.clone();
        let mut pending: FuturesUnordered<WriteAck> = FuturesUnordered::new();
        let cond = loop {
            // race checks, fixed priority order
            if let Some(cond) = self.check() {
                break cond;
            }
            if let Some(sig) = &signal
                && sig.is_cancelled()
            {
                break Shutdown::Aborted;
            }
            // backpressure: hold off while the destination is saturated
            if matches!(self.writer.desired_size(), Some(d) if d <= 0.0) {
                tokio::select! {
                    res = self.writer.ready() => {
                        trace!("pipe resumed, writer ready: {:?}", res.is_ok());
                    }
                    Some(_) = pending.next(), if !pending.is_empty() => {}
                    _ = wait_cancelled(&signal) => break Shutdown::Aborted,
                }
                continue; // re-evaluate conditions after any wakeup
            }
            // move one chunk; never await the write ack inline, so reads can
            // run ahead up to the destination's own buffering
            tokio::select! {
                res = self.reader.read() => match res {
                    Ok(Some(chunk)) => {
                        match self.writer.write(chunk) {
                            Ok(ack) => pending.push(ack),
                            // destination state changed; next check() decides
                            Err(e) => trace!("pipe write rejected: {}", e),
                        }
                        // surface sink failures promptly
                        while let Some(Some(res)) = pending.next().now_or_never() {
                            if res.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(None) => break Shutdown::SourceClosed,
                    Err(e) => break Shutdown::SourceErrored(e),
                },
                Some(res) = pending.next(), if !pending.is_empty() => {
                    if let Err(e) = res {
                        trace!("pipe write failed mid-transfer: {}", e);
                    }
                }
                _ = wait_cancelled(&signal) => break Shutdown::Aborted,
            }
        };
        self.shutdown(cond, pending).await
    }

    /// Terminal-condition check, run once per loop iteration. A source error
    /// outranks a destination error, which outranks either side closing; the
    /// first true condition wins.
    fn check(&self) -> Option<Shutdown> {
        if let Some(e) = self.reader.inner.error_cause() {
            return Some(Shutdown::SourceErrored(e));
        }
        if let Some(e) = self.writer.inner.error_cause() {
            return Some(Shutdown::DestErrored(e));
        }
        if self.reader.inner.is_closed() {
            return Some(Shutdown::SourceClosed);
        }
        if self.writer.inner.is_closed_or_closing() {
            return Some(Shutdown::DestClosed);
        }
        None
    }

    async fn shutdown(
        self,
        cond: Shutdown,
        mut pending: FuturesUnordered<WriteAck>,
    ) -> StreamResult<()> {
        // wait for pending writes to drain, unless the destination already
        // errored or the transfer was aborted outright
        if matches!(
            cond,
            Shutdown::SourceClosed | Shutdown::DestClosed | Shutdown::SourceErrored(_)
        ) {
            while let Some(res) = pending.next().await {
                if res.is_err() {
                    break;
                }
            }
        }
        let result = match cond {
            Shutdown::SourceErrored(e) => {
                debug!("pipe shutdown: source errored: {}", e);
                if !self.prevent_abort {
                    let _ = self.writer.abort(Some(e.clone())).await;
                }
                Err(e)
            }
            Shutdown::DestErrored(e) => {
                debug!("pipe shutdown: destination errored: {}", e);
                if !self.prevent_cancel {
                    let _ = self.reader.cancel(Some(e.clone())).await;
                }
                Err(e)
            }
            Shutdown::SourceClosed => {
                debug!("pipe shutdown: source closed");
                if self.prevent_close {
                    Ok(())
                } else {
                    match self.writer.close() {
                        Ok(ack) => ack.await,
                        // destination errored while draining; propagate
                        Err(e) => Err(e),
                    }
                }
            }
            Shutdown::DestClosed => {
                debug!("pipe shutdown: destination closed early");
                if !self.prevent_cancel {
                    let _ = self.reader.cancel(Some(StreamError::Closed)).await;
                }
                Err(StreamError::Closed)
            }
            Shutdown::Aborted => {
                debug!("pipe shutdown: abort signal");
                let cause = StreamError::Aborted(None);
                if !self.prevent_abort {
                    let _ = self.writer.abort(None).await;
                }
                if !self.prevent_cancel {
                    let _ = self.reader.cancel(Some(cause.clone())).await;
                }
                Err(cause)
            }
        };
        self.writer.release();
        self.reader.release();
        result
    }
}

impl<T: Send + 'static> ReadableStream<T> {
    /// Pipe every chunk of this stream into `dest`, closing it afterwards.
    pub async fn pipe_to(&self, dest: &WritableStream<T>) -> StreamResult<()> {
        PipeOperation::new(self, dest)?.execute().await
    }
}

async fn wait_cancelled(signal: &Option<CancellationToken>) {
    match signal {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}
