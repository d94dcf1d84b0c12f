//! Push-based writable stream: the sink wrapper, its pending-write queue, and
//! the writable-side state machine.

use crate::errors::{StreamError, StreamResult};
use crate::queue::SizeMirror;
use crate::strategy::{CountQueuingStrategy, QueuingStrategy};
use crate::{SpawnFn, default_spawner};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

mod controller;
mod writer;

pub use controller::WritableController;
pub use writer::{StreamWriter, WriteAck};

/// Writable consumer contract. `write` is mandatory; the rest default to
/// no-ops.
#[async_trait]
pub trait Sink<T>: Send {
    /// Called exactly once, right after construction.
    async fn start(&mut self, ctrl: &WritableController) -> StreamResult<()> {
        let _ = ctrl;
        Ok(())
    }

    /// Called once per accepted chunk, strictly serialized: the call for
    /// chunk *n+1* is not issued until chunk *n* has settled.
    async fn write(&mut self, chunk: T, ctrl: &WritableController) -> StreamResult<()>;

    /// Called once, after the queue has drained following a close request.
    async fn close(&mut self) -> StreamResult<()> {
        Ok(())
    }

    /// Called at most once, when the stream is aborted.
    async fn abort(&mut self, reason: Option<StreamError>) -> StreamResult<()> {
        let _ = reason;
        Ok(())
    }
}

pub(crate) const TAG_WRITABLE: u8 = 0;
pub(crate) const TAG_CLOSED: u8 = 1;
pub(crate) const TAG_ERRORED: u8 = 2;
pub(crate) const TAG_ERRORING: u8 = 3;

/// `Writable → Erroring → Errored` or `Writable → Closed`; the last two are
/// terminal. `Erroring` exists so an in-flight sink call can settle before
/// the cause is published to `closed()` observers.
pub(crate) enum WritePhase {
    Writable,
    Erroring(StreamError),
    Errored(StreamError),
    Closed,
}

/// State of the writer's `ready` gate, broadcast over a watch channel so the
/// gate can re-arm each time backpressure crosses the high-water mark.
#[derive(Clone)]
pub(crate) enum ReadyGate {
    Ready,
    Pending,
    Rejected(StreamError),
}

pub(crate) struct QueuedWrite<T> {
    chunk: T,
    size: f64,
    ack: oneshot::Sender<StreamResult<()>>,
}

pub(crate) struct WriteState<T> {
    pub(crate) phase: WritePhase,
    queue: VecDeque<QueuedWrite<T>>,
    /// Queued plus in-flight size; an in-flight chunk keeps counting until
    /// its sink call settles.
    total: f64,
    in_flight: bool,
    started: bool,
    close_requested: bool,
    close_started: bool,
    close_ack: Option<oneshot::Sender<StreamResult<()>>>,
    backpressure: bool,
    pub(crate) locked: bool,
}

pub(crate) struct WritableInner<T> {
    pub(crate) state: Mutex<WriteState<T>>,
    pub(crate) state_tag: AtomicU8,
    pub(crate) queue_total: SizeMirror,
    pub(crate) strategy: Arc<dyn QueuingStrategy<T>>,
    pub(crate) sink: AsyncMutex<Box<dyn Sink<T>>>,
    pub(crate) closed: watch::Sender<Option<StreamResult<()>>>,
    pub(crate) ready: watch::Sender<ReadyGate>,
    pub(crate) abort_token: CancellationToken,
    pub(crate) abort_reason: Arc<Mutex<Option<StreamError>>>,
    pub(crate) spawner: SpawnFn,
}

enum Job<T> {
    Write(QueuedWrite<T>),
    Close,
}

impl<T: Send + 'static> WritableInner<T> {
    fn new(
        sink: Box<dyn Sink<T>>,
        strategy: Arc<dyn QueuingStrategy<T>>,
        spawner: SpawnFn,
    ) -> Arc<Self> {
        let (closed, _) = watch::channel(None);
        let initial_gate = if strategy.high_water_mark() > 0.0 {
            ReadyGate::Ready
        } else {
            ReadyGate::Pending
        };
        let (ready, _) = watch::channel(initial_gate);
        let inner = Arc::new(Self {
            state: Mutex::new(WriteState {
                phase: WritePhase::Writable,
                queue: VecDeque::new(),
                total: 0.0,
                in_flight: false,
                started: false,
                close_requested: false,
                close_started: false,
                close_ack: None,
                backpressure: strategy.high_water_mark() <= 0.0,
                locked: false,
            }),
            state_tag: AtomicU8::new(TAG_WRITABLE),
            queue_total: SizeMirror::new(),
            strategy,
            sink: AsyncMutex::new(sink),
            closed,
            ready,
            abort_token: CancellationToken::new(),
            abort_reason: Arc::new(Mutex::new(None)),
            spawner,
        });
        inner.spawn_start();
        inner
    }

    fn spawn_start(self: &Arc<Self>) {
        let inner = self.clone();
        (self.spawner)(Box::pin(async move {
            let ctrl = WritableController::new(&inner);
            let res = {
                let mut sink = inner.sink.lock().await;
                sink.start(&ctrl).await
            };
            match res {
                Ok(()) => {
                    {
                        let mut s = inner.state.lock().unwrap();
                        s.started = true;
                    }
                    inner.advance();
                }
                Err(e) => {
                    debug!("sink start failed: {}", e);
                    inner.error(e);
                }
            }
        }));
    }

    /// Accept a chunk into the pending-write queue. Returns the ack channel
    /// without awaiting it; delivery to the sink happens through `advance`.
    pub(crate) fn write(self: &Arc<Self>, chunk: T) -> StreamResult<oneshot::Receiver<StreamResult<()>>> {
        let rx = {
            let mut s = self.state.lock().unwrap();
            match &s.phase {
                WritePhase::Erroring(e) | WritePhase::Errored(e) => return Err(e.clone()),
                WritePhase::Closed => return Err(StreamError::Closed),
                WritePhase::Writable => {}
            }
            if s.close_requested {
                return Err(StreamError::Closing);
            }
            let size = self.strategy.size(&chunk);
            let (tx, rx) = oneshot::channel();
            s.queue.push_back(QueuedWrite {
                chunk,
                size,
                ack: tx,
            });
            s.total += size;
            self.queue_total.store(s.total);
            if !s.backpressure && self.strategy.high_water_mark() - s.total <= 0.0 {
                trace!("backpressure engaged at total {}", s.total);
                s.backpressure = true;
                self.ready.send_replace(ReadyGate::Pending);
            }
            rx
        };
        self.advance();
        Ok(rx)
    }

    /// Request a close. The sink's `close` runs once the queue drains; the
    /// returned channel settles with its outcome.
    pub(crate) fn close(self: &Arc<Self>) -> StreamResult<oneshot::Receiver<StreamResult<()>>> {
        let rx = {
            let mut s = self.state.lock().unwrap();
            match &s.phase {
                WritePhase::Erroring(e) | WritePhase::Errored(e) => return Err(e.clone()),
                WritePhase::Closed => return Err(StreamError::Closed),
                WritePhase::Writable => {}
            }
            if s.close_requested {
                return Err(StreamError::Closing);
            }
            s.close_requested = true;
            let (tx, rx) = oneshot::channel();
            s.close_ack = Some(tx);
            rx
        };
        self.advance();
        Ok(rx)
    }

    /// Deliver the next pending write (or the deferred close) to the sink,
    /// one at a time, in submission order.
    pub(crate) fn advance(self: &Arc<Self>) {
        let job = {
            let mut s = self.state.lock().unwrap();
            if !s.started || s.in_flight {
                return;
            }
            match &s.phase {
                WritePhase::Writable => {}
                WritePhase::Erroring(e) => {
                    let e = e.clone();
                    self.finalize_errored(&mut s, e);
                    return;
                }
                _ => return,
            }
            if let Some(w) = s.queue.pop_front() {
                s.in_flight = true;
                Job::Write(w)
            } else if s.close_requested && !s.close_started {
                s.close_started = true;
                s.in_flight = true;
                Job::Close
            } else {
                return;
            }
        };
        let inner = self.clone();
        (self.spawner)(Box::pin(async move {
            match job {
                Job::Write(QueuedWrite { chunk, size, ack }) => {
                    let ctrl = WritableController::new(&inner);
                    let res = {
                        let mut sink = inner.sink.lock().await;
                        sink.write(chunk, &ctrl).await
                    };
                    {
                        let mut s = inner.state.lock().unwrap();
                        s.in_flight = false;
                        s.total -= size;
                        if s.queue.is_empty() {
                            s.total = 0.0;
                        }
                        inner.queue_total.store(s.total);
                        match res {
                            Ok(()) => {
                                let _ = ack.send(Ok(()));
                                if s.backpressure
                                    && matches!(s.phase, WritePhase::Writable)
                                    && inner.strategy.high_water_mark() - s.total > 0.0
                                {
                                    trace!("backpressure cleared at total {}", s.total);
                                    s.backpressure = false;
                                    inner.ready.send_replace(ReadyGate::Ready);
                                }
                            }
                            Err(e) => {
                                let _ = ack.send(Err(e.clone()));
                                inner.begin_erroring(&mut s, e);
                            }
                        }
                    }
                    inner.advance();
                }
                Job::Close => {
                    let res = {
                        let mut sink = inner.sink.lock().await;
                        sink.close().await
                    };
                    {
                        let mut s = inner.state.lock().unwrap();
                        s.in_flight = false;
                        let ack = s.close_ack.take();
                        match res {
                            Ok(()) => {
                                trace!("writable stream closed");
                                s.phase = WritePhase::Closed;
                                inner.state_tag.store(TAG_CLOSED, Ordering::Release);
                                inner.settle_closed(Ok(()));
                                if let Some(ack) = ack {
                                    let _ = ack.send(Ok(()));
                                }
                            }
                            Err(e) => {
                                if let Some(ack) = ack {
                                    let _ = ack.send(Err(e.clone()));
                                }
                                inner.begin_erroring(&mut s, e);
                            }
                        }
                    }
                    inner.advance();
                }
            }
        }));
    }

    /// Move to `Erroring`: reject every queued write and arm the gates. The
    /// terminal `Errored` state is published once no sink call is in flight.
    pub(crate) fn begin_erroring(&self, s: &mut WriteState<T>, cause: StreamError) {
        if !matches!(s.phase, WritePhase::Writable) {
            return;
        }
        debug!("writable stream erroring: {}", cause);
        s.phase = WritePhase::Erroring(cause.clone());
        self.state_tag.store(TAG_ERRORING, Ordering::Release);
        for w in s.queue.drain(..) {
            let _ = w.ack.send(Err(cause.clone()));
        }
        s.total = 0.0;
        self.queue_total.store(0.0);
        if let Some(ack) = s.close_ack.take() {
            let _ = ack.send(Err(cause.clone()));
        }
        self.ready.send_replace(ReadyGate::Rejected(cause.clone()));
        if !s.in_flight {
            self.finalize_errored(s, cause);
        }
    }

    fn finalize_errored(&self, s: &mut WriteState<T>, cause: StreamError) {
        s.phase = WritePhase::Errored(cause.clone());
        self.state_tag.store(TAG_ERRORED, Ordering::Release);
        self.settle_closed(Err(cause));
    }

    /// The `closed()` cell settles exactly once.
    fn settle_closed(&self, result: StreamResult<()>) {
        self.closed.send_if_modified(|v| {
            if v.is_none() {
                *v = Some(result);
                true
            } else {
                false
            }
        });
    }

    /// Error the stream from the controller or an observer. Idempotent.
    pub(crate) fn error(self: &Arc<Self>, cause: StreamError) {
        let mut s = self.state.lock().unwrap();
        self.begin_erroring(&mut s, cause);
    }

    /// Abort: short-circuit the drain order, reject queued writes, run the
    /// sink's `abort`, and land in `Errored` once it settles.
    pub(crate) async fn abort(self: Arc<Self>, reason: Option<StreamError>) -> StreamResult<()> {
        let cause = StreamError::aborted(reason.clone());
        {
            let mut s = self.state.lock().unwrap();
            match &s.phase {
                WritePhase::Closed => return Ok(()),
                WritePhase::Erroring(_) | WritePhase::Errored(_) => return Ok(()),
                WritePhase::Writable => {}
            }
            debug!("aborting writable stream");
            *self.abort_reason.lock().unwrap() = Some(cause.clone());
            self.begin_erroring(&mut s, cause);
        }
        self.abort_token.cancel();
        let res = {
            let mut sink = self.sink.lock().await;
            sink.abort(reason).await
        };
        {
            let mut s = self.state.lock().unwrap();
            if let WritePhase::Erroring(e) = &s.phase {
                let e = e.clone();
                self.finalize_errored(&mut s, e);
            }
        }
        res
    }

    /// `Some(hwm - pending)` while writable, `Some(0)` when closed, `None`
    /// while erroring or errored. Lock-free.
    pub(crate) fn desired_size(&self) -> Option<f64> {
        match self.state_tag.load(Ordering::Acquire) {
            TAG_WRITABLE => Some(self.strategy.high_water_mark() - self.queue_total.load()),
            TAG_CLOSED => Some(0.0),
            _ => None,
        }
    }

    pub(crate) fn is_closed_or_closing(&self) -> bool {
        if self.state_tag.load(Ordering::Acquire) == TAG_CLOSED {
            return true;
        }
        self.state.lock().unwrap().close_requested
    }

    pub(crate) fn error_cause(&self) -> Option<StreamError> {
        match self.state_tag.load(Ordering::Acquire) {
            TAG_ERRORED | TAG_ERRORING => {}
            _ => return None,
        }
        match &self.state.lock().unwrap().phase {
            WritePhase::Erroring(e) | WritePhase::Errored(e) => Some(e.clone()),
            _ => None,
        }
    }
}

// Unbounded impl: called from `Drop`, which cannot add bounds.
impl<T> WritableInner<T> {
    pub(crate) fn lock_handle(&self) -> StreamResult<()> {
        let mut s = self.state.lock().unwrap();
        if s.locked {
            return Err(StreamError::Locked);
        }
        s.locked = true;
        Ok(())
    }

    pub(crate) fn release_handle(&self) {
        self.state.lock().unwrap().locked = false;
    }
}

/// Push-based sink wrapper. Accepted chunks queue up and are delivered to
/// the sink one at a time; backpressure is advisory, surfaced through the
/// writer's `ready()` gate rather than by blocking `write`. Must be
/// constructed inside an async runtime unless a custom spawner is supplied.
pub struct WritableStream<T> {
    pub(crate) inner: Arc<WritableInner<T>>,
}

impl<T: Send + 'static> WritableStream<T> {
    /// Shorthand for `builder(sink).build()`.
    pub fn new(sink: impl Sink<T> + 'static) -> Self {
        Self::builder(sink).build()
    }

    pub fn builder(sink: impl Sink<T> + 'static) -> WritableStreamBuilder<T> {
        WritableStreamBuilder {
            sink: Box::new(sink),
            strategy: None,
            spawner: None,
        }
    }

    /// Acquire the single writer handle. Fails while another handle is live.
    pub fn writer(&self) -> StreamResult<StreamWriter<T>> {
        self.inner.lock_handle()?;
        Ok(StreamWriter::new(self.inner.clone()))
    }

    pub fn is_locked(&self) -> bool {
        self.inner.state.lock().unwrap().locked
    }

    pub fn desired_size(&self) -> Option<f64> {
        self.inner.desired_size()
    }

    /// Close the stream without going through a writer. Fails with
    /// [`StreamError::Locked`] while a writer handle is live.
    pub async fn close(&self) -> StreamResult<()> {
        if self.is_locked() {
            return Err(StreamError::Locked);
        }
        let rx = self.inner.close()?;
        rx.await.map_err(|_| StreamError::Closed)?
    }

    /// Abort the stream without going through a writer.
    pub async fn abort(&self, reason: Option<StreamError>) -> StreamResult<()> {
        if self.is_locked() {
            return Err(StreamError::Locked);
        }
        self.inner.clone().abort(reason).await
    }

    /// Resolves once the stream closes, or with the cause once it errors.
    pub async fn closed(&self) -> StreamResult<()> {
        let mut rx = self.inner.closed.subscribe();
        let settled = rx
            .wait_for(|v| v.is_some())
            .await
            .map_err(|_| StreamError::Closed)?;
        settled.clone().unwrap_or(Ok(()))
    }
}

/// Builder for [`WritableStream`] with strategy and spawner seams.
pub struct WritableStreamBuilder<T> {
    sink: Box<dyn Sink<T>>,
    strategy: Option<Arc<dyn QueuingStrategy<T>>>,
    spawner: Option<SpawnFn>,
}

impl<T: Send + 'static> WritableStreamBuilder<T> {
    pub fn strategy(mut self, strategy: impl QueuingStrategy<T> + 'static) -> Self {
        self.strategy = Some(Arc::new(strategy));
        self
    }

    /// Replace `tokio::spawn` as the executor for sink callbacks.
    pub fn spawner(mut self, spawner: SpawnFn) -> Self {
        self.spawner = Some(spawner);
        self
    }

    pub fn build(self) -> WritableStream<T> {
        let strategy = self
            .strategy
            .unwrap_or_else(|| Arc::new(CountQueuingStrategy::new(1.0)));
        let spawner = self.spawner.unwrap_or_else(default_spawner);
        WritableStream {
            inner: WritableInner::new(self.sink, strategy, spawner),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Records every sink interaction; shared by the writable and pipe tests.
    pub(crate) struct RecordingSink<T> {
        pub log: Arc<StdMutex<Vec<String>>>,
        pub chunks: Arc<StdMutex<Vec<T>>>,
        pub fail_write: bool,
    }

    impl<T> RecordingSink<T> {
        pub fn new() -> (Self, Arc<StdMutex<Vec<String>>>, Arc<StdMutex<Vec<T>>>) {
            let log = Arc::new(StdMutex::new(Vec::new()));
            let chunks = Arc::new(StdMutex::new(Vec::new()));
            (
                Self {
                    log: log.clone(),
                    chunks: chunks.clone(),
                    fail_write: false,
                },
                log,
                chunks,
            )
        }
    }

    #[async_trait]
    impl<T: Send + std::fmt::Debug + 'static> Sink<T> for RecordingSink<T> {
        async fn write(&mut self, chunk: T, _ctrl: &WritableController) -> StreamResult<()> {
            if self.fail_write {
                return Err("sink write failed".into());
            }
            self.log.lock().unwrap().push(format!("write {:?}", chunk));
            self.chunks.lock().unwrap().push(chunk);
            Ok(())
        }

        async fn close(&mut self) -> StreamResult<()> {
            self.log.lock().unwrap().push("close".into());
            Ok(())
        }

        async fn abort(&mut self, reason: Option<StreamError>) -> StreamResult<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("abort {:?}", reason.map(|r| r.to_string())));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_writes_reach_sink_in_order() {
        let (sink, log, _) = RecordingSink::new();
        let stream = WritableStream::new(sink);
        let writer = stream.writer().unwrap();
        writer.write(1).unwrap().await.unwrap();
        writer.write(2).unwrap().await.unwrap();
        writer.close().unwrap().await.unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["write 1", "write 2", "close"]
        );
        assert_eq!(stream.desired_size(), Some(0.0));
    }

    #[tokio::test]
    async fn test_second_writer_fails_until_release() {
        let (sink, _, _) = RecordingSink::<u32>::new();
        let stream = WritableStream::new(sink);
        let writer = stream.writer().unwrap();
        assert!(matches!(stream.writer(), Err(StreamError::Locked)));
        writer.release();
        assert!(stream.writer().is_ok());
    }

    #[tokio::test]
    async fn test_write_after_close_request_fails() {
        let (sink, _, _) = RecordingSink::<u32>::new();
        let stream = WritableStream::new(sink);
        let writer = stream.writer().unwrap();
        let close = writer.close().unwrap();
        assert!(matches!(writer.write(1), Err(StreamError::Closing)));
        close.await.unwrap();
        assert!(matches!(writer.write(2), Err(StreamError::Closed)));
    }

    #[tokio::test]
    async fn test_failed_write_errors_stream() {
        let (mut sink, _, _) = RecordingSink::<u32>::new();
        sink.fail_write = true;
        let stream = WritableStream::new(sink);
        let writer = stream.writer().unwrap();
        let err = writer.write(1).unwrap().await.unwrap_err();
        assert_eq!(err, "sink write failed".into());
        assert!(stream.desired_size().is_none());
        assert_eq!(writer.closed().await.unwrap_err(), "sink write failed".into());
    }

    #[tokio::test]
    async fn test_abort_rejects_queued_writes() {
        use tokio::sync::Semaphore;
        struct StalledSink {
            gate: Arc<Semaphore>,
        }
        #[async_trait]
        impl Sink<u32> for StalledSink {
            async fn write(&mut self, _chunk: u32, _ctrl: &WritableController) -> StreamResult<()> {
                let _ = self.gate.acquire().await;
                Ok(())
            }
        }
        let gate = Arc::new(Semaphore::new(0));
        let stream = WritableStream::new(StalledSink { gate: gate.clone() });
        let writer = stream.writer().unwrap();
        let first = writer.write(1).unwrap();
        let second = writer.write(2).unwrap();
        // abort waits on the sink's in-flight write; run it alongside
        let abort = tokio::spawn(async move {
            writer.abort(Some("fed up".into())).await.unwrap();
        });
        // the queued (never submitted) write observes the abort cause
        // before the in-flight write unblocks
        let err = second.await.unwrap_err();
        assert_eq!(err, StreamError::aborted(Some("fed up".into())));
        gate.add_permits(1);
        // the in-flight write settles on its own terms
        let _ = first.await;
        abort.await.unwrap();
        assert!(stream.desired_size().is_none());
    }
}
