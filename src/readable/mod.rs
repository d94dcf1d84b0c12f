//! Pull-based readable stream: the source wrapper, its chunk queue, and the
//! readable-side state machine.

use crate::errors::{StreamError, StreamResult};
use crate::queue::{ChunkQueue, SizeMirror};
use crate::strategy::{CountQueuingStrategy, QueuingStrategy};
use crate::{SpawnFn, default_spawner};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::{oneshot, watch};
use tracing::{debug, trace};

mod byte;
mod controller;
mod reader;
mod tee;

pub use byte::ByobRequest;
pub use controller::ReadableController;
pub use reader::{IntoStream, StreamReader};

/// Readable producer contract. All methods default to no-ops so plain data
/// sources only implement what they need.
#[async_trait]
pub trait Source<T>: Send {
    /// Called exactly once, right after construction.
    async fn start(&mut self, ctrl: &ReadableController<T>) -> StreamResult<()> {
        let _ = ctrl;
        Ok(())
    }

    /// Called whenever the queue has room and no pull is in flight.
    async fn pull(&mut self, ctrl: &ReadableController<T>) -> StreamResult<()> {
        let _ = ctrl;
        Ok(())
    }

    /// Called at most once, when the stream is cancelled while still readable.
    async fn cancel(&mut self, reason: Option<StreamError>) -> StreamResult<()> {
        let _ = reason;
        Ok(())
    }
}

/// Terminal-state tags mirrored into an atomic so `desired_size` and the
/// pipe's race checks never take the state mutex.
pub(crate) const TAG_ACTIVE: u8 = 0;
pub(crate) const TAG_CLOSED: u8 = 1;
pub(crate) const TAG_ERRORED: u8 = 2;

/// Stream-level state. `Closed` and `Errored` are terminal.
pub(crate) enum StreamPhase {
    Readable,
    Closed,
    Errored(StreamError),
}

/// Source pull state, an independent axis from [`StreamPhase`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PullState {
    /// `start` has not settled yet.
    Uninitialized,
    /// Started, idle.
    Ready,
    /// A `pull` call is in flight.
    Pulling,
    /// A `pull` is in flight and another was requested meanwhile.
    PullAgain,
    /// Close requested while chunks remain queued.
    Closing,
    /// Terminal.
    Closed,
}

/// Events driving the pull state machine.
#[derive(Debug, Clone, Copy)]
pub(crate) enum PullEvent {
    StartSettled,
    PullIssued,
    PullRequestedWhilePulling,
    PullSettled,
    CloseDeferred,
    Finalized,
}

impl PullState {
    /// Total transition function; illegal combinations keep the state as-is
    /// rather than panicking, terminal `Closed` absorbs everything.
    pub(crate) fn step(self, ev: PullEvent) -> PullState {
        use PullEvent::*;
        use PullState::*;
        match (self, ev) {
            (_, Finalized) => Closed,
            (Uninitialized, StartSettled) => Ready,
            (Ready, PullIssued) => Pulling,
            (Pulling, PullRequestedWhilePulling) => PullAgain,
            // Settling a pull re-enters Ready; a queued pull-again re-enters
            // Ready too and the caller immediately re-evaluates maybe_pull.
            (Pulling, PullSettled) | (PullAgain, PullSettled) => Ready,
            (_, CloseDeferred) => Closing,
            (s, _) => s,
        }
    }
}

/// A read that could not be satisfied immediately. Byte-mode `read_into`
/// waiters record the caller's buffer capacity so the controller can surface
/// a BYOB request for them.
pub(crate) struct ReadWaiter<T> {
    pub(crate) tx: oneshot::Sender<StreamResult<Option<T>>>,
    pub(crate) byob_capacity: Option<usize>,
}

pub(crate) struct ReadState<T> {
    pub(crate) phase: StreamPhase,
    pub(crate) pull: PullState,
    pub(crate) queue: ChunkQueue<T>,
    pub(crate) waiters: VecDeque<ReadWaiter<T>>,
    pub(crate) locked: bool,
    /// Bumped on every lock acquisition and on terminal auto-release, so a
    /// stale handle dropping late cannot release a newer owner's lock.
    pub(crate) lock_epoch: u64,
}

/// Whether this stream was built through the byte constructor; only byte-mode
/// controllers expose BYOB requests.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamMode {
    Default,
    Byte,
}

pub(crate) struct ReadableInner<T> {
    pub(crate) state: Mutex<ReadState<T>>,
    pub(crate) state_tag: AtomicU8,
    pub(crate) queue_total: SizeMirror,
    pub(crate) strategy: Arc<dyn QueuingStrategy<T>>,
    pub(crate) source: AsyncMutex<Box<dyn Source<T>>>,
    pub(crate) closed: watch::Sender<Option<StreamResult<()>>>,
    pub(crate) mode: StreamMode,
    pub(crate) spawner: SpawnFn,
}

/// Outcome of the synchronous half of a read.
pub(crate) enum ReadOutcome<T> {
    Ready(StreamResult<Option<T>>),
    Pending(oneshot::Receiver<StreamResult<Option<T>>>),
}

impl<T: Send + 'static> ReadableInner<T> {
    fn new(
        source: Box<dyn Source<T>>,
        strategy: Arc<dyn QueuingStrategy<T>>,
        spawner: SpawnFn,
        mode: StreamMode,
    ) -> Arc<Self> {
        let (closed, _) = watch::channel(None);
        let inner = Arc::new(Self {
            state: Mutex::new(ReadState {
                phase: StreamPhase::Readable,
                pull: PullState::Uninitialized,
                queue: ChunkQueue::new(),
                waiters: VecDeque::new(),
                locked: false,
                lock_epoch: 0,
            }),
            state_tag: AtomicU8::new(TAG_ACTIVE),
            queue_total: SizeMirror::new(),
            strategy,
            source: AsyncMutex::new(source),
            closed,
            mode,
            spawner,
        });
        inner.spawn_start();
        inner
    }

    fn spawn_start(self: &Arc<Self>) {
        let inner = self.clone();
        (self.spawner)(Box::pin(async move {
            let ctrl = ReadableController::new(&inner);
            let res = {
                let mut source = inner.source.lock().await;
                source.start(&ctrl).await
            };
            match res {
                Ok(()) => {
                    {
                        let mut s = inner.state.lock().unwrap();
                        s.pull = s.pull.step(PullEvent::StartSettled);
                    }
                    inner.maybe_pull();
                }
                Err(e) => {
                    debug!("source start failed: {}", e);
                    inner.error(e);
                }
            }
        }));
    }

    /// Issue a `pull` to the source if the stream wants more data and none is
    /// in flight. A pull already in flight records a pull-again instead of a
    /// second concurrent call.
    pub(crate) fn maybe_pull(self: &Arc<Self>) {
        let issue = {
            let mut s = self.state.lock().unwrap();
            if !matches!(s.phase, StreamPhase::Readable) {
                return;
            }
            let wants = !s.waiters.is_empty()
                || self.strategy.high_water_mark() - s.queue.total() > 0.0;
            if !wants {
                return;
            }
            match s.pull {
                PullState::Ready => {
                    s.pull = s.pull.step(PullEvent::PullIssued);
                    true
                }
                PullState::Pulling => {
                    s.pull = s.pull.step(PullEvent::PullRequestedWhilePulling);
                    false
                }
                // Uninitialized: start completion re-evaluates. PullAgain:
                // already queued. Closing/Closed: no more pulls.
                _ => false,
            }
        };
        if !issue {
            return;
        }
        trace!("issuing source pull");
        let inner = self.clone();
        (self.spawner)(Box::pin(async move {
            let ctrl = ReadableController::new(&inner);
            let res = {
                let mut source = inner.source.lock().await;
                source.pull(&ctrl).await
            };
            if let Err(e) = res {
                debug!("source pull failed: {}", e);
                inner.error(e);
                return;
            }
            let again = {
                let mut s = inner.state.lock().unwrap();
                let again = s.pull == PullState::PullAgain;
                s.pull = s.pull.step(PullEvent::PullSettled);
                again
            };
            if again {
                inner.maybe_pull();
            }
        }));
    }

    /// Synchronous half of `read`: pop a queued chunk or register a waiter.
    /// Callers follow up with `maybe_pull`.
    pub(crate) fn begin_read(&self, byob_capacity: Option<usize>) -> ReadOutcome<T> {
        let mut s = self.state.lock().unwrap();
        match &s.phase {
            StreamPhase::Errored(e) => ReadOutcome::Ready(Err(e.clone())),
            StreamPhase::Closed => ReadOutcome::Ready(Ok(None)),
            StreamPhase::Readable => {
                if let Some((value, _size)) = s.queue.pop() {
                    self.queue_total.store(s.queue.total());
                    if s.queue.is_empty() && s.pull == PullState::Closing {
                        self.finalize_closed(&mut s);
                    }
                    ReadOutcome::Ready(Ok(Some(value)))
                } else {
                    let (tx, rx) = oneshot::channel();
                    s.waiters.push_back(ReadWaiter { tx, byob_capacity });
                    ReadOutcome::Pending(rx)
                }
            }
        }
    }

    /// Enqueue a chunk from the source. A waiting read is satisfied directly,
    /// bypassing the queue.
    pub(crate) fn enqueue(self: &Arc<Self>, chunk: T) -> StreamResult<()> {
        let mut bad_size = None;
        {
            let mut s = self.state.lock().unwrap();
            match &s.phase {
                StreamPhase::Errored(e) => return Err(e.clone()),
                StreamPhase::Closed => return Err(StreamError::Closed),
                StreamPhase::Readable => {}
            }
            if matches!(s.pull, PullState::Closing | PullState::Closed) {
                return Err(StreamError::Closing);
            }
            // Satisfy the oldest live waiter. A waiter whose read future was
            // dropped (e.g. a pipe's select loop moved on) hands the chunk
            // back, so it falls through to the next waiter or the queue.
            let mut chunk = Some(chunk);
            while let Some(c) = chunk.take() {
                match s.waiters.pop_front() {
                    Some(w) => {
                        if let Err(Ok(Some(c))) = w.tx.send(Ok(Some(c))) {
                            chunk = Some(c);
                        }
                    }
                    None => {
                        let size = self.strategy.size(&c);
                        if !size.is_finite() || size < 0.0 {
                            bad_size = Some(size);
                            break;
                        }
                        s.queue.push(c, size);
                        self.queue_total.store(s.queue.total());
                    }
                }
            }
        }
        if let Some(size) = bad_size {
            let cause = StreamError::from(format!("invalid chunk size {size}"));
            self.error(cause.clone());
            return Err(cause);
        }
        self.maybe_pull();
        Ok(())
    }

    /// Close requested by the source. Defers while chunks remain queued;
    /// finalization then happens on the read that drains the queue.
    pub(crate) fn close(&self) -> StreamResult<()> {
        let mut s = self.state.lock().unwrap();
        match &s.phase {
            StreamPhase::Errored(e) => return Err(e.clone()),
            StreamPhase::Closed => return Err(StreamError::Closed),
            StreamPhase::Readable => {}
        }
        if matches!(s.pull, PullState::Closing | PullState::Closed) {
            return Err(StreamError::Closing);
        }
        if s.queue.is_empty() {
            self.finalize_closed(&mut s);
        } else {
            s.pull = s.pull.step(PullEvent::CloseDeferred);
        }
        Ok(())
    }

    /// Error the stream. Idempotent, first cause wins; pending reads are
    /// rejected and the queue is dropped.
    pub(crate) fn error(&self, cause: StreamError) {
        let mut s = self.state.lock().unwrap();
        if !matches!(s.phase, StreamPhase::Readable) {
            return;
        }
        debug!("readable stream errored: {}", cause);
        s.phase = StreamPhase::Errored(cause.clone());
        s.pull = s.pull.step(PullEvent::Finalized);
        s.locked = false;
        s.lock_epoch += 1;
        s.queue.clear();
        self.queue_total.store(0.0);
        for w in s.waiters.drain(..) {
            let _ = w.tx.send(Err(cause.clone()));
        }
        self.state_tag.store(TAG_ERRORED, Ordering::Release);
        self.closed.send_replace(Some(Err(cause)));
    }

    /// Cancel: synchronously close and drop the queue, then forward to the
    /// source and await its confirmation.
    pub(crate) async fn cancel(self: Arc<Self>, reason: Option<StreamError>) -> StreamResult<()> {
        {
            let mut s = self.state.lock().unwrap();
            match &s.phase {
                StreamPhase::Closed => return Ok(()),
                StreamPhase::Errored(e) => return Err(e.clone()),
                StreamPhase::Readable => {}
            }
            trace!("cancelling readable stream");
            s.queue.clear();
            self.queue_total.store(0.0);
            self.finalize_closed(&mut s);
        }
        let mut source = self.source.lock().await;
        source.cancel(reason).await
    }

    fn finalize_closed(&self, s: &mut ReadState<T>) {
        trace!("readable stream closed");
        s.phase = StreamPhase::Closed;
        s.pull = s.pull.step(PullEvent::Finalized);
        s.locked = false;
        s.lock_epoch += 1;
        for w in s.waiters.drain(..) {
            let _ = w.tx.send(Ok(None));
        }
        self.state_tag.store(TAG_CLOSED, Ordering::Release);
        self.queue_total.store(0.0);
        self.closed.send_replace(Some(Ok(())));
    }

    /// `Some(hwm - queued)` while readable, `Some(0)` once closed, `None`
    /// once errored. Lock-free.
    pub(crate) fn desired_size(&self) -> Option<f64> {
        match self.state_tag.load(Ordering::Acquire) {
            TAG_ACTIVE => Some(self.strategy.high_water_mark() - self.queue_total.load()),
            TAG_CLOSED => Some(0.0),
            _ => None,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state_tag.load(Ordering::Acquire) == TAG_CLOSED
    }

    pub(crate) fn error_cause(&self) -> Option<StreamError> {
        if self.state_tag.load(Ordering::Acquire) != TAG_ERRORED {
            return None;
        }
        match &self.state.lock().unwrap().phase {
            StreamPhase::Errored(e) => Some(e.clone()),
            _ => None,
        }
    }

    pub(crate) async fn closed_settled(&self) -> StreamResult<()> {
        let mut rx = self.closed.subscribe();
        let settled = rx
            .wait_for(|v| v.is_some())
            .await
            .map_err(|_| StreamError::Closed)?;
        settled.clone().unwrap_or(Ok(()))
    }
}

// Unbounded impl: called from `Drop`, which cannot add bounds.
impl<T> ReadableInner<T> {
    /// Take the single handle lock, returning the epoch the owner must
    /// present to release it.
    pub(crate) fn lock_handle(&self) -> StreamResult<u64> {
        let mut s = self.state.lock().unwrap();
        if s.locked {
            return Err(StreamError::Locked);
        }
        s.locked = true;
        s.lock_epoch += 1;
        Ok(s.lock_epoch)
    }

    /// Release the handle lock, ignored if the lock has moved on since
    /// `epoch` was issued.
    pub(crate) fn release_handle(&self, epoch: u64) {
        let mut s = self.state.lock().unwrap();
        if s.locked && s.lock_epoch == epoch {
            s.locked = false;
        }
    }
}

/// Pull-based source wrapper. Chunks flow source → queue → reader, with
/// `maybe_pull` keeping the queue topped up to the strategy's high-water
/// mark. Must be constructed inside an async runtime unless a custom spawner
/// is supplied.
pub struct ReadableStream<T> {
    pub(crate) inner: Arc<ReadableInner<T>>,
}

impl<T: Send + 'static> ReadableStream<T> {
    /// Shorthand for `builder(source).build()`.
    pub fn new(source: impl Source<T> + 'static) -> Self {
        Self::builder(source).build()
    }

    pub fn builder(source: impl Source<T> + 'static) -> ReadableStreamBuilder<T> {
        ReadableStreamBuilder {
            source: Box::new(source),
            strategy: None,
            spawner: None,
            mode: StreamMode::Default,
        }
    }

    /// Acquire the single reader handle. Fails while another handle is live;
    /// a closed or errored stream releases its reader, so re-acquiring after
    /// a terminal state succeeds.
    pub fn reader(&self) -> StreamResult<StreamReader<T>> {
        let epoch = self.inner.lock_handle()?;
        Ok(StreamReader::new(self.inner.clone(), epoch))
    }

    pub fn is_locked(&self) -> bool {
        self.inner.state.lock().unwrap().locked
    }

    pub fn desired_size(&self) -> Option<f64> {
        self.inner.desired_size()
    }

    /// Cancel the stream without going through a reader. Fails with
    /// [`StreamError::Locked`] while a reader handle is live.
    pub async fn cancel(&self, reason: Option<StreamError>) -> StreamResult<()> {
        if self.is_locked() {
            return Err(StreamError::Locked);
        }
        self.inner.clone().cancel(reason).await
    }

    /// Resolves once the stream closes, or with the cause once it errors.
    pub async fn closed(&self) -> StreamResult<()> {
        self.inner.closed_settled().await
    }

    /// Mint a controller bound to this stream. Used by the transform
    /// coupling, which drives the readable side without a source callback.
    pub(crate) fn controller(&self) -> ReadableController<T> {
        ReadableController::new(&self.inner)
    }
}

/// Builder for [`ReadableStream`] with strategy and spawner seams.
pub struct ReadableStreamBuilder<T> {
    source: Box<dyn Source<T>>,
    strategy: Option<Arc<dyn QueuingStrategy<T>>>,
    spawner: Option<SpawnFn>,
    mode: StreamMode,
}

impl<T: Send + 'static> ReadableStreamBuilder<T> {
    pub fn strategy(mut self, strategy: impl QueuingStrategy<T> + 'static) -> Self {
        self.strategy = Some(Arc::new(strategy));
        self
    }

    /// Replace `tokio::spawn` as the executor for source callbacks.
    pub fn spawner(mut self, spawner: SpawnFn) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// Mark the stream byte-oriented; its controller gains BYOB requests.
    pub fn byte_mode(mut self) -> Self {
        self.mode = StreamMode::Byte;
        self
    }

    pub fn build(self) -> ReadableStream<T> {
        let strategy = self
            .strategy
            .unwrap_or_else(|| Arc::new(CountQueuingStrategy::new(1.0)));
        let spawner = self.spawner.unwrap_or_else(default_spawner);
        ReadableStream {
            inner: ReadableInner::new(self.source, strategy, spawner, self.mode),
        }
    }
}
