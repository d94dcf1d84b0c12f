//! Fork a readable stream into two branches sharing one upstream reader.

use super::reader::StreamReader;
use super::{ReadableController, ReadableStream, Source};
use crate::errors::{StreamError, StreamResult};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{debug, trace};

struct TeeFlags {
    cancelled: [bool; 2],
    reasons: [Option<StreamError>; 2],
    upstream_cancelled: bool,
}

struct TeeShared<T> {
    reader: StreamReader<T>,
    flags: Mutex<TeeFlags>,
    /// Wakes the shared read loop. `Notify` holds at most one permit, which
    /// coalesces overlapping branch pulls into a single upstream read.
    demand: Notify,
}

/// Synthetic source backing one tee branch. Pulls only signal demand; the
/// upstream reads happen in a detached loop, so a branch's `cancel` is never
/// stuck behind an in-flight upstream read.
struct TeeBranch<T> {
    shared: Arc<TeeShared<T>>,
    index: usize,
}

#[async_trait]
impl<T: Clone + Send + 'static> Source<T> for TeeBranch<T> {
    async fn pull(&mut self, _ctrl: &ReadableController<T>) -> StreamResult<()> {
        self.shared.demand.notify_one();
        Ok(())
    }

    async fn cancel(&mut self, reason: Option<StreamError>) -> StreamResult<()> {
        let composite = {
            let mut f = self.shared.flags.lock().unwrap();
            f.cancelled[self.index] = true;
            f.reasons[self.index] = reason;
            if f.cancelled[0] && f.cancelled[1] && !f.upstream_cancelled {
                f.upstream_cancelled = true;
                Some(StreamError::composite(f.reasons[0].take(), f.reasons[1].take()))
            } else {
                None
            }
        };
        match composite {
            Some(reason) => {
                debug!("both tee branches cancelled, cancelling upstream");
                // Wake the read loop so it observes the closed upstream and
                // exits rather than parking on demand forever.
                self.shared.demand.notify_one();
                self.shared.reader.cancel(reason).await
            }
            None => Ok(()),
        }
    }
}

/// One upstream read per unit of demand, each chunk cloned out to every
/// branch that has not cancelled. Exits on the upstream's terminal state.
async fn distribute<T: Clone + Send + 'static>(
    shared: Arc<TeeShared<T>>,
    ctrls: [ReadableController<T>; 2],
) {
    loop {
        shared.demand.notified().await;
        if shared.flags.lock().unwrap().upstream_cancelled {
            return;
        }
        match shared.reader.read().await {
            Ok(Some(chunk)) => {
                trace!("tee distributing chunk to both branches");
                let cancelled = shared.flags.lock().unwrap().cancelled;
                for (i, ctrl) in ctrls.iter().enumerate() {
                    if !cancelled[i] {
                        // A branch that just cancelled rejects this; fine.
                        let _ = ctrl.enqueue(chunk.clone());
                    }
                }
            }
            Ok(None) => {
                for ctrl in &ctrls {
                    let _ = ctrl.close();
                }
                return;
            }
            Err(e) => {
                for ctrl in &ctrls {
                    ctrl.error(e.clone());
                }
                return;
            }
        }
    }
}

impl<T: Clone + Send + 'static> ReadableStream<T> {
    /// Fork into two independent branches observing the upstream chunk order.
    /// The upstream is cancelled only once both branches have cancelled, with
    /// a composite reason.
    pub fn tee(self) -> StreamResult<(ReadableStream<T>, ReadableStream<T>)> {
        let spawner = self.inner.spawner.clone();
        let reader = self.reader()?;
        let shared = Arc::new(TeeShared {
            reader,
            flags: Mutex::new(TeeFlags {
                cancelled: [false, false],
                reasons: [None, None],
                upstream_cancelled: false,
            }),
            demand: Notify::new(),
        });
        let a = ReadableStream::new(TeeBranch {
            shared: shared.clone(),
            index: 0,
        });
        let b = ReadableStream::new(TeeBranch {
            shared: shared.clone(),
            index: 1,
        });
        (spawner)(Box::pin(distribute(
            shared,
            [a.controller(), b.controller()],
        )));
        Ok((a, b))
    }
}
