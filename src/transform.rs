//! Writable/readable pair coupled through a user transformer, enabling
//! `pipe_through` chains.

use crate::errors::{StreamError, StreamResult};
use crate::pipe::PipeOperation;
use crate::readable::{ReadableController, ReadableStream, Source};
use crate::writable::{Sink, WritableController, WritableInner, WritableStream};
use async_trait::async_trait;
use std::sync::{Arc, OnceLock, Weak};
use tracing::debug;

/// Chunk mapper between the writable and readable halves of a
/// [`TransformStream`]. `transform` may enqueue any number of outputs per
/// input; `flush` runs after the writable side closes, before the readable
/// side does.
#[async_trait]
pub trait Transformer<I, O>: Send {
    async fn start(&mut self, ctrl: &ReadableController<O>) -> StreamResult<()> {
        let _ = ctrl;
        Ok(())
    }

    async fn transform(&mut self, chunk: I, ctrl: &ReadableController<O>) -> StreamResult<()>;

    async fn flush(&mut self, ctrl: &ReadableController<O>) -> StreamResult<()> {
        let _ = ctrl;
        Ok(())
    }
}

/// Inert source for the readable half; chunks arrive through the
/// transformer, not through pulls. Cancelling the readable half errors the
/// writable half.
struct TransformSource<I> {
    writable: Arc<OnceLock<Weak<WritableInner<I>>>>,
}

#[async_trait]
impl<I: Send + 'static, O: Send + 'static> Source<O> for TransformSource<I> {
    async fn cancel(&mut self, reason: Option<StreamError>) -> StreamResult<()> {
        if let Some(inner) = self.writable.get().and_then(Weak::upgrade) {
            inner.error(StreamError::cancelled(reason));
        }
        Ok(())
    }
}

/// Sink for the writable half: feeds each chunk through the transformer
/// into the readable half's controller.
struct TransformSink<I, O> {
    transformer: Box<dyn Transformer<I, O>>,
    ctrl: ReadableController<O>,
}

#[async_trait]
impl<I: Send + 'static, O: Send + 'static> Sink<I> for TransformSink<I, O> {
    async fn start(&mut self, _ctrl: &WritableController) -> StreamResult<()> {
        self.transformer.start(&self.ctrl).await
    }

    async fn write(&mut self, chunk: I, _ctrl: &WritableController) -> StreamResult<()> {
        let res = self.transformer.transform(chunk, &self.ctrl).await;
        if let Err(e) = &res {
            self.ctrl.error(e.clone());
        }
        res
    }

    async fn close(&mut self) -> StreamResult<()> {
        match self.transformer.flush(&self.ctrl).await {
            Ok(()) => {
                let _ = self.ctrl.close();
                Ok(())
            }
            Err(e) => {
                self.ctrl.error(e.clone());
                Err(e)
            }
        }
    }

    async fn abort(&mut self, reason: Option<StreamError>) -> StreamResult<()> {
        self.ctrl.error(StreamError::aborted(reason));
        Ok(())
    }
}

/// A `WritableStream<I>` and `ReadableStream<O>` joined through a
/// [`Transformer`]. Writing into one side makes transformed chunks readable
/// on the other; closing the writable side flushes, then closes the
/// readable side; an error on either side propagates to both.
pub struct TransformStream<I, O> {
    writable: WritableStream<I>,
    readable: ReadableStream<O>,
}

impl<I: Send + 'static, O: Send + 'static> TransformStream<I, O> {
    pub fn new(transformer: impl Transformer<I, O> + 'static) -> Self {
        let writable_slot = Arc::new(OnceLock::new());
        let readable = ReadableStream::builder(TransformSource::<I> {
            writable: writable_slot.clone(),
        })
        .build();
        let writable = WritableStream::builder(TransformSink {
            transformer: Box::new(transformer) as Box<dyn Transformer<I, O>>,
            ctrl: readable.controller(),
        })
        .build();
        let _ = writable_slot.set(Arc::downgrade(&writable.inner));
        Self { writable, readable }
    }

    pub fn writable(&self) -> &WritableStream<I> {
        &self.writable
    }

    pub fn readable(&self) -> &ReadableStream<O> {
        &self.readable
    }

    pub fn split(self) -> (WritableStream<I>, ReadableStream<O>) {
        (self.writable, self.readable)
    }
}

impl<T: Send + 'static> ReadableStream<T> {
    /// Pipe this stream through a transform, yielding its readable end. The
    /// transfer runs detached; its outcome surfaces on the returned stream.
    pub fn pipe_through<O: Send + 'static>(
        &self,
        transform: TransformStream<T, O>,
    ) -> StreamResult<ReadableStream<O>> {
        let (writable, readable) = transform.split();
        let pipe = PipeOperation::new(self, &writable)?;
        let spawner = self.inner.spawner.clone();
        (spawner)(Box::pin(async move {
            if let Err(e) = pipe.execute().await {
                debug!("pipe_through transfer ended: {}", e);
            }
        }));
        Ok(readable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Doubler;

    #[async_trait]
    impl Transformer<u32, u32> for Doubler {
        async fn transform(
            &mut self,
            chunk: u32,
            ctrl: &ReadableController<u32>,
        ) -> StreamResult<()> {
            ctrl.enqueue(chunk * 2)?;
            Ok(())
        }

        async fn flush(&mut self, ctrl: &ReadableController<u32>) -> StreamResult<()> {
            ctrl.enqueue(0)?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_transform_maps_chunks_and_flushes() {
        let ts = TransformStream::new(Doubler);
        let writer = ts.writable().writer().unwrap();
        let reader = ts.readable().reader().unwrap();
        writer.write(1).unwrap().await.unwrap();
        writer.write(2).unwrap().await.unwrap();
        let close = writer.close().unwrap();
        assert_eq!(reader.read().await.unwrap(), Some(2));
        assert_eq!(reader.read().await.unwrap(), Some(4));
        // flush output lands before the readable close
        assert_eq!(reader.read().await.unwrap(), Some(0));
        assert_eq!(reader.read().await.unwrap(), None);
        close.await.unwrap();
    }

    #[tokio::test]
    async fn test_transform_error_propagates_both_ways() {
        struct Failing;
        #[async_trait]
        impl Transformer<u32, u32> for Failing {
            async fn transform(
                &mut self,
                _chunk: u32,
                _ctrl: &ReadableController<u32>,
            ) -> StreamResult<()> {
                Err("bad chunk".into())
            }
        }
        let ts = TransformStream::new(Failing);
        let writer = ts.writable().writer().unwrap();
        let reader = ts.readable().reader().unwrap();
        let err = writer.write(7).unwrap().await.unwrap_err();
        assert_eq!(err, "bad chunk".into());
        assert_eq!(reader.read().await.unwrap_err(), "bad chunk".into());
    }

    #[tokio::test]
    async fn test_readable_cancel_errors_writable() {
        let ts = TransformStream::new(Doubler);
        let (writable, readable) = ts.split();
        readable.cancel(Some("not interested".into())).await.unwrap();
        let err = writable.closed().await.unwrap_err();
        assert_eq!(
            err,
            StreamError::cancelled(Some("not interested".into()))
        );
    }

    #[tokio::test]
    async fn test_pipe_through_chains() {
        use crate::readable::Source;
        struct Nums;
        #[async_trait]
        impl Source<u32> for Nums {
            async fn start(&mut self, ctrl: &ReadableController<u32>) -> StreamResult<()> {
                ctrl.enqueue(3)?;
                ctrl.enqueue(4)?;
                ctrl.close()?;
                Ok(())
            }
        }
        let out = ReadableStream::new(Nums)
            .pipe_through(TransformStream::new(Doubler))
            .unwrap();
        let reader = out.reader().unwrap();
        assert_eq!(reader.read().await.unwrap(), Some(6));
        assert_eq!(reader.read().await.unwrap(), Some(8));
        assert_eq!(reader.read().await.unwrap(), Some(0));
        assert_eq!(reader.read().await.unwrap(), None);
    }
}
