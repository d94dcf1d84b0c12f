//! Bridges between streams and the surrounding ecosystem: iterators,
//! `AsyncRead`/`AsyncWrite`, and `futures::Stream` (see
//! [`StreamReader::into_stream`](crate::readable::StreamReader::into_stream)).

use crate::errors::StreamResult;
use crate::readable::{ReadableController, ReadableStream, Source};
use crate::strategy::ByteLengthQueuingStrategy;
use crate::writable::{Sink, WritableController, WritableStream};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

struct IterSource<I> {
    iter: I,
}

#[async_trait]
impl<I> Source<I::Item> for IterSource<I>
where
    I: Iterator + Send + 'static,
    I::Item: Send + 'static,
{
    async fn pull(&mut self, ctrl: &ReadableController<I::Item>) -> StreamResult<()> {
        match self.iter.next() {
            Some(item) => ctrl.enqueue(item)?,
            None => ctrl.close()?,
        }
        Ok(())
    }
}

impl<T: Send + 'static> ReadableStream<T> {
    /// Readable stream over an iterator, one item per pull, closing at the
    /// iterator's end.
    pub fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        ReadableStream::new(IterSource {
            iter: iter.into_iter(),
        })
    }
}

struct AsyncReadSource<R> {
    reader: R,
    chunk_size: usize,
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send + 'static> Source<Bytes> for AsyncReadSource<R> {
    async fn pull(&mut self, ctrl: &ReadableController<Bytes>) -> StreamResult<()> {
        let mut buf = BytesMut::zeroed(self.chunk_size);
        let n = self.reader.read(&mut buf).await?;
        if n == 0 {
            ctrl.close()?;
        } else {
            buf.truncate(n);
            ctrl.enqueue(buf.freeze())?;
        }
        Ok(())
    }
}

impl ReadableStream<Bytes> {
    /// Byte stream pulling up to `chunk_size` bytes at a time from any
    /// `AsyncRead`; closes on EOF, errors on I/O failure.
    pub fn from_async_read<R>(reader: R, chunk_size: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        ReadableStream::builder(AsyncReadSource { reader, chunk_size })
            .strategy(ByteLengthQueuingStrategy::new(chunk_size as f64))
            .byte_mode()
            .build()
    }
}

struct AsyncWriteSink<W> {
    writer: W,
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> Sink<Bytes> for AsyncWriteSink<W> {
    async fn write(&mut self, chunk: Bytes, _ctrl: &WritableController) -> StreamResult<()> {
        self.writer.write_all(&chunk).await?;
        Ok(())
    }

    async fn close(&mut self) -> StreamResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }

    async fn abort(&mut self, _reason: Option<crate::errors::StreamError>) -> StreamResult<()> {
        // best effort; the peer learns about the abort from the missing data
        let _ = self.writer.shutdown().await;
        Ok(())
    }
}

impl WritableStream<Bytes> {
    /// Writable stream flushing every chunk to any `AsyncWrite`; `close`
    /// shuts the writer down.
    pub fn from_async_write<W>(writer: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        WritableStream::new(AsyncWriteSink { writer })
    }
}
