//! sluiceway: a backpressure-aware producer/consumer streaming engine
//! modeled on the WHATWG Streams protocol.
//!
//! Readable and writable streams decouple a pull-based producer from a
//! push-based consumer through an internal bounded queue. Lock ownership is
//! explicit (one live reader/writer handle per stream), backpressure is
//! advisory (`desired_size`, the writer's `ready()` gate), and every failure
//! resolves to a terminal state whose cause is handed back verbatim to all
//! observers.
//!
//! ```no_run
//! use sluiceway::{ReadableStream, WritableStream};
//! # use sluiceway::{Sink, WritableController, StreamResult};
//! # use async_trait::async_trait;
//! # struct Stdout;
//! # #[async_trait]
//! # impl Sink<u32> for Stdout {
//! #     async fn write(&mut self, chunk: u32, _ctrl: &WritableController) -> StreamResult<()> {
//! #         println!("{chunk}"); Ok(())
//! #     }
//! # }
//! # async fn demo() -> StreamResult<()> {
//! let source = ReadableStream::from_iter(1..=3);
//! let dest = WritableStream::new(Stdout);
//! source.pipe_to(&dest).await?;
//! # Ok(())
//! # }
//! ```

use futures::future::BoxFuture;
use std::sync::Arc;

mod adapters;
mod errors;
mod pipe;
mod queue;
mod readable;
mod strategy;
mod transform;
mod writable;

pub use errors::{StreamError, StreamResult};
pub use pipe::PipeOperation;
pub use readable::{
    ByobRequest, IntoStream, ReadableController, ReadableStream, ReadableStreamBuilder, Source,
    StreamReader,
};
pub use strategy::{ByteLengthQueuingStrategy, CountQueuingStrategy, QueuingStrategy};
pub use transform::{TransformStream, Transformer};
pub use writable::{
    Sink, StreamWriter, WritableController, WritableStream, WritableStreamBuilder, WriteAck,
};

/// Executor seam: every source/sink callback runs through one of these, so
/// the engine imposes no threading policy of its own. Defaults to
/// `tokio::spawn`.
pub type SpawnFn = Arc<dyn Fn(BoxFuture<'static, ()>) + Send + Sync>;

pub(crate) fn default_spawner() -> SpawnFn {
    Arc::new(|fut| {
        tokio::spawn(fut);
    })
}
