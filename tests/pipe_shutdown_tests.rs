use anyhow::Result;
use async_trait::async_trait;
use sluiceway::{
    PipeOperation, ReadableController, ReadableStream, Sink, Source, StreamError, StreamResult,
    WritableController, WritableStream,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Source that yields increasing numbers forever and records its cancel
/// reason.
struct Endless {
    next: u32,
    cancel_reason: Arc<Mutex<Option<Option<StreamError>>>>,
}

impl Endless {
    fn new() -> (Self, Arc<Mutex<Option<Option<StreamError>>>>) {
        let cancel_reason = Arc::new(Mutex::new(None));
        (
            Self {
                next: 0,
                cancel_reason: cancel_reason.clone(),
            },
            cancel_reason,
        )
    }
}

#[async_trait]
impl Source<u32> for Endless {
    async fn pull(&mut self, ctrl: &ReadableController<u32>) -> StreamResult<()> {
        self.next += 1;
        ctrl.enqueue(self.next)?;
        Ok(())
    }

    async fn cancel(&mut self, reason: Option<StreamError>) -> StreamResult<()> {
        *self.cancel_reason.lock().unwrap() = Some(reason);
        Ok(())
    }
}

struct FailingSink {
    message: &'static str,
}

#[async_trait]
impl Sink<u32> for FailingSink {
    async fn write(&mut self, _chunk: u32, _ctrl: &WritableController) -> StreamResult<()> {
        Err(self.message.into())
    }
}

#[test_log::test(tokio::test)]
async fn test_sink_failure_cancels_source_with_reason() -> Result<()> {
    let (source, cancel_reason) = Endless::new();
    let source = ReadableStream::new(source);
    let dest = WritableStream::new(FailingSink {
        message: "disk full",
    });
    let err = timeout(Duration::from_secs(5), source.pipe_to(&dest))
        .await?
        .unwrap_err();
    assert_eq!(err, StreamError::from("disk full"));
    let seen = cancel_reason.lock().unwrap().clone();
    assert_eq!(seen, Some(Some(StreamError::from("disk full"))));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_prevent_cancel_leaves_source_alone() -> Result<()> {
    let (source, cancel_reason) = Endless::new();
    let source = ReadableStream::new(source);
    let dest = WritableStream::new(FailingSink { message: "nope" });
    let err = timeout(
        Duration::from_secs(5),
        PipeOperation::new(&source, &dest)?.prevent_cancel().execute(),
    )
    .await?
    .unwrap_err();
    assert_eq!(err, StreamError::from("nope"));
    assert!(cancel_reason.lock().unwrap().is_none());
    // the source lock was still released
    assert!(source.reader().is_ok());
    Ok(())
}

/// Sink whose writes never complete, for backpressure assertions.
struct BlackHole;

#[async_trait]
impl Sink<u32> for BlackHole {
    async fn write(&mut self, _chunk: u32, _ctrl: &WritableController) -> StreamResult<()> {
        std::future::pending().await
    }
}

#[test_log::test(tokio::test)]
async fn test_ready_stays_pending_past_high_water_mark() -> Result<()> {
    let dest = WritableStream::new(BlackHole);
    let writer = dest.writer().unwrap();
    let _first = writer.write(1).unwrap();
    let _second = writer.write(2).unwrap();
    assert!(writer.desired_size().unwrap() <= 0.0);
    // hwm is 1 and nothing ever settles: ready must not resolve
    assert!(
        timeout(Duration::from_millis(100), writer.ready())
            .await
            .is_err()
    );
    Ok(())
}

struct CountingSink {
    written: Arc<Mutex<Vec<u32>>>,
    aborted: Arc<Mutex<Option<Option<StreamError>>>>,
}

#[async_trait]
impl Sink<u32> for CountingSink {
    async fn write(&mut self, chunk: u32, _ctrl: &WritableController) -> StreamResult<()> {
        self.written.lock().unwrap().push(chunk);
        Ok(())
    }

    async fn abort(&mut self, reason: Option<StreamError>) -> StreamResult<()> {
        *self.aborted.lock().unwrap() = Some(reason);
        Ok(())
    }
}

#[test_log::test(tokio::test)]
async fn test_abort_signal_tears_down_both_endpoints() -> Result<()> {
    let (source, cancel_reason) = Endless::new();
    let source = ReadableStream::new(source);
    let written = Arc::new(Mutex::new(Vec::new()));
    let aborted = Arc::new(Mutex::new(None));
    let dest = WritableStream::new(CountingSink {
        written: written.clone(),
        aborted: aborted.clone(),
    });
    let token = CancellationToken::new();
    let pipe = PipeOperation::new(&source, &dest)?.abort_signal(token.clone());
    let transfer = tokio::spawn(pipe.execute());

    // let a few chunks through, then pull the plug
    timeout(Duration::from_secs(5), async {
        while written.lock().unwrap().len() < 3 {
            tokio::task::yield_now().await;
        }
    })
    .await?;
    token.cancel();

    let err = timeout(Duration::from_secs(5), transfer).await??.unwrap_err();
    assert_eq!(err, StreamError::Aborted(None));
    assert!(aborted.lock().unwrap().is_some());
    assert!(cancel_reason.lock().unwrap().is_some());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_source_error_aborts_destination() -> Result<()> {
    struct Faulty;
    #[async_trait]
    impl Source<u32> for Faulty {
        async fn pull(&mut self, ctrl: &ReadableController<u32>) -> StreamResult<()> {
            ctrl.enqueue(1)?;
            Err("pull exploded".into())
        }
    }
    let source = ReadableStream::new(Faulty);
    let written = Arc::new(Mutex::new(Vec::new()));
    let aborted = Arc::new(Mutex::new(None));
    let dest = WritableStream::new(CountingSink {
        written: written.clone(),
        aborted: aborted.clone(),
    });
    let err = timeout(Duration::from_secs(5), source.pipe_to(&dest))
        .await?
        .unwrap_err();
    assert_eq!(err, StreamError::from("pull exploded"));
    let abort_reason = aborted.lock().unwrap().clone().expect("sink aborted");
    assert_eq!(abort_reason, Some(StreamError::from("pull exploded")));
    Ok(())
}
