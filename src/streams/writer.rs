use super::{
    chunk::Chunk,
    deferred::{Deferred, DeferredFuture},
    error::StreamError,
    lock::LockToken,
    writable::{WakeLink, WritableShared, WritableStream},
};
use crate::platform::SharedPtr;
use futures::Sink;
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

type StreamResult<T> = Result<T, StreamError>;

/// Lock-holding producer for a [`WritableStream`].
///
/// Dropping the writer releases the lock; writes already queued keep going.
pub struct WritableStreamDefaultWriter {
    shared: SharedPtr<WritableShared>,
    link: WakeLink,
    token: LockToken,
    released: bool,
    ready_fut: Option<DeferredFuture<()>>,
    last_write: Option<DeferredFuture<()>>,
    close_fut: Option<DeferredFuture<()>>,
}

impl WritableStreamDefaultWriter {
    pub(crate) fn new(stream: WritableStream, token: LockToken) -> Self {
        Self {
            shared: stream.shared,
            link: stream.link,
            token,
            released: false,
            ready_fut: None,
            last_write: None,
            close_fut: None,
        }
    }

    fn check_lock(&self) -> StreamResult<()> {
        if self.shared.lock.is_held_by(self.token) {
            Ok(())
        } else {
            Err(StreamError::NotLocked)
        }
    }

    /// Queue `chunk`; resolves once the sink has accepted it.
    pub fn write(&self, chunk: impl Into<Chunk>) -> DeferredFuture<()> {
        if let Err(e) = self.check_lock() {
            return Deferred::rejected(e).wait();
        }
        self.shared.write(chunk.into())
    }

    /// Close after queued writes. Repeated calls share one outcome.
    pub fn close(&self) -> DeferredFuture<()> {
        if let Err(e) = self.check_lock() {
            return Deferred::rejected(e).wait();
        }
        self.shared.close()
    }

    pub fn abort(&self, reason: Option<String>) -> DeferredFuture<()> {
        if let Err(e) = self.check_lock() {
            return Deferred::rejected(e).wait();
        }
        self.shared.abort(reason)
    }

    /// Pending while the queue is at or above the high-water mark.
    pub fn ready(&self) -> DeferredFuture<()> {
        if let Err(e) = self.check_lock() {
            return Deferred::rejected(e).wait();
        }
        self.shared.inner.lock().ready_future()
    }

    pub fn closed(&self) -> DeferredFuture<()> {
        let inner = self.shared.inner.lock();
        match &inner.writer {
            Some(slot) if slot.token == self.token => slot.closed.wait(),
            _ => Deferred::rejected(StreamError::Released).wait(),
        }
    }

    pub fn desired_size(&self) -> Option<isize> {
        self.shared.desired_size()
    }

    /// Wait for `ready`, then write.
    pub async fn write_when_ready(&self, chunk: impl Into<Chunk>) -> StreamResult<()> {
        self.ready().await?;
        self.write(chunk).await
    }

    pub fn release_lock(mut self) -> WritableStream {
        self.released = true;
        self.shared.release(self.token);
        WritableStream {
            shared: SharedPtr::clone(&self.shared),
            link: SharedPtr::clone(&self.link),
        }
    }
}

impl Drop for WritableStreamDefaultWriter {
    fn drop(&mut self) {
        if !self.released {
            self.shared.release(self.token);
        }
    }
}

fn poll_slot(
    slot: &mut Option<DeferredFuture<()>>,
    cx: &mut Context<'_>,
) -> Poll<StreamResult<()>> {
    let Some(fut) = slot.as_mut() else {
        return Poll::Ready(Ok(()));
    };
    match Pin::new(fut).poll(cx) {
        Poll::Pending => Poll::Pending,
        Poll::Ready(outcome) => {
            *slot = None;
            Poll::Ready(outcome)
        }
    }
}

impl Sink<Chunk> for WritableStreamDefaultWriter {
    type Error = StreamError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<StreamResult<()>> {
        let this = self.get_mut();
        if this.ready_fut.is_none() {
            this.ready_fut = Some(this.ready());
        }
        poll_slot(&mut this.ready_fut, cx)
    }

    fn start_send(self: Pin<&mut Self>, item: Chunk) -> StreamResult<()> {
        let this = self.get_mut();
        this.check_lock()?;
        // Writes complete in order, so the newest one covers all earlier ones.
        this.last_write = Some(this.shared.write(item));
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<StreamResult<()>> {
        poll_slot(&mut self.get_mut().last_write, cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<StreamResult<()>> {
        let this = self.get_mut();
        if let Poll::Ready(Err(e)) = poll_slot(&mut this.last_write, cx) {
            return Poll::Ready(Err(e));
        }
        if this.last_write.is_some() {
            return Poll::Pending;
        }
        if this.close_fut.is_none() {
            this.close_fut = Some(this.close());
        }
        poll_slot(&mut this.close_fut, cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::{
        test_support::run_local,
        writable::{WritableSink, WritableStreamDefaultController},
    };
    use futures::SinkExt;
    use parking_lot::Mutex;

    struct CollectSink(SharedPtr<Mutex<Vec<u8>>>);

    impl WritableSink for CollectSink {
        async fn write(
            &mut self,
            chunk: Chunk,
            _controller: &mut WritableStreamDefaultController,
        ) -> StreamResult<()> {
            self.0.lock().extend_from_slice(&chunk);
            Ok(())
        }
    }

    fn collect_stream() -> (WritableStream, SharedPtr<Mutex<Vec<u8>>>) {
        let out = SharedPtr::new(Mutex::new(Vec::new()));
        let stream = WritableStream::builder(CollectSink(SharedPtr::clone(&out)))
            .spawn(tokio::task::spawn_local);
        (stream, out)
    }

    #[test]
    fn writer_works_as_futures_sink() {
        run_local(async {
            let (stream, out) = collect_stream();
            let mut writer = stream.get_writer().unwrap();

            writer.send(Chunk::from("hello ")).await.unwrap();
            writer.feed(Chunk::from("sink")).await.unwrap();
            SinkExt::close(&mut writer).await.unwrap();

            assert_eq!(out.lock().as_slice(), b"hello sink");
        });
    }

    #[test]
    fn released_writer_rejects_closed_future() {
        run_local(async {
            let (stream, _) = collect_stream();
            let writer = stream.get_writer().unwrap();
            let closed = writer.closed();

            let stream = writer.release_lock();
            assert!(matches!(closed.await, Err(StreamError::Released)));
            assert!(!stream.locked());

            let writer = stream.get_writer().unwrap();
            writer.write("again").await.unwrap();
        });
    }

    #[test]
    fn write_when_ready_waits_for_capacity() {
        run_local(async {
            let (stream, out) = collect_stream();
            let writer = stream.get_writer().unwrap();
            for part in ["a", "b", "c"] {
                writer.write_when_ready(part).await.unwrap();
            }
            writer.close().await.unwrap();
            assert_eq!(out.lock().as_slice(), b"abc");
        });
    }
}
