use super::{
    ByteLengthQueuingStrategy, CountQueuingStrategy, QueuingStrategy,
    chunk::Chunk,
    error::StreamError,
    readable::{
        DefaultSource, ReadableShared, ReadableSource, ReadableStream, readable_stream_task,
    },
    writable::{
        WritableShared, WritableSink, WritableStream, WritableStreamDefaultController,
        writable_stream_task,
    },
};
use crate::platform::{BoxedStrategy, MaybeSend, MaybeSync, PlatformBoxFutureStatic, SharedPtr};
use futures::future;
use std::future::Future;

type StreamResult<T> = Result<T, StreamError>;

/// Transformer trait
pub trait Transformer: MaybeSend + 'static {
    /// Called once before the first chunk
    fn start(
        &mut self,
        controller: &mut TransformStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(()))
    }

    /// Called for each chunk written to the writable side
    fn transform(
        &mut self,
        chunk: Chunk,
        controller: &mut TransformStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    /// Called when the writable side is closed
    fn flush(
        &mut self,
        controller: &mut TransformStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(()))
    }
}

/// Multiplexes transformer output and shutdown onto both sides.
#[derive(Clone)]
pub struct TransformStreamDefaultController {
    readable: SharedPtr<ReadableShared>,
    writable: SharedPtr<WritableShared>,
}

impl TransformStreamDefaultController {
    /// Push a chunk to the readable side.
    pub fn enqueue(&self, chunk: impl Into<Chunk>) -> StreamResult<()> {
        self.readable.enqueue(chunk.into())
    }

    /// Fail both sides with `error`.
    pub fn error(&self, error: StreamError) {
        tracing::debug!(%error, "transform stream errored");
        self.readable.error(error.clone());
        self.writable.error(error);
    }

    /// Close the readable side and stop accepting writes.
    pub fn terminate(&self) {
        tracing::debug!("transform stream terminated");
        if let Err(error) = self.readable.close() {
            tracing::debug!(%error, "readable side already shut down at terminate");
        }
        self.writable.close_without_sink(StreamError::Terminated);
    }

    pub fn desired_size(&self) -> Option<isize> {
        self.readable.desired_size()
    }
}

pub(crate) struct TransformSink<T> {
    transformer: T,
    controller: TransformStreamDefaultController,
}

impl<T: Transformer> WritableSink for TransformSink<T> {
    async fn start(&mut self, _controller: &mut WritableStreamDefaultController) -> StreamResult<()> {
        let result = self.transformer.start(&mut self.controller).await;
        if let Err(error) = &result {
            self.controller.readable.error(error.clone());
        }
        result
    }

    async fn write(
        &mut self,
        chunk: Chunk,
        _controller: &mut WritableStreamDefaultController,
    ) -> StreamResult<()> {
        let result = self.transformer.transform(chunk, &mut self.controller).await;
        if let Err(error) = &result {
            self.controller.readable.error(error.clone());
        }
        result
    }

    async fn close(mut self) -> StreamResult<()> {
        match self.transformer.flush(&mut self.controller).await {
            Ok(()) => self.controller.readable.close(),
            Err(error) => {
                self.controller.readable.error(error.clone());
                Err(error)
            }
        }
    }

    async fn abort(&mut self, reason: Option<String>) -> StreamResult<()> {
        self.controller.readable.error(StreamError::Aborted(reason));
        Ok(())
    }
}

pub(crate) struct TransformReadableSource {
    writable: SharedPtr<WritableShared>,
}

impl ReadableSource for TransformReadableSource {
    async fn cancel(&mut self, reason: Option<String>) -> StreamResult<()> {
        self.writable.error(StreamError::Canceled(reason));
        Ok(())
    }
}

/// A writable side whose chunks come out of a readable side after passing
/// through a [`Transformer`].
pub struct TransformStream {
    readable: ReadableStream,
    writable: WritableStream,
}

impl TransformStream {
    pub fn builder<T: Transformer>(transformer: T) -> TransformStreamBuilder<T> {
        TransformStreamBuilder::new(transformer)
    }

    /// Pass chunks through unchanged.
    pub fn identity() -> TransformStreamBuilder<IdentityTransformer> {
        Self::builder(IdentityTransformer)
    }

    /// Transform with a synchronous closure.
    pub fn from_fn<F>(f: F) -> TransformStreamBuilder<FnTransformer<F>>
    where
        F: FnMut(Chunk, &TransformStreamDefaultController) -> StreamResult<()>
            + MaybeSend
            + 'static,
    {
        Self::builder(FnTransformer(f))
    }

    pub fn readable(&self) -> ReadableStream {
        self.readable.clone()
    }

    pub fn writable(&self) -> WritableStream {
        self.writable.clone()
    }

    pub fn split(self) -> (ReadableStream, WritableStream) {
        (self.readable, self.writable)
    }
}

pub struct TransformStreamBuilder<T> {
    transformer: T,
    writable_strategy: BoxedStrategy,
    readable_strategy: BoxedStrategy,
}

impl<T: Transformer> TransformStreamBuilder<T> {
    fn new(transformer: T) -> Self {
        Self {
            transformer,
            writable_strategy: Box::new(CountQueuingStrategy::new(1)),
            readable_strategy: Box::new(CountQueuingStrategy::new(0)),
        }
    }

    pub fn writable_strategy<S>(mut self, s: S) -> Self
    where
        S: QueuingStrategy + MaybeSend + MaybeSync + 'static,
    {
        self.writable_strategy = Box::new(s);
        self
    }

    /// Strategy for the readable side's queue.
    ///
    /// It only shapes the `desired_size` reported to the transformer. Writes
    /// are not held back when the readable queue is full; a transformer that
    /// wants backpressure checks `desired_size` itself.
    pub fn readable_strategy<S>(mut self, s: S) -> Self
    where
        S: QueuingStrategy + MaybeSend + MaybeSync + 'static,
    {
        self.readable_strategy = Box::new(s);
        self
    }

    /// Measure the readable side in bytes instead of chunks. Like
    /// [`readable_strategy`](Self::readable_strategy), this is advisory.
    pub fn readable_byte_limit(self, high_water_mark: usize) -> Self {
        self.readable_strategy(ByteLengthQueuingStrategy::new(high_water_mark))
    }

    /// Return stream + future driving both sides, without spawning
    pub fn prepare(self) -> (TransformStream, impl Future<Output = ()> + MaybeSend + 'static) {
        let (readable, command_rx) = ReadableStream::new_parts(self.readable_strategy, false, None);
        let (writable, wake_rx) = WritableStream::new_parts(self.writable_strategy);

        let controller = TransformStreamDefaultController {
            readable: SharedPtr::clone(&readable.shared),
            writable: SharedPtr::clone(&writable.shared),
        };
        let sink = TransformSink {
            transformer: self.transformer,
            controller,
        };
        let source = TransformReadableSource {
            writable: SharedPtr::clone(&writable.shared),
        };

        let readable_task = readable_stream_task(
            DefaultSource(source),
            SharedPtr::clone(&readable.shared),
            command_rx,
        );
        let writable_task = writable_stream_task(sink, SharedPtr::clone(&writable.shared), wake_rx);
        let task = async move {
            future::join(readable_task, writable_task).await;
        };
        (TransformStream { readable, writable }, task)
    }

    pub fn spawn<F, R>(self, spawn_fn: F) -> TransformStream
    where
        F: FnOnce(PlatformBoxFutureStatic<()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(Box::pin(fut));
        stream
    }

    pub fn spawn_ref<F, R>(self, spawn_fn: &'static F) -> TransformStream
    where
        F: Fn(PlatformBoxFutureStatic<()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(Box::pin(fut));
        stream
    }
}

/// Forwards every chunk unchanged.
pub struct IdentityTransformer;

impl Transformer for IdentityTransformer {
    async fn transform(
        &mut self,
        chunk: Chunk,
        controller: &mut TransformStreamDefaultController,
    ) -> StreamResult<()> {
        controller.enqueue(chunk)
    }
}

pub struct FnTransformer<F>(F);

impl<F> Transformer for FnTransformer<F>
where
    F: FnMut(Chunk, &TransformStreamDefaultController) -> StreamResult<()> + MaybeSend + 'static,
{
    async fn transform(
        &mut self,
        chunk: Chunk,
        controller: &mut TransformStreamDefaultController,
    ) -> StreamResult<()> {
        (self.0)(chunk, controller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::{
        readable::ReadableStreamState,
        test_support::{run_local, settle_until},
        writable::WritableStreamState,
    };
    use parking_lot::Mutex;

    struct UppercaseTransformer;

    impl Transformer for UppercaseTransformer {
        async fn transform(
            &mut self,
            chunk: Chunk,
            controller: &mut TransformStreamDefaultController,
        ) -> StreamResult<()> {
            controller.enqueue(chunk.to_ascii_uppercase())
        }
    }

    #[test]
    fn uppercases_written_chunks() {
        run_local(async {
            let transform =
                TransformStream::builder(UppercaseTransformer).spawn(tokio::task::spawn_local);
            let writer = transform.writable().get_writer().unwrap();
            let reader = transform.readable().get_reader().unwrap();

            writer.write("ab").await.unwrap();
            assert_eq!(reader.read().await.unwrap().unwrap(), "AB");
        });
    }

    #[test]
    fn one_chunk_may_produce_many() {
        run_local(async {
            let transform = TransformStream::from_fn(|chunk, controller| {
                for byte in chunk.iter() {
                    controller.enqueue(vec![*byte])?;
                }
                Ok(())
            })
            .spawn(tokio::task::spawn_local);
            let (readable, writable) = transform.split();
            let writer = writable.get_writer().unwrap();
            let reader = readable.get_reader().unwrap();

            writer.write("xyz").await.unwrap();
            writer.close().await.unwrap();
            let mut out = Vec::new();
            while let Some(chunk) = reader.read().await.unwrap() {
                out.push(chunk.to_vec());
            }
            assert_eq!(out, vec![b"x".to_vec(), b"y".to_vec(), b"z".to_vec()]);
        });
    }

    #[test]
    fn flush_runs_before_readable_closes() {
        struct Trailer;
        impl Transformer for Trailer {
            async fn transform(
                &mut self,
                chunk: Chunk,
                controller: &mut TransformStreamDefaultController,
            ) -> StreamResult<()> {
                controller.enqueue(chunk)
            }

            async fn flush(&mut self, controller: &mut TransformStreamDefaultController) -> StreamResult<()> {
                controller.enqueue("<eof>")
            }
        }

        run_local(async {
            let transform = TransformStream::builder(Trailer).spawn(tokio::task::spawn_local);
            let writer = transform.writable().get_writer().unwrap();
            let reader = transform.readable().get_reader().unwrap();

            writer.write("body").await.unwrap();
            writer.close().await.unwrap();
            assert_eq!(reader.read().await.unwrap().unwrap(), "body");
            assert_eq!(reader.read().await.unwrap().unwrap(), "<eof>");
            assert!(reader.read().await.unwrap().is_none());
        });
    }

    #[test]
    fn terminate_closes_both_sides() {
        run_local(async {
            let transform = TransformStream::from_fn(|chunk, controller| {
                controller.enqueue(chunk)?;
                controller.terminate();
                Ok(())
            })
            .spawn(tokio::task::spawn_local);
            let writable = transform.writable();
            let writer = writable.get_writer().unwrap();
            let reader = transform.readable().get_reader().unwrap();

            writer.write("last").await.unwrap();
            assert_eq!(reader.read().await.unwrap().unwrap(), "last");
            assert!(reader.read().await.unwrap().is_none());
            assert_eq!(writable.state(), WritableStreamState::Closed);
            assert!(matches!(writer.write("more").await, Err(StreamError::Closed)));
        });
    }

    #[test]
    fn transform_error_fails_both_sides() {
        run_local(async {
            let transform = TransformStream::from_fn(|_chunk, _controller| {
                Err(StreamError::protocol("bad input"))
            })
            .spawn(tokio::task::spawn_local);
            let writer = transform.writable().get_writer().unwrap();
            let reader = transform.readable().get_reader().unwrap();

            assert!(matches!(writer.write("x").await, Err(StreamError::Protocol(_))));
            assert!(matches!(reader.read().await, Err(StreamError::Protocol(_))));
            assert!(writer.closed().await.is_err());
        });
    }

    /// Keeps a copy of its controller and rejects every chunk.
    struct StashingTransformer {
        stash: SharedPtr<Mutex<Option<TransformStreamDefaultController>>>,
        fail: bool,
    }

    impl Transformer for StashingTransformer {
        async fn start(&mut self, controller: &mut TransformStreamDefaultController) -> StreamResult<()> {
            *self.stash.lock() = Some(controller.clone());
            Ok(())
        }

        async fn transform(
            &mut self,
            chunk: Chunk,
            controller: &mut TransformStreamDefaultController,
        ) -> StreamResult<()> {
            if self.fail {
                return Err(StreamError::protocol("rejected"));
            }
            controller.enqueue(chunk)
        }
    }

    fn stashing(fail: bool) -> (StashingTransformer, SharedPtr<Mutex<Option<TransformStreamDefaultController>>>) {
        let stash = SharedPtr::new(Mutex::new(None));
        let transformer = StashingTransformer {
            stash: SharedPtr::clone(&stash),
            fail,
        };
        (transformer, stash)
    }

    #[test]
    fn terminate_after_error_keeps_error() {
        run_local(async {
            let (transformer, stash) = stashing(true);
            let transform = TransformStream::builder(transformer).spawn(tokio::task::spawn_local);
            let readable = transform.readable();
            let writer = transform.writable().get_writer().unwrap();

            assert!(writer.write("x").await.is_err());
            assert_eq!(readable.state(), ReadableStreamState::Errored);

            let controller = stash.lock().clone().unwrap();
            controller.terminate();
            assert_eq!(readable.state(), ReadableStreamState::Errored);
            let reader = readable.get_reader().unwrap();
            assert!(matches!(reader.read().await, Err(StreamError::Protocol(_))));
        });
    }

    #[test]
    fn readable_limit_is_reported_but_does_not_block_writes() {
        run_local(async {
            let (transformer, stash) = stashing(false);
            let transform = TransformStream::builder(transformer)
                .readable_byte_limit(4)
                .spawn(tokio::task::spawn_local);
            let writer = transform.writable().get_writer().unwrap();
            settle_until(|| stash.lock().is_some()).await;

            let controller = stash.lock().clone().unwrap();
            assert_eq!(controller.desired_size(), Some(4));

            writer.write("abcdef").await.unwrap();
            assert_eq!(controller.desired_size(), Some(-2));
            writer.write("gh").await.unwrap();
            assert_eq!(controller.desired_size(), Some(-4));

            let reader = transform.readable().get_reader().unwrap();
            assert_eq!(reader.read().await.unwrap().unwrap(), "abcdef");
            assert_eq!(controller.desired_size(), Some(2));
        });
    }

    #[test]
    fn readable_cancel_errors_writable_side() {
        run_local(async {
            let transform = TransformStream::identity().spawn(tokio::task::spawn_local);
            let writable = transform.writable();
            let reader = transform.readable().get_reader().unwrap();

            reader.cancel(Some("enough".into())).await.unwrap();
            settle_until(|| writable.state() == WritableStreamState::Errored).await;
            let writer = writable.get_writer().unwrap();
            assert!(matches!(
                writer.write("x").await,
                Err(StreamError::Canceled(Some(ref r))) if r == "enough"
            ));
        });
    }
}
