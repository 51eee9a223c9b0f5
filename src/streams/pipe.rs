use super::{
    error::StreamError,
    readable::ReadableStream,
    reader::ReadableStreamDefaultReader,
    transform::TransformStream,
    writable::WritableStream,
    writer::WritableStreamDefaultWriter,
};
use crate::platform::MaybeSend;
use futures::future::{AbortRegistration, Abortable, Aborted};
use std::future::Future;

type StreamResult<T> = Result<T, StreamError>;

#[derive(Debug, Default)]
pub struct PipeOptions {
    /// Leave the destination open when the source ends.
    pub prevent_close: bool,
    /// Leave the destination alone when the source errors.
    pub prevent_abort: bool,
    /// Leave the source alone when the destination fails.
    pub prevent_cancel: bool,
    /// Stops the pipe from outside, see [`futures::future::AbortHandle`].
    pub signal: Option<AbortRegistration>,
}

impl ReadableStream {
    /// Pump every chunk into `destination`.
    ///
    /// Both streams are locked before this returns; the returned future
    /// does the transfer and can be spawned.
    pub fn pipe_to(
        &self,
        destination: &WritableStream,
        options: PipeOptions,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend + 'static + use<> {
        let locks = self
            .get_reader()
            .and_then(|reader| Ok((reader, destination.get_writer()?)));
        async move {
            let (reader, writer) = locks?;
            pipe_loop(reader, writer, options).await
        }
    }

    /// Pipe into `transform`'s writable side and hand back its readable side.
    pub fn pipe_through(
        &self,
        transform: &TransformStream,
        options: PipeOptions,
    ) -> (
        ReadableStream,
        impl Future<Output = StreamResult<()>> + MaybeSend + 'static + use<>,
    ) {
        let pipe = self.pipe_to(&transform.writable(), options);
        (transform.readable(), pipe)
    }
}

async fn pipe_loop(
    reader: ReadableStreamDefaultReader,
    writer: WritableStreamDefaultWriter,
    options: PipeOptions,
) -> StreamResult<()> {
    let PipeOptions {
        prevent_close,
        prevent_abort,
        prevent_cancel,
        signal,
    } = options;

    let transfer = async {
        let mut last_write = None;
        loop {
            // Wait until the writer is ready before pulling from the reader
            if let Err(write_err) = writer.ready().await {
                if !prevent_cancel {
                    reader.cancel(Some(write_err.to_string())).await?;
                }
                return Err(write_err);
            }

            match reader.read().await {
                Ok(Some(chunk)) => {
                    let write = writer.write(chunk);
                    if let Some(Err(write_err)) = write.deferred().outcome() {
                        tracing::debug!(%write_err, "pipe destination refused a chunk");
                        if !prevent_cancel {
                            reader.cancel(Some(write_err.to_string())).await?;
                        }
                        return Err(write_err);
                    }
                    last_write = Some(write);
                }
                Ok(None) => {
                    if !prevent_close {
                        writer.close().await?;
                    } else if let Some(write) = last_write.take() {
                        write.await?;
                    }
                    return Ok(());
                }
                Err(read_err) => {
                    if !prevent_abort {
                        writer.abort(Some(read_err.to_string())).await?;
                    }
                    return Err(read_err);
                }
            }
        }
    };

    match signal {
        Some(registration) => match Abortable::new(transfer, registration).await {
            Ok(result) => result,
            Err(Aborted) => {
                tracing::debug!("pipe aborted by signal");
                if !prevent_cancel {
                    let _ = reader.cancel(Some("Aborted".to_string())).await;
                }
                if !prevent_abort {
                    let _ = writer.abort(Some("Aborted".to_string())).await;
                }
                Err(StreamError::Aborted(Some("Pipe operation aborted".into())))
            }
        },
        None => transfer.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        platform::SharedPtr,
        streams::{
            chunk::Chunk,
            readable::{ReadableSource, ReadableStreamDefaultController, ReadableStreamState},
            test_support::run_local,
            writable::{WritableSink, WritableStreamDefaultController, WritableStreamState},
        },
    };
    use futures::future::AbortHandle;
    use parking_lot::Mutex;

    #[derive(Clone, Default)]
    struct Collected(SharedPtr<Mutex<Vec<u8>>>);

    struct CollectSink(Collected);

    impl WritableSink for CollectSink {
        async fn write(
            &mut self,
            chunk: Chunk,
            _controller: &mut WritableStreamDefaultController,
        ) -> StreamResult<()> {
            (self.0).0.lock().extend_from_slice(&chunk);
            Ok(())
        }
    }

    fn collecting() -> (WritableStream, Collected) {
        let out = Collected::default();
        let stream = WritableStream::builder(CollectSink(out.clone())).spawn(tokio::task::spawn_local);
        (stream, out)
    }

    #[test]
    fn pipes_all_chunks_and_closes() {
        run_local(async {
            let source = ReadableStream::from_vec(vec!["a", "b", "c"]).spawn(tokio::task::spawn_local);
            let (dest, out) = collecting();

            source.pipe_to(&dest, PipeOptions::default()).await.unwrap();
            assert_eq!((out.0).lock().as_slice(), b"abc");
            assert_eq!(dest.state(), WritableStreamState::Closed);
            assert!(!source.locked());
            assert!(!dest.locked());
        });
    }

    #[test]
    fn prevent_close_leaves_destination_writable() {
        run_local(async {
            let source = ReadableStream::from_vec(vec!["x"]).spawn(tokio::task::spawn_local);
            let (dest, out) = collecting();

            let options = PipeOptions {
                prevent_close: true,
                ..Default::default()
            };
            source.pipe_to(&dest, options).await.unwrap();
            assert_eq!(dest.state(), WritableStreamState::Writable);
            assert_eq!((out.0).lock().as_slice(), b"x");
        });
    }

    #[test]
    fn source_error_aborts_destination() {
        struct Broken;
        impl ReadableSource for Broken {
            async fn pull(&mut self, _c: &mut ReadableStreamDefaultController) -> StreamResult<()> {
                Err(StreamError::protocol("source failed"))
            }
        }

        run_local(async {
            let source = ReadableStream::builder(Broken).spawn(tokio::task::spawn_local);
            let (dest, _) = collecting();

            let result = source.pipe_to(&dest, PipeOptions::default()).await;
            assert!(matches!(result, Err(StreamError::Protocol(_))));
            assert_eq!(dest.state(), WritableStreamState::Errored);
        });
    }

    #[test]
    fn destination_error_cancels_source() {
        struct Refuse;
        impl WritableSink for Refuse {
            async fn write(
                &mut self,
                _chunk: Chunk,
                _c: &mut WritableStreamDefaultController,
            ) -> StreamResult<()> {
                Err(StreamError::protocol("sink full"))
            }
        }

        run_local(async {
            let source = ReadableStream::from_iterator((0..100u8).map(|i| vec![i]))
                .spawn(tokio::task::spawn_local);
            let dest = WritableStream::builder(Refuse).spawn(tokio::task::spawn_local);

            let result = source.pipe_to(&dest, PipeOptions::default()).await;
            assert!(matches!(result, Err(StreamError::Protocol(_))));
            assert_eq!(source.state(), ReadableStreamState::Closed);
        });
    }

    #[test]
    fn locked_source_fails_fast() {
        run_local(async {
            let source = ReadableStream::from_vec(vec!["x"]).spawn(tokio::task::spawn_local);
            let _reader = source.get_reader().unwrap();
            let (dest, _) = collecting();

            let result = source.pipe_to(&dest, PipeOptions::default()).await;
            assert!(matches!(result, Err(StreamError::LockContention)));
            assert!(!dest.locked());
        });
    }

    #[test]
    fn signal_aborts_the_pipe() {
        struct Never;
        impl ReadableSource for Never {}

        run_local(async {
            let source = ReadableStream::builder(Never).spawn(tokio::task::spawn_local);
            let (dest, _) = collecting();
            let (handle, registration) = AbortHandle::new_pair();

            let options = PipeOptions {
                signal: Some(registration),
                ..Default::default()
            };
            let pipe = tokio::task::spawn_local(source.pipe_to(&dest, options));
            tokio::task::yield_now().await;
            handle.abort();

            let result = pipe.await.unwrap();
            assert!(matches!(result, Err(StreamError::Aborted(_))));
            assert_eq!(source.state(), ReadableStreamState::Closed);
            assert_eq!(dest.state(), WritableStreamState::Errored);
        });
    }

    #[test]
    fn pipe_outlives_the_handles_it_was_built_from() {
        run_local(async {
            let (dest, out) = collecting();
            let pipe = {
                let source =
                    ReadableStream::from_vec(vec!["left", "over"]).spawn(tokio::task::spawn_local);
                source.pipe_to(&dest.clone(), PipeOptions::default())
            };
            tokio::task::spawn_local(pipe).await.unwrap().unwrap();
            assert_eq!((out.0).lock().as_slice(), b"leftover");
            assert_eq!(dest.state(), WritableStreamState::Closed);
        });
    }

    #[test]
    fn pipe_through_survives_dropped_transform() {
        run_local(async {
            let source = ReadableStream::from_vec(vec!["x", "y"]).spawn(tokio::task::spawn_local);
            let (readable, pipe) = {
                let transform = TransformStream::identity().spawn(tokio::task::spawn_local);
                source.pipe_through(&transform, PipeOptions::default())
            };
            let pipe = tokio::task::spawn_local(pipe);

            let reader = readable.get_reader().unwrap();
            assert_eq!(reader.read().await.unwrap().unwrap(), "x");
            assert_eq!(reader.read().await.unwrap().unwrap(), "y");
            assert!(reader.read().await.unwrap().is_none());
            pipe.await.unwrap().unwrap();
        });
    }

    #[test]
    fn pipe_through_transform() {
        run_local(async {
            let source = ReadableStream::from_vec(vec!["ab", "cd"]).spawn(tokio::task::spawn_local);
            let upper = TransformStream::from_fn(|chunk, controller| {
                controller.enqueue(chunk.to_ascii_uppercase())
            })
            .spawn(tokio::task::spawn_local);

            let (readable, pipe) = source.pipe_through(&upper, PipeOptions::default());
            tokio::task::spawn_local(pipe);

            let reader = readable.get_reader().unwrap();
            let mut out = Vec::new();
            while let Some(chunk) = reader.read().await.unwrap() {
                out.extend_from_slice(&chunk);
            }
            assert_eq!(out, b"ABCD");
        });
    }
}
