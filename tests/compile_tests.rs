//! Thread-safety bounds per platform feature.
//!
//!   cargo test                                        (send)
//!   cargo test --no-default-features --features local

use chunked_streams::{
    Chunk, ReadableStream, ReadableStreamDefaultReader, StreamError, TransformStream,
    WritableSink, WritableStream, WritableStreamDefaultController, WritableStreamDefaultWriter,
};

struct NullSink;

impl WritableSink for NullSink {
    async fn write(
        &mut self,
        _chunk: Chunk,
        _controller: &mut WritableStreamDefaultController,
    ) -> Result<(), StreamError> {
        Ok(())
    }
}

#[cfg(feature = "send")]
#[test]
fn handles_are_send_and_sync() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    assert_send::<ReadableStream>();
    assert_sync::<ReadableStream>();
    assert_send::<WritableStream>();
    assert_sync::<WritableStream>();
    assert_send::<TransformStream>();
    assert_send::<ReadableStreamDefaultReader>();
    assert_send::<WritableStreamDefaultWriter>();
    assert_send::<Chunk>();
    assert_send::<StreamError>();

    let (_, driver) = WritableStream::builder(NullSink).prepare();
    fn assert_send_future<F: std::future::Future + Send>(_: &F) {}
    assert_send_future(&driver);
}

#[cfg(feature = "local")]
#[test]
fn sources_may_hold_rc_under_local() {
    use chunked_streams::{ReadableSource, ReadableStreamDefaultController, StreamResult};
    use std::{cell::Cell, rc::Rc};

    struct RcSource(Rc<Cell<u32>>);

    impl ReadableSource for RcSource {
        async fn pull(&mut self, controller: &mut ReadableStreamDefaultController) -> StreamResult<()> {
            self.0.set(self.0.get() + 1);
            controller.close()
        }
    }

    let (_stream, _driver) = ReadableStream::builder(RcSource(Rc::new(Cell::new(0)))).prepare();
    let (_stream, _driver) = WritableStream::builder(NullSink).prepare();
}
