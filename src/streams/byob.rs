//! Byte-stream mode: sources that write straight into reader-supplied views.
//!
//! A pending read on a byte stream may carry a destination view, either
//! handed in by a [`ReadableStreamBYOBReader`] or auto-allocated for a
//! default read when `auto_allocate_chunk_size` is configured. The source
//! borrows that view through [`ReadableByteStreamController::byob_request`],
//! fills it, and calls [`ReadableStreamBYOBRequest::respond`]. The filled
//! view becomes the read result without another copy.

use super::{
    chunk::Chunk,
    deferred::{Deferred, DeferredFuture, Settlements},
    error::StreamError,
    lock::LockToken,
    readable::{
        CommandLink, ReadableShared, ReadableStream, ReadableStreamState, UnderlyingSource,
    },
    reader::ViewKind,
};
use crate::platform::{MaybeSend, SharedPtr};
use std::future::Future;

type StreamResult<T> = Result<T, StreamError>;

pub trait ReadableByteSource: MaybeSend + 'static {
    fn start(
        &mut self,
        controller: &mut ReadableByteStreamController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        async { Ok(()) }
    }

    /// Fill the current [`byob_request`](ReadableByteStreamController::byob_request)
    /// or enqueue bytes.
    fn pull(
        &mut self,
        controller: &mut ReadableByteStreamController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    fn cancel(
        &mut self,
        reason: Option<String>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = reason;
        async { Ok(()) }
    }
}

pub(crate) struct ByteSource<S>(pub(crate) S);

impl<S: ReadableByteSource> UnderlyingSource for ByteSource<S> {
    type Controller = ReadableByteStreamController;

    fn controller(shared: &SharedPtr<ReadableShared>) -> Self::Controller {
        ReadableByteStreamController {
            shared: SharedPtr::clone(shared),
        }
    }

    fn start(
        &mut self,
        controller: &mut Self::Controller,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        self.0.start(controller)
    }

    fn pull(
        &mut self,
        controller: &mut Self::Controller,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        self.0.pull(controller)
    }

    fn cancel(
        &mut self,
        reason: Option<String>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        self.0.cancel(reason)
    }
}

impl ReadableShared {
    /// Lend the head request's view, if it has one that is not already out.
    fn lend_view(&self) -> Option<(u64, Vec<u8>)> {
        let mut inner = self.inner.lock();
        if inner.state != ReadableStreamState::Readable || inner.close_requested {
            return None;
        }
        let head = inner.reader.as_mut()?.pending.front_mut()?;
        let buffer = head.view.as_mut()?.buffer.take()?;
        Some((head.seq, buffer))
    }

    /// Put an unanswered view back. Bytes enqueued while it was lent are
    /// copied into it now.
    fn return_view(&self, seq: u64, buffer: Vec<u8>) {
        let mut settle = Settlements::default();
        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let Some(slot) = inner.reader.as_mut() else {
                return;
            };
            if let Some(view) = slot
                .pending
                .iter_mut()
                .find(|request| request.seq == seq)
                .and_then(|request| request.view.as_mut())
            {
                view.buffer.get_or_insert(buffer);
            }
            self.process_pending(inner, &mut settle);
            self.call_pull_if_needed(inner);
        }
        settle.run();
    }

    /// Settle the request `seq` with the first `written` bytes of `view`.
    /// `view` is only consumed on success.
    fn respond(&self, seq: u64, view: &mut Option<Vec<u8>>, written: usize) -> StreamResult<()> {
        let view_len = view.as_ref().map_or(0, Vec::len);
        if written > view_len {
            return Err(StreamError::Range { written, view_len });
        }

        let mut settle = Settlements::default();
        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            match inner.state {
                ReadableStreamState::Errored => return Err(inner.get_stored_error()),
                ReadableStreamState::Closed => {
                    // Close already ended every pending read.
                    view.take();
                    return Ok(());
                }
                ReadableStreamState::Readable => {}
            }
            let Some(slot) = inner.reader.as_mut() else {
                return Err(StreamError::protocol("BYOB request outlived its reader"));
            };
            if slot.pending.front().is_none_or(|head| head.seq != seq) {
                return Err(StreamError::protocol("BYOB request is no longer pending"));
            }
            if written == 0 {
                return Err(StreamError::protocol(
                    "respond(0) is only valid once the stream is closed",
                ));
            }
            let (Some(request), Some(buffer)) = (slot.pending.pop_front(), view.take()) else {
                return Err(StreamError::protocol("BYOB request was already answered"));
            };
            settle.read(
                request.deferred,
                Ok(Some(Chunk::from_vec(buffer).narrow(written))),
            );
            self.process_pending(inner, &mut settle);
            self.call_pull_if_needed(inner);
        }
        settle.run();
        Ok(())
    }
}

/// Producer handle passed to [`ReadableByteSource`] callbacks.
#[derive(Clone)]
pub struct ReadableByteStreamController {
    shared: SharedPtr<ReadableShared>,
}

impl ReadableByteStreamController {
    pub fn desired_size(&self) -> Option<isize> {
        self.shared.desired_size()
    }

    pub fn close(&self) -> StreamResult<()> {
        self.shared.close()
    }

    /// Queue bytes. They are copied into waiting BYOB views as needed.
    pub fn enqueue(&self, chunk: impl Into<Chunk>) -> StreamResult<()> {
        self.shared.enqueue(chunk.into())
    }

    pub fn error(&self, error: StreamError) {
        self.shared.error(error)
    }

    /// The destination view of the oldest pending read, if it has one.
    ///
    /// The view is lent out until the request is answered or dropped.
    pub fn byob_request(&self) -> Option<ReadableStreamBYOBRequest> {
        let (seq, view) = self.shared.lend_view()?;
        Some(ReadableStreamBYOBRequest {
            shared: SharedPtr::clone(&self.shared),
            seq,
            view: Some(view),
        })
    }
}

/// A borrowed destination view for one pending read.
pub struct ReadableStreamBYOBRequest {
    shared: SharedPtr<ReadableShared>,
    seq: u64,
    view: Option<Vec<u8>>,
}

impl ReadableStreamBYOBRequest {
    /// Empty once the request has been answered.
    pub fn view(&mut self) -> &mut [u8] {
        self.view.as_deref_mut().unwrap_or_default()
    }

    pub fn view_len(&self) -> usize {
        self.view.as_ref().map_or(0, Vec::len)
    }

    /// Report `bytes_written` bytes at the start of the view.
    ///
    /// Fails with [`StreamError::Range`] when `bytes_written` exceeds the
    /// view; the read stays pending and the view stays usable.
    pub fn respond(&mut self, bytes_written: usize) -> StreamResult<()> {
        self.shared.respond(self.seq, &mut self.view, bytes_written)
    }
}

impl Drop for ReadableStreamBYOBRequest {
    fn drop(&mut self) {
        if let Some(view) = self.view.take() {
            self.shared.return_view(self.seq, view);
        }
    }
}

/// Reader that supplies its own destination buffers.
pub struct ReadableStreamBYOBReader {
    shared: SharedPtr<ReadableShared>,
    link: CommandLink,
    token: LockToken,
    released: bool,
}

impl ReadableStreamBYOBReader {
    pub(crate) fn new(stream: ReadableStream, token: LockToken) -> Self {
        Self {
            shared: stream.shared,
            link: stream.link,
            token,
            released: false,
        }
    }

    /// Read into `view`. Resolves with the view narrowed to the bytes
    /// written, or `None` at end of stream.
    pub fn read(&self, view: Vec<u8>) -> DeferredFuture<Option<Chunk>> {
        if view.is_empty() {
            return Deferred::rejected(StreamError::protocol("BYOB read needs a non-empty view"))
                .wait();
        }
        self.shared.read(self.token, Some((ViewKind::Byob, view)))
    }

    pub fn closed(&self) -> DeferredFuture<()> {
        self.shared.closed_for(self.token)
    }

    pub fn cancel(&self, reason: Option<String>) -> DeferredFuture<()> {
        self.shared.cancel_for(self.token, reason)
    }

    pub fn pending_reads(&self) -> usize {
        self.shared.pending_for(self.token)
    }

    pub fn release_lock(mut self) -> ReadableStream {
        self.released = true;
        self.shared.release(self.token);
        ReadableStream {
            shared: SharedPtr::clone(&self.shared),
            link: SharedPtr::clone(&self.link),
        }
    }
}

impl Drop for ReadableStreamBYOBReader {
    fn drop(&mut self) {
        if !self.released {
            self.shared.release(self.token);
        }
    }
}
