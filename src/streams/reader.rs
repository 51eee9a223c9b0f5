use super::{
    chunk::Chunk,
    deferred::{Deferred, DeferredFuture},
    error::StreamError,
    lock::LockToken,
    readable::{CommandLink, ReadableShared, ReadableStream},
};
use crate::platform::SharedPtr;
use futures::{AsyncRead, Stream};
use std::{
    collections::VecDeque,
    future::Future,
    io,
    pin::Pin,
    task::{Context, Poll},
};

type StreamResult<T> = Result<T, StreamError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ViewKind {
    /// Supplied by a BYOB reader.
    Byob,
    /// Allocated for a default read on a byte stream.
    AutoAllocated,
}

pub(crate) struct PullIntoView {
    pub(crate) kind: ViewKind,
    /// `None` while lent to a BYOB request.
    pub(crate) buffer: Option<Vec<u8>>,
}

pub(crate) struct ReadRequest {
    pub(crate) seq: u64,
    pub(crate) deferred: Deferred<Option<Chunk>>,
    pub(crate) view: Option<PullIntoView>,
}

impl ReadRequest {
    /// Whether an enqueued chunk can settle this request as-is.
    pub(crate) fn accepts_chunk(&self) -> bool {
        self.view
            .as_ref()
            .is_none_or(|view| view.kind == ViewKind::AutoAllocated)
    }
}

/// Per-reader bookkeeping kept in the stream state while locked.
pub(crate) struct ReaderSlot {
    pub(crate) token: LockToken,
    pub(crate) pending: VecDeque<ReadRequest>,
    pub(crate) closed: Deferred<()>,
    next_seq: u64,
}

impl ReaderSlot {
    pub(crate) fn new(token: LockToken, closed: Deferred<()>) -> Self {
        Self {
            token,
            pending: VecDeque::new(),
            closed,
            next_seq: 0,
        }
    }

    pub(crate) fn push_request(
        &mut self,
        view: Option<(ViewKind, Vec<u8>)>,
    ) -> Deferred<Option<Chunk>> {
        let deferred = Deferred::new();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.push_back(ReadRequest {
            seq,
            deferred: deferred.clone(),
            view: view.map(|(kind, buffer)| PullIntoView {
                kind,
                buffer: Some(buffer),
            }),
        });
        deferred
    }
}

impl ReadableShared {
    pub(crate) fn closed_for(&self, token: LockToken) -> DeferredFuture<()> {
        let mut inner = self.inner.lock();
        match inner.slot_mut(token) {
            Some(slot) => slot.closed.wait(),
            None => Deferred::rejected(StreamError::Released).wait(),
        }
    }

    pub(crate) fn pending_for(&self, token: LockToken) -> usize {
        let mut inner = self.inner.lock();
        inner.slot_mut(token).map_or(0, |slot| slot.pending.len())
    }

    pub(crate) fn cancel_for(&self, token: LockToken, reason: Option<String>) -> DeferredFuture<()> {
        if !self.lock.is_held_by(token) {
            return Deferred::rejected(StreamError::NotLocked).wait();
        }
        self.cancel(reason)
    }
}

/// Lock-holding consumer of a [`ReadableStream`].
///
/// Reads are served strictly in call order. Dropping the reader releases
/// the lock the same way [`release_lock`](Self::release_lock) does.
pub struct ReadableStreamDefaultReader {
    shared: SharedPtr<ReadableShared>,
    link: CommandLink,
    token: LockToken,
    released: bool,
    in_flight: Option<DeferredFuture<Option<Chunk>>>,
    leftover: Option<Chunk>,
}

impl ReadableStreamDefaultReader {
    pub(crate) fn new(stream: ReadableStream, token: LockToken) -> Self {
        Self {
            shared: stream.shared,
            link: stream.link,
            token,
            released: false,
            in_flight: None,
            leftover: None,
        }
    }

    /// Next chunk, or `None` at end of stream.
    pub fn read(&self) -> DeferredFuture<Option<Chunk>> {
        self.shared.read(self.token, None)
    }

    /// Resolves when the stream closes, rejects when it errors or this
    /// reader is released first.
    pub fn closed(&self) -> DeferredFuture<()> {
        self.shared.closed_for(self.token)
    }

    pub fn cancel(&self, reason: Option<String>) -> DeferredFuture<()> {
        self.shared.cancel_for(self.token, reason)
    }

    /// Reads registered but not yet settled.
    pub fn pending_reads(&self) -> usize {
        self.shared.pending_for(self.token)
    }

    /// Unlock the stream. Pending reads are rejected with
    /// [`StreamError::Released`].
    pub fn release_lock(mut self) -> ReadableStream {
        self.released = true;
        self.shared.release(self.token);
        ReadableStream {
            shared: SharedPtr::clone(&self.shared),
            link: SharedPtr::clone(&self.link),
        }
    }
}

impl Drop for ReadableStreamDefaultReader {
    fn drop(&mut self) {
        if !self.released {
            self.shared.release(self.token);
        }
    }
}

impl Stream for ReadableStreamDefaultReader {
    type Item = StreamResult<Chunk>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(chunk) = this.leftover.take() {
            return Poll::Ready(Some(Ok(chunk)));
        }
        let fut = this
            .in_flight
            .get_or_insert_with(|| this.shared.read(this.token, None));
        match Pin::new(fut).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(outcome) => {
                this.in_flight = None;
                Poll::Ready(outcome.transpose())
            }
        }
    }
}

impl AsyncRead for ReadableStreamDefaultReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let mut chunk = match this.leftover.take() {
            Some(chunk) => chunk,
            None => {
                let fut = this
                    .in_flight
                    .get_or_insert_with(|| this.shared.read(this.token, None));
                match Pin::new(fut).poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(outcome) => {
                        this.in_flight = None;
                        match outcome {
                            Ok(Some(chunk)) => chunk,
                            Ok(None) => return Poll::Ready(Ok(0)),
                            Err(e) => return Poll::Ready(Err(e.into())),
                        }
                    }
                }
            }
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        chunk.advance(n);
        if !chunk.is_empty() {
            this.leftover = Some(chunk);
        }
        Poll::Ready(Ok(n))
    }
}
