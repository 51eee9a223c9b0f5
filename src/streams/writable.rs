use super::{
    CountQueuingStrategy, QueuingStrategy, StreamConfig,
    chunk::Chunk,
    deferred::{Deferred, DeferredFuture, Settlements},
    error::StreamError,
    lock::{LockToken, StreamLock},
    writer::WritableStreamDefaultWriter,
};
use crate::platform::{
    BoxedStrategy, MaybeSend, MaybeSync, PlatformBoxFutureStatic, SharedPtr, SharedWeak,
};
use futures::{
    FutureExt, StreamExt,
    channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded},
    future::{self, Either, poll_fn},
    task::AtomicWaker,
};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    future::Future,
    pin::pin,
    sync::atomic::{AtomicBool, Ordering},
    task::Poll,
};

type StreamResult<T> = Result<T, StreamError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritableStreamState {
    Writable,
    Closed,
    Errored,
}

pub trait WritableSink: MaybeSend + Sized + 'static {
    /// Start the sink
    fn start(
        &mut self,
        controller: &mut WritableStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(())) // default no-op
    }

    /// Write a chunk to the sink
    fn write(
        &mut self,
        chunk: Chunk,
        controller: &mut WritableStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    /// Close the sink
    fn close(self) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        future::ready(Ok(())) // default no-op
    }

    /// Abort the sink
    fn abort(
        &mut self,
        reason: Option<String>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = reason;
        future::ready(Ok(())) // default no-op
    }
}

struct PendingWrite {
    chunk: Chunk,
    size: usize,
    completion: Deferred<()>,
}

/// Next step for the sink driver.
enum SinkAction {
    Write(Chunk),
    Close,
    Abort(Option<String>),
    Wait,
    Done,
}

pub(crate) struct WriterSlot {
    pub(crate) token: LockToken,
    pub(crate) closed: Deferred<()>,
}

pub(crate) struct WritableInner {
    state: WritableStreamState,
    started: bool,
    close_requested: bool,
    queue: VecDeque<PendingWrite>,
    /// Strategy size of queued writes plus the one in flight.
    queue_total_size: usize,
    in_flight: Option<(Deferred<()>, usize)>,
    close: Option<Deferred<()>>,
    abort: Option<Deferred<()>>,
    pending_abort: Option<Option<String>>,
    closed: Deferred<()>,
    ready: Deferred<()>,
    stored_error: Option<StreamError>,
    pub(crate) writer: Option<WriterSlot>,
}

impl WritableInner {
    pub(crate) fn ready_future(&self) -> DeferredFuture<()> {
        self.ready.wait()
    }

    fn get_stored_error(&self) -> StreamError {
        self.stored_error
            .clone()
            .unwrap_or_else(|| "Stream is errored".into())
    }

    /// Settle the stream's closed future and the current writer's.
    fn settle_closed(&self, outcome: StreamResult<()>, settle: &mut Settlements) {
        if let Some(slot) = &self.writer {
            settle.signal(&slot.closed, outcome.clone());
        }
        settle.signal(&self.closed, outcome);
    }

    fn reject_ready(&mut self, error: StreamError, settle: &mut Settlements) {
        if self.ready.is_pending() {
            settle.signal(&self.ready, Err(error));
        } else {
            self.ready = Deferred::rejected(error);
        }
    }
}

/// Wake-up sender held by user-facing handles; see [`CommandLink`](super::readable::CommandLink).
pub(crate) type WakeLink = SharedPtr<UnboundedSender<()>>;

pub(crate) struct WritableShared {
    pub(crate) inner: Mutex<WritableInner>,
    /// Claimed by whichever of close or abort fires the sink first.
    shutdown: AtomicBool,
    abort_requested: AtomicBool,
    abort_waker: AtomicWaker,
    pub(crate) lock: StreamLock,
    wake_tx: SharedWeak<UnboundedSender<()>>,
    strategy: BoxedStrategy,
}

impl WritableShared {
    fn new(strategy: BoxedStrategy) -> (SharedPtr<Self>, WakeLink, UnboundedReceiver<()>) {
        let (wake_tx, wake_rx) = unbounded();
        let link = SharedPtr::new(wake_tx);
        let ready = if strategy.high_water_mark() > 0 {
            Deferred::resolved(())
        } else {
            Deferred::new()
        };
        let shared = SharedPtr::new(Self {
            inner: Mutex::new(WritableInner {
                state: WritableStreamState::Writable,
                started: false,
                close_requested: false,
                queue: VecDeque::new(),
                queue_total_size: 0,
                in_flight: None,
                close: None,
                abort: None,
                pending_abort: None,
                closed: Deferred::new(),
                ready,
                stored_error: None,
                writer: None,
            }),
            shutdown: AtomicBool::new(false),
            abort_requested: AtomicBool::new(false),
            abort_waker: AtomicWaker::new(),
            lock: StreamLock::new(),
            wake_tx: SharedPtr::downgrade(&link),
            strategy,
        });
        (shared, link, wake_rx)
    }

    fn wake_driver(&self) {
        if let Some(tx) = self.wake_tx.upgrade() {
            let _ = tx.unbounded_send(());
        }
    }

    fn claim_shutdown(&self) -> bool {
        self.shutdown
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn desired_size_locked(&self, inner: &WritableInner) -> Option<isize> {
        match inner.state {
            WritableStreamState::Errored => None,
            WritableStreamState::Closed => Some(0),
            WritableStreamState::Writable => Some(
                self.strategy.high_water_mark() as isize - inner.queue_total_size as isize,
            ),
        }
    }

    pub(crate) fn desired_size(&self) -> Option<isize> {
        let inner = self.inner.lock();
        self.desired_size_locked(&inner)
    }

    pub(crate) fn state(&self) -> WritableStreamState {
        self.inner.lock().state
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.abort_requested.load(Ordering::SeqCst)
    }

    /// Resolves once `abort` has been requested.
    pub(crate) fn abort_signal(&self) -> impl Future<Output = ()> + '_ {
        poll_fn(move |cx| {
            if self.is_aborted() {
                return Poll::Ready(());
            }
            self.abort_waker.register(cx.waker());
            if self.is_aborted() {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
    }

    fn update_ready(&self, inner: &mut WritableInner, settle: &mut Settlements) {
        if inner.state != WritableStreamState::Writable {
            return;
        }
        let backpressure = self.desired_size_locked(inner).is_some_and(|size| size <= 0);
        if backpressure && inner.ready.is_fulfilled() {
            tracing::trace!("writable stream backpressure on");
            inner.ready = Deferred::new();
        } else if !backpressure && inner.ready.is_pending() {
            tracing::trace!("writable stream backpressure off");
            settle.signal(&inner.ready, Ok(()));
        }
    }

    /// Move to `Errored` without touching the sink.
    fn error_locked(&self, inner: &mut WritableInner, error: StreamError, settle: &mut Settlements) {
        if inner.state != WritableStreamState::Writable {
            return;
        }
        tracing::debug!(%error, "writable stream errored");
        inner.state = WritableStreamState::Errored;
        inner.stored_error = Some(error.clone());
        self.shutdown.store(true, Ordering::SeqCst);
        for write in inner.queue.drain(..) {
            settle.signal(&write.completion, Err(error.clone()));
        }
        inner.queue_total_size = inner.in_flight.as_ref().map_or(0, |(_, size)| *size);
        if let Some(close) = &inner.close {
            settle.signal(close, Err(error.clone()));
        }
        inner.reject_ready(error.clone(), settle);
        inner.settle_closed(Err(error), settle);
    }

    pub(crate) fn error(&self, error: StreamError) {
        let mut settle = Settlements::default();
        {
            let mut inner = self.inner.lock();
            self.error_locked(&mut inner, error, &mut settle);
        }
        settle.run();
        self.wake_driver();
    }

    /// Close without running the sink's close; queued writes fail with
    /// `reason`.
    pub(crate) fn close_without_sink(&self, reason: StreamError) {
        let mut settle = Settlements::default();
        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if inner.state != WritableStreamState::Writable {
                return;
            }
            self.shutdown.store(true, Ordering::SeqCst);
            inner.state = WritableStreamState::Closed;
            for write in inner.queue.drain(..) {
                settle.signal(&write.completion, Err(reason.clone()));
            }
            if let Some(close) = &inner.close {
                settle.signal(close, Ok(()));
            }
            settle.signal(&inner.ready, Ok(()));
            inner.settle_closed(Ok(()), &mut settle);
            tracing::debug!("writable stream closed without sink close");
        }
        settle.run();
        self.wake_driver();
    }

    // ----------- Producer API -----------

    pub(crate) fn acquire(&self) -> StreamResult<LockToken> {
        let token = self.lock.try_acquire()?;
        let mut inner = self.inner.lock();
        let closed = Deferred::new();
        if let Some(outcome) = inner.closed.outcome() {
            closed.settle(outcome);
        }
        inner.writer = Some(WriterSlot { token, closed });
        Ok(token)
    }

    pub(crate) fn release(&self, token: LockToken) {
        let slot = {
            let mut inner = self.inner.lock();
            match &inner.writer {
                Some(slot) if slot.token == token => inner.writer.take(),
                _ => None,
            }
        };
        if let Some(slot) = slot {
            slot.closed.reject(StreamError::Released);
        }
        self.lock.release(token);
    }

    pub(crate) fn write(&self, chunk: Chunk) -> DeferredFuture<()> {
        let mut settle = Settlements::default();
        let fut = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            match inner.state {
                WritableStreamState::Errored => {
                    return Deferred::rejected(inner.get_stored_error()).wait();
                }
                WritableStreamState::Closed => {
                    return Deferred::rejected(StreamError::Closed).wait();
                }
                WritableStreamState::Writable if inner.close_requested => {
                    return Deferred::rejected(StreamError::Closing).wait();
                }
                WritableStreamState::Writable => {}
            }
            let size = self.strategy.size(&chunk);
            let completion = Deferred::new();
            inner.queue.push_back(PendingWrite {
                chunk,
                size,
                completion: completion.clone(),
            });
            inner.queue_total_size += size;
            self.update_ready(inner, &mut settle);
            completion.wait()
        };
        settle.run();
        self.wake_driver();
        fut
    }

    pub(crate) fn close(&self) -> DeferredFuture<()> {
        let mut settle = Settlements::default();
        let fut = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if let Some(close) = &inner.close {
                return close.wait();
            }
            match inner.state {
                WritableStreamState::Errored => {
                    return Deferred::rejected(inner.get_stored_error()).wait();
                }
                WritableStreamState::Closed => return Deferred::resolved(()).wait(),
                WritableStreamState::Writable => {}
            }
            tracing::debug!(queued = inner.queue.len(), "writable stream close requested");
            let close = Deferred::new();
            inner.close = Some(close.clone());
            inner.close_requested = true;
            settle.signal(&inner.ready, Ok(()));
            close.wait()
        };
        settle.run();
        self.wake_driver();
        fut
    }

    pub(crate) fn abort(&self, reason: Option<String>) -> DeferredFuture<()> {
        let mut settle = Settlements::default();
        let fut = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if let Some(abort) = &inner.abort {
                return abort.wait();
            }
            if inner.state != WritableStreamState::Writable {
                return Deferred::resolved(()).wait();
            }
            if !self.claim_shutdown() {
                // The sink is already closing; abort follows its outcome.
                return match &inner.close {
                    Some(close) => close.wait(),
                    None => Deferred::resolved(()).wait(),
                };
            }

            tracing::debug!(reason = ?reason, "writable stream aborted");
            let error = StreamError::Aborted(reason.clone());
            inner.state = WritableStreamState::Errored;
            inner.stored_error = Some(error.clone());
            for write in inner.queue.drain(..) {
                settle.signal(&write.completion, Err(error.clone()));
            }
            if let Some((in_flight, _)) = &inner.in_flight {
                settle.signal(in_flight, Err(error.clone()));
            }
            if let Some(close) = &inner.close {
                settle.signal(close, Err(error.clone()));
            }
            inner.reject_ready(error, &mut settle);

            let abort = Deferred::new();
            inner.abort = Some(abort.clone());
            inner.pending_abort = Some(reason);
            abort.wait()
        };
        settle.run();
        self.abort_requested.store(true, Ordering::SeqCst);
        self.abort_waker.wake();
        self.wake_driver();
        fut
    }

    // ----------- Driver bookkeeping -----------

    fn next_action(&self) -> SinkAction {
        let mut inner = self.inner.lock();
        if let Some(reason) = inner.pending_abort.take() {
            return SinkAction::Abort(reason);
        }
        if !inner.started {
            return SinkAction::Wait;
        }
        if inner.state != WritableStreamState::Writable {
            return SinkAction::Done;
        }
        if inner.in_flight.is_some() {
            return SinkAction::Wait;
        }
        if let Some(write) = inner.queue.pop_front() {
            inner.in_flight = Some((write.completion, write.size));
            return SinkAction::Write(write.chunk);
        }
        if inner.close_requested {
            if self.claim_shutdown() {
                return SinkAction::Close;
            }
            return SinkAction::Wait;
        }
        SinkAction::Wait
    }

    fn finish_start(&self, result: StreamResult<()>) {
        let mut settle = Settlements::default();
        {
            let mut inner = self.inner.lock();
            inner.started = true;
            if let Err(error) = result {
                tracing::warn!(%error, "writable sink start failed");
                self.error_locked(&mut inner, error, &mut settle);
            }
        }
        settle.run();
    }

    fn finish_write(&self, result: StreamResult<()>) {
        let mut settle = Settlements::default();
        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let Some((completion, size)) = inner.in_flight.take() else {
                return;
            };
            inner.queue_total_size = inner.queue_total_size.saturating_sub(size);
            match result {
                Ok(()) => {
                    settle.signal(&completion, Ok(()));
                    self.update_ready(inner, &mut settle);
                }
                Err(error) => {
                    if inner.state == WritableStreamState::Writable {
                        tracing::warn!(%error, "writable sink write failed");
                    }
                    settle.signal(&completion, Err(error.clone()));
                    self.error_locked(inner, error, &mut settle);
                }
            }
        }
        settle.run();
    }

    fn finish_close(&self, result: StreamResult<()>) {
        let mut settle = Settlements::default();
        {
            let mut inner = self.inner.lock();
            match &result {
                Ok(()) => {
                    inner.state = WritableStreamState::Closed;
                    tracing::debug!("writable stream closed");
                }
                Err(error) => {
                    tracing::warn!(%error, "writable sink close failed");
                    inner.state = WritableStreamState::Errored;
                    inner.stored_error = Some(error.clone());
                    inner.reject_ready(error.clone(), &mut settle);
                }
            }
            if let Some(close) = &inner.close {
                settle.signal(close, result.clone());
            }
            inner.settle_closed(result, &mut settle);
        }
        settle.run();
    }

    fn finish_abort(&self, result: StreamResult<()>) {
        let mut settle = Settlements::default();
        {
            let inner = self.inner.lock();
            if let Err(error) = &result {
                tracing::warn!(%error, "writable sink abort failed");
            }
            // Shutdown completes even when the sink's abort fails.
            inner.settle_closed(Ok(()), &mut settle);
            if let Some(abort) = &inner.abort {
                settle.signal(abort, result);
            }
        }
        settle.run();
    }
}

// ----------- Driver Task -----------
pub(crate) async fn writable_stream_task<Sink: WritableSink>(
    mut sink: Sink,
    shared: SharedPtr<WritableShared>,
    mut wake_rx: UnboundedReceiver<()>,
) {
    let mut controller = WritableStreamDefaultController {
        shared: SharedPtr::clone(&shared),
    };

    let started = sink.start(&mut controller).await;
    shared.finish_start(started);

    loop {
        match shared.next_action() {
            SinkAction::Write(chunk) => {
                let result = {
                    let write = pin!(sink.write(chunk, &mut controller));
                    let aborted = pin!(shared.abort_signal());
                    match future::select(write, aborted).await {
                        Either::Left((result, _)) => result,
                        Either::Right(((), _)) => Err(StreamError::Aborted(None)),
                    }
                };
                shared.finish_write(result);
            }
            SinkAction::Close => {
                let result = sink.close().await;
                shared.finish_close(result);
                return;
            }
            SinkAction::Abort(reason) => {
                let result = sink.abort(reason).await;
                shared.finish_abort(result);
                return;
            }
            SinkAction::Wait => {
                if wake_rx.next().await.is_none() {
                    return;
                }
            }
            SinkAction::Done => return,
        }
    }
}

// ----------- Controller -----------
#[derive(Clone)]
pub struct WritableStreamDefaultController {
    shared: SharedPtr<WritableShared>,
}

impl WritableStreamDefaultController {
    /// Signal an error on the stream
    pub fn error(&self, error: StreamError) {
        self.shared.error(error)
    }

    /// Returns `true` if the stream has been aborted.
    pub fn is_aborted(&self) -> bool {
        self.shared.is_aborted()
    }

    /// Returns a future that resolves once the stream is aborted.
    ///
    /// Sinks doing long writes can race their work against it, or use
    /// [`with_abort`](Self::with_abort):
    ///
    /// ```no_run
    /// # use chunked_streams::*;
    /// # async fn slow_io(_: Chunk) {}
    /// # struct Sink;
    /// # impl Sink {
    /// async fn write(
    ///     &mut self,
    ///     chunk: Chunk,
    ///     controller: &mut WritableStreamDefaultController,
    /// ) -> StreamResult<()> {
    ///     controller.with_abort(slow_io(chunk)).await
    /// }
    /// # }
    /// ```
    pub fn abort_future(&self) -> impl Future<Output = ()> + MaybeSend + 'static + use<> {
        let shared = SharedPtr::clone(&self.shared);
        poll_fn(move |cx| {
            if shared.is_aborted() {
                return Poll::Ready(());
            }
            shared.abort_waker.register(cx.waker());
            if shared.is_aborted() {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
    }

    /// Races a future against the abort signal.
    ///
    /// If the abort fires first, returns `Err(StreamError::Aborted)`.
    pub fn with_abort<F, T>(&self, fut: F) -> impl Future<Output = StreamResult<T>>
    where
        F: Future<Output = T>,
    {
        let abort_fut = self.abort_future();
        async move {
            let fut = pin!(fut);
            let abort_fut = pin!(abort_fut);
            future::select(fut, abort_fut).map(|either| match either {
                Either::Left((value, _)) => Ok(value),
                Either::Right(((), _)) => Err(StreamError::Aborted(None)),
            })
            .await
        }
    }
}

// ----------- Main WritableStream -----------
/// Cloneable handle on a writable stream.
///
/// The driver and its sink are dropped once every handle and writer is gone
/// and no queued write or close is left for the sink.
#[derive(Clone)]
pub struct WritableStream {
    pub(crate) shared: SharedPtr<WritableShared>,
    pub(crate) link: WakeLink,
}

impl WritableStream {
    pub(crate) fn new_parts(strategy: BoxedStrategy) -> (Self, UnboundedReceiver<()>) {
        let (shared, link, wake_rx) = WritableShared::new(strategy);
        (Self { shared, link }, wake_rx)
    }

    pub fn builder<Sink: WritableSink>(sink: Sink) -> WritableStreamBuilder<Sink> {
        WritableStreamBuilder::new(sink)
    }

    pub fn locked(&self) -> bool {
        self.shared.lock.is_locked()
    }

    pub fn state(&self) -> WritableStreamState {
        self.shared.state()
    }

    pub fn desired_size(&self) -> Option<isize> {
        self.shared.desired_size()
    }

    pub fn get_writer(&self) -> StreamResult<WritableStreamDefaultWriter> {
        let token = self.shared.acquire()?;
        Ok(WritableStreamDefaultWriter::new(self.clone(), token))
    }

    /// Close an unlocked stream once queued writes finish.
    pub fn close(&self) -> DeferredFuture<()> {
        if self.locked() {
            return Deferred::rejected(StreamError::LockContention).wait();
        }
        self.shared.close()
    }

    /// Abort an unlocked stream.
    pub fn abort(&self, reason: Option<String>) -> DeferredFuture<()> {
        if self.locked() {
            return Deferred::rejected(StreamError::LockContention).wait();
        }
        self.shared.abort(reason)
    }
}

// ----------- Builder -----------
pub struct WritableStreamBuilder<Sink> {
    sink: Sink,
    strategy: BoxedStrategy,
}

impl<Sink: WritableSink> WritableStreamBuilder<Sink> {
    fn new(sink: Sink) -> Self {
        Self {
            sink,
            strategy: Box::new(CountQueuingStrategy::new(1)),
        }
    }

    pub fn strategy<S>(mut self, s: S) -> Self
    where
        S: QueuingStrategy + MaybeSend + MaybeSync + 'static,
    {
        self.strategy = Box::new(s);
        self
    }

    pub fn config(mut self, config: &StreamConfig) -> Self {
        self.strategy = config.boxed_strategy();
        self
    }

    /// Return stream + future without spawning
    pub fn prepare(self) -> (WritableStream, impl Future<Output = ()> + MaybeSend + 'static) {
        let (stream, wake_rx) = WritableStream::new_parts(self.strategy);
        let task = writable_stream_task(self.sink, SharedPtr::clone(&stream.shared), wake_rx);
        (stream, task)
    }

    pub fn spawn<F, R>(self, spawn_fn: F) -> WritableStream
    where
        F: FnOnce(PlatformBoxFutureStatic<()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(Box::pin(fut));
        stream
    }

    pub fn spawn_ref<F, R>(self, spawn_fn: &'static F) -> WritableStream
    where
        F: Fn(PlatformBoxFutureStatic<()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(Box::pin(fut));
        stream
    }
}
