use super::{
    ByteLengthQueuingStrategy, CountQueuingStrategy, QueuingStrategy, StreamConfig,
    byob::{ByteSource, ReadableByteSource, ReadableStreamBYOBReader},
    chunk::Chunk,
    deferred::{Deferred, DeferredFuture, Settlements},
    error::StreamError,
    lock::{LockToken, StreamLock},
    queue::ChunkQueue,
    reader::{ReadRequest, ReadableStreamDefaultReader, ReaderSlot, ViewKind},
};
use crate::platform::{
    BoxedStrategy, MaybeSend, MaybeSync, PlatformBoxFutureStatic, SharedPtr, SharedWeak,
};
use futures::{
    StreamExt,
    channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded},
    future::{self, Either},
    stream::Stream,
};
use parking_lot::Mutex;
use std::{
    future::Future,
    marker::PhantomData,
    pin::pin,
    sync::atomic::{AtomicBool, Ordering},
};

type StreamResult<T> = Result<T, StreamError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadableStreamState {
    Readable,
    Closed,
    Errored,
}

// ----------- Stream Type Markers -----------
pub struct DefaultStream;
pub struct ByteStream;

// ----------- Source Traits -----------
/// Producer callbacks for a default (chunk) stream.
///
/// Every callback is optional; a source that only pushes through a stored
/// controller can leave `pull` as the default no-op.
pub trait ReadableSource: MaybeSend + 'static {
    fn start(
        &mut self,
        controller: &mut ReadableStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        async { Ok(()) }
    }

    /// Called when a read finds the queue empty.
    fn pull(
        &mut self,
        controller: &mut ReadableStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        async { Ok(()) }
    }

    fn cancel(
        &mut self,
        reason: Option<String>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = reason;
        async { Ok(()) }
    }
}

/// Uniform view over default and byte sources for the driver task.
pub(crate) trait UnderlyingSource: MaybeSend + 'static {
    type Controller: MaybeSend + 'static;

    fn controller(shared: &SharedPtr<ReadableShared>) -> Self::Controller;

    fn start(
        &mut self,
        controller: &mut Self::Controller,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    fn pull(
        &mut self,
        controller: &mut Self::Controller,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    fn cancel(
        &mut self,
        reason: Option<String>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;
}

pub(crate) struct DefaultSource<S>(pub(crate) S);

impl<S: ReadableSource> UnderlyingSource for DefaultSource<S> {
    type Controller = ReadableStreamDefaultController;

    fn controller(shared: &SharedPtr<ReadableShared>) -> Self::Controller {
        ReadableStreamDefaultController {
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

// ----------- Driver Commands -----------
pub(crate) enum SourceCommand {
    Pull,
    Cancel {
        reason: Option<String>,
        completion: Deferred<()>,
    },
    /// The stream no longer needs its source.
    Detach,
}

/// Sender half held by user-facing handles. The driver exits once the last
/// handle, and with it the last link, is gone.
pub(crate) type CommandLink = SharedPtr<UnboundedSender<SourceCommand>>;

// ----------- Inner State -----------
pub(crate) struct ReadableInner {
    pub(crate) state: ReadableStreamState,
    pub(crate) queue: ChunkQueue,
    pub(crate) close_requested: bool,
    pub(crate) started: bool,
    pub(crate) pulling: bool,
    pub(crate) pull_again: bool,
    pub(crate) stored_error: Option<StreamError>,
    pub(crate) reader: Option<ReaderSlot>,
    pub(crate) cancel: Option<Deferred<()>>,
    pub(crate) byte_mode: bool,
    pub(crate) auto_allocate_chunk_size: Option<usize>,
}

impl ReadableInner {
    pub(crate) fn get_stored_error(&self) -> StreamError {
        self.stored_error
            .clone()
            .unwrap_or_else(|| "Stream is errored".into())
    }

    pub(crate) fn slot_mut(&mut self, token: LockToken) -> Option<&mut ReaderSlot> {
        self.reader.as_mut().filter(|slot| slot.token == token)
    }

    fn has_pending_reads(&self) -> bool {
        self.reader
            .as_ref()
            .is_some_and(|slot| !slot.pending.is_empty())
    }
}

pub(crate) struct ReadableShared {
    pub(crate) inner: Mutex<ReadableInner>,
    closed: AtomicBool,
    errored: AtomicBool,
    pub(crate) lock: StreamLock,
    commands: SharedWeak<UnboundedSender<SourceCommand>>,
    strategy: BoxedStrategy,
}

impl ReadableShared {
    fn new(
        strategy: BoxedStrategy,
        byte_mode: bool,
        auto_allocate_chunk_size: Option<usize>,
    ) -> (SharedPtr<Self>, CommandLink, UnboundedReceiver<SourceCommand>) {
        let (command_tx, command_rx) = unbounded();
        let link = SharedPtr::new(command_tx);
        let shared = SharedPtr::new(Self {
            inner: Mutex::new(ReadableInner {
                state: ReadableStreamState::Readable,
                queue: ChunkQueue::new(),
                close_requested: false,
                started: false,
                pulling: false,
                pull_again: false,
                stored_error: None,
                reader: None,
                cancel: None,
                byte_mode,
                auto_allocate_chunk_size,
            }),
            closed: AtomicBool::new(false),
            errored: AtomicBool::new(false),
            lock: StreamLock::new(),
            commands: SharedPtr::downgrade(&link),
            strategy,
        });
        (shared, link, command_rx)
    }

    /// `false` when the driver can no longer receive commands.
    fn send(&self, command: SourceCommand) -> bool {
        self.commands
            .upgrade()
            .is_some_and(|tx| tx.unbounded_send(command).is_ok())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn is_errored(&self) -> bool {
        self.errored.load(Ordering::SeqCst)
    }

    pub(crate) fn desired_size_locked(&self, inner: &ReadableInner) -> Option<isize> {
        match inner.state {
            ReadableStreamState::Errored => None,
            ReadableStreamState::Closed => Some(0),
            ReadableStreamState::Readable if inner.close_requested => Some(0),
            ReadableStreamState::Readable => {
                let queued: usize = inner.queue.iter().map(|c| self.strategy.size(c)).sum();
                Some(self.strategy.high_water_mark() as isize - queued as isize)
            }
        }
    }

    pub(crate) fn desired_size(&self) -> Option<isize> {
        let inner = self.inner.lock();
        self.desired_size_locked(&inner)
    }

    // ----------- Producer side -----------

    pub(crate) fn enqueue(&self, chunk: Chunk) -> StreamResult<()> {
        let mut settle = Settlements::default();
        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            match inner.state {
                ReadableStreamState::Errored => return Err(inner.get_stored_error()),
                ReadableStreamState::Closed => return Err(StreamError::Closed),
                ReadableStreamState::Readable if inner.close_requested => {
                    return Err(StreamError::Closing);
                }
                ReadableStreamState::Readable => {}
            }
            if chunk.is_empty() {
                return Ok(());
            }

            // Hand the chunk straight to the oldest waiting read when it accepts
            // whole chunks; views that need filling go through the queue.
            let passthrough = inner.reader.as_mut().and_then(|slot| {
                let accepts = slot.pending.front().is_some_and(|head| head.accepts_chunk());
                if accepts { slot.pending.pop_front() } else { None }
            });
            match passthrough {
                Some(request) => settle.read(request.deferred, Ok(Some(chunk))),
                None => {
                    inner.queue.push(chunk)?;
                }
            }
            self.process_pending(inner, &mut settle);
        }
        settle.run();
        Ok(())
    }

    pub(crate) fn close(&self) -> StreamResult<()> {
        let mut settle = Settlements::default();
        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            match inner.state {
                ReadableStreamState::Errored => return Err(inner.get_stored_error()),
                ReadableStreamState::Closed => return Ok(()),
                ReadableStreamState::Readable if inner.close_requested => return Ok(()),
                ReadableStreamState::Readable => {}
            }
            inner.close_requested = true;
            tracing::debug!(queued = inner.queue.nbytes(), "readable stream close requested");
            if inner.queue.is_empty() {
                self.finalize_close(inner, &mut settle);
            }
            self.detach_source();
        }
        settle.run();
        Ok(())
    }

    pub(crate) fn error(&self, error: StreamError) {
        let mut settle = Settlements::default();
        {
            let mut guard = self.inner.lock();
            self.error_locked(&mut guard, error, &mut settle);
        }
        settle.run();
    }

    fn error_locked(&self, inner: &mut ReadableInner, error: StreamError, settle: &mut Settlements) {
        if inner.state != ReadableStreamState::Readable {
            return;
        }
        tracing::debug!(%error, "readable stream errored");
        inner.state = ReadableStreamState::Errored;
        inner.stored_error = Some(error.clone());
        self.errored.store(true, Ordering::SeqCst);
        inner.queue.clear();
        inner.queue.close();
        if let Some(slot) = inner.reader.as_mut() {
            for request in slot.pending.drain(..) {
                settle.read(request.deferred, Err(error.clone()));
            }
            settle.signal(&slot.closed, Err(error));
        }
        self.detach_source();
    }

    fn finalize_close(&self, inner: &mut ReadableInner, settle: &mut Settlements) {
        if inner.state != ReadableStreamState::Readable {
            return;
        }
        inner.state = ReadableStreamState::Closed;
        inner.queue.close();
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tracing::debug!("readable stream closed");
        }
        if let Some(slot) = inner.reader.as_mut() {
            for request in slot.pending.drain(..) {
                settle.read(request.deferred, Ok(None));
            }
            settle.signal(&slot.closed, Ok(()));
        }
    }

    fn detach_source(&self) {
        self.send(SourceCommand::Detach);
    }

    /// Move queued bytes into the oldest pending reads, in order, until
    /// either side runs out. Closes the stream once a requested close has
    /// drained the queue.
    pub(crate) fn process_pending(&self, inner: &mut ReadableInner, settle: &mut Settlements) {
        loop {
            if inner.queue.is_empty() {
                break;
            }
            let Some(slot) = inner.reader.as_mut() else {
                break;
            };
            let Some(head) = slot.pending.front_mut() else {
                break;
            };
            match head.view.as_mut() {
                Some(view) if view.kind == ViewKind::Byob => {
                    let Some(mut buffer) = view.buffer.take() else {
                        // The view is lent to a BYOB request; wait for respond().
                        break;
                    };
                    let n = inner.queue.read(&mut buffer);
                    let request = slot.pending.pop_front();
                    if let Some(request) = request {
                        settle.read(request.deferred, Ok(Some(Chunk::from_vec(buffer).narrow(n))));
                    }
                }
                _ => {
                    let request = slot.pending.pop_front();
                    if let (Some(request), Some(chunk)) = (request, inner.queue.next()) {
                        settle.read(request.deferred, Ok(Some(chunk)));
                    }
                }
            }
        }
        if inner.close_requested && inner.queue.is_empty() {
            self.finalize_close(inner, settle);
        }
    }

    // ----------- Pull scheduling -----------

    fn should_call_pull(&self, inner: &ReadableInner) -> bool {
        inner.state == ReadableStreamState::Readable
            && inner.started
            && !inner.close_requested
            && inner.queue.is_empty()
            && inner.has_pending_reads()
    }

    pub(crate) fn call_pull_if_needed(&self, inner: &mut ReadableInner) {
        if !self.should_call_pull(inner) {
            return;
        }
        if inner.pulling {
            inner.pull_again = true;
            return;
        }
        inner.pulling = true;
        tracing::trace!("requesting pull from source");
        if !self.send(SourceCommand::Pull) {
            inner.pulling = false;
            tracing::warn!("readable source driver is gone; pull dropped");
        }
    }

    fn finish_start(&self, result: StreamResult<()>) {
        let mut settle = Settlements::default();
        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            match result {
                Ok(()) => {
                    inner.started = true;
                    self.call_pull_if_needed(inner);
                }
                Err(error) => {
                    tracing::warn!(%error, "readable source start failed");
                    self.error_locked(inner, error, &mut settle);
                }
            }
        }
        settle.run();
    }

    fn finish_pull(&self, result: StreamResult<()>) {
        let mut settle = Settlements::default();
        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            inner.pulling = false;
            match result {
                Ok(()) => {
                    tracing::trace!("pull finished");
                    if inner.pull_again {
                        inner.pull_again = false;
                        self.call_pull_if_needed(inner);
                    }
                }
                Err(error) => {
                    tracing::warn!(%error, "readable source pull failed");
                    self.error_locked(inner, error, &mut settle);
                }
            }
        }
        settle.run();
    }

    fn source_needed(&self) -> bool {
        let inner = self.inner.lock();
        inner.state == ReadableStreamState::Readable && !inner.close_requested
    }

    // ----------- Consumer side -----------

    pub(crate) fn acquire(&self) -> StreamResult<LockToken> {
        let token = self.lock.try_acquire()?;
        let mut inner = self.inner.lock();
        let closed = match inner.state {
            ReadableStreamState::Readable => Deferred::new(),
            ReadableStreamState::Closed => Deferred::resolved(()),
            ReadableStreamState::Errored => Deferred::rejected(inner.get_stored_error()),
        };
        inner.reader = Some(ReaderSlot::new(token, closed));
        Ok(token)
    }

    /// Register a read for the lock holder `token`.
    pub(crate) fn read(
        &self,
        token: LockToken,
        view: Option<(ViewKind, Vec<u8>)>,
    ) -> DeferredFuture<Option<Chunk>> {
        let mut settle = Settlements::default();
        let fut = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if inner.slot_mut(token).is_none() {
                return Deferred::rejected(StreamError::NotLocked).wait();
            }
            match inner.state {
                ReadableStreamState::Errored => {
                    return Deferred::rejected(inner.get_stored_error()).wait();
                }
                ReadableStreamState::Closed => return Deferred::resolved(None).wait(),
                ReadableStreamState::Readable => {}
            }

            let view = match view {
                Some(view) => Some(view),
                None if inner.byte_mode => match inner.auto_allocate_chunk_size {
                    Some(size) => match auto_allocate(size) {
                        Ok(buffer) => Some((ViewKind::AutoAllocated, buffer)),
                        Err(error) => return Deferred::rejected(error).wait(),
                    },
                    None => None,
                },
                None => None,
            };

            let Some(slot) = inner.slot_mut(token) else {
                return Deferred::rejected(StreamError::NotLocked).wait();
            };
            let fut = slot.push_request(view).wait();
            self.process_pending(inner, &mut settle);
            self.call_pull_if_needed(inner);
            fut
        };
        settle.run();
        fut
    }

    pub(crate) fn cancel(&self, reason: Option<String>) -> DeferredFuture<()> {
        let mut settle = Settlements::default();
        let fut = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if let Some(cancel) = &inner.cancel {
                return cancel.wait();
            }
            match inner.state {
                ReadableStreamState::Errored => {
                    return Deferred::rejected(inner.get_stored_error()).wait();
                }
                ReadableStreamState::Closed => return Deferred::resolved(()).wait(),
                ReadableStreamState::Readable => {}
            }

            tracing::debug!(reason = ?reason, "readable stream canceled");
            let completion = Deferred::new();
            inner.cancel = Some(completion.clone());
            inner.queue.clear();
            inner.close_requested = true;
            self.finalize_close(inner, &mut settle);

            let command = SourceCommand::Cancel {
                reason,
                completion: completion.clone(),
            };
            if !self.send(command) {
                // Source already detached; nothing left to notify.
                settle.signal(&completion, Ok(()));
            }
            completion.wait()
        };
        settle.run();
        fut
    }

    /// Drop the reader slot for `token` and unlock.
    pub(crate) fn release(&self, token: LockToken) {
        let mut settle = Settlements::default();
        {
            let mut inner = self.inner.lock();
            if inner.slot_mut(token).is_some() {
                if let Some(mut slot) = inner.reader.take() {
                    for request in slot.pending.drain(..) {
                        settle.read(request.deferred, Err(StreamError::Released));
                    }
                    settle.signal(&slot.closed, Err(StreamError::Released));
                }
            }
        }
        settle.run();
        self.lock.release(token);
    }
}

fn auto_allocate(size: usize) -> StreamResult<Vec<u8>> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(size)
        .map_err(|_| StreamError::AllocationFailure { requested: size })?;
    buffer.resize(size, 0);
    Ok(buffer)
}

// ----------- Controllers -----------
/// Producer handle passed to [`ReadableSource`] callbacks.
#[derive(Clone)]
pub struct ReadableStreamDefaultController {
    pub(crate) shared: SharedPtr<ReadableShared>,
}

impl ReadableStreamDefaultController {
    /// `None` once errored, `Some(0)` once closed.
    pub fn desired_size(&self) -> Option<isize> {
        self.shared.desired_size()
    }

    /// Close the stream; already queued chunks remain readable.
    pub fn close(&self) -> StreamResult<()> {
        self.shared.close()
    }

    /// Queue a chunk, or hand it straight to a waiting read.
    pub fn enqueue(&self, chunk: impl Into<Chunk>) -> StreamResult<()> {
        self.shared.enqueue(chunk.into())
    }

    pub fn error(&self, error: StreamError) {
        self.shared.error(error)
    }
}

// ----------- Driver Task -----------
enum PullOutcome {
    Finished(StreamResult<()>),
    Interrupted {
        reason: Option<String>,
        completion: Deferred<()>,
    },
    Detached,
}

async fn run_cancel<U: UnderlyingSource>(
    source: &mut U,
    reason: Option<String>,
    completion: Deferred<()>,
) {
    let result = source.cancel(reason).await;
    if let Err(error) = &result {
        tracing::warn!(%error, "readable source cancel failed");
    }
    completion.settle(result);
}

/// Owns the source and runs its callbacks one at a time.
pub(crate) async fn readable_stream_task<U: UnderlyingSource>(
    mut source: U,
    shared: SharedPtr<ReadableShared>,
    mut commands: UnboundedReceiver<SourceCommand>,
) {
    let mut controller = U::controller(&shared);

    let started = source.start(&mut controller).await;
    shared.finish_start(started);

    let mut detached = !shared.source_needed();
    loop {
        if detached {
            // Only a late cancel can still reach the source.
            while let Ok(cmd) = commands.try_recv() {
                if let SourceCommand::Cancel { reason, completion } = cmd {
                    run_cancel(&mut source, reason, completion).await;
                }
            }
            return;
        }

        let Some(cmd) = commands.next().await else {
            return;
        };
        match cmd {
            SourceCommand::Pull => {
                let outcome = {
                    let mut pull = pin!(source.pull(&mut controller));
                    loop {
                        match future::select(pull.as_mut(), commands.next()).await {
                            Either::Left((result, _)) => break PullOutcome::Finished(result),
                            Either::Right((Some(SourceCommand::Cancel { reason, completion }), _)) => {
                                break PullOutcome::Interrupted { reason, completion };
                            }
                            Either::Right((Some(SourceCommand::Pull), _)) => {}
                            Either::Right((Some(SourceCommand::Detach), _)) => detached = true,
                            Either::Right((None, _)) => break PullOutcome::Detached,
                        }
                    }
                };
                match outcome {
                    PullOutcome::Finished(result) => shared.finish_pull(result),
                    PullOutcome::Interrupted { reason, completion } => {
                        shared.finish_pull(Ok(()));
                        run_cancel(&mut source, reason, completion).await;
                        return;
                    }
                    PullOutcome::Detached => return,
                }
            }
            SourceCommand::Cancel { reason, completion } => {
                run_cancel(&mut source, reason, completion).await;
                return;
            }
            SourceCommand::Detach => detached = true,
        }
        detached = detached || !shared.source_needed();
    }
}

// ----------- Main ReadableStream -----------
/// Cloneable handle on a readable stream.
///
/// The driver and its source are dropped once every handle, reader and pipe
/// referring to the stream is gone.
#[derive(Clone)]
pub struct ReadableStream {
    pub(crate) shared: SharedPtr<ReadableShared>,
    pub(crate) link: CommandLink,
}

impl ReadableStream {
    pub(crate) fn new_parts(
        strategy: BoxedStrategy,
        byte_mode: bool,
        auto_allocate_chunk_size: Option<usize>,
    ) -> (Self, UnboundedReceiver<SourceCommand>) {
        let (shared, link, command_rx) =
            ReadableShared::new(strategy, byte_mode, auto_allocate_chunk_size);
        (Self { shared, link }, command_rx)
    }

    pub(crate) fn controller(&self) -> ReadableStreamDefaultController {
        ReadableStreamDefaultController {
            shared: SharedPtr::clone(&self.shared),
        }
    }

    /// Returns a builder for a default stream over `source`
    pub fn builder<Source: ReadableSource>(
        source: Source,
    ) -> ReadableStreamBuilder<Source, DefaultStream> {
        ReadableStreamBuilder::new(source)
    }

    /// Returns a builder for a byte stream over `source`
    pub fn builder_bytes<Source: ReadableByteSource>(
        source: Source,
    ) -> ReadableStreamBuilder<Source, ByteStream> {
        ReadableStreamBuilder::new_bytes(source)
    }

    pub fn from_iterator<I>(iter: I) -> ReadableStreamBuilder<IteratorSource<I::IntoIter>, DefaultStream>
    where
        I: IntoIterator,
        I::IntoIter: MaybeSend + 'static,
        I::Item: Into<Chunk>,
    {
        ReadableStreamBuilder::new(IteratorSource {
            iter: iter.into_iter(),
        })
    }

    pub fn from_vec<T>(
        items: Vec<T>,
    ) -> ReadableStreamBuilder<IteratorSource<std::vec::IntoIter<T>>, DefaultStream>
    where
        T: Into<Chunk> + MaybeSend + 'static,
    {
        Self::from_iterator(items)
    }

    pub fn from_stream<S>(stream: S) -> ReadableStreamBuilder<AsyncStreamSource<S>, DefaultStream>
    where
        S: Stream + Unpin + MaybeSend + 'static,
        S::Item: Into<Chunk> + MaybeSend,
    {
        ReadableStreamBuilder::new(AsyncStreamSource { stream })
    }

    pub fn locked(&self) -> bool {
        self.shared.lock.is_locked()
    }

    pub fn state(&self) -> ReadableStreamState {
        self.shared.inner.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn is_errored(&self) -> bool {
        self.shared.is_errored()
    }

    pub fn is_byte_stream(&self) -> bool {
        self.shared.inner.lock().byte_mode
    }

    pub fn desired_size(&self) -> Option<isize> {
        self.shared.desired_size()
    }

    /// Lock the stream to a new default reader.
    pub fn get_reader(&self) -> StreamResult<ReadableStreamDefaultReader> {
        let token = self.shared.acquire()?;
        Ok(ReadableStreamDefaultReader::new(self.clone(), token))
    }

    /// Lock a byte stream to a new BYOB reader.
    pub fn get_byob_reader(&self) -> StreamResult<ReadableStreamBYOBReader> {
        if !self.is_byte_stream() {
            return Err(StreamError::protocol("BYOB readers require a byte stream"));
        }
        let token = self.shared.acquire()?;
        Ok(ReadableStreamBYOBReader::new(self.clone(), token))
    }

    /// Cancel an unlocked stream.
    pub fn cancel(&self, reason: Option<String>) -> DeferredFuture<()> {
        if self.locked() {
            return Deferred::rejected(StreamError::LockContention).wait();
        }
        self.shared.cancel(reason)
    }
}

// ----------- Example Source Implementations  -----------
pub struct IteratorSource<I> {
    iter: I,
}

impl<I> ReadableSource for IteratorSource<I>
where
    I: Iterator + MaybeSend + 'static,
    I::Item: Into<Chunk>,
{
    async fn pull(&mut self, controller: &mut ReadableStreamDefaultController) -> StreamResult<()> {
        match self.iter.next() {
            Some(item) => controller.enqueue(item)?,
            None => controller.close()?,
        }
        Ok(())
    }
}

pub struct AsyncStreamSource<S> {
    stream: S,
}

impl<S> ReadableSource for AsyncStreamSource<S>
where
    S: Stream + Unpin + MaybeSend + 'static,
    S::Item: Into<Chunk> + MaybeSend,
{
    async fn pull(&mut self, controller: &mut ReadableStreamDefaultController) -> StreamResult<()> {
        match self.stream.next().await {
            Some(item) => controller.enqueue(item)?,
            None => controller.close()?,
        }
        Ok(())
    }
}

// ----------- Builder Pattern Implementation -----------
pub struct ReadableStreamBuilder<Source, StreamType = DefaultStream> {
    source: Source,
    strategy: BoxedStrategy,
    auto_allocate_chunk_size: Option<usize>,
    _phantom: PhantomData<StreamType>,
}

impl<Source, StreamType> ReadableStreamBuilder<Source, StreamType> {
    pub fn strategy<S>(mut self, s: S) -> Self
    where
        S: QueuingStrategy + MaybeSend + MaybeSync + 'static,
    {
        self.strategy = Box::new(s);
        self
    }

    /// Apply a whole [`StreamConfig`].
    pub fn config(mut self, config: &StreamConfig) -> Self {
        self.strategy = config.boxed_strategy();
        self.auto_allocate_chunk_size = config.auto_allocate_chunk_size;
        self
    }
}

impl<Source: ReadableSource> ReadableStreamBuilder<Source, DefaultStream> {
    fn new(source: Source) -> Self {
        Self {
            source,
            strategy: Box::new(CountQueuingStrategy::new(1)),
            auto_allocate_chunk_size: None,
            _phantom: PhantomData,
        }
    }

    /// Return stream + future without spawning
    pub fn prepare(self) -> (ReadableStream, impl Future<Output = ()> + MaybeSend + 'static) {
        let (stream, command_rx) = ReadableStream::new_parts(self.strategy, false, None);
        let task = readable_stream_task(
            DefaultSource(self.source),
            SharedPtr::clone(&stream.shared),
            command_rx,
        );
        (stream, task)
    }

    /// Spawn bundled into one task
    pub fn spawn<F, R>(self, spawn_fn: F) -> ReadableStream
    where
        F: FnOnce(PlatformBoxFutureStatic<()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(Box::pin(fut));
        stream
    }

    /// Spawn using a static function reference
    pub fn spawn_ref<F, R>(self, spawn_fn: &'static F) -> ReadableStream
    where
        F: Fn(PlatformBoxFutureStatic<()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(Box::pin(fut));
        stream
    }
}

impl<Source: ReadableByteSource> ReadableStreamBuilder<Source, ByteStream> {
    fn new_bytes(source: Source) -> Self {
        Self {
            source,
            strategy: Box::new(ByteLengthQueuingStrategy::new(0)),
            auto_allocate_chunk_size: None,
            _phantom: PhantomData,
        }
    }

    /// Size of the view allocated for default reads, exposed to the source
    /// through `byob_request()`.
    pub fn auto_allocate_chunk_size(mut self, size: usize) -> Self {
        self.auto_allocate_chunk_size = Some(size);
        self
    }

    /// Return stream + future without spawning
    pub fn prepare(self) -> (ReadableStream, impl Future<Output = ()> + MaybeSend + 'static) {
        let (stream, command_rx) =
            ReadableStream::new_parts(self.strategy, true, self.auto_allocate_chunk_size);
        let task = readable_stream_task(
            ByteSource(self.source),
            SharedPtr::clone(&stream.shared),
            command_rx,
        );
        (stream, task)
    }

    /// Spawn with an owned spawner function
    pub fn spawn<F, R>(self, spawn_fn: F) -> ReadableStream
    where
        F: FnOnce(PlatformBoxFutureStatic<()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(Box::pin(fut));
        stream
    }

    /// Spawn using a static spawner function reference
    pub fn spawn_ref<F, R>(self, spawn_fn: &'static F) -> ReadableStream
    where
        F: Fn(PlatformBoxFutureStatic<()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(Box::pin(fut));
        stream
    }
}
