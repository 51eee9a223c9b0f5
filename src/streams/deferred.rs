//! Single-settlement asynchronous results.
//!
//! A [`Deferred`] is the completion side of a promise: it starts pending,
//! and the first `resolve`/`reject` wins. Later settlement attempts are
//! ignored, which is what lets a timeout and a natural completion race
//! without double-resolving. Any number of [`DeferredFuture`]s may observe
//! the outcome.

use super::{chunk::Chunk, error::StreamError};
use crate::platform::{BoxedCallback, MaybeSend, SharedPtr};
use parking_lot::Mutex;
use pin_project::pin_project;
use std::{
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll, Waker},
};

type StreamResult<T> = Result<T, StreamError>;

struct DeferredInner<T> {
    outcome: Option<StreamResult<T>>,
    wakers: Vec<Waker>,
    callbacks: Vec<BoxedCallback<StreamResult<T>>>,
}

pub struct Deferred<T> {
    inner: SharedPtr<Mutex<DeferredInner<T>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            inner: SharedPtr::clone(&self.inner),
        }
    }
}

impl<T: Clone + MaybeSend + 'static> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.inner.lock().outcome {
            None => "pending",
            Some(Ok(_)) => "fulfilled",
            Some(Err(_)) => "rejected",
        };
        f.debug_struct("Deferred").field("state", &state).finish()
    }
}

impl<T: Clone + MaybeSend + 'static> Deferred<T> {
    pub fn new() -> Self {
        Self {
            inner: SharedPtr::new(Mutex::new(DeferredInner {
                outcome: None,
                wakers: Vec::new(),
                callbacks: Vec::new(),
            })),
        }
    }

    pub fn resolved(value: T) -> Self {
        let deferred = Self::new();
        deferred.resolve(value);
        deferred
    }

    pub fn rejected(error: StreamError) -> Self {
        let deferred = Self::new();
        deferred.reject(error);
        deferred
    }

    /// Fulfil with `value`. Returns `false` if already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Reject with `error`. Returns `false` if already settled.
    pub fn reject(&self, error: StreamError) -> bool {
        self.settle(Err(error))
    }

    /// Settle with `outcome` unless someone got there first.
    pub fn settle(&self, outcome: StreamResult<T>) -> bool {
        let (wakers, callbacks) = {
            let mut inner = self.inner.lock();
            if inner.outcome.is_some() {
                return false;
            }
            inner.outcome = Some(outcome.clone());
            (
                std::mem::take(&mut inner.wakers),
                std::mem::take(&mut inner.callbacks),
            )
        };
        // Callbacks may settle other deferreds; run them with the lock released.
        for waker in wakers {
            waker.wake();
        }
        for callback in callbacks {
            callback(&outcome);
        }
        true
    }

    pub fn is_pending(&self) -> bool {
        self.inner.lock().outcome.is_none()
    }

    pub fn is_settled(&self) -> bool {
        !self.is_pending()
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(self.inner.lock().outcome, Some(Ok(_)))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self.inner.lock().outcome, Some(Err(_)))
    }

    /// The cached outcome, if settled.
    pub fn outcome(&self) -> Option<StreamResult<T>> {
        self.inner.lock().outcome.clone()
    }

    #[cfg(test)]
    pub(crate) fn callback_count(&self) -> usize {
        self.inner.lock().callbacks.len()
    }

    /// A future resolving to the outcome. Can be called any number of times.
    pub fn wait(&self) -> DeferredFuture<T> {
        DeferredFuture {
            deferred: self.clone(),
        }
    }

    /// Run `callback` once settled; immediately if that already happened.
    pub fn then<F>(&self, callback: F)
    where
        F: FnOnce(&StreamResult<T>) + MaybeSend + 'static,
    {
        let settled = {
            let mut inner = self.inner.lock();
            match &inner.outcome {
                Some(outcome) => Some(outcome.clone()),
                None => {
                    inner.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        if let Some(outcome) = settled {
            callback(&outcome);
        }
    }
}

/// Propagate `source`'s outcome to `target` once `source` settles.
pub fn forward<T: Clone + MaybeSend + 'static>(source: &Deferred<T>, target: &Deferred<T>) {
    let target = target.clone();
    source.then(move |outcome| {
        target.settle(outcome.clone());
    });
}

/// Settle `target` with whatever `future` produces.
///
/// This chains a Source/Sink callback's returned future into a Deferred the
/// outside world already observes.
pub fn forward_future<T, F>(future: F, target: Deferred<T>) -> Forward<F, T>
where
    T: Clone + MaybeSend + 'static,
    F: Future<Output = StreamResult<T>>,
{
    Forward { future, target }
}

#[pin_project]
pub struct Forward<F, T> {
    #[pin]
    future: F,
    target: Deferred<T>,
}

impl<F, T> Future for Forward<F, T>
where
    T: Clone + MaybeSend + 'static,
    F: Future<Output = StreamResult<T>>,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.project();
        match this.future.poll(cx) {
            Poll::Ready(outcome) => {
                this.target.settle(outcome);
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Observer of a [`Deferred`]'s outcome.
pub struct DeferredFuture<T> {
    deferred: Deferred<T>,
}

impl<T> DeferredFuture<T> {
    /// The deferred this future observes.
    pub fn deferred(&self) -> &Deferred<T> {
        &self.deferred
    }
}

impl<T: Clone> Future for DeferredFuture<T> {
    type Output = StreamResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.deferred.inner.lock();
        if let Some(outcome) = &inner.outcome {
            return Poll::Ready(outcome.clone());
        }
        let waker = cx.waker();
        if !inner.wakers.iter().any(|w| w.will_wake(waker)) {
            inner.wakers.push(waker.clone());
        }
        Poll::Pending
    }
}

/// Settlements collected under a stream's state lock and run after it is
/// released, so observers may re-enter the stream.
#[derive(Default)]
pub(crate) struct Settlements {
    reads: Vec<(Deferred<Option<Chunk>>, StreamResult<Option<Chunk>>)>,
    signals: Vec<(Deferred<()>, StreamResult<()>)>,
}

impl Settlements {
    pub(crate) fn read(
        &mut self,
        deferred: Deferred<Option<Chunk>>,
        outcome: StreamResult<Option<Chunk>>,
    ) {
        self.reads.push((deferred, outcome));
    }

    pub(crate) fn signal(&mut self, deferred: &Deferred<()>, outcome: StreamResult<()>) {
        self.signals.push((deferred.clone(), outcome));
    }

    pub(crate) fn run(self) {
        for (deferred, outcome) in self.reads {
            deferred.settle(outcome);
        }
        for (deferred, outcome) in self.signals {
            deferred.settle(outcome);
        }
    }
}
