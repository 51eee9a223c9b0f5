#![allow(dead_code)]

use chunked_streams::{
    Chunk, ReadableSource, ReadableStream, ReadableStreamDefaultController, StreamResult,
    WritableSink, WritableStreamDefaultController,
};
use parking_lot::Mutex;
use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Current-thread runtime plus `LocalSet`, so drivers can use `spawn_local`.
pub fn run_local<F: Future>(fut: F) -> F::Output {
    init_tracing();
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build test runtime");
    tokio::task::LocalSet::new().block_on(&rt, fut)
}

pub async fn settle_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

pub async fn idle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Source that hands its controller to the test and only counts pulls.
#[derive(Clone, Default)]
pub struct Handoff {
    controller: Arc<Mutex<Option<ReadableStreamDefaultController>>>,
    pulls: Arc<AtomicUsize>,
}

impl Handoff {
    pub fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    pub async fn controller(&self) -> ReadableStreamDefaultController {
        settle_until(|| self.controller.lock().is_some()).await;
        self.controller
            .lock()
            .clone()
            .expect("controller captured at start")
    }
}

pub struct HandoffSource(pub Handoff);

impl ReadableSource for HandoffSource {
    async fn start(&mut self, controller: &mut ReadableStreamDefaultController) -> StreamResult<()> {
        *self.0.controller.lock() = Some(controller.clone());
        Ok(())
    }

    async fn pull(&mut self, _controller: &mut ReadableStreamDefaultController) -> StreamResult<()> {
        self.0.pulls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub async fn handoff_stream() -> (ReadableStream, Handoff, ReadableStreamDefaultController) {
    let handoff = Handoff::default();
    let stream = ReadableStream::builder(HandoffSource(handoff.clone())).spawn(tokio::task::spawn_local);
    let controller = handoff.controller().await;
    (stream, handoff, controller)
}

/// Sink that records every call it sees.
#[derive(Clone, Default)]
pub struct SinkLog {
    pub entries: Arc<Mutex<Vec<String>>>,
    pub closes: Arc<AtomicUsize>,
}

impl SinkLog {
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

pub struct LoggingSink(pub SinkLog);

impl WritableSink for LoggingSink {
    async fn write(
        &mut self,
        chunk: Chunk,
        _controller: &mut WritableStreamDefaultController,
    ) -> StreamResult<()> {
        self.0
            .entries
            .lock()
            .push(format!("write:{}", String::from_utf8_lossy(&chunk)));
        Ok(())
    }

    async fn close(self) -> StreamResult<()> {
        self.0.closes.fetch_add(1, Ordering::SeqCst);
        self.0.entries.lock().push("close".into());
        Ok(())
    }

    async fn abort(&mut self, reason: Option<String>) -> StreamResult<()> {
        self.0
            .entries
            .lock()
            .push(format!("abort:{}", reason.unwrap_or_default()));
        Ok(())
    }
}
