use super::error::StreamError;
use std::sync::atomic::{AtomicUsize, Ordering};

const UNLOCKED: usize = 0;

/// Identity of the reader or writer currently holding a [`StreamLock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockToken(usize);

/// Single-owner lock over a stream.
///
/// Acquisition only moves `unlocked -> holder`, and release only moves
/// `holder -> unlocked` for the exact holder that acquired it; a stale
/// token releases nothing.
#[derive(Debug)]
pub struct StreamLock {
    holder: AtomicUsize,
    next_token: AtomicUsize,
}

impl Default for StreamLock {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamLock {
    pub fn new() -> Self {
        Self {
            holder: AtomicUsize::new(UNLOCKED),
            next_token: AtomicUsize::new(UNLOCKED + 1),
        }
    }

    pub fn try_acquire(&self) -> Result<LockToken, StreamError> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        match self
            .holder
            .compare_exchange(UNLOCKED, token, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                tracing::trace!(token, "stream lock acquired");
                Ok(LockToken(token))
            }
            Err(current) => {
                tracing::trace!(holder = current, "stream lock contention");
                Err(StreamError::LockContention)
            }
        }
    }

    /// Returns `false` when `token` is not the current holder.
    pub fn release(&self, token: LockToken) -> bool {
        let released = self
            .holder
            .compare_exchange(token.0, UNLOCKED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if released {
            tracing::trace!(token = token.0, "stream lock released");
        }
        released
    }

    pub fn is_locked(&self) -> bool {
        self.holder.load(Ordering::Acquire) != UNLOCKED
    }

    pub fn is_held_by(&self, token: LockToken) -> bool {
        self.holder.load(Ordering::Acquire) == token.0
    }
}
