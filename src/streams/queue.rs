use super::{chunk::Chunk, error::StreamError};
use std::collections::VecDeque;

type StreamResult<T> = Result<T, StreamError>;

/// FIFO of [`Chunk`]s with exact byte accounting.
///
/// `nbytes` always equals the sum of the visible lengths of the queued
/// chunks. Partially consumed head chunks keep their buffer alive until the
/// last byte is read or the queue is cleared.
#[derive(Debug, Default)]
pub struct ChunkQueue {
    chunks: VecDeque<Chunk>,
    nbytes: usize,
    closed: bool,
}

impl ChunkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy `bytes` into a new chunk at the tail. Returns the byte count.
    pub fn write(&mut self, bytes: &[u8]) -> StreamResult<usize> {
        if self.closed {
            return Err(StreamError::Closed);
        }
        if bytes.is_empty() {
            return Ok(0);
        }
        let chunk = Chunk::copy_from_slice(bytes)?;
        Ok(self.push_unchecked(chunk))
    }

    /// Append `chunk` without copying. Empty chunks are dropped.
    pub fn push(&mut self, chunk: Chunk) -> StreamResult<usize> {
        if self.closed {
            return Err(StreamError::Closed);
        }
        Ok(self.push_unchecked(chunk))
    }

    fn push_unchecked(&mut self, chunk: Chunk) -> usize {
        let n = chunk.len();
        if n > 0 {
            self.nbytes += n;
            self.chunks.push_back(chunk);
        }
        n
    }

    /// Consume up to `dest.len()` bytes from the head into `dest`.
    pub fn read(&mut self, dest: &mut [u8]) -> usize {
        let n = self.peek(dest);
        self.skip(n)
    }

    /// Copy up to `dest.len()` bytes from the head without consuming them.
    pub fn peek(&self, dest: &mut [u8]) -> usize {
        let mut copied = 0;
        for chunk in &self.chunks {
            if copied == dest.len() {
                break;
            }
            let n = chunk.len().min(dest.len() - copied);
            dest[copied..copied + n].copy_from_slice(&chunk[..n]);
            copied += n;
        }
        copied
    }

    /// Discard up to `n` bytes from the head, releasing drained chunks.
    pub fn skip(&mut self, n: usize) -> usize {
        let mut skipped = 0;
        while skipped < n {
            let Some(head) = self.chunks.front_mut() else {
                break;
            };
            skipped += head.advance(n - skipped);
            if head.is_empty() {
                self.chunks.pop_front();
            }
        }
        self.nbytes -= skipped;
        skipped
    }

    /// Take the whole head chunk for pass-through consumers.
    pub fn next(&mut self) -> Option<Chunk> {
        let chunk = self.chunks.pop_front()?;
        self.nbytes -= chunk.len();
        Some(chunk)
    }

    /// Take at most `n` bytes from the head as a zero-copy view.
    pub fn next_bounded(&mut self, n: usize) -> Option<Chunk> {
        let head = self.chunks.front_mut()?;
        if head.len() <= n {
            return self.next();
        }
        let part = head.split_to(n);
        self.nbytes -= part.len();
        Some(part)
    }

    /// Release every queued chunk.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.nbytes = 0;
    }

    /// Reject further writes. Queued bytes stay readable.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Total unread bytes.
    pub fn nbytes(&self) -> usize {
        self.nbytes
    }

    /// Number of queued chunks.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter()
    }
}
