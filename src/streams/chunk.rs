//! Reference-counted byte segments.
//!
//! A [`Chunk`] is a `(pos, size)` window over a shared, immutable-once-shared
//! [`Buffer`]. Cloning a chunk duplicates the handle (the buffer's reference
//! count goes up), dropping it releases the handle, and the bytes are freed
//! when the last handle is gone. Sub-views produced by [`Chunk::split_to`],
//! [`Chunk::narrow`] and [`Chunk::advance`] never copy.

use super::error::StreamError;
use crate::platform::{SharedPtr, SharedWeak};
use std::{fmt, ops::Deref};

type StreamResult<T> = Result<T, StreamError>;

/// Backing storage of one or more chunks.
pub struct Buffer {
    data: Box<[u8]>,
}

impl Drop for Buffer {
    fn drop(&mut self) {
        tracing::trace!(len = self.data.len(), "chunk buffer freed");
    }
}

pub struct Chunk {
    buf: SharedPtr<Buffer>,
    pos: usize,
    size: usize,
}

impl Chunk {
    /// Allocate a zero-filled chunk of `size` bytes.
    ///
    /// Allocation is fallible: an allocator refusal surfaces as
    /// [`StreamError::AllocationFailure`] instead of aborting the process.
    pub fn allocate(size: usize) -> StreamResult<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| StreamError::AllocationFailure { requested: size })?;
        data.resize(size, 0);
        Ok(Self::from_vec(data))
    }

    /// Copy `bytes` into a freshly allocated chunk.
    pub fn copy_from_slice(bytes: &[u8]) -> StreamResult<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(bytes.len())
            .map_err(|_| StreamError::AllocationFailure {
                requested: bytes.len(),
            })?;
        data.extend_from_slice(bytes);
        Ok(Self::from_vec(data))
    }

    /// Take ownership of `data` without copying.
    pub fn from_vec(data: Vec<u8>) -> Self {
        let size = data.len();
        Self {
            buf: SharedPtr::new(Buffer {
                data: data.into_boxed_slice(),
            }),
            pos: 0,
            size,
        }
    }

    pub fn empty() -> Self {
        Self::from_vec(Vec::new())
    }

    /// Another handle on the same bytes. Equivalent to `clone()`.
    pub fn duplicate(&self) -> Self {
        self.clone()
    }

    /// Give up this handle. Equivalent to dropping it.
    pub fn release(self) {}

    /// Number of live handles sharing the underlying buffer.
    pub fn ref_count(&self) -> usize {
        SharedPtr::strong_count(&self.buf)
    }

    /// Observe the buffer's lifetime without keeping it alive.
    pub fn downgrade(&self) -> BufferWatch {
        BufferWatch(SharedPtr::downgrade(&self.buf))
    }

    /// Read cursor into the buffer.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// End of this view in the buffer.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes still visible through this view (`size - pos`).
    pub fn len(&self) -> usize {
        self.size - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos == self.size
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf.data[self.pos..self.size]
    }

    /// Mutable access to the visible bytes, only while this is the sole handle.
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        let (pos, size) = (self.pos, self.size);
        SharedPtr::get_mut(&mut self.buf).map(|buf| &mut buf.data[pos..size])
    }

    /// Move the cursor forward by up to `n` bytes, returning how far it moved.
    pub fn advance(&mut self, n: usize) -> usize {
        let n = n.min(self.len());
        self.pos += n;
        n
    }

    /// Split off the first `n` bytes as a new view; `self` keeps the rest.
    pub fn split_to(&mut self, n: usize) -> Chunk {
        let n = n.min(self.len());
        let head = Chunk {
            buf: SharedPtr::clone(&self.buf),
            pos: self.pos,
            size: self.pos + n,
        };
        self.pos += n;
        head
    }

    /// Shrink the view to its first `n` bytes.
    pub fn narrow(mut self, n: usize) -> Chunk {
        self.size = self.pos + n.min(self.len());
        self
    }

    /// Copy the visible bytes out into an owned vector.
    pub fn to_vec(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }
}

impl Clone for Chunk {
    fn clone(&self) -> Self {
        Self {
            buf: SharedPtr::clone(&self.buf),
            pos: self.pos,
            size: self.size,
        }
    }
}

impl Deref for Chunk {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for Chunk {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("pos", &self.pos)
            .field("size", &self.size)
            .field("bytes", &String::from_utf8_lossy(self.as_slice()))
            .finish()
    }
}

impl PartialEq for Chunk {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for Chunk {}

impl PartialEq<[u8]> for Chunk {
    fn eq(&self, other: &[u8]) -> bool {
        self.as_slice() == other
    }
}

impl PartialEq<&[u8]> for Chunk {
    fn eq(&self, other: &&[u8]) -> bool {
        self.as_slice() == *other
    }
}

impl<const N: usize> PartialEq<&[u8; N]> for Chunk {
    fn eq(&self, other: &&[u8; N]) -> bool {
        self.as_slice() == &other[..]
    }
}

impl PartialEq<&str> for Chunk {
    fn eq(&self, other: &&str) -> bool {
        self.as_slice() == other.as_bytes()
    }
}

impl From<Vec<u8>> for Chunk {
    fn from(data: Vec<u8>) -> Self {
        Chunk::from_vec(data)
    }
}

impl From<&[u8]> for Chunk {
    fn from(bytes: &[u8]) -> Self {
        Chunk::from_vec(bytes.to_vec())
    }
}

impl<const N: usize> From<&[u8; N]> for Chunk {
    fn from(bytes: &[u8; N]) -> Self {
        Chunk::from_vec(bytes.to_vec())
    }
}

impl From<&str> for Chunk {
    fn from(text: &str) -> Self {
        Chunk::from_vec(text.as_bytes().to_vec())
    }
}

impl From<String> for Chunk {
    fn from(text: String) -> Self {
        Chunk::from_vec(text.into_bytes())
    }
}

/// Weak observer of a chunk's buffer.
#[derive(Clone)]
pub struct BufferWatch(SharedWeak<Buffer>);

impl BufferWatch {
    /// `true` once every [`Chunk`] sharing the buffer has been released.
    pub fn is_freed(&self) -> bool {
        self.0.strong_count() == 0
    }
}
