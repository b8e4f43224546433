//! Owned byte buffers handed out by engine allocators
//!
//! Keys and values cross the KVStore boundary as plain byte slices with an
//! explicit length. Buffers coming *back* (allocator results, `get` values)
//! are owned by the caller until freed. A pooled buffer remembers where it
//! came from and returns itself to that pool when dropped, so an explicit
//! `free` and a plain drop release the same way.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Receiver for buffers returning to the allocator that produced them
pub trait Reclaim: Send + Sync {
    fn reclaim(&self, bytes: Vec<u8>, tag: PoolTag);
}

/// Bookkeeping the pool attaches to a buffer at allocation time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolTag {
    /// Size class the backing storage belongs to (None = exact-size)
    pub class: Option<u16>,
    /// Bytes charged against the pool budget
    pub charge: usize,
}

struct Lease {
    pool: Arc<dyn Reclaim>,
    tag: PoolTag,
}

/// A caller-owned byte buffer
///
/// Contents of a freshly allocated buffer are unspecified.
pub struct Buffer {
    bytes: Vec<u8>,
    lease: Option<Lease>,
}

impl Buffer {
    /// Wrap bytes that belong to no pool
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self { bytes, lease: None }
    }

    /// Wrap bytes leased from `pool`
    pub fn pooled(bytes: Vec<u8>, pool: Arc<dyn Reclaim>, tag: PoolTag) -> Self {
        Self {
            bytes,
            lease: Some(Lease { pool, tag }),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Whether dropping this buffer returns storage to a pool
    pub fn is_pooled(&self) -> bool {
        self.lease.is_some()
    }

    /// Copy the contents out
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.clone()
    }

    /// Detach the bytes from their pool
    ///
    /// The pool is credited as if the buffer had been freed; the returned
    /// vector is ordinary heap memory.
    pub fn into_vec(mut self) -> Vec<u8> {
        let bytes = std::mem::take(&mut self.bytes);
        if let Some(lease) = self.lease.take() {
            lease.pool.reclaim(Vec::new(), lease.tag);
        }
        bytes
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            lease.pool.reclaim(std::mem::take(&mut self.bytes), lease.tag);
        }
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl PartialEq<[u8]> for Buffer {
    fn eq(&self, other: &[u8]) -> bool {
        self.bytes == other
    }
}

impl PartialEq<&[u8]> for Buffer {
    fn eq(&self, other: &&[u8]) -> bool {
        self.bytes == *other
    }
}

impl<const N: usize> PartialEq<[u8; N]> for Buffer {
    fn eq(&self, other: &[u8; N]) -> bool {
        self.bytes == other[..]
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.bytes.len())
            .field("pooled", &self.is_pooled())
            .finish()
    }
}
