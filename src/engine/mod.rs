//! Backing engine seam
//!
//! # Architecture
//!
//! The KVStore plugins never talk to storage directly. Everything they need
//! from the clustered object/index engine goes through the narrow
//! [`IndexEngine`] operation set:
//!
//! ```text
//! connect / disconnect          ← store lifecycle
//! alloc / free                  ← blob allocator hooks
//! create / delete / open / close collection
//! get / put / delete_key        ← per-collection key-value ops
//! contains_key                  ← presence check without a value copy
//! get_default / put_default     ← handle-less default collection
//! apply_batch                   ← atomic multi-op write (optional)
//! ```
//!
//! Engines report failures as [`EngineError`] with errno-style codes; the
//! plugin layer turns those codes into the crate's typed errors.
//!
//! [`MemoryEngine`] is the in-process reference engine used by the shell
//! and the test suite.

use std::fmt;

use crate::buffer::Buffer;
use crate::config::KvsConfig;
use crate::fid::IndexFid;

pub mod memory;
pub mod pool;

pub use memory::{EngineSettings, MemoryEngine};
pub use pool::{BufferPool, PoolStats, MAX_CLASS_LIMIT};

/// Engine failure with an engine-specific status code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineError {
    pub code: i32,
    pub message: String,
}

impl EngineError {
    pub const IO: i32 = 5;
    pub const BAD_HANDLE: i32 = 9;
    pub const NO_MEMORY: i32 = 12;
    pub const EXISTS: i32 = 17;
    pub const INVALID: i32 = 22;
    pub const NOT_FOUND: i32 = 2;
    pub const CONNECTED: i32 = 106;
    pub const NOT_CONNECTED: i32 = 107;
    pub const UNREACHABLE: i32 = 113;
    pub const STALE: i32 = 116;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Self::NOT_FOUND, message)
    }

    pub fn exists(message: impl Into<String>) -> Self {
        Self::new(Self::EXISTS, message)
    }

    pub fn no_memory(message: impl Into<String>) -> Self {
        Self::new(Self::NO_MEMORY, message)
    }

    pub fn not_connected() -> Self {
        Self::new(Self::NOT_CONNECTED, "engine is not connected")
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

impl std::error::Error for EngineError {}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Engine-private handle to an open collection
///
/// Move-only: the holder owns the open collection until it hands the
/// handle back through [`IndexEngine::close_collection`].
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct CollectionHandle(u64);

impl CollectionHandle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// One write in an atomic batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl BatchOp {
    pub fn key(&self) -> &[u8] {
        match self {
            BatchOp::Put { key, .. } | BatchOp::Delete { key } => key,
        }
    }
}

/// Operations the backing object/index engine exposes to KVStore plugins
///
/// All calls are synchronous and return once the engine operation has
/// completed or failed. Thread-safety of concurrent calls on distinct
/// handles is whatever the engine provides.
pub trait IndexEngine: Send + Sync {
    /// Short engine name for diagnostics
    fn name(&self) -> &'static str;

    fn connect(&self, config: &KvsConfig) -> EngineResult<()>;

    /// Best-effort teardown of the connection
    fn disconnect(&self);

    fn alloc(&self, size: usize) -> EngineResult<Buffer>;

    fn free(&self, buffer: Buffer) {
        drop(buffer);
    }

    fn create_collection(&self, fid: IndexFid) -> EngineResult<CollectionHandle>;

    fn delete_collection(&self, fid: IndexFid) -> EngineResult<()>;

    fn open_collection(&self, fid: IndexFid) -> EngineResult<CollectionHandle>;

    fn close_collection(&self, handle: CollectionHandle);

    fn get(&self, handle: &CollectionHandle, key: &[u8]) -> EngineResult<Buffer>;

    fn put(&self, handle: &CollectionHandle, key: &[u8], value: &[u8]) -> EngineResult<()>;

    fn delete_key(&self, handle: &CollectionHandle, key: &[u8]) -> EngineResult<()>;

    /// Whether `key` is present, without handing its value back
    fn contains_key(&self, handle: &CollectionHandle, key: &[u8]) -> EngineResult<bool> {
        match self.get(handle, key) {
            Ok(_) => Ok(true),
            Err(e) if e.code == EngineError::NOT_FOUND => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn get_default(&self, key: &[u8]) -> EngineResult<Buffer>;

    fn put_default(&self, key: &[u8], value: &[u8]) -> EngineResult<()>;

    /// Apply several writes to one collection
    ///
    /// The default applies them one by one and stops at the first failure;
    /// engines with native batches should override this to make the whole
    /// batch atomic.
    fn apply_batch(&self, handle: &CollectionHandle, ops: Vec<BatchOp>) -> EngineResult<()> {
        for op in ops {
            match op {
                BatchOp::Put { key, value } => self.put(handle, &key, &value)?,
                BatchOp::Delete { key } => self.delete_key(handle, &key)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_display() {
        let err = EngineError::not_found("no such key");
        assert_eq!(err.code, EngineError::NOT_FOUND);
        assert_eq!(err.to_string(), "no such key (code 2)");
    }

    #[test]
    fn test_batch_op_key() {
        let put = BatchOp::Put {
            key: b"k".to_vec(),
            value: b"v".to_vec(),
        };
        let del = BatchOp::Delete { key: b"d".to_vec() };
        assert_eq!(put.key(), b"k");
        assert_eq!(del.key(), b"d");
    }
}
