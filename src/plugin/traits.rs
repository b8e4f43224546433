//! KVStore plugin contract

use serde::{Deserialize, Serialize};

use crate::buffer::Buffer;
use crate::config::KvsConfig;
use crate::error::Result;
use crate::fid::IndexFid;

/// Backend capability flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendCapability {
    /// Writes between begin and commit become visible atomically at commit
    Transactions,
    /// Serves the handle-less default collection
    DefaultCollection,
}

/// Backend metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendMetadata {
    pub name: String,
    pub version: String,
    pub engine: String,
    pub description: String,
    pub capabilities: Vec<BackendCapability>,
}

impl BackendMetadata {
    pub fn supports(&self, capability: BackendCapability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Backend-private handle to an open index
///
/// Move-only. A backend hands one out from `index_create`/`index_open` and
/// gets it back, exactly once, through `index_close`.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct IndexToken {
    raw: u64,
    fid: IndexFid,
}

impl IndexToken {
    pub fn new(raw: u64, fid: IndexFid) -> Self {
        Self { raw, fid }
    }

    pub fn raw(&self) -> u64 {
        self.raw
    }

    pub fn fid(&self) -> IndexFid {
        self.fid
    }
}

/// Collection a key-value operation addresses
#[derive(Debug, Clone, Copy)]
pub enum CollectionRef<'a> {
    Index(&'a IndexToken),
    /// The engine-defined default collection
    Default,
}

/// The KVStore plugin contract
///
/// One implementation per backing engine; `KvStore` drives whichever
/// backend it was initialised with through these three groups of
/// operations:
///
/// * store: `init`, `fini`, `alloc`, `free`
/// * index: `index_create`, `index_delete`, `index_open`, `index_close`
/// * key-value: transactions plus `get`, `set`, `delete`
///
/// All calls are synchronous. Implementations add no locking beyond what
/// their engine needs; concurrent use of distinct indexes is as safe as the
/// engine makes it.
pub trait KvsBackend: Send + Sync {
    fn metadata(&self) -> BackendMetadata;

    /// Establish the engine connection
    ///
    /// Fails with `AlreadyInitialized` while a previous `init` is live.
    fn init(&self, config: &KvsConfig) -> Result<()>;

    /// Best-effort teardown
    fn fini(&self);

    /// Allocate an engine buffer of `size` bytes; contents unspecified
    fn alloc(&self, size: usize) -> Result<Buffer>;

    fn free(&self, buffer: Buffer);

    /// Durably create an empty collection and open it
    fn index_create(&self, fid: IndexFid) -> Result<IndexToken>;

    /// Durably remove a collection; open handles elsewhere are not invalidated
    fn index_delete(&self, fid: IndexFid) -> Result<()>;

    fn index_open(&self, fid: IndexFid) -> Result<IndexToken>;

    /// Release an open handle; never fails
    fn index_close(&self, index: IndexToken);

    fn begin_transaction(&self, index: &IndexToken) -> Result<()>;

    fn commit_transaction(&self, index: &IndexToken) -> Result<()>;

    fn abort_transaction(&self, index: &IndexToken) -> Result<()>;

    fn get(&self, target: CollectionRef<'_>, key: &[u8]) -> Result<Buffer>;

    /// Insert or overwrite
    fn set(&self, target: CollectionRef<'_>, key: &[u8], value: &[u8]) -> Result<()>;

    /// Remove a key; `KeyNotFound` if absent
    fn delete(&self, index: &IndexToken, key: &[u8]) -> Result<()>;
}
