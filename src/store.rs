//! Caller-facing KVStore API
//!
//! A [`KvStore`] owns one initialised backend. Indexes opened through it keep
//! only a weak reference back to the store, so a store can be finalised while
//! indexes are still around; every operation on such an index then fails with
//! `NotInitialized("store")` instead of reaching the engine.
//!
//! ```text
//!   KvStore ──Arc──► StoreShared { backend, live }
//!                          ▲
//!   Index ───Weak──────────┘   + fid + IndexToken (released exactly once)
//! ```

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::buffer::Buffer;
use crate::config::{KvsConfig, BACKEND_KEY};
use crate::error::{Error, Result};
use crate::fid::IndexFid;
use crate::plugin::{
    BackendMetadata, BackendRegistry, CollectionRef, IndexToken, KvsBackend, DEFAULT_BACKEND,
};

struct StoreShared {
    backend: Arc<dyn KvsBackend>,
    live: AtomicBool,
}

impl StoreShared {
    fn backend(&self) -> Result<&dyn KvsBackend> {
        if self.live.load(Ordering::Acquire) {
            Ok(self.backend.as_ref())
        } else {
            Err(Error::NotInitialized("store"))
        }
    }
}

/// Collection addressed by a key-value operation
#[derive(Clone, Copy)]
pub enum Target<'a> {
    Index(&'a Index),
    /// The engine-defined default collection
    Default,
}

/// An initialised key-value store
///
/// Lifecycle calls (`init`, `fini`) must not race with other calls on the
/// same store. Distinct indexes may be used from different threads as far as
/// the backing engine allows it; the store adds no locking of its own.
pub struct KvStore {
    shared: Arc<StoreShared>,
}

impl KvStore {
    /// Initialise `backend` with `config` and wrap it in a store
    ///
    /// Fails with `AlreadyInitialized` if the backend's connection is still
    /// live from an earlier `init`.
    pub fn init(backend: Arc<dyn KvsBackend>, config: &KvsConfig) -> Result<Self> {
        backend.init(config)?;
        info!(backend = %backend.metadata().name, "KVStore initialized");
        Ok(Self {
            shared: Arc::new(StoreShared {
                backend,
                live: AtomicBool::new(true),
            }),
        })
    }

    /// Initialise the backend named by `kvstore.backend` from the built-in registry
    pub fn open(config: &KvsConfig) -> Result<Self> {
        Self::open_with(&BackendRegistry::with_builtins(), config)
    }

    /// Initialise the backend named by `kvstore.backend` from `registry`
    pub fn open_with(registry: &BackendRegistry, config: &KvsConfig) -> Result<Self> {
        let name = config
            .get_string(BACKEND_KEY)
            .unwrap_or_else(|| DEFAULT_BACKEND.to_string());
        let backend = registry.create(&name)?;
        Self::init(backend, config)
    }

    /// Release the engine connection
    ///
    /// Idempotent. Every later operation on this store, or on indexes opened
    /// through it, fails with `NotInitialized("store")`.
    pub fn fini(&self) {
        if self.shared.live.swap(false, Ordering::AcqRel) {
            self.shared.backend.fini();
            info!("KVStore finalized");
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.live.load(Ordering::Acquire)
    }

    pub fn metadata(&self) -> BackendMetadata {
        self.shared.backend.metadata()
    }

    /// Allocate an engine buffer of `size` bytes
    pub fn alloc(&self, size: usize) -> Result<Buffer> {
        self.shared.backend()?.alloc(size)
    }

    /// Return a buffer to the engine allocator
    pub fn free(&self, buffer: Buffer) {
        match self.shared.backend() {
            Ok(backend) => backend.free(buffer),
            Err(_) => drop(buffer),
        }
    }

    /// Create the collection `fid` and open it
    pub fn index_create(&self, fid: IndexFid) -> Result<Index> {
        let token = self.shared.backend()?.index_create(fid)?;
        Ok(self.bind(fid, token))
    }

    /// Remove the collection `fid`
    ///
    /// Indexes already open on `fid` are not closed. Their key-value
    /// operations fail from then on, with the error the engine reports.
    pub fn index_delete(&self, fid: IndexFid) -> Result<()> {
        self.shared.backend()?.index_delete(fid)
    }

    /// Open the existing collection `fid`
    pub fn index_open(&self, fid: IndexFid) -> Result<Index> {
        let token = self.shared.backend()?.index_open(fid)?;
        Ok(self.bind(fid, token))
    }

    fn bind(&self, fid: IndexFid, token: IndexToken) -> Index {
        Index {
            store: Arc::downgrade(&self.shared),
            fid,
            token: Some(token),
        }
    }

    /// Look up `key`; an index target is served by the store that opened it
    pub fn get(&self, target: Target<'_>, key: &[u8]) -> Result<Buffer> {
        match target {
            Target::Index(index) => index.get(key),
            Target::Default => self.get_default(key),
        }
    }

    /// Insert or overwrite `key`
    pub fn set(&self, target: Target<'_>, key: &[u8], value: &[u8]) -> Result<()> {
        match target {
            Target::Index(index) => index.set(key, value),
            Target::Default => self.set_default(key, value),
        }
    }

    pub fn get_default(&self, key: &[u8]) -> Result<Buffer> {
        self.shared.backend()?.get(CollectionRef::Default, key)
    }

    pub fn set_default(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.shared.backend()?.set(CollectionRef::Default, key, value)
    }

    /// Remove `key` from `index`; `KeyNotFound` if absent
    pub fn delete(&self, index: &Index, key: &[u8]) -> Result<()> {
        index.delete(key)
    }
}

impl Drop for KvStore {
    fn drop(&mut self) {
        self.fini();
    }
}

/// An open handle to one collection
///
/// Closing (explicitly or on drop) releases the engine handle, drops the
/// store reference and resets the fid to [`IndexFid::ZERO`]. A closed index
/// answers every operation with `NotInitialized("index")`.
pub struct Index {
    store: Weak<StoreShared>,
    fid: IndexFid,
    token: Option<IndexToken>,
}

impl Index {
    /// The collection's fid, or `IndexFid::ZERO` once closed
    pub fn fid(&self) -> IndexFid {
        self.fid
    }

    pub fn is_open(&self) -> bool {
        self.token.is_some()
    }

    fn with_backend<T>(&self, f: impl FnOnce(&dyn KvsBackend, &IndexToken) -> Result<T>) -> Result<T> {
        let token = self.token.as_ref().ok_or(Error::NotInitialized("index"))?;
        let store = self.store.upgrade().ok_or(Error::NotInitialized("store"))?;
        f(store.backend()?, token)
    }

    pub fn get(&self, key: &[u8]) -> Result<Buffer> {
        self.with_backend(|backend, token| backend.get(CollectionRef::Index(token), key))
    }

    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.with_backend(|backend, token| backend.set(CollectionRef::Index(token), key, value))
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.with_backend(|backend, token| backend.delete(token, key))
    }

    pub fn begin(&self) -> Result<()> {
        self.with_backend(|backend, token| backend.begin_transaction(token))
    }

    pub fn commit(&self) -> Result<()> {
        self.with_backend(|backend, token| backend.commit_transaction(token))
    }

    pub fn abort(&self) -> Result<()> {
        self.with_backend(|backend, token| backend.abort_transaction(token))
    }

    /// Begin a transaction that aborts when dropped uncommitted
    pub fn transaction(&self) -> Result<Transaction<'_>> {
        self.begin()?;
        Ok(Transaction {
            index: self,
            finished: false,
        })
    }

    /// Release the handle. Never fails; closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if let Some(token) = self.token.take() {
            match self.store.upgrade() {
                Some(store) if store.live.load(Ordering::Acquire) => {
                    store.backend.index_close(token);
                }
                _ => debug!(fid = %self.fid, "Store already finalized, dropping index handle"),
            }
        }
        self.store = Weak::new();
        self.fid = IndexFid::ZERO;
        Ok(())
    }
}

impl Drop for Index {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("fid", &self.fid)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Transaction scope on one index
///
/// Dereferences to the index, so key-value calls go through the guard.
/// Dropping the guard without `commit` aborts.
pub struct Transaction<'a> {
    index: &'a Index,
    finished: bool,
}

impl Transaction<'_> {
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        self.index.commit()
    }

    pub fn abort(mut self) -> Result<()> {
        self.finished = true;
        self.index.abort()
    }
}

impl Deref for Transaction<'_> {
    type Target = Index;

    fn deref(&self) -> &Index {
        self.index
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.index.abort() {
                warn!(fid = %self.index.fid(), error = %e, "Failed to abort dropped transaction");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{BufferedBackend, ObjectIndexBackend};
    use crate::engine::MemoryEngine;

    fn store() -> KvStore {
        KvStore::open(&KvsConfig::new()).unwrap()
    }

    fn buffered_store() -> KvStore {
        let backend = Arc::new(BufferedBackend::new(MemoryEngine::new()));
        KvStore::init(backend, &KvsConfig::new()).unwrap()
    }

    #[test]
    fn test_index_scenario() -> Result<()> {
        let store = store();
        let fid = IndexFid::new(7, 3);

        let mut index = store.index_create(fid)?;
        index.set(b"a", &[1, 2, 3])?;
        assert_eq!(index.get(b"a")?, [1u8, 2, 3]);

        index.delete(b"a")?;
        assert!(matches!(index.get(b"a"), Err(Error::KeyNotFound)));

        index.close()?;
        store.index_delete(fid)?;
        assert!(matches!(store.index_open(fid), Err(Error::NotFound(f)) if f == fid));
        Ok(())
    }

    #[test]
    fn test_create_then_open_share_collection() -> Result<()> {
        let store = store();
        let fid = IndexFid::new(1, 2);
        let writer = store.index_create(fid)?;
        let reader = store.index_open(fid)?;

        writer.set(b"shared", b"yes")?;
        assert_eq!(reader.get(b"shared")?, *b"yes");
        assert!(matches!(store.index_create(fid), Err(Error::AlreadyExists(_))));
        Ok(())
    }

    #[test]
    fn test_closed_index_is_unusable() -> Result<()> {
        let store = store();
        let mut index = store.index_create(IndexFid::new(2, 2))?;
        index.set(b"k", b"v")?;

        index.close()?;
        assert!(!index.is_open());
        assert_eq!(index.fid(), IndexFid::ZERO);
        assert!(matches!(index.get(b"k"), Err(Error::NotInitialized("index"))));
        assert!(matches!(index.set(b"k", b"v"), Err(Error::NotInitialized("index"))));
        assert!(matches!(index.begin(), Err(Error::NotInitialized("index"))));

        // Closing again is harmless
        index.close()?;
        Ok(())
    }

    #[test]
    fn test_fini_invalidates_store_and_indexes() -> Result<()> {
        let store = store();
        let index = store.index_create(IndexFid::new(3, 3))?;
        store.fini();
        store.fini();

        assert!(!store.is_initialized());
        assert!(matches!(store.alloc(8), Err(Error::NotInitialized("store"))));
        assert!(matches!(store.get_default(b"k"), Err(Error::NotInitialized("store"))));
        assert!(matches!(
            store.index_open(IndexFid::new(3, 3)),
            Err(Error::NotInitialized("store"))
        ));
        assert!(matches!(index.get(b"k"), Err(Error::NotInitialized("store"))));
        Ok(())
    }

    #[test]
    fn test_index_outliving_store() -> Result<()> {
        let index = {
            let store = store();
            store.index_create(IndexFid::new(4, 4))?
        };
        assert!(matches!(index.get(b"k"), Err(Error::NotInitialized("store"))));
        Ok(())
    }

    #[test]
    fn test_single_init_per_backend() -> Result<()> {
        let backend: Arc<dyn KvsBackend> = Arc::new(ObjectIndexBackend::new(MemoryEngine::new()));
        let first = KvStore::init(backend.clone(), &KvsConfig::new())?;
        assert!(matches!(
            KvStore::init(backend.clone(), &KvsConfig::new()),
            Err(Error::AlreadyInitialized(_))
        ));

        first.fini();
        let second = KvStore::init(backend, &KvsConfig::new())?;
        assert!(second.is_initialized());
        Ok(())
    }

    #[test]
    fn test_open_selects_backend() -> Result<()> {
        let config = KvsConfig::from_pairs([(BACKEND_KEY, "buffered")])?;
        let store = KvStore::open(&config)?;
        assert_eq!(store.metadata().name, "buffered");

        let config = KvsConfig::from_pairs([(BACKEND_KEY, "missing")])?;
        assert!(matches!(KvStore::open(&config), Err(Error::Plugin(_))));
        Ok(())
    }

    #[test]
    fn test_unreachable_endpoint() {
        let config = KvsConfig::from_pairs([("engine.endpoint", "tcp://10.0.0.1:1234")]).unwrap();
        assert!(matches!(KvStore::open(&config), Err(Error::Connection(_))));
    }

    #[test]
    fn test_targets() -> Result<()> {
        let store = store();
        let index = store.index_create(IndexFid::new(5, 5))?;

        store.set(Target::Index(&index), b"k", b"indexed")?;
        store.set(Target::Default, b"k", b"global")?;
        assert_eq!(store.get(Target::Index(&index), b"k")?, *b"indexed");
        assert_eq!(store.get(Target::Default, b"k")?, *b"global");
        assert_eq!(store.get_default(b"k")?, *b"global");

        store.delete(&index, b"k")?;
        assert!(matches!(store.delete(&index, b"k"), Err(Error::KeyNotFound)));
        assert_eq!(store.get(Target::Default, b"k")?, *b"global");
        Ok(())
    }

    #[test]
    fn test_alloc_and_free() -> Result<()> {
        let store = store();
        let empty = store.alloc(0)?;
        assert!(empty.is_empty());
        store.free(empty);

        let buf = store.alloc(100)?;
        assert_eq!(buf.len(), 100);
        store.free(buf);
        Ok(())
    }

    #[test]
    fn test_transaction_guard_commit() -> Result<()> {
        let store = buffered_store();
        let fid = IndexFid::new(6, 6);
        let index = store.index_create(fid)?;
        let observer = store.index_open(fid)?;

        let txn = index.transaction()?;
        txn.set(b"k", b"v")?;
        assert!(matches!(observer.get(b"k"), Err(Error::KeyNotFound)));
        txn.commit()?;

        assert_eq!(observer.get(b"k")?, *b"v");
        Ok(())
    }

    #[test]
    fn test_transaction_guard_aborts_on_drop() -> Result<()> {
        let store = buffered_store();
        let index = store.index_create(IndexFid::new(8, 8))?;
        {
            let txn = index.transaction()?;
            txn.set(b"k", b"v")?;
        }
        assert!(matches!(index.get(b"k"), Err(Error::KeyNotFound)));

        // The scope is over, a new one can begin
        index.transaction()?.commit()?;
        Ok(())
    }

    #[test]
    fn test_noop_transactions() -> Result<()> {
        let store = store();
        let index = store.index_create(IndexFid::new(9, 9))?;
        index.begin()?;
        index.begin()?;
        index.set(b"k", b"v")?;
        index.abort()?;
        assert_eq!(index.get(b"k")?, *b"v");
        index.commit()?;
        Ok(())
    }
}
