//! Buffered-transaction backend
//!
//! Same engine mapping as [`ObjectIndexBackend`], but writes issued on an
//! index between `begin_transaction` and `commit_transaction` are held in a
//! per-index pending list:
//!
//! ```text
//! begin   → pending[idx] = []
//! set/del → pending[idx].push(op)      (reads see pending ops first)
//! commit  → engine.apply_batch(idx, pending[idx])   atomic in one call
//! abort   → pending[idx] dropped
//! close   → pending[idx] dropped
//! ```
//!
//! Scopes are flat: a second `begin` on the same index fails.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, warn};

use super::object_index::ObjectIndexBackend;
use super::key_error;
use crate::buffer::Buffer;
use crate::config::KvsConfig;
use crate::engine::{BatchOp, IndexEngine};
use crate::error::{Error, Result};
use crate::fid::IndexFid;
use crate::plugin::{BackendCapability, BackendMetadata, CollectionRef, IndexToken, KvsBackend};

/// Backend whose transactions buffer writes until commit
pub struct BufferedBackend<E: IndexEngine> {
    inner: ObjectIndexBackend<E>,
    pending: DashMap<u64, Vec<BatchOp>>,
}

/// Latest pending effect on `key`: `Some(Some(v))` written, `Some(None)` deleted
fn lookup<'a>(ops: &'a [BatchOp], key: &[u8]) -> Option<Option<&'a [u8]>> {
    ops.iter().rev().find(|op| op.key() == key).map(|op| match op {
        BatchOp::Put { value, .. } => Some(value.as_slice()),
        BatchOp::Delete { .. } => None,
    })
}

impl<E: IndexEngine> BufferedBackend<E> {
    pub fn new(engine: E) -> Self {
        Self {
            inner: ObjectIndexBackend::new(engine),
            pending: DashMap::new(),
        }
    }

    pub fn engine(&self) -> &E {
        self.inner.engine()
    }

    /// Whether `index` has an open transaction
    pub fn in_transaction(&self, index: &IndexToken) -> bool {
        self.pending.contains_key(&index.raw())
    }

    fn no_transaction(index: &IndexToken) -> Error {
        Error::Transaction(format!("no active transaction on index {}", index.fid()))
    }
}

impl<E: IndexEngine> KvsBackend for BufferedBackend<E> {
    fn metadata(&self) -> BackendMetadata {
        BackendMetadata {
            name: "buffered".to_string(),
            version: crate::VERSION.to_string(),
            engine: self.inner.engine().name().to_string(),
            description: "Engine index operations with write-buffering transactions".to_string(),
            capabilities: vec![
                BackendCapability::Transactions,
                BackendCapability::DefaultCollection,
            ],
        }
    }

    fn init(&self, config: &KvsConfig) -> Result<()> {
        self.inner.init(config)
    }

    fn fini(&self) {
        if !self.pending.is_empty() {
            warn!(open = self.pending.len(), "Discarding pending transactions at fini");
            self.pending.clear();
        }
        self.inner.fini();
    }

    fn alloc(&self, size: usize) -> Result<Buffer> {
        self.inner.alloc(size)
    }

    fn free(&self, buffer: Buffer) {
        self.inner.free(buffer);
    }

    fn index_create(&self, fid: IndexFid) -> Result<IndexToken> {
        self.inner.index_create(fid)
    }

    fn index_delete(&self, fid: IndexFid) -> Result<()> {
        self.inner.index_delete(fid)
    }

    fn index_open(&self, fid: IndexFid) -> Result<IndexToken> {
        self.inner.index_open(fid)
    }

    fn index_close(&self, index: IndexToken) {
        if let Some((_, ops)) = self.pending.remove(&index.raw()) {
            warn!(fid = %index.fid(), ops = ops.len(), "Index closed with open transaction, discarding");
        }
        self.inner.index_close(index);
    }

    fn begin_transaction(&self, index: &IndexToken) -> Result<()> {
        match self.pending.entry(index.raw()) {
            Entry::Occupied(_) => Err(Error::Transaction(format!(
                "transaction already active on index {}",
                index.fid()
            ))),
            Entry::Vacant(slot) => {
                slot.insert(Vec::new());
                debug!(fid = %index.fid(), "Transaction started");
                Ok(())
            }
        }
    }

    fn commit_transaction(&self, index: &IndexToken) -> Result<()> {
        let (_, ops) = self
            .pending
            .remove(&index.raw())
            .ok_or_else(|| Self::no_transaction(index))?;

        let count = ops.len();
        if count > 0 {
            self.inner
                .engine()
                .apply_batch(&ObjectIndexBackend::<E>::handle(index), ops)
                .map_err(key_error)?;
        }
        debug!(fid = %index.fid(), ops = count, "Transaction committed");
        Ok(())
    }

    fn abort_transaction(&self, index: &IndexToken) -> Result<()> {
        let (_, ops) = self
            .pending
            .remove(&index.raw())
            .ok_or_else(|| Self::no_transaction(index))?;
        debug!(fid = %index.fid(), ops = ops.len(), "Transaction aborted");
        Ok(())
    }

    fn get(&self, target: CollectionRef<'_>, key: &[u8]) -> Result<Buffer> {
        if let CollectionRef::Index(index) = target {
            if let Some(ops) = self.pending.get(&index.raw()) {
                match lookup(&ops, key) {
                    Some(Some(value)) => {
                        let mut buf = self.inner.alloc(value.len())?;
                        buf.copy_from_slice(value);
                        return Ok(buf);
                    }
                    Some(None) => return Err(Error::KeyNotFound),
                    None => {}
                }
            }
        }
        self.inner.get(target, key)
    }

    fn set(&self, target: CollectionRef<'_>, key: &[u8], value: &[u8]) -> Result<()> {
        if let CollectionRef::Index(index) = target {
            if let Some(mut ops) = self.pending.get_mut(&index.raw()) {
                ops.push(BatchOp::Put {
                    key: key.to_vec(),
                    value: value.to_vec(),
                });
                return Ok(());
            }
        }
        self.inner.set(target, key, value)
    }

    fn delete(&self, index: &IndexToken, key: &[u8]) -> Result<()> {
        if !self.in_transaction(index) {
            return self.inner.delete(index, key);
        }

        let pending_state = self
            .pending
            .get(&index.raw())
            .and_then(|ops| lookup(&ops, key).map(|effect| effect.is_some()));
        let exists = match pending_state {
            Some(exists) => exists,
            None => self
                .inner
                .engine()
                .contains_key(&ObjectIndexBackend::<E>::handle(index), key)
                .map_err(key_error)?,
        };
        if !exists {
            return Err(Error::KeyNotFound);
        }

        let mut ops = self
            .pending
            .get_mut(&index.raw())
            .ok_or_else(|| Self::no_transaction(index))?;
        ops.push(BatchOp::Delete { key: key.to_vec() });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;

    fn backend() -> BufferedBackend<MemoryEngine> {
        let backend = BufferedBackend::new(MemoryEngine::new());
        backend.init(&KvsConfig::new()).unwrap();
        backend
    }

    #[test]
    fn test_writes_outside_transaction_are_immediate() -> Result<()> {
        let backend = backend();
        let idx = backend.index_create(IndexFid::new(1, 1))?;
        backend.set(CollectionRef::Index(&idx), b"k", b"v")?;

        let other = backend.index_open(IndexFid::new(1, 1))?;
        assert_eq!(backend.get(CollectionRef::Index(&other), b"k")?, *b"v");
        Ok(())
    }

    #[test]
    fn test_commit_makes_writes_visible() -> Result<()> {
        let backend = backend();
        let fid = IndexFid::new(2, 2);
        let idx = backend.index_create(fid)?;
        let observer = backend.index_open(fid)?;

        backend.begin_transaction(&idx)?;
        backend.set(CollectionRef::Index(&idx), b"a", b"1")?;
        backend.set(CollectionRef::Index(&idx), b"b", b"2")?;

        // Own writes are visible, other handles see nothing yet
        assert_eq!(backend.get(CollectionRef::Index(&idx), b"a")?, *b"1");
        assert!(matches!(
            backend.get(CollectionRef::Index(&observer), b"a"),
            Err(Error::KeyNotFound)
        ));

        backend.commit_transaction(&idx)?;
        assert_eq!(backend.get(CollectionRef::Index(&observer), b"a")?, *b"1");
        assert_eq!(backend.get(CollectionRef::Index(&observer), b"b")?, *b"2");
        assert!(!backend.in_transaction(&idx));
        Ok(())
    }

    #[test]
    fn test_abort_discards() -> Result<()> {
        let backend = backend();
        let idx = backend.index_create(IndexFid::new(3, 3))?;
        backend.set(CollectionRef::Index(&idx), b"keep", b"old")?;

        backend.begin_transaction(&idx)?;
        backend.set(CollectionRef::Index(&idx), b"keep", b"new")?;
        backend.delete(&idx, b"keep")?;
        assert!(matches!(
            backend.get(CollectionRef::Index(&idx), b"keep"),
            Err(Error::KeyNotFound)
        ));
        backend.abort_transaction(&idx)?;

        assert_eq!(backend.get(CollectionRef::Index(&idx), b"keep")?, *b"old");
        Ok(())
    }

    #[test]
    fn test_flat_scope() -> Result<()> {
        let backend = backend();
        let idx = backend.index_create(IndexFid::new(4, 4))?;

        assert!(matches!(backend.commit_transaction(&idx), Err(Error::Transaction(_))));
        assert!(matches!(backend.abort_transaction(&idx), Err(Error::Transaction(_))));

        backend.begin_transaction(&idx)?;
        assert!(matches!(backend.begin_transaction(&idx), Err(Error::Transaction(_))));
        backend.commit_transaction(&idx)?;
        Ok(())
    }

    #[test]
    fn test_delete_missing_in_transaction() -> Result<()> {
        let backend = backend();
        let idx = backend.index_create(IndexFid::new(5, 5))?;

        backend.begin_transaction(&idx)?;
        assert!(matches!(backend.delete(&idx, b"ghost"), Err(Error::KeyNotFound)));

        backend.set(CollectionRef::Index(&idx), b"tmp", b"x")?;
        backend.delete(&idx, b"tmp")?;
        assert!(matches!(backend.delete(&idx, b"tmp"), Err(Error::KeyNotFound)));
        backend.commit_transaction(&idx)?;

        assert!(matches!(
            backend.get(CollectionRef::Index(&idx), b"tmp"),
            Err(Error::KeyNotFound)
        ));
        Ok(())
    }

    #[test]
    fn test_delete_large_value_under_tight_budget() -> Result<()> {
        let backend = BufferedBackend::new(MemoryEngine::new());
        backend.init(&KvsConfig::from_pairs([("engine.capacity_bytes", "128")])?)?;
        let idx = backend.index_create(IndexFid::new(7, 7))?;
        backend.set(CollectionRef::Index(&idx), b"big", &[0u8; 4096])?;

        backend.begin_transaction(&idx)?;
        backend.delete(&idx, b"big")?;
        backend.commit_transaction(&idx)?;

        assert!(matches!(
            backend.get(CollectionRef::Index(&idx), b"big"),
            Err(Error::KeyNotFound)
        ));
        assert_eq!(backend.engine().outstanding_bytes(), 0);
        Ok(())
    }

    #[test]
    fn test_close_discards_pending() -> Result<()> {
        let backend = backend();
        let fid = IndexFid::new(6, 6);
        let idx = backend.index_create(fid)?;
        backend.begin_transaction(&idx)?;
        backend.set(CollectionRef::Index(&idx), b"k", b"v")?;
        backend.index_close(idx);

        let idx = backend.index_open(fid)?;
        assert!(!backend.in_transaction(&idx));
        assert!(matches!(
            backend.get(CollectionRef::Index(&idx), b"k"),
            Err(Error::KeyNotFound)
        ));
        Ok(())
    }

    #[test]
    fn test_default_collection_is_never_buffered() -> Result<()> {
        let backend = backend();
        let idx = backend.index_create(IndexFid::new(7, 7))?;
        backend.begin_transaction(&idx)?;
        backend.set(CollectionRef::Default, b"g", b"now")?;
        backend.abort_transaction(&idx)?;
        assert_eq!(backend.get(CollectionRef::Default, b"g")?, *b"now");
        Ok(())
    }
}
