//! Object-index backend
//!
//! Maps the KVStore contract one-to-one onto an index engine. Each engine
//! key-value call is atomic on its own, so the transaction envelope is a
//! no-op that always succeeds.

use tracing::{debug, error, info};

use super::{collection_error, connect_error, engine_error, key_error};
use crate::buffer::Buffer;
use crate::config::KvsConfig;
use crate::engine::{CollectionHandle, IndexEngine};
use crate::error::Result;
use crate::fid::IndexFid;
use crate::plugin::{BackendCapability, BackendMetadata, CollectionRef, IndexToken, KvsBackend};

/// Backend over an [`IndexEngine`] with single-operation atomicity
pub struct ObjectIndexBackend<E: IndexEngine> {
    engine: E,
}

impl<E: IndexEngine> ObjectIndexBackend<E> {
    pub fn new(engine: E) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// The engine handle a token stands for
    pub(crate) fn handle(token: &IndexToken) -> CollectionHandle {
        CollectionHandle::new(token.raw())
    }

    fn token(handle: CollectionHandle, fid: IndexFid) -> IndexToken {
        IndexToken::new(handle.raw(), fid)
    }
}

impl<E: IndexEngine> KvsBackend for ObjectIndexBackend<E> {
    fn metadata(&self) -> BackendMetadata {
        BackendMetadata {
            name: "object-index".to_string(),
            version: crate::VERSION.to_string(),
            engine: self.engine.name().to_string(),
            description: "Direct mapping onto engine index operations".to_string(),
            capabilities: vec![BackendCapability::DefaultCollection],
        }
    }

    fn init(&self, config: &KvsConfig) -> Result<()> {
        self.engine.connect(config).map_err(connect_error)?;
        info!(engine = self.engine.name(), "KVStore backend initialized");
        Ok(())
    }

    fn fini(&self) {
        self.engine.disconnect();
        info!(engine = self.engine.name(), "KVStore backend finalized");
    }

    fn alloc(&self, size: usize) -> Result<Buffer> {
        self.engine.alloc(size).map_err(engine_error)
    }

    fn free(&self, buffer: Buffer) {
        self.engine.free(buffer);
    }

    fn index_create(&self, fid: IndexFid) -> Result<IndexToken> {
        let handle = self.engine.create_collection(fid).map_err(|e| {
            error!(%fid, code = e.code, "Failed to create index");
            collection_error(fid, e)
        })?;
        debug!(%fid, "Index created");
        Ok(Self::token(handle, fid))
    }

    fn index_delete(&self, fid: IndexFid) -> Result<()> {
        self.engine.delete_collection(fid).map_err(|e| {
            error!(%fid, code = e.code, "Failed to delete index");
            collection_error(fid, e)
        })?;
        debug!(%fid, "Index deleted");
        Ok(())
    }

    fn index_open(&self, fid: IndexFid) -> Result<IndexToken> {
        let handle = self.engine.open_collection(fid).map_err(|e| {
            error!(%fid, code = e.code, "Failed to open index");
            collection_error(fid, e)
        })?;
        debug!(%fid, "Index opened");
        Ok(Self::token(handle, fid))
    }

    fn index_close(&self, index: IndexToken) {
        debug!(fid = %index.fid(), "Index closed");
        self.engine.close_collection(Self::handle(&index));
    }

    fn begin_transaction(&self, _index: &IndexToken) -> Result<()> {
        Ok(())
    }

    fn commit_transaction(&self, _index: &IndexToken) -> Result<()> {
        Ok(())
    }

    fn abort_transaction(&self, _index: &IndexToken) -> Result<()> {
        Ok(())
    }

    fn get(&self, target: CollectionRef<'_>, key: &[u8]) -> Result<Buffer> {
        let value = match target {
            CollectionRef::Index(index) => self.engine.get(&Self::handle(index), key),
            CollectionRef::Default => self.engine.get_default(key),
        };
        value.map_err(key_error)
    }

    fn set(&self, target: CollectionRef<'_>, key: &[u8], value: &[u8]) -> Result<()> {
        let stored = match target {
            CollectionRef::Index(index) => self.engine.put(&Self::handle(index), key, value),
            CollectionRef::Default => self.engine.put_default(key, value),
        };
        stored.map_err(engine_error)?;
        debug!(key_len = key.len(), value_len = value.len(), "Set key-value");
        Ok(())
    }

    fn delete(&self, index: &IndexToken, key: &[u8]) -> Result<()> {
        self.engine
            .delete_key(&Self::handle(index), key)
            .map_err(key_error)?;
        debug!(key_len = key.len(), "Deleted key");
        Ok(())
    }
}
