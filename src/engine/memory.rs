//! In-process reference engine
//!
//! `MemoryEngine` implements the full [`IndexEngine`] operation set on top of
//! process memory. Collections live in the engine's namespace and survive a
//! disconnect/connect cycle, so "durable" here means "for the life of the
//! engine value". Open handles, the default collection binding and the
//! buffer pool belong to the current connection and go away on disconnect.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use super::pool::{BufferPool, MAX_CLASS_LIMIT};
use super::{BatchOp, CollectionHandle, EngineError, EngineResult, IndexEngine};
use crate::buffer::Buffer;
use crate::config::KvsConfig;
use crate::fid::IndexFid;

/// Endpoint scheme served by this engine
pub const MEMORY_SCHEME: &str = "mem://";

/// Fid of the default collection unless configured otherwise
pub const DEFAULT_COLLECTION_FID: IndexFid = IndexFid::new(0, 1);

/// Engine settings read from the store configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub endpoint: Option<String>,
    pub default_fid: IndexFid,
    pub capacity_bytes: Option<usize>,
    pub min_class: Option<usize>,
    pub max_class: Option<usize>,
}

impl EngineSettings {
    pub fn from_config(config: &KvsConfig) -> EngineResult<Self> {
        let invalid = |e: crate::error::Error| EngineError::new(EngineError::INVALID, e.to_string());

        let default_fid = match config.get_string("engine.default_fid") {
            Some(text) => text.parse().map_err(invalid)?,
            None => DEFAULT_COLLECTION_FID,
        };

        let settings = Self {
            endpoint: config.get_string("engine.endpoint"),
            default_fid,
            capacity_bytes: config.get("engine.capacity_bytes").map_err(invalid)?,
            min_class: config.get("engine.min_class").map_err(invalid)?,
            max_class: config.get("engine.max_class").map_err(invalid)?,
        };

        for (key, class) in [
            ("engine.min_class", settings.min_class),
            ("engine.max_class", settings.max_class),
        ] {
            if let Some(size) = class.filter(|&size| size > MAX_CLASS_LIMIT) {
                return Err(EngineError::new(
                    EngineError::INVALID,
                    format!("{} {} exceeds the {} byte limit", key, size, MAX_CLASS_LIMIT),
                ));
            }
        }

        if let (Some(min), Some(max)) = (settings.min_class, settings.max_class) {
            if min > max {
                return Err(EngineError::new(
                    EngineError::INVALID,
                    format!("engine.min_class {} exceeds engine.max_class {}", min, max),
                ));
            }
        }

        Ok(settings)
    }
}

#[derive(Debug)]
struct Collection {
    fid: IndexFid,
    entries: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
    deleted: AtomicBool,
}

impl Collection {
    fn new(fid: IndexFid) -> Arc<Self> {
        Arc::new(Self {
            fid,
            entries: RwLock::new(HashMap::new()),
            deleted: AtomicBool::new(false),
        })
    }

    fn check_live(&self) -> EngineResult<()> {
        if self.deleted.load(Ordering::Acquire) {
            return Err(EngineError::new(
                EngineError::STALE,
                format!("collection {} was deleted", self.fid),
            ));
        }
        Ok(())
    }
}

/// State owned by one connection
struct Session {
    pool: BufferPool,
    handles: DashMap<u64, Arc<Collection>>,
    next_handle: AtomicU64,
    default: Arc<Collection>,
}

impl Session {
    fn register(&self, collection: Arc<Collection>) -> CollectionHandle {
        let raw = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.handles.insert(raw, collection);
        CollectionHandle::new(raw)
    }

    fn resolve(&self, handle: &CollectionHandle) -> EngineResult<Arc<Collection>> {
        let collection = self
            .handles
            .get(&handle.raw())
            .map(|c| c.value().clone())
            .ok_or_else(|| {
                EngineError::new(
                    EngineError::BAD_HANDLE,
                    format!("unknown collection handle {}", handle.raw()),
                )
            })?;
        collection.check_live()?;
        Ok(collection)
    }

    fn read(&self, collection: &Collection, key: &[u8]) -> EngineResult<Buffer> {
        let entries = collection.entries.read();
        let value = entries
            .get(key)
            .ok_or_else(|| EngineError::not_found(format!("key not found in {}", collection.fid)))?;
        self.pool.alloc_copy(value)
    }
}

/// In-memory index engine
#[derive(Default)]
pub struct MemoryEngine {
    namespace: DashMap<IndexFid, Arc<Collection>>,
    session: RwLock<Option<Session>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self) -> bool {
        self.session.read().is_some()
    }

    /// Number of collections in the namespace, default collection included
    pub fn collection_count(&self) -> usize {
        self.namespace.len()
    }

    pub fn contains_collection(&self, fid: IndexFid) -> bool {
        self.namespace.contains_key(&fid)
    }

    /// Handles currently open on this connection
    pub fn open_handles(&self) -> usize {
        self.session
            .read()
            .as_ref()
            .map(|s| s.handles.len())
            .unwrap_or(0)
    }

    /// Bytes charged to outstanding buffers on this connection
    pub fn outstanding_bytes(&self) -> usize {
        self.session
            .read()
            .as_ref()
            .map(|s| s.pool.outstanding())
            .unwrap_or(0)
    }

    fn with_session<T>(&self, f: impl FnOnce(&Session) -> EngineResult<T>) -> EngineResult<T> {
        let guard = self.session.read();
        match guard.as_ref() {
            Some(session) => f(session),
            None => Err(EngineError::not_connected()),
        }
    }
}

impl IndexEngine for MemoryEngine {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn connect(&self, config: &KvsConfig) -> EngineResult<()> {
        let mut session = self.session.write();
        if session.is_some() {
            return Err(EngineError::new(
                EngineError::CONNECTED,
                "engine is already connected",
            ));
        }

        let settings = EngineSettings::from_config(config)?;
        if let Some(endpoint) = &settings.endpoint {
            if !endpoint.starts_with(MEMORY_SCHEME) {
                return Err(EngineError::new(
                    EngineError::UNREACHABLE,
                    format!("endpoint '{}' is not reachable", endpoint),
                ));
            }
        }

        let default = self
            .namespace
            .entry(settings.default_fid)
            .or_insert_with(|| Collection::new(settings.default_fid))
            .value()
            .clone();

        *session = Some(Session {
            pool: BufferPool::new(settings.min_class, settings.max_class, settings.capacity_bytes),
            handles: DashMap::new(),
            next_handle: AtomicU64::new(1),
            default,
        });

        info!(
            endpoint = settings.endpoint.as_deref().unwrap_or(MEMORY_SCHEME),
            default_fid = %settings.default_fid,
            "Memory engine connected"
        );
        Ok(())
    }

    fn disconnect(&self) {
        if let Some(session) = self.session.write().take() {
            info!(open_handles = session.handles.len(), "Memory engine disconnected");
        }
    }

    fn alloc(&self, size: usize) -> EngineResult<Buffer> {
        self.with_session(|s| s.pool.alloc(size))
    }

    fn create_collection(&self, fid: IndexFid) -> EngineResult<CollectionHandle> {
        self.with_session(|s| {
            let collection = match self.namespace.entry(fid) {
                Entry::Occupied(_) => {
                    return Err(EngineError::exists(format!("collection {} exists", fid)))
                }
                Entry::Vacant(slot) => slot.insert(Collection::new(fid)).value().clone(),
            };
            debug!(%fid, "Created collection");
            Ok(s.register(collection))
        })
    }

    fn delete_collection(&self, fid: IndexFid) -> EngineResult<()> {
        self.with_session(|_| {
            let (_, collection) = self
                .namespace
                .remove(&fid)
                .ok_or_else(|| EngineError::not_found(format!("collection {} not found", fid)))?;
            collection.deleted.store(true, Ordering::Release);
            debug!(%fid, "Deleted collection");
            Ok(())
        })
    }

    fn open_collection(&self, fid: IndexFid) -> EngineResult<CollectionHandle> {
        self.with_session(|s| {
            let collection = self
                .namespace
                .get(&fid)
                .map(|c| c.value().clone())
                .ok_or_else(|| EngineError::not_found(format!("collection {} not found", fid)))?;
            Ok(s.register(collection))
        })
    }

    fn close_collection(&self, handle: CollectionHandle) {
        if let Some(session) = self.session.read().as_ref() {
            session.handles.remove(&handle.raw());
        }
    }

    fn get(&self, handle: &CollectionHandle, key: &[u8]) -> EngineResult<Buffer> {
        self.with_session(|s| {
            let collection = s.resolve(handle)?;
            s.read(&collection, key)
        })
    }

    fn put(&self, handle: &CollectionHandle, key: &[u8], value: &[u8]) -> EngineResult<()> {
        self.with_session(|s| {
            let collection = s.resolve(handle)?;
            collection.entries.write().insert(key.to_vec(), value.to_vec());
            Ok(())
        })
    }

    fn delete_key(&self, handle: &CollectionHandle, key: &[u8]) -> EngineResult<()> {
        self.with_session(|s| {
            let collection = s.resolve(handle)?;
            let removed = collection.entries.write().remove(key);
            removed
                .map(|_| ())
                .ok_or_else(|| EngineError::not_found(format!("key not found in {}", collection.fid)))
        })
    }

    fn contains_key(&self, handle: &CollectionHandle, key: &[u8]) -> EngineResult<bool> {
        self.with_session(|s| {
            let collection = s.resolve(handle)?;
            let present = collection.entries.read().contains_key(key);
            Ok(present)
        })
    }

    fn get_default(&self, key: &[u8]) -> EngineResult<Buffer> {
        self.with_session(|s| {
            s.default.check_live()?;
            s.read(&s.default, key)
        })
    }

    fn put_default(&self, key: &[u8], value: &[u8]) -> EngineResult<()> {
        self.with_session(|s| {
            s.default.check_live()?;
            s.default.entries.write().insert(key.to_vec(), value.to_vec());
            Ok(())
        })
    }

    /// Validates every operation under the collection's write lock before
    /// applying any, so the batch lands entirely or not at all.
    fn apply_batch(&self, handle: &CollectionHandle, ops: Vec<BatchOp>) -> EngineResult<()> {
        self.with_session(|s| {
            let collection = s.resolve(handle)?;
            let mut entries = collection.entries.write();

            {
                let mut present: HashMap<&[u8], bool> = HashMap::new();
                for op in &ops {
                    let key = op.key();
                    let exists = present
                        .get(key)
                        .copied()
                        .unwrap_or_else(|| entries.contains_key(key));
                    match op {
                        BatchOp::Put { .. } => {
                            present.insert(key, true);
                        }
                        BatchOp::Delete { .. } if !exists => {
                            return Err(EngineError::not_found(format!(
                                "batch deletes missing key in {}",
                                collection.fid
                            )));
                        }
                        BatchOp::Delete { .. } => {
                            present.insert(key, false);
                        }
                    }
                }
            }

            let count = ops.len();
            for op in ops {
                match op {
                    BatchOp::Put { key, value } => {
                        entries.insert(key, value);
                    }
                    BatchOp::Delete { key } => {
                        entries.remove(&key);
                    }
                }
            }
            debug!(fid = %collection.fid, ops = count, "Applied batch");
            Ok(())
        })
    }
}
