//! KVStore backends
//!
//! Both backends drive an [`IndexEngine`](crate::engine::IndexEngine) and
//! translate its errno-style failures into the crate's error taxonomy:
//!
//! ```text
//! connect          CONNECTED → AlreadyInitialized, anything else → Connection
//! collection ops   NOT_FOUND → NotFound(fid), EXISTS → AlreadyExists(fid)
//! key ops          NOT_FOUND → KeyNotFound
//! any op           NO_MEMORY → OutOfMemory, NOT_CONNECTED → NotInitialized
//! otherwise        Engine { code, message }
//! ```

pub mod buffered;
pub mod object_index;

pub use buffered::BufferedBackend;
pub use object_index::ObjectIndexBackend;

use crate::engine::EngineError;
use crate::error::Error;
use crate::fid::IndexFid;

pub(crate) fn connect_error(err: EngineError) -> Error {
    match err.code {
        EngineError::CONNECTED => Error::AlreadyInitialized(err.message),
        _ => Error::Connection(err.to_string()),
    }
}

pub(crate) fn collection_error(fid: IndexFid, err: EngineError) -> Error {
    match err.code {
        EngineError::NOT_FOUND => Error::NotFound(fid),
        EngineError::EXISTS => Error::AlreadyExists(fid),
        _ => engine_error(err),
    }
}

pub(crate) fn key_error(err: EngineError) -> Error {
    match err.code {
        EngineError::NOT_FOUND => Error::KeyNotFound,
        _ => engine_error(err),
    }
}

pub(crate) fn engine_error(err: EngineError) -> Error {
    match err.code {
        EngineError::NO_MEMORY => Error::OutOfMemory(err.message),
        EngineError::NOT_CONNECTED => Error::NotInitialized("store"),
        code => Error::Engine {
            code,
            message: err.message,
        },
    }
}
