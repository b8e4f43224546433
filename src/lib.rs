// PhotonDB KVStore - Rust Implementation
// A pluggable key-value store over an external index engine

#![warn(rust_2018_idioms)]

pub mod backends;
pub mod buffer;
pub mod config;
pub mod engine;
pub mod fid;
pub mod plugin;
pub mod shell;
pub mod store;

// Re-exports for convenience
pub use backends::{BufferedBackend, ObjectIndexBackend};
pub use buffer::Buffer;
pub use config::KvsConfig;
pub use engine::{IndexEngine, MemoryEngine};
pub use fid::IndexFid;
pub use plugin::{BackendRegistry, KvsBackend};
pub use store::{Index, KvStore, Target, Transaction};

/// KVStore error types
pub mod error {
    use crate::fid::IndexFid;
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Connection error: {0}")]
        Connection(String),

        #[error("Already initialized: {0}")]
        AlreadyInitialized(String),

        /// Names what is not initialized: the store or the index handle.
        #[error("Not initialized: {0}")]
        NotInitialized(&'static str),

        #[error("Out of memory: {0}")]
        OutOfMemory(String),

        #[error("Index already exists: fid={0}")]
        AlreadyExists(IndexFid),

        #[error("Index not found: fid={0}")]
        NotFound(IndexFid),

        #[error("Key not found")]
        KeyNotFound,

        #[error("Transaction error: {0}")]
        Transaction(String),

        #[error("Configuration error: {0}")]
        Config(String),

        #[error("Plugin error: {0}")]
        Plugin(String),

        /// Catch-all backing engine failure with the engine's own code.
        #[error("Engine error (code {code}): {message}")]
        Engine { code: i32, message: String },
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
