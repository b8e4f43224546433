//! KVStore plugin system
//!
//! A backend plugs one storage engine into the uniform KVStore API by
//! implementing [`KvsBackend`]. Backends are instantiated by name from a
//! [`BackendRegistry`]:
//! - `object-index` - direct mapping onto the engine's index operations,
//!   transactions are no-ops
//! - `buffered` - same engine mapping, transactions buffer writes until commit

pub mod registry;
pub mod traits;

pub use registry::{BackendFactory, BackendRegistry, DEFAULT_BACKEND};
pub use traits::{BackendCapability, BackendMetadata, CollectionRef, IndexToken, KvsBackend};
