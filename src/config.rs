//! Store configuration
//!
//! `KvsConfig` is the opaque collection of key/value settings handed to
//! `KvStore::init`. The store itself only reads `kvstore.backend`; every
//! other key is passed through to the selected backend and its engine.
//!
//! Settings can come from explicit pairs, a configuration file (format
//! detected from the extension) and environment variables, later sources
//! overriding earlier ones:
//!
//! ```rust
//! use photondb_kvstore::KvsConfig;
//!
//! let config = KvsConfig::builder()
//!     .set("engine.endpoint", "mem://local").unwrap()
//!     .build()
//!     .unwrap();
//! assert_eq!(config.get_string("engine.endpoint").as_deref(), Some("mem://local"));
//! ```

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File, Source, Value};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{Error, Result};

/// Key naming the backend `KvStore::open` instantiates
pub const BACKEND_KEY: &str = "kvstore.backend";

/// Opaque key/value settings for a store and its engine
#[derive(Debug, Clone)]
pub struct KvsConfig {
    inner: Config,
}

impl KvsConfig {
    /// An empty configuration
    pub fn new() -> Self {
        Self {
            inner: Config::default(),
        }
    }

    pub fn builder() -> KvsConfigBuilder {
        KvsConfigBuilder {
            inner: Config::builder(),
        }
    }

    /// Build from explicit `key = value` pairs (dotted keys address sections)
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut builder = Self::builder();
        for (key, value) in pairs {
            builder = builder.set(key.as_ref(), value)?;
        }
        builder.build()
    }

    /// Load settings from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::builder().file(path).build()
    }

    /// Typed lookup; `Ok(None)` when the key is absent
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.inner.get::<T>(key) {
            Ok(value) => Ok(Some(value)),
            Err(ConfigError::NotFound(_)) => Ok(None),
            Err(e) => Err(Error::Config(format!("Invalid value for '{}': {}", key, e))),
        }
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.inner.get_string(key).ok()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.get::<Value>(key).is_ok()
    }

    /// All leaf settings flattened to dotted keys
    pub fn entries(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        if let Ok(root) = self.inner.collect() {
            for (key, value) in root {
                flatten(key, value, &mut out);
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

impl Default for KvsConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn flatten(prefix: String, value: Value, out: &mut BTreeMap<String, String>) {
    match value.clone().into_table() {
        Ok(table) => {
            for (key, child) in table {
                flatten(format!("{}.{}", prefix, key), child, out);
            }
        }
        Err(_) => {
            out.insert(prefix, value.to_string());
        }
    }
}

/// Layered construction of a `KvsConfig`
pub struct KvsConfigBuilder {
    inner: ConfigBuilder<DefaultState>,
}

impl KvsConfigBuilder {
    /// Add a configuration file source
    pub fn file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.inner = self.inner.add_source(File::from(path.as_ref()));
        self
    }

    /// Add environment overrides, e.g. prefix `KVS` maps `KVS__ENGINE__ENDPOINT`
    /// to `engine.endpoint`
    pub fn env_prefix(mut self, prefix: &str) -> Self {
        self.inner = self
            .inner
            .add_source(Environment::with_prefix(prefix).separator("__"));
        self
    }

    /// Set a single value, overriding every source
    pub fn set<V: Into<String>>(mut self, key: &str, value: V) -> Result<Self> {
        self.inner = self
            .inner
            .set_override(key, value.into())
            .map_err(|e| Error::Config(format!("Invalid key '{}': {}", key, e)))?;
        Ok(self)
    }

    pub fn build(self) -> Result<KvsConfig> {
        let inner = self
            .inner
            .build()
            .map_err(|e| Error::Config(format!("Failed to load configuration: {}", e)))?;
        Ok(KvsConfig { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config() {
        let config = KvsConfig::new();
        assert!(config.is_empty());
        assert_eq!(config.get_string("engine.endpoint"), None);
        assert!(!config.contains("engine.endpoint"));
    }

    #[test]
    fn test_pairs_and_typed_lookup() -> Result<()> {
        let config = KvsConfig::from_pairs([
            ("engine.capacity_bytes", "4096"),
            ("kvstore.backend", "buffered"),
        ])?;

        assert_eq!(config.get::<u64>("engine.capacity_bytes")?, Some(4096));
        assert_eq!(config.get::<u64>("engine.min_class")?, None);
        assert_eq!(config.get_string(BACKEND_KEY).as_deref(), Some("buffered"));
        Ok(())
    }

    #[test]
    fn test_env_prefix_overrides() -> Result<()> {
        std::env::set_var("KVSTEST__ENGINE__ENDPOINT", "mem://from-env");
        let config = KvsConfig::builder()
            .set("engine.capacity_bytes", "512")?
            .env_prefix("KVSTEST")
            .build();
        std::env::remove_var("KVSTEST__ENGINE__ENDPOINT");
        let config = config?;

        assert_eq!(config.get_string("engine.endpoint").as_deref(), Some("mem://from-env"));
        assert_eq!(config.get::<u64>("engine.capacity_bytes")?, Some(512));
        Ok(())
    }

    #[test]
    fn test_typed_lookup_rejects_bad_value() -> Result<()> {
        let config = KvsConfig::from_pairs([("engine.capacity_bytes", "lots")])?;
        assert!(matches!(
            config.get::<u64>("engine.capacity_bytes"),
            Err(Error::Config(_))
        ));
        Ok(())
    }

    #[test]
    fn test_entries_flattened() -> Result<()> {
        let config = KvsConfig::from_pairs([
            ("engine.endpoint", "mem://a"),
            ("engine.default_fid", "0:9"),
        ])?;

        let entries = config.entries();
        assert_eq!(entries.get("engine.endpoint").map(String::as_str), Some("mem://a"));
        assert_eq!(entries.get("engine.default_fid").map(String::as_str), Some("0:9"));
        Ok(())
    }

    #[test]
    fn test_from_file() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("kvs_config_{}", std::process::id()));
        std::fs::create_dir_all(&dir).map_err(|e| Error::Config(e.to_string()))?;
        let path = dir.join("kvstore.toml");
        std::fs::write(
            &path,
            "[kvstore]\nbackend = \"object-index\"\n\n[engine]\nendpoint = \"mem://file\"\n",
        )
        .map_err(|e| Error::Config(e.to_string()))?;

        let config = KvsConfig::from_file(&path)?;
        assert_eq!(config.get_string("engine.endpoint").as_deref(), Some("mem://file"));
        assert_eq!(config.get_string(BACKEND_KEY).as_deref(), Some("object-index"));

        std::fs::remove_dir_all(dir).ok();
        Ok(())
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let result = KvsConfig::from_file("/nonexistent/kvstore.toml");
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
