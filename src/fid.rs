//! Index identifiers.
//!
//! Every index (collection) in the backing engine is named by a 128-bit
//! fid made of two 64-bit halves. The fid is chosen by the caller and never
//! changes once the collection exists.
//!
//! # Text form
//!
//! Fids print as `hi:lo` in lowercase hex, which is also the format used in
//! diagnostics and accepted by [`IndexFid::from_str`](std::str::FromStr):
//!
//! ```rust
//! use photondb_kvstore::IndexFid;
//!
//! let fid: IndexFid = "7:3".parse().unwrap();
//! assert_eq!(fid, IndexFid::new(7, 3));
//! assert_eq!(fid.to_string(), "7:3");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

/// A 128-bit identifier naming a collection within the store's namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexFid {
    pub hi: u64,
    pub lo: u64,
}

impl IndexFid {
    /// Sentinel carried by a closed index handle.
    pub const ZERO: IndexFid = IndexFid { hi: 0, lo: 0 };

    /// Creates a fid from its two halves.
    pub const fn new(hi: u64, lo: u64) -> Self {
        Self { hi, lo }
    }

    /// Creates a random fid using UUIDv4.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use photondb_kvstore::IndexFid;
    ///
    /// let a = IndexFid::random();
    /// let b = IndexFid::random();
    /// assert_ne!(a, b);
    /// ```
    pub fn random() -> Self {
        Self::from_uuid(Uuid::new_v4())
    }

    /// Reinterprets a UUID as a fid, big-endian halves.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self::from_u128(uuid.as_u128())
    }

    /// Returns the fid as a UUID.
    pub fn as_uuid(&self) -> Uuid {
        Uuid::from_u128(self.as_u128())
    }

    pub const fn from_u128(value: u128) -> Self {
        Self {
            hi: (value >> 64) as u64,
            lo: value as u64,
        }
    }

    pub const fn as_u128(&self) -> u128 {
        ((self.hi as u128) << 64) | self.lo as u128
    }

    /// True for the closed-handle sentinel.
    pub const fn is_zero(&self) -> bool {
        self.hi == 0 && self.lo == 0
    }
}

impl fmt::Display for IndexFid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}:{:x}", self.hi, self.lo)
    }
}

impl FromStr for IndexFid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (hi, lo) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| Error::Config(format!("Invalid fid '{}': expected hi:lo", s)))?;

        let parse = |part: &str| {
            let part = part.strip_prefix("0x").unwrap_or(part);
            u64::from_str_radix(part, 16)
                .map_err(|e| Error::Config(format!("Invalid fid '{}': {}", s, e)))
        };

        Ok(Self::new(parse(hi)?, parse(lo)?))
    }
}

impl From<u128> for IndexFid {
    fn from(value: u128) -> Self {
        Self::from_u128(value)
    }
}

impl From<Uuid> for IndexFid {
    fn from(uuid: Uuid) -> Self {
        Self::from_uuid(uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_hex() {
        assert_eq!(IndexFid::new(255, 16).to_string(), "ff:10");
        assert_eq!(IndexFid::ZERO.to_string(), "0:0");
    }

    #[test]
    fn test_parse() -> Result<()> {
        assert_eq!("ff:10".parse::<IndexFid>()?, IndexFid::new(255, 16));
        assert_eq!("0x7:0x3".parse::<IndexFid>()?, IndexFid::new(7, 3));
        assert_eq!(" 1:2 ".parse::<IndexFid>()?, IndexFid::new(1, 2));
        Ok(())
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("7".parse::<IndexFid>().is_err());
        assert!("7:zz".parse::<IndexFid>().is_err());
        assert!(":".parse::<IndexFid>().is_err());
    }

    #[test]
    fn test_u128_halves() {
        let fid = IndexFid::from_u128((1u128 << 64) | 42);
        assert_eq!(fid, IndexFid::new(1, 42));
        assert_eq!(fid.as_u128(), (1u128 << 64) | 42);
    }

    #[test]
    fn test_uuid_conversion() {
        let uuid = Uuid::new_v4();
        let fid = IndexFid::from(uuid);
        assert_eq!(fid.as_uuid(), uuid);
        assert!(!fid.is_zero());
    }

    #[test]
    fn test_zero_sentinel() {
        assert!(IndexFid::ZERO.is_zero());
        assert!(!IndexFid::new(0, 1).is_zero());
    }
}
