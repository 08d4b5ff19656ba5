//! Strongly-typed identifiers for Trellis entities.
//!
//! All identifiers are:
//! - **Strongly typed**: different identifier kinds cannot be mixed up at
//!   compile time
//! - **Deterministically ordered**: keys sort stably, so derived sets and
//!   mappings iterate in a reproducible order
//!
//! # Example
//!
//! ```rust
//! use trellis_core::key::{AssetKey, AssetPartition, PartitionKey};
//!
//! let asset = AssetKey::new("mart/daily_orders");
//! let partition = AssetPartition::new(asset.clone(), PartitionKey::new("2025-01-15"));
//! assert_eq!(partition.asset_key(), &asset);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

/// Stable identifier of an asset in the dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetKey(String);

impl AssetKey {
    /// Creates an asset key from a string.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AssetKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Identifier of a single partition within an asset.
///
/// Partition keys are opaque to the decision engine; ordering within an
/// asset comes from the asset's partitions definition, not from the key's
/// string ordering.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(String);

impl PartitionKey {
    /// Creates a partition key from a string.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PartitionKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// The atomic unit of a materialization decision: an asset key paired with
/// an optional partition key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AssetPartition {
    asset_key: AssetKey,
    partition_key: Option<PartitionKey>,
}

impl AssetPartition {
    /// Creates an asset partition for a partitioned asset.
    #[must_use]
    pub fn new(asset_key: AssetKey, partition_key: PartitionKey) -> Self {
        Self {
            asset_key,
            partition_key: Some(partition_key),
        }
    }

    /// Creates the single asset partition of an unpartitioned asset.
    #[must_use]
    pub fn unpartitioned(asset_key: AssetKey) -> Self {
        Self {
            asset_key,
            partition_key: None,
        }
    }

    /// Returns the asset key.
    #[must_use]
    pub fn asset_key(&self) -> &AssetKey {
        &self.asset_key
    }

    /// Returns the partition key, if the asset is partitioned.
    #[must_use]
    pub fn partition_key(&self) -> Option<&PartitionKey> {
        self.partition_key.as_ref()
    }
}

impl fmt::Display for AssetPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.partition_key {
            Some(partition) => write!(f, "{}[{partition}]", self.asset_key),
            None => write!(f, "{}", self.asset_key),
        }
    }
}

/// A unique identifier for a materialization run.
///
/// Uses ULID generation: lexicographically sortable by creation time,
/// globally unique without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Ulid);

impl RunId {
    /// Generates a new unique run ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates a run ID from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_str(s).map(Self).map_err(|e| Error::InvalidId {
            message: format!("invalid run id {s:?}: {e}"),
        })
    }
}
