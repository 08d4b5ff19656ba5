//! Partitions definitions and serialized partition subsets.
//!
//! A [`PartitionsDefinition`] is the ordered universe of partition keys for
//! one asset. Persisted evaluation records store partition sets as a
//! [`SerializedPartitionsSubset`]: an opaque wire string plus a fingerprint
//! of the definition it was serialized against. A subset can only be
//! deserialized against a definition with a matching fingerprint; after a
//! partitioning scheme change the stored subset is unreadable and callers
//! decide how to degrade.
//!
//! The wire form is a JSON array of partition key strings. Two logically
//! identical subsets may serialize to different strings (element order is
//! not canonicalized), so equality of serialized subsets must fall back to
//! deserialization when the strings disagree.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

use crate::error::{Error, Result};
use crate::key::PartitionKey;

/// The ordered set of partition keys defined for one asset.
///
/// Order is meaningful: a partition's position is its ordinal, used for
/// deterministic prioritization (later partitions are newer and sort
/// first when picking which candidates to keep under a limit).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionsDefinition {
    keys: Vec<PartitionKey>,
    fingerprint: String,
}

impl PartitionsDefinition {
    /// Creates a partitions definition from an ordered list of keys.
    ///
    /// # Errors
    ///
    /// Returns an error if the key list contains duplicates.
    pub fn new(keys: impl IntoIterator<Item = PartitionKey>) -> Result<Self> {
        let keys: Vec<PartitionKey> = keys.into_iter().collect();
        let mut seen = BTreeSet::new();
        for key in &keys {
            if !seen.insert(key) {
                return Err(Error::InvalidInput(format!(
                    "duplicate partition key: {key}"
                )));
            }
        }
        let fingerprint = fingerprint_for(&keys);
        Ok(Self { keys, fingerprint })
    }

    /// Returns the partition keys in definition order.
    #[must_use]
    pub fn keys(&self) -> &[PartitionKey] {
        &self.keys
    }

    /// Returns true if the key belongs to this definition.
    #[must_use]
    pub fn contains(&self, key: &PartitionKey) -> bool {
        self.keys.iter().any(|k| k == key)
    }

    /// Returns the ordinal of a key within the definition, if present.
    #[must_use]
    pub fn ordinal(&self, key: &PartitionKey) -> Option<usize> {
        self.keys.iter().position(|k| k == key)
    }

    /// Returns the fingerprint identifying this definition's key universe.
    ///
    /// Two definitions with the same keys in the same order share a
    /// fingerprint; any change to the scheme produces a new one.
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Serializes a subset of this definition's keys.
    ///
    /// # Errors
    ///
    /// Returns an error if any key is not part of this definition.
    pub fn serialize_subset(
        &self,
        keys: impl IntoIterator<Item = PartitionKey>,
    ) -> Result<SerializedPartitionsSubset> {
        let keys: Vec<PartitionKey> = keys.into_iter().collect();
        for key in &keys {
            if !self.contains(key) {
                return Err(Error::UnknownPartitionKey {
                    key: key.to_string(),
                });
            }
        }
        let serialized = serde_json::to_string(&keys)
            .map_err(|e| Error::serialization(format!("partition subset encode: {e}")))?;
        Ok(SerializedPartitionsSubset {
            serialized_subset: serialized,
            definition_fingerprint: self.fingerprint.clone(),
        })
    }
}

fn fingerprint_for(keys: &[PartitionKey]) -> String {
    let mut hasher = Sha256::new();
    for key in keys {
        hasher.update(key.as_str().as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    // 16 hex chars (64 bits) is plenty for scheme-change detection.
    digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

/// A partition subset serialized against a specific partitions definition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SerializedPartitionsSubset {
    serialized_subset: String,
    definition_fingerprint: String,
}

impl SerializedPartitionsSubset {
    /// Reconstructs a serialized subset from its stored parts.
    #[must_use]
    pub fn from_parts(serialized_subset: String, definition_fingerprint: String) -> Self {
        Self {
            serialized_subset,
            definition_fingerprint,
        }
    }

    /// Returns the opaque wire string.
    #[must_use]
    pub fn serialized(&self) -> &str {
        &self.serialized_subset
    }

    /// Returns true if this subset was serialized against the given
    /// definition and can be deserialized against it.
    #[must_use]
    pub fn can_deserialize(&self, definition: &PartitionsDefinition) -> bool {
        self.definition_fingerprint == definition.fingerprint()
    }

    /// Deserializes the subset against the given definition.
    ///
    /// # Errors
    ///
    /// Returns an error if the definition fingerprint does not match, if the
    /// wire string is malformed, or if a stored key is no longer defined.
    pub fn deserialize(&self, definition: &PartitionsDefinition) -> Result<BTreeSet<PartitionKey>> {
        if !self.can_deserialize(definition) {
            return Err(Error::IncompatiblePartitionSubset {
                stored: self.definition_fingerprint.clone(),
                current: definition.fingerprint().to_string(),
            });
        }
        let keys: Vec<PartitionKey> = serde_json::from_str(&self.serialized_subset)
            .map_err(|e| Error::serialization(format!("partition subset decode: {e}")))?;
        for key in &keys {
            if !definition.contains(key) {
                return Err(Error::UnknownPartitionKey {
                    key: key.to_string(),
                });
            }
        }
        Ok(keys.into_iter().collect())
    }
}
