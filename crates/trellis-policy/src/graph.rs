//! The asset graph collaborator interface.
//!
//! Graph construction lives outside this crate; the engine consumes the
//! graph through [`AssetGraph`]. Implementations must present a fixed
//! snapshot for the duration of a tick.

use std::collections::BTreeSet;

use trellis_core::{AssetKey, AssetPartition, PartitionsDefinition};

use crate::error::{Error, Result};
use crate::policy::MaterializePolicy;

/// How a parent's partitions map onto a child's partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PartitionMappingKind {
    /// One-to-one: the child partition depends on the parent partition with
    /// the same key.
    Identity,
    /// Time-window aligned: structurally one-to-one for co-partitioned
    /// assets, with window clamping handled by the graph.
    TimeWindow,
    /// Anything else (fan-in, fan-out, user-defined). Never eligible for
    /// same-run materialization.
    Custom,
}

impl PartitionMappingKind {
    /// Returns true if a child partition and its mapped parent partition can
    /// be produced by the same run.
    #[must_use]
    pub fn supports_same_run(self) -> bool {
        matches!(self, Self::Identity | Self::TimeWindow)
    }
}

/// The parent partitions a child asset partition depends on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParentPartitions {
    /// Parent partitions that exist upstream.
    pub parent_partitions: BTreeSet<AssetPartition>,
    /// Parent partitions the mapping requires but which do not exist
    /// upstream (e.g. a child partition range predating the parent's start).
    pub required_but_nonexistent: BTreeSet<AssetPartition>,
}

/// Read-only view of the asset dependency graph for one tick.
pub trait AssetGraph {
    /// Returns every asset key, topologically sorted with parents before
    /// children. The order must be stable across calls within a tick.
    fn asset_keys(&self) -> Vec<AssetKey>;

    /// Returns the direct parents of an asset.
    fn parents(&self, asset_key: &AssetKey) -> BTreeSet<AssetKey>;

    /// Returns the direct children of an asset.
    fn children(&self, asset_key: &AssetKey) -> BTreeSet<AssetKey>;

    /// Returns the partitions definition for an asset, or `None` if the
    /// asset is unpartitioned.
    fn partitions_def(&self, asset_key: &AssetKey) -> Option<&PartitionsDefinition>;

    /// Resolves the parent partitions of a child asset partition.
    ///
    /// # Errors
    ///
    /// Returns an error if the partition mapping cannot be resolved.
    fn parents_partitions(&self, asset_partition: &AssetPartition) -> Result<ParentPartitions>;

    /// Returns true if the asset is a source (produced outside the graph).
    fn is_source(&self, asset_key: &AssetKey) -> bool;

    /// Returns true if the asset is an observable source. Non-observable
    /// sources never gain a materialization or observation record.
    fn is_observable(&self, asset_key: &AssetKey) -> bool;

    /// Returns true if the asset can be materialized by a run.
    fn is_materializable(&self, asset_key: &AssetKey) -> bool {
        !self.is_source(asset_key)
    }

    /// Returns true if two assets share an identical partitioning scheme
    /// (including both being unpartitioned).
    fn have_same_partitioning(&self, a: &AssetKey, b: &AssetKey) -> bool {
        match (self.partitions_def(a), self.partitions_def(b)) {
            (None, None) => true,
            (Some(left), Some(right)) => left.fingerprint() == right.fingerprint(),
            _ => false,
        }
    }

    /// Returns the kind of partition mapping from a parent onto a child.
    fn partition_mapping_kind(&self, child: &AssetKey, parent: &AssetKey) -> PartitionMappingKind;

    /// Returns the deployment/repository unit an asset belongs to. Assets in
    /// different units cannot be materialized by the same run.
    fn repository_unit(&self, asset_key: &AssetKey) -> Option<String>;

    /// Returns the materialize policy configured for an asset, if any.
    fn materialize_policy(&self, asset_key: &AssetKey) -> Option<&MaterializePolicy>;
}

/// Deterministic priority key for ordering discard candidates.
///
/// Sorting candidates by this key ascending puts the highest-priority
/// candidates first: later partitions (higher ordinal) outrank earlier
/// ones, and ties break on the asset key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CandidateSortKey {
    negated_ordinal: i64,
    asset_key: AssetKey,
}

/// Computes the deterministic sort key for a candidate asset partition.
///
/// # Errors
///
/// Returns [`Error::IncomparableCandidate`] if the candidate carries a
/// partition key that has no position in its asset's partitions definition.
/// This is a programming-error class failure and is not retried.
pub fn sort_key_for_asset_partition(
    graph: &dyn AssetGraph,
    candidate: &AssetPartition,
) -> Result<CandidateSortKey> {
    let negated_ordinal = match (candidate.partition_key(), graph.partitions_def(candidate.asset_key())) {
        (None, _) => 0,
        (Some(key), Some(def)) => {
            let ordinal = def
                .ordinal(key)
                .ok_or_else(|| Error::IncomparableCandidate {
                    partition: candidate.to_string(),
                })?;
            let ordinal = i64::try_from(ordinal).map_err(|_| Error::IncomparableCandidate {
                partition: candidate.to_string(),
            })?;
            -(ordinal + 1)
        }
        (Some(_), None) => {
            return Err(Error::IncomparableCandidate {
                partition: candidate.to_string(),
            })
        }
    };
    Ok(CandidateSortKey {
        negated_ordinal,
        asset_key: candidate.asset_key().clone(),
    })
}
