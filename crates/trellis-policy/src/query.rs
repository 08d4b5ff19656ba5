//! The point-in-time query collaborator interface.
//!
//! The instance queryer answers "what happened, as of this tick" questions:
//! materialization and observation existence, data-version-aware update
//! detection, outdated-ancestor computation, and active backfill membership.
//! Implementations present a fixed snapshot (a fixed evaluation time and
//! storage watermark) for the duration of a tick; failure of any query is
//! fatal to the tick.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

use trellis_core::{AssetKey, AssetPartition};

use crate::cursor::StorageWatermark;
use crate::error::Result;

/// The asset partitions targeted by currently active backfills.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillSubset {
    partitions_by_asset: BTreeMap<AssetKey, BTreeSet<AssetPartition>>,
}

impl BackfillSubset {
    /// Creates an empty subset (no active backfills).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a targeted asset partition.
    pub fn insert(&mut self, partition: AssetPartition) {
        self.partitions_by_asset
            .entry(partition.asset_key().clone())
            .or_default()
            .insert(partition);
    }

    /// Returns true if no backfill is active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.partitions_by_asset.is_empty()
    }

    /// Returns true if any partition of the asset is targeted.
    #[must_use]
    pub fn contains_asset(&self, asset_key: &AssetKey) -> bool {
        self.partitions_by_asset.contains_key(asset_key)
    }

    /// Returns true if the exact asset partition is targeted.
    #[must_use]
    pub fn contains(&self, partition: &AssetPartition) -> bool {
        self.partitions_by_asset
            .get(partition.asset_key())
            .is_some_and(|partitions| partitions.contains(partition))
    }
}

impl FromIterator<AssetPartition> for BackfillSubset {
    fn from_iter<I: IntoIterator<Item = AssetPartition>>(iter: I) -> Self {
        let mut subset = Self::new();
        for partition in iter {
            subset.insert(partition);
        }
        subset
    }
}

/// Point-in-time query layer consumed by the engine.
///
/// All methods observe the same fixed snapshot of external state for the
/// duration of a tick.
pub trait InstanceQueryer {
    /// The fixed evaluation time for this tick.
    fn evaluation_time(&self) -> DateTime<Utc>;

    /// The storage watermark this tick evaluates against.
    ///
    /// # Errors
    ///
    /// Returns an error if the event log position cannot be read.
    fn latest_storage_watermark(&self) -> Result<Option<StorageWatermark>>;

    /// Returns true if the asset partition has a materialization or
    /// observation record, optionally restricted to records after the
    /// given watermark.
    ///
    /// # Errors
    ///
    /// Returns an error if the record lookup fails.
    fn has_materialization_or_observation(
        &self,
        partition: &AssetPartition,
        after: Option<StorageWatermark>,
    ) -> Result<bool>;

    /// Returns the subset of `parent_partitions` updated after the child's
    /// latest materialization.
    ///
    /// When `respect_data_versions` is true the check compares data
    /// versions, so a re-materialization that produced identical data does
    /// not count as an update. Parents whose asset key appears in
    /// `ignored_parent_keys` are excluded (used to break self-dependency
    /// feedback loops).
    ///
    /// # Errors
    ///
    /// Returns an error if the record lookup fails.
    fn parent_partitions_updated_after_child(
        &self,
        child: &AssetPartition,
        parent_partitions: &BTreeSet<AssetPartition>,
        respect_data_versions: bool,
        ignored_parent_keys: &BTreeSet<AssetKey>,
    ) -> Result<BTreeSet<AssetPartition>>;

    /// Returns the partitions of `asset_key` whose parents gained a
    /// materialization or observation record after the given watermark.
    ///
    /// # Errors
    ///
    /// Returns an error if the record lookup fails.
    fn partitions_with_newly_updated_parents(
        &self,
        asset_key: &AssetKey,
        after: Option<StorageWatermark>,
    ) -> Result<BTreeSet<AssetPartition>>;

    /// Returns the ancestors whose staleness makes this asset partition
    /// outdated (transitively collected root causes).
    ///
    /// # Errors
    ///
    /// Returns an error if the staleness computation fails.
    fn outdated_ancestors(&self, partition: &AssetPartition) -> Result<BTreeSet<AssetKey>>;

    /// Returns true if the parent→child relationship is explicitly marked
    /// ignorable for staleness tracking.
    fn has_ignorable_partition_mapping_for_outdated(
        &self,
        child: &AssetKey,
        parent: &AssetKey,
    ) -> bool;

    /// Returns the asset partitions targeted by active backfills. Always
    /// recomputed from live backfill state, never cached across ticks.
    ///
    /// # Errors
    ///
    /// Returns an error if backfill state cannot be read.
    fn active_backfill_target(&self) -> Result<BackfillSubset>;
}
