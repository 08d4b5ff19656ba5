//! Scriptable materialization history for tests.

use chrono::{DateTime, TimeZone, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use trellis_core::{AssetKey, AssetPartition};
use trellis_policy::cursor::StorageWatermark;
use trellis_policy::error::Result;
use trellis_policy::query::{BackfillSubset, InstanceQueryer};

use crate::graph::TestAssetGraph;

#[derive(Debug, Clone)]
struct Record {
    position: StorageWatermark,
    data_version: Option<String>,
}

#[derive(Debug)]
struct State {
    now: DateTime<Utc>,
    watermark: Option<StorageWatermark>,
    records: BTreeMap<AssetPartition, Vec<Record>>,
    outdated: BTreeMap<AssetPartition, BTreeSet<AssetKey>>,
    ignorable: BTreeSet<(AssetKey, AssetKey)>,
    backfill: BackfillSubset,
}

/// An [`InstanceQueryer`] backed by an in-memory event log that tests
/// append to between ticks.
pub struct TestInstanceQueryer {
    graph: Arc<TestAssetGraph>,
    state: Mutex<State>,
}

impl TestInstanceQueryer {
    /// Creates a queryer with an empty event log.
    pub fn new(graph: Arc<TestAssetGraph>) -> Self {
        Self {
            graph,
            state: Mutex::new(State {
                now: Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap(),
                watermark: None,
                records: BTreeMap::new(),
                outdated: BTreeMap::new(),
                ignorable: BTreeSet::new(),
                backfill: BackfillSubset::new(),
            }),
        }
    }

    /// Appends a materialization record, advancing the watermark.
    pub fn record_materialization(&self, partition: AssetPartition) -> StorageWatermark {
        self.record_with_data_version(partition, None)
    }

    /// Appends a materialization record carrying a data version.
    pub fn record_with_data_version(
        &self,
        partition: AssetPartition,
        data_version: Option<&str>,
    ) -> StorageWatermark {
        let mut state = self.state.lock().expect("queryer lock");
        let position =
            StorageWatermark::new(state.watermark.map_or(1, |w| w.position() + 1));
        state.records.entry(partition).or_default().push(Record {
            position,
            data_version: data_version.map(str::to_string),
        });
        state.watermark = Some(position);
        position
    }

    /// Fixes the evaluation time returned to the engine.
    pub fn set_evaluation_time(&self, now: DateTime<Utc>) {
        self.state.lock().expect("queryer lock").now = now;
    }

    /// Declares which ancestors make a partition outdated.
    pub fn mark_outdated(
        &self,
        partition: AssetPartition,
        ancestors: impl IntoIterator<Item = impl Into<AssetKey>>,
    ) {
        self.state
            .lock()
            .expect("queryer lock")
            .outdated
            .insert(partition, ancestors.into_iter().map(Into::into).collect());
    }

    /// Clears a partition's outdated ancestors.
    pub fn clear_outdated(&self, partition: &AssetPartition) {
        self.state
            .lock()
            .expect("queryer lock")
            .outdated
            .remove(partition);
    }

    /// Marks a parent→child relationship ignorable for staleness tracking.
    pub fn mark_ignorable(&self, child: impl Into<AssetKey>, parent: impl Into<AssetKey>) {
        self.state
            .lock()
            .expect("queryer lock")
            .ignorable
            .insert((child.into(), parent.into()));
    }

    /// Replaces the active backfill target.
    pub fn set_backfill(&self, backfill: BackfillSubset) {
        self.state.lock().expect("queryer lock").backfill = backfill;
    }

    fn latest_position(records: &[Record]) -> Option<StorageWatermark> {
        records.iter().map(|record| record.position).max()
    }
}

impl InstanceQueryer for TestInstanceQueryer {
    fn evaluation_time(&self) -> DateTime<Utc> {
        self.state.lock().expect("queryer lock").now
    }

    fn latest_storage_watermark(&self) -> Result<Option<StorageWatermark>> {
        Ok(self.state.lock().expect("queryer lock").watermark)
    }

    fn has_materialization_or_observation(
        &self,
        partition: &AssetPartition,
        after: Option<StorageWatermark>,
    ) -> Result<bool> {
        let state = self.state.lock().expect("queryer lock");
        Ok(state.records.get(partition).is_some_and(|records| {
            records
                .iter()
                .any(|record| after.map_or(true, |mark| record.position > mark))
        }))
    }

    fn parent_partitions_updated_after_child(
        &self,
        child: &AssetPartition,
        parent_partitions: &BTreeSet<AssetPartition>,
        respect_data_versions: bool,
        ignored_parent_keys: &BTreeSet<AssetKey>,
    ) -> Result<BTreeSet<AssetPartition>> {
        let state = self.state.lock().expect("queryer lock");
        let child_latest = state
            .records
            .get(child)
            .and_then(|records| Self::latest_position(records));

        let mut updated = BTreeSet::new();
        for parent in parent_partitions {
            if ignored_parent_keys.contains(parent.asset_key()) {
                continue;
            }
            let Some(records) = state.records.get(parent) else {
                continue;
            };
            let Some(child_latest) = child_latest else {
                // Child has never materialized; any parent record counts.
                if !records.is_empty() {
                    updated.insert(parent.clone());
                }
                continue;
            };
            let has_newer = records.iter().any(|record| record.position > child_latest);
            if !has_newer {
                continue;
            }
            if respect_data_versions {
                let version_before = records
                    .iter()
                    .filter(|record| record.position <= child_latest)
                    .max_by_key(|record| record.position)
                    .and_then(|record| record.data_version.clone());
                let version_now = records
                    .iter()
                    .max_by_key(|record| record.position)
                    .and_then(|record| record.data_version.clone());
                if version_before.is_some() && version_before == version_now {
                    continue;
                }
            }
            updated.insert(parent.clone());
        }
        Ok(updated)
    }

    fn partitions_with_newly_updated_parents(
        &self,
        asset_key: &AssetKey,
        after: Option<StorageWatermark>,
    ) -> Result<BTreeSet<AssetPartition>> {
        use trellis_policy::graph::AssetGraph;

        let partitions: Vec<AssetPartition> = match self.graph.partitions_def(asset_key) {
            Some(def) => def
                .keys()
                .iter()
                .map(|key| AssetPartition::new(asset_key.clone(), key.clone()))
                .collect(),
            None => vec![AssetPartition::unpartitioned(asset_key.clone())],
        };

        let mut with_updated = BTreeSet::new();
        for partition in partitions {
            let parents = self.graph.parents_partitions(&partition)?.parent_partitions;
            for parent in parents {
                if self.has_materialization_or_observation(&parent, after)? {
                    with_updated.insert(partition.clone());
                    break;
                }
            }
        }
        Ok(with_updated)
    }

    fn outdated_ancestors(&self, partition: &AssetPartition) -> Result<BTreeSet<AssetKey>> {
        Ok(self
            .state
            .lock()
            .expect("queryer lock")
            .outdated
            .get(partition)
            .cloned()
            .unwrap_or_default())
    }

    fn has_ignorable_partition_mapping_for_outdated(
        &self,
        child: &AssetKey,
        parent: &AssetKey,
    ) -> bool {
        self.state
            .lock()
            .expect("queryer lock")
            .ignorable
            .contains(&(child.clone(), parent.clone()))
    }

    fn active_backfill_target(&self) -> Result<BackfillSubset> {
        Ok(self.state.lock().expect("queryer lock").backfill.clone())
    }
}
