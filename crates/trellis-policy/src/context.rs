//! Per-asset, per-tick evaluation context.
//!
//! A [`RuleEvaluationContext`] bundles everything a rule may consult while
//! evaluating one asset: the graph and queryer collaborators, the previous
//! tick's decoded record, and the partitions upstream assets will
//! materialize this tick. The expensive derived views (previous-tick
//! firings, updated-parent partitions, never-handled roots) are computed
//! once at construction and shared by every rule of the asset; the skip and
//! discard stages reuse the same context with a narrowed candidate set.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use trellis_core::{AssetKey, AssetPartition};

use crate::config::EvaluatorConfig;
use crate::cursor::{Cursor, StorageWatermark};
use crate::freshness::FreshnessResolver;
use crate::graph::AssetGraph;
use crate::query::InstanceQueryer;
use crate::rule::{Rule, RuleEvaluationResults, RuleSnapshot};

/// The partitions each upstream asset will materialize this tick, threaded
/// top-down through the topological walk.
pub type WillMaterializeMapping = BTreeMap<AssetKey, BTreeSet<AssetPartition>>;

/// Groups asset partitions by their asset key.
#[must_use]
pub fn group_by_asset_key(
    partitions: &BTreeSet<AssetPartition>,
) -> BTreeMap<AssetKey, BTreeSet<AssetPartition>> {
    let mut grouped: BTreeMap<AssetKey, BTreeSet<AssetPartition>> = BTreeMap::new();
    for partition in partitions {
        grouped
            .entry(partition.asset_key().clone())
            .or_default()
            .insert(partition.clone());
    }
    grouped
}

/// Everything the rules of one asset consult during one tick.
#[derive(Clone)]
pub struct RuleEvaluationContext<'a> {
    asset_key: AssetKey,
    graph: &'a dyn AssetGraph,
    queryer: &'a dyn InstanceQueryer,
    freshness: &'a dyn FreshnessResolver,
    config: &'a EvaluatorConfig,
    previous_watermark: Option<StorageWatermark>,
    will_materialize: &'a WillMaterializeMapping,
    candidates: BTreeSet<AssetPartition>,
    memo: Arc<ContextMemo>,
}

/// Derived views shared across the asset's rules and stages.
#[derive(Debug)]
struct ContextMemo {
    previous_results_by_snapshot: BTreeMap<RuleSnapshot, RuleEvaluationResults>,
    previously_requested_or_discarded: BTreeSet<AssetPartition>,
    previously_evaluated: BTreeSet<AssetPartition>,
    partitions_with_updated_parents: BTreeSet<AssetPartition>,
    never_handled_roots: BTreeSet<AssetPartition>,
    will_update_parents_by_partition: BTreeMap<AssetPartition, BTreeSet<AssetKey>>,
}

impl<'a> RuleEvaluationContext<'a> {
    /// Builds the context for one asset, computing the derived views.
    ///
    /// # Errors
    ///
    /// Returns an error if decoding the previous tick's record or querying
    /// external state fails.
    pub fn new(
        asset_key: AssetKey,
        graph: &'a dyn AssetGraph,
        queryer: &'a dyn InstanceQueryer,
        freshness: &'a dyn FreshnessResolver,
        config: &'a EvaluatorConfig,
        cursor: &Cursor,
        will_materialize: &'a WillMaterializeMapping,
    ) -> crate::error::Result<Self> {
        let partitions_def = graph.partitions_def(&asset_key);
        let previous = cursor.latest_evaluation(&asset_key);

        let previous_results_by_snapshot = match previous {
            Some(record) => record.results_by_snapshot(partitions_def)?,
            None => BTreeMap::new(),
        };
        let previously_requested_or_discarded = match previous {
            Some(record) => record.requested_or_discarded_partitions(partitions_def)?,
            None => BTreeSet::new(),
        };
        let previously_evaluated = match previous {
            Some(record) => record.evaluated_partitions(partitions_def)?,
            None => BTreeSet::new(),
        };

        let previous_watermark = cursor.latest_storage_watermark();
        let partitions_with_updated_parents =
            queryer.partitions_with_newly_updated_parents(&asset_key, previous_watermark)?;

        let is_root = graph
            .parents(&asset_key)
            .iter()
            .all(|parent| !graph.is_materializable(parent));
        let never_handled_roots = if is_root {
            let all_partitions: Vec<AssetPartition> = match partitions_def {
                Some(def) => def
                    .keys()
                    .iter()
                    .map(|key| AssetPartition::new(asset_key.clone(), key.clone()))
                    .collect(),
                None => vec![AssetPartition::unpartitioned(asset_key.clone())],
            };
            let mut roots = BTreeSet::new();
            for partition in all_partitions {
                if previously_requested_or_discarded.contains(&partition) {
                    continue;
                }
                if !queryer.has_materialization_or_observation(&partition, None)? {
                    roots.insert(partition);
                }
            }
            roots
        } else {
            BTreeSet::new()
        };

        let will_update_parents_by_partition = will_update_parents_by_partition(
            &asset_key,
            graph,
            will_materialize,
        );

        Ok(Self {
            asset_key,
            graph,
            queryer,
            freshness,
            config,
            previous_watermark,
            will_materialize,
            candidates: BTreeSet::new(),
            memo: Arc::new(ContextMemo {
                previous_results_by_snapshot,
                previously_requested_or_discarded,
                previously_evaluated,
                partitions_with_updated_parents,
                never_handled_roots,
                will_update_parents_by_partition,
            }),
        })
    }

    /// Reuses the context with a narrowed candidate set for a later stage.
    #[must_use]
    pub fn with_candidates(&self, candidates: BTreeSet<AssetPartition>) -> Self {
        let mut narrowed = self.clone();
        narrowed.candidates = candidates;
        narrowed
    }

    /// The asset under evaluation.
    #[must_use]
    pub fn asset_key(&self) -> &AssetKey {
        &self.asset_key
    }

    /// The asset graph collaborator.
    #[must_use]
    pub fn graph(&self) -> &'a dyn AssetGraph {
        self.graph
    }

    /// The point-in-time query collaborator.
    #[must_use]
    pub fn queryer(&self) -> &'a dyn InstanceQueryer {
        self.queryer
    }

    /// The freshness collaborator.
    #[must_use]
    pub fn freshness(&self) -> &'a dyn FreshnessResolver {
        self.freshness
    }

    /// Evaluator tunables.
    #[must_use]
    pub fn config(&self) -> &'a EvaluatorConfig {
        self.config
    }

    /// The candidate partitions for the current stage. Empty during the
    /// materialize stage, which generates candidates rather than filtering
    /// them.
    #[must_use]
    pub fn candidates(&self) -> &BTreeSet<AssetPartition> {
        &self.candidates
    }

    /// What upstream assets will materialize this tick.
    #[must_use]
    pub fn will_materialize(&self) -> &'a WillMaterializeMapping {
        self.will_materialize
    }

    /// The previous tick's firings for a rule, decoded against the current
    /// partitioning. Empty if the rule did not fire or the asset was
    /// repartitioned.
    #[must_use]
    pub fn previous_tick_results(&self, rule: &Rule) -> RuleEvaluationResults {
        self.memo
            .previous_results_by_snapshot
            .get(&rule.snapshot())
            .cloned()
            .unwrap_or_default()
    }

    /// Returns true if the partition was materialized since the previous
    /// tick, or was requested or discarded by the previous tick's record.
    /// Such a partition's carried-forward state is stale and must not be
    /// reused.
    ///
    /// # Errors
    ///
    /// Returns an error if the record lookup fails.
    pub fn materialized_requested_or_discarded_since_previous_tick(
        &self,
        partition: &AssetPartition,
    ) -> crate::error::Result<bool> {
        if self
            .memo
            .previously_requested_or_discarded
            .contains(partition)
        {
            return Ok(true);
        }
        self.queryer
            .has_materialization_or_observation(partition, self.previous_watermark)
    }

    /// Root-asset partitions that have never been materialized, observed,
    /// requested, or discarded. Empty for non-root assets.
    #[must_use]
    pub fn never_handled_roots(&self) -> &BTreeSet<AssetPartition> {
        &self.memo.never_handled_roots
    }

    /// Partitions of this asset whose parents gained a record since the
    /// previous tick.
    #[must_use]
    pub fn partitions_with_updated_parents(&self) -> &BTreeSet<AssetPartition> {
        &self.memo.partitions_with_updated_parents
    }

    /// For each partition of this asset, the parent assets that will
    /// materialize a same-run-mappable partition this tick.
    #[must_use]
    pub fn will_update_parents_by_partition(
        &self,
    ) -> &BTreeMap<AssetPartition, BTreeSet<AssetKey>> {
        &self.memo.will_update_parents_by_partition
    }

    /// Candidates that no rule evaluated on the previous tick.
    ///
    /// A partition evaluated last tick carries at least one materialize
    /// firing in the previous record, and any such partition was seen by
    /// every skip rule as well.
    #[must_use]
    pub fn candidates_not_previously_evaluated(&self) -> BTreeSet<AssetPartition> {
        self.candidates
            .difference(&self.memo.previously_evaluated)
            .cloned()
            .collect()
    }

    /// Candidates whose parents updated since the previous tick or will
    /// update this tick.
    #[must_use]
    pub fn candidates_with_updated_or_will_update_parents(&self) -> BTreeSet<AssetPartition> {
        self.candidates
            .iter()
            .filter(|candidate| {
                self.memo.partitions_with_updated_parents.contains(*candidate)
                    || self
                        .memo
                        .will_update_parents_by_partition
                        .contains_key(*candidate)
            })
            .cloned()
            .collect()
    }

    /// The parent partitions of a candidate that will not be materialized
    /// in the same run this tick.
    ///
    /// # Errors
    ///
    /// Returns an error if the partition mapping cannot be resolved.
    pub fn parents_not_materializing_this_tick(
        &self,
        candidate: &AssetPartition,
    ) -> crate::error::Result<BTreeSet<AssetPartition>> {
        let parent_partitions = self
            .graph
            .parents_partitions(candidate)?
            .parent_partitions;
        Ok(parent_partitions
            .into_iter()
            .filter(|parent| {
                !will_materialize_in_same_run(
                    self.graph,
                    self.will_materialize,
                    candidate.asset_key(),
                    parent,
                )
            })
            .collect())
    }
}

/// Returns true if the parent partition will be materialized this tick in a
/// run the child can join.
fn will_materialize_in_same_run(
    graph: &dyn AssetGraph,
    will_materialize: &WillMaterializeMapping,
    child: &AssetKey,
    parent: &AssetPartition,
) -> bool {
    will_materialize
        .get(parent.asset_key())
        .is_some_and(|partitions| partitions.contains(parent))
        && can_join_parent_run(graph, child, parent.asset_key())
}

/// A child can only ride along in a parent's run if both assets are
/// materializable, share an identical partitioning scheme, map one-to-one
/// onto each other, and live in the same repository unit.
fn can_join_parent_run(graph: &dyn AssetGraph, child: &AssetKey, parent: &AssetKey) -> bool {
    graph.is_materializable(child)
        && graph.is_materializable(parent)
        && graph.have_same_partitioning(child, parent)
        && (graph.partitions_def(parent).is_none()
            || graph.partition_mapping_kind(child, parent).supports_same_run())
        && graph.repository_unit(child) == graph.repository_unit(parent)
}

fn will_update_parents_by_partition(
    asset_key: &AssetKey,
    graph: &dyn AssetGraph,
    will_materialize: &WillMaterializeMapping,
) -> BTreeMap<AssetPartition, BTreeSet<AssetKey>> {
    let mut by_partition: BTreeMap<AssetPartition, BTreeSet<AssetKey>> = BTreeMap::new();

    for parent_key in graph.parents(asset_key) {
        let Some(parent_partitions) = will_materialize.get(&parent_key) else {
            continue;
        };
        if !can_join_parent_run(graph, asset_key, &parent_key) {
            continue;
        }

        for parent_partition in parent_partitions {
            // Identical partitioning makes the mapping one-to-one: the child
            // partition carries the parent's key, or the whole asset when
            // both are unpartitioned.
            let child_partition = match parent_partition.partition_key() {
                None => AssetPartition::unpartitioned(asset_key.clone()),
                Some(key) => AssetPartition::new(asset_key.clone(), key.clone()),
            };
            by_partition
                .entry(child_partition)
                .or_default()
                .insert(parent_key.clone());
        }
    }
    by_partition
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_by_asset_key_partitions_the_set() {
        let a1 = AssetPartition::new(AssetKey::new("a"), "p1".into());
        let a2 = AssetPartition::new(AssetKey::new("a"), "p2".into());
        let b = AssetPartition::unpartitioned(AssetKey::new("b"));

        let grouped = group_by_asset_key(&[a1.clone(), a2.clone(), b.clone()].into_iter().collect());
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[&AssetKey::new("a")], [a1, a2].into_iter().collect());
        assert_eq!(grouped[&AssetKey::new("b")], [b].into_iter().collect());
    }
}
