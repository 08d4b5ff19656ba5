//! The closed set of materialization decision rules.
//!
//! Each rule is a pure, stateless function of the per-asset
//! [`RuleEvaluationContext`]: it returns a mapping from optional evaluation
//! data payloads to the asset partitions they apply to. Rules are tagged
//! with a [`DecisionType`]; materialize rules build the candidate set, skip
//! rules subtract from it, and discard rules subtract from what remains.
//!
//! Rule identity for cross-tick correlation is the [`RuleSnapshot`]
//! (class name, description, decision type) — deliberately excluding a
//! rule's own configuration fields, so differently-configured instances of
//! the same class correlate as one identity across ticks.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use trellis_core::{AssetKey, AssetPartition};

use crate::context::{group_by_asset_key, RuleEvaluationContext};
use crate::error::Result;
use crate::query::BackfillSubset;

/// The three possible outcomes of evaluating a rule for an asset partition.
///
/// Fixed meaning, never extended at runtime:
/// - `Materialize`: the partition should be produced by a run this tick
/// - `Skip`: not this tick, but a future tick is expected to produce it
/// - `Discard`: not this tick, and no future tick is expected to either
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionType {
    /// The partition should be materialized by a run kicked off this tick.
    Materialize,
    /// The partition should not be materialized this tick; future ticks are
    /// expected to materialize it.
    Skip,
    /// The partition should not be materialized this tick, and future ticks
    /// are not expected to materialize it either.
    Discard,
}

/// Optional payload attached to a rule firing.
///
/// Absence means "no extra context, the rule just applies".
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleEvaluationData {
    /// Free-form explanatory text.
    Text {
        /// The explanation.
        text: String,
    },
    /// Which parents updated since the child's last materialization, and
    /// which will be materialized in the same run this tick.
    ParentUpdated {
        /// Parents that actually updated since the last materialization.
        updated_asset_keys: BTreeSet<AssetKey>,
        /// Parents that will be materialized in the same run this tick.
        will_update_asset_keys: BTreeSet<AssetKey>,
    },
    /// Which upstream assets the partition is waiting on.
    WaitingOnAssets {
        /// The upstream asset keys being waited on.
        waiting_on_asset_keys: BTreeSet<AssetKey>,
    },
}

/// The durable identity of a rule, used to correlate firings across ticks.
///
/// Intentionally excludes the rule's configuration fields; see the module
/// docs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RuleSnapshot {
    /// The rule's class name.
    pub class_name: String,
    /// Human-readable description of when the rule fires.
    pub description: String,
    /// The decision kind the rule produces.
    pub decision_type: DecisionType,
}

/// One rule firing: the rule's identity plus its optional payload.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RuleEvaluation {
    /// The identity of the rule that fired.
    pub rule_snapshot: RuleSnapshot,
    /// The payload attached to the firing, if any.
    pub evaluation_data: Option<RuleEvaluationData>,
}

impl RuleEvaluation {
    /// Creates a rule firing from an identity and optional payload.
    #[must_use]
    pub fn new(rule_snapshot: RuleSnapshot, evaluation_data: Option<RuleEvaluationData>) -> Self {
        Self {
            rule_snapshot,
            evaluation_data,
        }
    }
}

/// The output of evaluating one rule for one asset on one tick: each entry
/// pairs an optional payload with the partitions it applies to.
pub type RuleEvaluationResults = Vec<(Option<RuleEvaluationData>, BTreeSet<AssetPartition>)>;

/// The closed set of decision rule variants.
///
/// Equality and hashing derive from the variant tag plus configuration
/// fields, so two zero-field variants of different kinds are never equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "class")]
pub enum Rule {
    /// Materialize wherever missing a materialization would violate this or
    /// a downstream asset's freshness target.
    MaterializeOnRequiredForFreshness,
    /// Materialize partitions whose upstream data changed since their
    /// latest materialization, or whose parents will update this tick.
    MaterializeOnParentUpdated,
    /// Materialize partitions that have never been materialized or observed.
    MaterializeOnMissing,
    /// Skip partitions waiting on upstream data to become up to date.
    SkipOnParentOutdated,
    /// Skip partitions waiting on upstream data to exist at all.
    SkipOnParentMissing,
    /// Skip partitions whose parents have not all been updated since the
    /// partition's last materialization.
    SkipOnNotAllParentsUpdated {
        /// Strict mode: require every parent partition updated. Lenient
        /// mode (false): require at least one updated partition per parent
        /// asset.
        require_update_for_all_parent_partitions: bool,
    },
    /// Skip partitions whose mapping requires parent partitions that do not
    /// exist upstream.
    SkipOnRequiredButNonexistentParents,
    /// Skip partitions targeted by an in-progress backfill.
    SkipOnBackfillInProgress {
        /// When true, skip every partition of any asset touched by an
        /// active backfill, not just the targeted partitions.
        all_partitions: bool,
    },
    /// Discard candidates beyond a per-tick materialization budget, dropping
    /// the lowest-priority candidates by a deterministic order.
    DiscardOnMaxMaterializationsExceeded {
        /// Maximum number of candidates to keep.
        limit: usize,
    },
}

impl Rule {
    /// Returns the decision kind this rule produces.
    #[must_use]
    pub fn decision_type(&self) -> DecisionType {
        match self {
            Self::MaterializeOnRequiredForFreshness
            | Self::MaterializeOnParentUpdated
            | Self::MaterializeOnMissing => DecisionType::Materialize,
            Self::SkipOnParentOutdated
            | Self::SkipOnParentMissing
            | Self::SkipOnNotAllParentsUpdated { .. }
            | Self::SkipOnRequiredButNonexistentParents
            | Self::SkipOnBackfillInProgress { .. } => DecisionType::Skip,
            Self::DiscardOnMaxMaterializationsExceeded { .. } => DecisionType::Discard,
        }
    }

    /// Returns the rule's class name.
    #[must_use]
    pub fn class_name(&self) -> &'static str {
        match self {
            Self::MaterializeOnRequiredForFreshness => "MaterializeOnRequiredForFreshnessRule",
            Self::MaterializeOnParentUpdated => "MaterializeOnParentUpdatedRule",
            Self::MaterializeOnMissing => "MaterializeOnMissingRule",
            Self::SkipOnParentOutdated => "SkipOnParentOutdatedRule",
            Self::SkipOnParentMissing => "SkipOnParentMissingRule",
            Self::SkipOnNotAllParentsUpdated { .. } => "SkipOnNotAllParentsUpdatedRule",
            Self::SkipOnRequiredButNonexistentParents => {
                "SkipOnRequiredButNonexistentParentsRule"
            }
            Self::SkipOnBackfillInProgress { .. } => "SkipOnBackfillInProgressRule",
            Self::DiscardOnMaxMaterializationsExceeded { .. } => {
                "DiscardOnMaxMaterializationsExceededRule"
            }
        }
    }

    /// Returns a human-readable description of when the rule fires.
    #[must_use]
    pub fn description(&self) -> String {
        match self {
            Self::MaterializeOnRequiredForFreshness => {
                "required to meet this or downstream asset's freshness policy".to_string()
            }
            Self::MaterializeOnParentUpdated => {
                "upstream data has changed since latest materialization".to_string()
            }
            Self::MaterializeOnMissing => "materialization is missing".to_string(),
            Self::SkipOnParentOutdated => "waiting on upstream data to be up to date".to_string(),
            Self::SkipOnParentMissing => "waiting on upstream data to be present".to_string(),
            Self::SkipOnNotAllParentsUpdated {
                require_update_for_all_parent_partitions,
            } => {
                if *require_update_for_all_parent_partitions {
                    "waiting until all upstream partitions are updated".to_string()
                } else {
                    "waiting on upstream data to be updated".to_string()
                }
            }
            Self::SkipOnRequiredButNonexistentParents => {
                "required parent partitions do not exist".to_string()
            }
            Self::SkipOnBackfillInProgress { all_partitions } => {
                if *all_partitions {
                    "part of an asset targeted by an in-progress backfill".to_string()
                } else {
                    "targeted by an in-progress backfill".to_string()
                }
            }
            Self::DiscardOnMaxMaterializationsExceeded { limit } => {
                format!("exceeds {limit} materialization(s) per tick")
            }
        }
    }

    /// Returns the rule's durable identity.
    #[must_use]
    pub fn snapshot(&self) -> RuleSnapshot {
        RuleSnapshot {
            class_name: self.class_name().to_string(),
            description: self.description(),
            decision_type: self.decision_type(),
        }
    }

    /// Evaluates the rule for one asset.
    ///
    /// # Errors
    ///
    /// Returns an error if an external collaborator query fails; the error
    /// aborts the whole tick.
    pub fn evaluate(&self, ctx: &RuleEvaluationContext<'_>) -> Result<RuleEvaluationResults> {
        match self {
            Self::MaterializeOnRequiredForFreshness => {
                materialize_on_required_for_freshness(ctx)
            }
            Self::MaterializeOnParentUpdated => materialize_on_parent_updated(self, ctx),
            Self::MaterializeOnMissing => materialize_on_missing(self, ctx),
            Self::SkipOnParentOutdated => skip_on_parent_outdated(self, ctx),
            Self::SkipOnParentMissing => skip_on_parent_missing(self, ctx),
            Self::SkipOnNotAllParentsUpdated {
                require_update_for_all_parent_partitions,
            } => skip_on_not_all_parents_updated(
                self,
                ctx,
                *require_update_for_all_parent_partitions,
            ),
            Self::SkipOnRequiredButNonexistentParents => {
                skip_on_required_but_nonexistent_parents(self, ctx)
            }
            Self::SkipOnBackfillInProgress { all_partitions } => {
                skip_on_backfill_in_progress(ctx, *all_partitions)
            }
            Self::DiscardOnMaxMaterializationsExceeded { limit } => {
                discard_on_max_materializations_exceeded(ctx, *limit)
            }
        }
    }
}

/// Mutable accumulator grouping asset partitions by evaluation data.
///
/// Finalized into the immutable [`RuleEvaluationResults`] mapping before
/// being returned from a rule.
#[derive(Debug, Default)]
pub(crate) struct EvaluationDataBuckets {
    buckets: BTreeMap<Option<RuleEvaluationData>, BTreeSet<AssetPartition>>,
}

impl EvaluationDataBuckets {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Inserts a partition into the bucket for the given data, creating the
    /// bucket if needed.
    pub(crate) fn add(&mut self, data: Option<RuleEvaluationData>, partition: AssetPartition) {
        self.buckets.entry(data).or_default().insert(partition);
    }

    pub(crate) fn add_all(
        &mut self,
        data: Option<RuleEvaluationData>,
        partitions: impl IntoIterator<Item = AssetPartition>,
    ) {
        self.buckets.entry(data).or_default().extend(partitions);
    }

    /// Union of all bucketed partitions.
    pub(crate) fn partitions(&self) -> BTreeSet<AssetPartition> {
        self.buckets.values().flatten().cloned().collect()
    }

    pub(crate) fn finalize(self) -> RuleEvaluationResults {
        self.buckets.into_iter().collect()
    }
}

/// Unions freshly computed firings with the previous tick's firings for
/// this rule.
///
/// A partition keeps its previous tick's evaluation data only if it was not
/// freshly evaluated this tick and `should_use_past` holds. This keeps
/// partitions that were not re-examined this tick (for cost reasons) from
/// silently vanishing from the audit trail while they remain in the same
/// logical state. Current-tick data always takes precedence.
fn with_previous_tick_data<F>(
    rule: &Rule,
    ctx: &RuleEvaluationContext<'_>,
    mut buckets: EvaluationDataBuckets,
    mut should_use_past: F,
) -> Result<RuleEvaluationResults>
where
    F: FnMut(&AssetPartition) -> Result<bool>,
{
    let freshly_evaluated = buckets.partitions();
    for (data, partitions) in ctx.previous_tick_results(rule) {
        for partition in partitions {
            if freshly_evaluated.contains(&partition) {
                continue;
            }
            if should_use_past(&partition)? {
                buckets.add(data.clone(), partition);
            }
        }
    }
    Ok(buckets.finalize())
}

fn materialize_on_required_for_freshness(
    ctx: &RuleEvaluationContext<'_>,
) -> Result<RuleEvaluationResults> {
    ctx.freshness()
        .freshness_evaluation_results(ctx.asset_key(), ctx.will_materialize())
}

fn materialize_on_parent_updated(
    rule: &Rule,
    ctx: &RuleEvaluationContext<'_>,
) -> Result<RuleEvaluationResults> {
    let mut buckets = EvaluationDataBuckets::new();

    let will_update_by_partition = ctx.will_update_parents_by_partition();
    let mut has_or_will_update: BTreeSet<AssetPartition> =
        ctx.partitions_with_updated_parents().clone();
    has_or_will_update.extend(will_update_by_partition.keys().cloned());

    let ignored_parent_keys: BTreeSet<AssetKey> =
        std::iter::once(ctx.asset_key().clone()).collect();

    for partition in &has_or_will_update {
        let parent_partitions = ctx.graph().parents_partitions(partition)?.parent_partitions;

        // Precise (data-version-aware) detection only while the combined
        // partition count stays under the configured bound.
        let combined_count = parent_partitions.union(&has_or_will_update).count();
        let respect_data_versions = ctx.config().respect_materialization_data_versions
            && combined_count < ctx.config().max_precise_parent_partition_checks;

        let updated = ctx.queryer().parent_partitions_updated_after_child(
            partition,
            &parent_partitions,
            respect_data_versions,
            &ignored_parent_keys,
        )?;
        let updated_asset_keys: BTreeSet<AssetKey> =
            updated.iter().map(|p| p.asset_key().clone()).collect();
        let will_update_asset_keys = will_update_by_partition
            .get(partition)
            .cloned()
            .unwrap_or_default();

        if !updated_asset_keys.is_empty() || !will_update_asset_keys.is_empty() {
            buckets.add(
                Some(RuleEvaluationData::ParentUpdated {
                    updated_asset_keys,
                    will_update_asset_keys,
                }),
                partition.clone(),
            );
        }
    }

    with_previous_tick_data(rule, ctx, buckets, |partition| {
        Ok(!ctx.materialized_requested_or_discarded_since_previous_tick(partition)?)
    })
}

fn materialize_on_missing(
    rule: &Rule,
    ctx: &RuleEvaluationContext<'_>,
) -> Result<RuleEvaluationResults> {
    let mut missing = ctx.never_handled_roots().clone();
    // Besides never-handled roots, partitions with newly updated parents may
    // themselves still be missing.
    for candidate in ctx.partitions_with_updated_parents() {
        if !ctx
            .queryer()
            .has_materialization_or_observation(candidate, None)?
        {
            missing.insert(candidate.clone());
        }
    }

    let mut buckets = EvaluationDataBuckets::new();
    if !missing.is_empty() {
        buckets.add_all(None, missing.iter().cloned());
    }

    with_previous_tick_data(rule, ctx, buckets, |partition| {
        Ok(!missing.contains(partition)
            && !ctx.materialized_requested_or_discarded_since_previous_tick(partition)?)
    })
}

fn skip_on_parent_outdated(
    rule: &Rule,
    ctx: &RuleEvaluationContext<'_>,
) -> Result<RuleEvaluationResults> {
    let mut buckets = EvaluationDataBuckets::new();

    // Only net-new candidates and candidates whose parents changed need to
    // be re-examined.
    let mut candidates_to_evaluate = ctx.candidates_not_previously_evaluated();
    candidates_to_evaluate.extend(ctx.candidates_with_updated_or_will_update_parents());

    for candidate in &candidates_to_evaluate {
        let mut outdated_ancestors: BTreeSet<AssetKey> = BTreeSet::new();
        for parent in ctx.parents_not_materializing_this_tick(candidate)? {
            if ctx
                .queryer()
                .has_ignorable_partition_mapping_for_outdated(candidate.asset_key(), parent.asset_key())
            {
                continue;
            }
            outdated_ancestors.extend(ctx.queryer().outdated_ancestors(&parent)?);
        }
        if !outdated_ancestors.is_empty() {
            buckets.add(
                Some(RuleEvaluationData::WaitingOnAssets {
                    waiting_on_asset_keys: outdated_ancestors,
                }),
                candidate.clone(),
            );
        }
    }

    with_previous_tick_data(rule, ctx, buckets, |partition| {
        Ok(!candidates_to_evaluate.contains(partition))
    })
}

fn skip_on_parent_missing(
    rule: &Rule,
    ctx: &RuleEvaluationContext<'_>,
) -> Result<RuleEvaluationResults> {
    let mut buckets = EvaluationDataBuckets::new();

    let mut candidates_to_evaluate = ctx.candidates_not_previously_evaluated();
    candidates_to_evaluate.extend(ctx.candidates_with_updated_or_will_update_parents());

    for candidate in &candidates_to_evaluate {
        let mut missing_parent_keys: BTreeSet<AssetKey> = BTreeSet::new();
        for parent in ctx.parents_not_materializing_this_tick(candidate)? {
            // Non-observable sources never gain a record.
            if ctx.graph().is_source(parent.asset_key())
                && !ctx.graph().is_observable(parent.asset_key())
            {
                continue;
            }
            if !ctx
                .queryer()
                .has_materialization_or_observation(&parent, None)?
            {
                missing_parent_keys.insert(parent.asset_key().clone());
            }
        }
        if !missing_parent_keys.is_empty() {
            buckets.add(
                Some(RuleEvaluationData::WaitingOnAssets {
                    waiting_on_asset_keys: missing_parent_keys,
                }),
                candidate.clone(),
            );
        }
    }

    with_previous_tick_data(rule, ctx, buckets, |partition| {
        Ok(!candidates_to_evaluate.contains(partition))
    })
}

fn skip_on_not_all_parents_updated(
    rule: &Rule,
    ctx: &RuleEvaluationContext<'_>,
    require_update_for_all_parent_partitions: bool,
) -> Result<RuleEvaluationResults> {
    let mut buckets = EvaluationDataBuckets::new();

    let mut candidates_to_evaluate = ctx.candidates_not_previously_evaluated();
    candidates_to_evaluate.extend(ctx.candidates_with_updated_or_will_update_parents());

    let parent_asset_keys = ctx.graph().parents(ctx.asset_key());

    for candidate in &candidates_to_evaluate {
        let parent_partitions = ctx.graph().parents_partitions(candidate)?.parent_partitions;

        let mut updated = ctx.queryer().parent_partitions_updated_after_child(
            candidate,
            &parent_partitions,
            ctx.config().respect_materialization_data_versions,
            &BTreeSet::new(),
        )?;
        for parent_key in &parent_asset_keys {
            if let Some(will) = ctx.will_materialize().get(parent_key) {
                updated.extend(will.iter().cloned());
            }
        }

        let mut non_updated_parent_keys: BTreeSet<AssetKey> =
            if require_update_for_all_parent_partitions {
                // Every parent partition must have updated; group what is
                // still missing by asset key.
                parent_partitions
                    .difference(&updated)
                    .map(|p| p.asset_key().clone())
                    .collect()
            } else {
                // At least one updated partition per distinct parent asset.
                let updated_by_key = group_by_asset_key(&updated);
                parent_asset_keys
                    .iter()
                    .filter(|parent| updated_by_key.get(*parent).map_or(true, |set| set.is_empty()))
                    .cloned()
                    .collect()
            };

        // Past partitions of this asset never gate their own successors.
        non_updated_parent_keys.remove(ctx.asset_key());

        if !non_updated_parent_keys.is_empty() {
            buckets.add(
                Some(RuleEvaluationData::WaitingOnAssets {
                    waiting_on_asset_keys: non_updated_parent_keys,
                }),
                candidate.clone(),
            );
        }
    }

    with_previous_tick_data(rule, ctx, buckets, |partition| {
        Ok(!candidates_to_evaluate.contains(partition))
    })
}

fn skip_on_required_but_nonexistent_parents(
    rule: &Rule,
    ctx: &RuleEvaluationContext<'_>,
) -> Result<RuleEvaluationResults> {
    let mut buckets = EvaluationDataBuckets::new();

    let candidates_to_evaluate = ctx.candidates_not_previously_evaluated();
    for candidate in &candidates_to_evaluate {
        let nonexistent = ctx
            .graph()
            .parents_partitions(candidate)?
            .required_but_nonexistent;
        let nonexistent_parent_keys: BTreeSet<AssetKey> =
            nonexistent.iter().map(|p| p.asset_key().clone()).collect();
        if !nonexistent_parent_keys.is_empty() {
            buckets.add(
                Some(RuleEvaluationData::WaitingOnAssets {
                    waiting_on_asset_keys: nonexistent_parent_keys,
                }),
                candidate.clone(),
            );
        }
    }

    with_previous_tick_data(rule, ctx, buckets, |partition| {
        Ok(!candidates_to_evaluate.contains(partition))
    })
}

fn skip_on_backfill_in_progress(
    ctx: &RuleEvaluationContext<'_>,
    all_partitions: bool,
) -> Result<RuleEvaluationResults> {
    // No carry-forward: fully recomputed from live backfill state each tick.
    let backfilling: BackfillSubset = ctx.queryer().active_backfill_target()?;

    let hit: BTreeSet<AssetPartition> = if all_partitions {
        ctx.candidates()
            .iter()
            .filter(|candidate| backfilling.contains_asset(candidate.asset_key()))
            .cloned()
            .collect()
    } else {
        ctx.candidates()
            .iter()
            .filter(|candidate| backfilling.contains(candidate))
            .cloned()
            .collect()
    };

    if hit.is_empty() {
        Ok(Vec::new())
    } else {
        Ok(vec![(None, hit)])
    }
}

fn discard_on_max_materializations_exceeded(
    ctx: &RuleEvaluationContext<'_>,
    limit: usize,
) -> Result<RuleEvaluationResults> {
    use crate::graph::sort_key_for_asset_partition;

    let mut keyed: Vec<_> = ctx
        .candidates()
        .iter()
        .map(|candidate| {
            sort_key_for_asset_partition(ctx.graph(), candidate)
                .map(|key| (key, candidate.clone()))
        })
        .collect::<Result<_>>()?;
    keyed.sort();

    let over_limit: BTreeSet<AssetPartition> = keyed
        .into_iter()
        .skip(limit)
        .map(|(_, candidate)| candidate)
        .collect();

    if over_limit.is_empty() {
        Ok(Vec::new())
    } else {
        Ok(vec![(None, over_limit)])
    }
}
