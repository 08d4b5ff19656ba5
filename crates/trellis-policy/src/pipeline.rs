//! The tick driver.
//!
//! One tick walks every policied asset in topological order (parents before
//! children), runs the asset's rules in three stages, and folds the results
//! into a [`TickOutcome`]: the per-asset records, the run requests for
//! everything that survived, and the successor cursor. A tick is atomic
//! with respect to its inputs — every query observes the same snapshot —
//! and any collaborator failure aborts the whole tick with no partial
//! state.
//!
//! Stage algebra, per asset: the materialize rules build the candidate set,
//! the skip rules subtract from the candidates, and the discard rules
//! subtract from what remains. A partition named by both a skip and a
//! discard rule counts as skipped.

use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, instrument};

use trellis_core::{AssetKey, AssetPartition, PartitionKey, RunId};

use crate::config::EvaluatorConfig;
use crate::context::{RuleEvaluationContext, WillMaterializeMapping};
use crate::cursor::Cursor;
use crate::error::Result;
use crate::evaluation::AssetEvaluation;
use crate::freshness::FreshnessResolver;
use crate::graph::AssetGraph;
use crate::metrics;
use crate::policy::MaterializePolicy;
use crate::query::InstanceQueryer;
use crate::rule::{DecisionType, RuleEvaluation};

/// A request to launch one materialization run.
///
/// Assets sharing a partition key and a repository unit are grouped into a
/// single run, so a child requested alongside its parent materializes in
/// the same run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    run_id: RunId,
    partition_key: Option<PartitionKey>,
    asset_keys: BTreeSet<AssetKey>,
}

impl RunRequest {
    /// The pre-assigned id of the run to launch.
    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// The partition key the run materializes, or `None` for unpartitioned
    /// assets.
    #[must_use]
    pub fn partition_key(&self) -> Option<&PartitionKey> {
        self.partition_key.as_ref()
    }

    /// The assets the run materializes.
    #[must_use]
    pub fn asset_keys(&self) -> &BTreeSet<AssetKey> {
        &self.asset_keys
    }
}

/// Everything one tick produced.
#[derive(Debug)]
pub struct TickOutcome {
    /// The evaluation record for every asset that was evaluated.
    pub evaluations: Vec<AssetEvaluation>,
    /// The subset of records that must be written to the record store:
    /// those not equivalent to what is already stored.
    pub to_persist: Vec<AssetEvaluation>,
    /// The runs to launch for the requested partitions.
    pub run_requests: Vec<RunRequest>,
    /// The successor cursor. Must be durably committed before the next
    /// tick begins.
    pub cursor: Cursor,
}

/// The outcome of the three rule stages for one asset.
struct AssetStageOutcome {
    evaluation: AssetEvaluation,
    requested: BTreeSet<AssetPartition>,
    num_skipped: usize,
    num_discarded: usize,
}

/// Evaluates ticks against a fixed set of collaborators.
pub struct TickEvaluator<'a> {
    graph: &'a dyn AssetGraph,
    queryer: &'a dyn InstanceQueryer,
    freshness: &'a dyn FreshnessResolver,
    config: EvaluatorConfig,
}

impl<'a> TickEvaluator<'a> {
    /// Creates an evaluator over the given collaborators.
    #[must_use]
    pub fn new(
        graph: &'a dyn AssetGraph,
        queryer: &'a dyn InstanceQueryer,
        freshness: &'a dyn FreshnessResolver,
        config: EvaluatorConfig,
    ) -> Self {
        Self {
            graph,
            queryer,
            freshness,
            config,
        }
    }

    /// Runs one tick against the given cursor.
    ///
    /// The cursor is read-only input; the successor cursor comes back in
    /// the outcome. Re-running the same tick against the same cursor and
    /// the same external state produces the same outcome.
    ///
    /// # Errors
    ///
    /// Returns the first collaborator or decode error encountered; no
    /// partial outcome is produced.
    #[instrument(skip_all, fields(evaluation_id = cursor.evaluation_id() + 1))]
    pub fn evaluate_tick(&self, cursor: &Cursor) -> Result<TickOutcome> {
        let watermark = self.queryer.latest_storage_watermark()?;

        let mut will_materialize: WillMaterializeMapping = BTreeMap::new();
        let mut outcomes: Vec<AssetStageOutcome> = Vec::new();
        let mut num_assets = 0u64;

        for asset_key in self.graph.asset_keys() {
            if !self.graph.is_materializable(&asset_key) {
                continue;
            }
            let Some(policy) = self.graph.materialize_policy(&asset_key) else {
                continue;
            };
            num_assets += 1;

            let ctx = RuleEvaluationContext::new(
                asset_key.clone(),
                self.graph,
                self.queryer,
                self.freshness,
                &self.config,
                cursor,
                &will_materialize,
            )?;
            let outcome = self.evaluate_asset(&asset_key, policy, &ctx)?;

            debug!(
                asset = %asset_key,
                requested = outcome.requested.len(),
                skipped = outcome.num_skipped,
                discarded = outcome.num_discarded,
                "evaluated asset"
            );

            if !outcome.requested.is_empty() {
                will_materialize.insert(asset_key, outcome.requested.clone());
            }
            outcomes.push(outcome);
        }

        let all_requested: BTreeSet<AssetPartition> = outcomes
            .iter()
            .flat_map(|outcome| outcome.requested.iter().cloned())
            .collect();
        let run_requests = build_run_requests(self.graph, &all_requested);
        let run_ids_by_asset = run_ids_by_asset(&run_requests);

        let mut evaluations = Vec::with_capacity(outcomes.len());
        let mut to_persist = Vec::new();
        let (mut total_requested, mut total_skipped, mut total_discarded) = (0u64, 0u64, 0u64);

        for outcome in outcomes {
            total_requested += outcome.requested.len() as u64;
            total_skipped += outcome.num_skipped as u64;
            total_discarded += outcome.num_discarded as u64;

            let run_ids = run_ids_by_asset
                .get(outcome.evaluation.asset_key())
                .cloned()
                .unwrap_or_default();
            let evaluation = outcome.evaluation.with_run_ids(run_ids);

            let partitions_def = self.graph.partitions_def(evaluation.asset_key());
            let stored = cursor.latest_evaluation(evaluation.asset_key());
            let persist = match stored {
                Some(stored) => !evaluation.is_equivalent_to(stored, partitions_def),
                // A first-ever record with nothing to say adds no
                // information.
                None => !evaluation.entries().is_empty(),
            };
            if persist {
                to_persist.push(evaluation.clone());
            }
            evaluations.push(evaluation);
        }

        metrics::record_tick(
            num_assets,
            total_requested,
            total_skipped,
            total_discarded,
            run_requests.len() as u64,
        );
        metrics::record_persistence(
            to_persist.len() as u64,
            evaluations.len() as u64 - to_persist.len() as u64,
        );
        info!(
            assets = num_assets,
            requested = total_requested,
            skipped = total_skipped,
            discarded = total_discarded,
            run_requests = run_requests.len(),
            persisted = to_persist.len(),
            "tick complete"
        );

        let next_cursor = cursor.with_updates(watermark, evaluations.iter().cloned());
        Ok(TickOutcome {
            evaluations,
            to_persist,
            run_requests,
            cursor: next_cursor,
        })
    }

    /// Evaluates a single asset in isolation, with no upstream assets
    /// slated to materialize. Intended for debugging and ad-hoc inspection;
    /// the record it returns is not part of any tick.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::MissingPolicy`] if the asset has no
    /// materialize policy, or any collaborator error.
    pub fn evaluate_single_asset(
        &self,
        cursor: &Cursor,
        asset_key: &AssetKey,
    ) -> Result<AssetEvaluation> {
        let policy = self
            .graph
            .materialize_policy(asset_key)
            .ok_or_else(|| crate::error::Error::MissingPolicy {
                asset_key: asset_key.clone(),
            })?;
        let will_materialize = WillMaterializeMapping::new();
        let ctx = RuleEvaluationContext::new(
            asset_key.clone(),
            self.graph,
            self.queryer,
            self.freshness,
            &self.config,
            cursor,
            &will_materialize,
        )?;
        Ok(self.evaluate_asset(asset_key, policy, &ctx)?.evaluation)
    }

    fn evaluate_asset(
        &self,
        asset_key: &AssetKey,
        policy: &MaterializePolicy,
        ctx: &RuleEvaluationContext<'_>,
    ) -> Result<AssetStageOutcome> {
        let mut results_by_rule: Vec<(RuleEvaluation, BTreeSet<AssetPartition>)> = Vec::new();

        let mut to_materialize: BTreeSet<AssetPartition> = BTreeSet::new();
        for rule in policy.rules_with_decision(DecisionType::Materialize) {
            for (data, partitions) in rule.evaluate(ctx)? {
                to_materialize.extend(partitions.iter().cloned());
                results_by_rule.push((RuleEvaluation::new(rule.snapshot(), data), partitions));
            }
        }

        let skip_ctx = ctx.with_candidates(to_materialize.clone());
        let mut to_skip: BTreeSet<AssetPartition> = BTreeSet::new();
        for rule in policy.rules_with_decision(DecisionType::Skip) {
            for (data, partitions) in rule.evaluate(&skip_ctx)? {
                to_skip.extend(partitions.iter().cloned());
                results_by_rule.push((RuleEvaluation::new(rule.snapshot(), data), partitions));
            }
        }

        let discard_candidates: BTreeSet<AssetPartition> =
            to_materialize.difference(&to_skip).cloned().collect();
        let discard_ctx = ctx.with_candidates(discard_candidates.clone());
        let mut to_discard: BTreeSet<AssetPartition> = BTreeSet::new();
        for rule in policy.rules_with_decision(DecisionType::Discard) {
            for (data, partitions) in rule.evaluate(&discard_ctx)? {
                to_discard.extend(partitions.iter().cloned());
                results_by_rule.push((RuleEvaluation::new(rule.snapshot(), data), partitions));
            }
        }

        let requested: BTreeSet<AssetPartition> = discard_candidates
            .difference(&to_discard)
            .cloned()
            .collect();
        let num_skipped = to_skip.intersection(&to_materialize).count();
        let num_discarded = to_discard.len();

        let evaluation = AssetEvaluation::from_rule_results(
            asset_key.clone(),
            self.graph.partitions_def(asset_key),
            results_by_rule,
            policy.rule_snapshots(),
            requested.len(),
            num_skipped,
            num_discarded,
        )?;

        Ok(AssetStageOutcome {
            evaluation,
            requested,
            num_skipped,
            num_discarded,
        })
    }
}

fn build_run_requests(
    graph: &dyn AssetGraph,
    requested: &BTreeSet<AssetPartition>,
) -> Vec<RunRequest> {
    let mut grouped: BTreeMap<(Option<String>, Option<PartitionKey>), BTreeSet<AssetKey>> =
        BTreeMap::new();
    for partition in requested {
        let unit = graph.repository_unit(partition.asset_key());
        grouped
            .entry((unit, partition.partition_key().cloned()))
            .or_default()
            .insert(partition.asset_key().clone());
    }
    grouped
        .into_iter()
        .map(|((_, partition_key), asset_keys)| RunRequest {
            run_id: RunId::generate(),
            partition_key,
            asset_keys,
        })
        .collect()
}

fn run_ids_by_asset(run_requests: &[RunRequest]) -> BTreeMap<AssetKey, BTreeSet<RunId>> {
    let mut by_asset: BTreeMap<AssetKey, BTreeSet<RunId>> = BTreeMap::new();
    for request in run_requests {
        for asset_key in &request.asset_keys {
            by_asset
                .entry(asset_key.clone())
                .or_default()
                .insert(request.run_id);
        }
    }
    by_asset
}
