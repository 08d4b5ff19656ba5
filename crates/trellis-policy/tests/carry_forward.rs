//! Carry-forward and equivalence-gated persistence across ticks.

use std::sync::Arc;

use trellis_core::{AssetKey, AssetPartition};
use trellis_policy::config::EvaluatorConfig;
use trellis_policy::cursor::Cursor;
use trellis_policy::pipeline::TickEvaluator;
use trellis_policy::rule::{Rule, RuleEvaluationData};
use trellis_test_utils::{
    init_test_logging, AssetSpec, StaticFreshnessResolver, TestAssetGraph, TestInstanceQueryer,
};

/// A child blocked on one of two parents: the blocked state must survive
/// ticks verbatim without being re-persisted, then resolve the moment the
/// missing parent lands.
#[test]
fn blocked_child_carries_forward_until_the_parent_arrives() {
    init_test_logging();
    let graph = TestAssetGraph::builder()
        .asset(AssetSpec::new("raw/orders"))
        .asset(AssetSpec::new("raw/customers"))
        .asset(
            AssetSpec::new("mart/enriched")
                .with_parents(["raw/orders", "raw/customers"])
                .eager(),
        )
        .build();
    let queryer = TestInstanceQueryer::new(Arc::clone(&graph));
    let freshness = StaticFreshnessResolver::new();
    let evaluator = TickEvaluator::new(&*graph, &queryer, &freshness, EvaluatorConfig::default());

    let down = AssetKey::new("mart/enriched");
    queryer.record_materialization(AssetPartition::unpartitioned(AssetKey::new("raw/orders")));

    // Tick 1: the child becomes a candidate but waits on raw/customers.
    let tick1 = evaluator.evaluate_tick(&Cursor::empty()).unwrap();
    let record1 = tick1
        .evaluations
        .iter()
        .find(|evaluation| evaluation.asset_key() == &down)
        .unwrap()
        .clone();
    assert_eq!(record1.num_requested(), 0);
    assert_eq!(record1.num_skipped(), 1);
    assert!(tick1.to_persist.iter().any(|e| e.asset_key() == &down));
    assert!(tick1.run_requests.is_empty());

    // Tick 2: nothing changed. Every firing is carried forward and the
    // fresh record adds no information, so nothing is persisted.
    let tick2 = evaluator.evaluate_tick(&tick1.cursor).unwrap();
    let record2 = tick2
        .evaluations
        .iter()
        .find(|evaluation| evaluation.asset_key() == &down)
        .unwrap();
    assert_eq!(record2.entries(), record1.entries());
    assert_eq!(record2.num_skipped(), 1);
    assert!(tick2.to_persist.is_empty());
    assert!(tick2.run_requests.is_empty());
    // The cursor still advances.
    assert_eq!(tick2.cursor.evaluation_id(), 2);

    // Tick 3: the missing parent lands; the child is re-evaluated and
    // requested.
    queryer.record_materialization(AssetPartition::unpartitioned(AssetKey::new(
        "raw/customers",
    )));
    let tick3 = evaluator.evaluate_tick(&tick2.cursor).unwrap();
    let record3 = tick3
        .evaluations
        .iter()
        .find(|evaluation| evaluation.asset_key() == &down)
        .unwrap();
    assert_eq!(record3.num_requested(), 1);
    assert_eq!(record3.num_skipped(), 0);
    assert_eq!(tick3.run_requests.len(), 1);
    assert!(tick3.to_persist.iter().any(|e| e.asset_key() == &down));
    assert_eq!(record3.run_ids().len(), 1);
}

/// External staleness changes alone do not reopen a candidate that was
/// already evaluated: without a parent update, the skip rules leave the
/// carried state untouched and nothing is re-persisted.
#[test]
fn staleness_changes_alone_do_not_reopen_settled_candidates() {
    init_test_logging();
    let graph = TestAssetGraph::builder()
        .asset(AssetSpec::new("raw/orders"))
        .asset(AssetSpec::new("raw/customers"))
        .asset(
            AssetSpec::new("mart/enriched")
                .with_parents(["raw/orders", "raw/customers"])
                .eager(),
        )
        .build();
    let queryer = TestInstanceQueryer::new(Arc::clone(&graph));
    let freshness = StaticFreshnessResolver::new();
    let evaluator = TickEvaluator::new(&*graph, &queryer, &freshness, EvaluatorConfig::default());

    let down = AssetKey::new("mart/enriched");
    let orders = AssetPartition::unpartitioned(AssetKey::new("raw/orders"));
    queryer.record_materialization(orders.clone());

    let tick1 = evaluator.evaluate_tick(&Cursor::empty()).unwrap();
    let record1 = tick1
        .evaluations
        .iter()
        .find(|evaluation| evaluation.asset_key() == &down)
        .unwrap()
        .clone();
    assert_eq!(record1.num_skipped(), 1);

    // An ancestor turns stale between ticks, but no parent gained a record,
    // so the candidate is not re-examined.
    queryer.mark_outdated(orders, [AssetKey::new("raw/orders")]);

    let tick2 = evaluator.evaluate_tick(&tick1.cursor).unwrap();
    let record2 = tick2
        .evaluations
        .iter()
        .find(|evaluation| evaluation.asset_key() == &down)
        .unwrap();
    assert!(record2.entries().iter().all(|entry| {
        entry.evaluation.rule_snapshot != Rule::SkipOnParentOutdated.snapshot()
    }));
    assert_eq!(record2.entries(), record1.entries());
    assert!(tick2.to_persist.is_empty());
}

/// The carried parent-updated firing keeps naming the parent that updated,
/// even though the update is no longer "new" on the second tick.
#[test]
fn carried_firings_keep_their_evaluation_data() {
    init_test_logging();
    let graph = TestAssetGraph::builder()
        .asset(AssetSpec::new("raw/orders"))
        .asset(AssetSpec::new("raw/customers"))
        .asset(
            AssetSpec::new("mart/enriched")
                .with_parents(["raw/orders", "raw/customers"])
                .eager(),
        )
        .build();
    let queryer = TestInstanceQueryer::new(Arc::clone(&graph));
    let freshness = StaticFreshnessResolver::new();
    let evaluator = TickEvaluator::new(&*graph, &queryer, &freshness, EvaluatorConfig::default());

    queryer.record_materialization(AssetPartition::unpartitioned(AssetKey::new("raw/orders")));

    let tick1 = evaluator.evaluate_tick(&Cursor::empty()).unwrap();
    let tick2 = evaluator.evaluate_tick(&tick1.cursor).unwrap();

    let record2 = tick2
        .evaluations
        .iter()
        .find(|evaluation| evaluation.asset_key() == &AssetKey::new("mart/enriched"))
        .unwrap();
    let parent_updated: Vec<_> = record2
        .entries()
        .iter()
        .filter(|entry| {
            entry.evaluation.rule_snapshot == Rule::MaterializeOnParentUpdated.snapshot()
        })
        .collect();
    assert_eq!(parent_updated.len(), 1);
    assert_eq!(
        parent_updated[0].evaluation.evaluation_data,
        Some(RuleEvaluationData::ParentUpdated {
            updated_asset_keys: [AssetKey::new("raw/orders")].into_iter().collect(),
            will_update_asset_keys: std::collections::BTreeSet::new(),
        })
    );
}

/// Once a partition is requested, its carried state is spent: the next tick
/// must not re-request it from stale carry-forward data.
#[test]
fn requested_partitions_do_not_rerequest_from_carried_state() {
    init_test_logging();
    let graph = TestAssetGraph::builder()
        .asset(AssetSpec::new("raw/events").eager())
        .build();
    let queryer = TestInstanceQueryer::new(Arc::clone(&graph));
    let freshness = StaticFreshnessResolver::new();
    let evaluator = TickEvaluator::new(&*graph, &queryer, &freshness, EvaluatorConfig::default());

    let tick1 = evaluator.evaluate_tick(&Cursor::empty()).unwrap();
    assert_eq!(tick1.run_requests.len(), 1);

    // The run has not landed yet, but the previous record already requested
    // the partition.
    let tick2 = evaluator.evaluate_tick(&tick1.cursor).unwrap();
    let record2 = tick2
        .evaluations
        .iter()
        .find(|evaluation| evaluation.asset_key() == &AssetKey::new("raw/events"))
        .unwrap();
    assert_eq!(record2.num_requested(), 0);
    assert!(tick2.run_requests.is_empty());
}
