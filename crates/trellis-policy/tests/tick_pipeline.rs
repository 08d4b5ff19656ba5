//! End-to-end tick scenarios over small asset graphs.

use std::collections::BTreeSet;
use std::sync::Arc;

use trellis_core::{AssetKey, AssetPartition, PartitionKey, PartitionsDefinition};
use trellis_policy::config::EvaluatorConfig;
use trellis_policy::cursor::Cursor;
use trellis_policy::evaluation::AssetEvaluation;
use trellis_policy::pipeline::{TickEvaluator, TickOutcome};
use trellis_policy::policy::MaterializePolicy;
use trellis_policy::graph::PartitionMappingKind;
use trellis_policy::query::BackfillSubset;
use trellis_policy::rule::{Rule, RuleEvaluationData};
use trellis_test_utils::{
    init_test_logging, AssetSpec, StaticFreshnessResolver, TestAssetGraph, TestInstanceQueryer,
};

fn evaluation<'a>(outcome: &'a TickOutcome, asset: &str) -> &'a AssetEvaluation {
    outcome
        .evaluations
        .iter()
        .find(|evaluation| evaluation.asset_key() == &AssetKey::new(asset))
        .unwrap_or_else(|| panic!("no evaluation for {asset}"))
}

fn fired_data(evaluation: &AssetEvaluation, rule: &Rule) -> Vec<Option<RuleEvaluationData>> {
    evaluation
        .entries()
        .iter()
        .filter(|entry| entry.evaluation.rule_snapshot == rule.snapshot())
        .map(|entry| entry.evaluation.evaluation_data.clone())
        .collect()
}

#[test]
fn missing_unpartitioned_root_is_requested() {
    init_test_logging();
    let graph = TestAssetGraph::builder()
        .asset(AssetSpec::new("raw/events").eager())
        .build();
    let queryer = TestInstanceQueryer::new(Arc::clone(&graph));
    let freshness = StaticFreshnessResolver::new();
    let evaluator = TickEvaluator::new(&*graph, &queryer, &freshness, EvaluatorConfig::default());

    let outcome = evaluator.evaluate_tick(&Cursor::empty()).unwrap();

    let record = evaluation(&outcome, "raw/events");
    assert_eq!(record.num_requested(), 1);
    assert_eq!(record.num_skipped(), 0);
    assert_eq!(fired_data(record, &Rule::MaterializeOnMissing), vec![None]);

    assert_eq!(outcome.run_requests.len(), 1);
    assert_eq!(outcome.run_requests[0].partition_key(), None);
    assert!(outcome.to_persist.iter().any(|persisted| {
        persisted.asset_key() == &AssetKey::new("raw/events")
    }));
    assert_eq!(outcome.cursor.evaluation_id(), 1);
}

#[test]
fn child_joins_the_run_of_a_parent_materializing_this_tick() {
    init_test_logging();
    let graph = TestAssetGraph::builder()
        .asset(AssetSpec::new("raw/events").eager())
        .asset(AssetSpec::new("staging/events").with_parents(["raw/events"]).eager())
        .build();
    let queryer = TestInstanceQueryer::new(Arc::clone(&graph));
    let freshness = StaticFreshnessResolver::new();
    let evaluator = TickEvaluator::new(&*graph, &queryer, &freshness, EvaluatorConfig::default());

    let outcome = evaluator.evaluate_tick(&Cursor::empty()).unwrap();

    let child = evaluation(&outcome, "staging/events");
    assert_eq!(child.num_requested(), 1);
    assert_eq!(
        fired_data(child, &Rule::MaterializeOnParentUpdated),
        vec![Some(RuleEvaluationData::ParentUpdated {
            updated_asset_keys: BTreeSet::new(),
            will_update_asset_keys: [AssetKey::new("raw/events")].into_iter().collect(),
        })]
    );

    // Parent and child share one run.
    assert_eq!(outcome.run_requests.len(), 1);
    let expected: BTreeSet<AssetKey> = ["raw/events", "staging/events"]
        .into_iter()
        .map(AssetKey::new)
        .collect();
    assert_eq!(outcome.run_requests[0].asset_keys(), &expected);
    let parent_runs = evaluation(&outcome, "raw/events").run_ids();
    assert_eq!(parent_runs, child.run_ids());
    assert_eq!(parent_runs.len(), 1);
}

#[test]
fn unpartitioned_child_of_a_partitioned_parent_cannot_join_its_run() {
    init_test_logging();
    let def = PartitionsDefinition::new(["p1"].map(PartitionKey::new)).unwrap();
    let graph = TestAssetGraph::builder()
        .asset(AssetSpec::new("raw/daily").with_partitions(def).eager())
        .asset(
            AssetSpec::new("mart/summary")
                .with_parents(["raw/daily"])
                .eager(),
        )
        .build();
    let queryer = TestInstanceQueryer::new(Arc::clone(&graph));
    let freshness = StaticFreshnessResolver::new();
    let evaluator = TickEvaluator::new(&*graph, &queryer, &freshness, EvaluatorConfig::default());

    let outcome = evaluator.evaluate_tick(&Cursor::empty()).unwrap();

    // The partitioning schemes differ, so the child cannot ride along with
    // the parent's missing-partition run, and with no parent data yet it
    // must not launch a run of its own either.
    assert_eq!(outcome.run_requests.len(), 1);
    assert_eq!(
        outcome.run_requests[0].partition_key(),
        Some(&PartitionKey::new("p1"))
    );
    let expected: BTreeSet<AssetKey> = [AssetKey::new("raw/daily")].into_iter().collect();
    assert_eq!(outcome.run_requests[0].asset_keys(), &expected);
    let child = evaluation(&outcome, "mart/summary");
    assert_eq!(child.num_requested(), 0);
    assert!(child.entries().is_empty());
}

#[test]
fn custom_mappings_never_share_a_run() {
    init_test_logging();
    let def = PartitionsDefinition::new(["p1"].map(PartitionKey::new)).unwrap();
    let graph = TestAssetGraph::builder()
        .asset(AssetSpec::new("raw/daily").with_partitions(def.clone()).eager())
        .asset(
            AssetSpec::new("mart/fanin")
                .with_parents(["raw/daily"])
                .with_partitions(def)
                .eager(),
        )
        .mapping("mart/fanin", "raw/daily", PartitionMappingKind::Custom)
        .build();
    let queryer = TestInstanceQueryer::new(Arc::clone(&graph));
    let freshness = StaticFreshnessResolver::new();
    let evaluator = TickEvaluator::new(&*graph, &queryer, &freshness, EvaluatorConfig::default());

    let outcome = evaluator.evaluate_tick(&Cursor::empty()).unwrap();

    // Identically partitioned, but the custom mapping keeps the child out of
    // the parent's run.
    assert_eq!(outcome.run_requests.len(), 1);
    let expected: BTreeSet<AssetKey> = [AssetKey::new("raw/daily")].into_iter().collect();
    assert_eq!(outcome.run_requests[0].asset_keys(), &expected);
    assert_eq!(evaluation(&outcome, "mart/fanin").num_requested(), 0);
}

#[test]
fn child_waits_while_a_parent_has_no_data() {
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

    // One parent has data, the other never materialized.
    queryer.record_materialization(AssetPartition::unpartitioned(AssetKey::new("raw/orders")));

    let outcome = evaluator.evaluate_tick(&Cursor::empty()).unwrap();

    let child = evaluation(&outcome, "mart/enriched");
    assert_eq!(child.num_requested(), 0);
    assert_eq!(child.num_skipped(), 1);
    assert_eq!(
        fired_data(child, &Rule::SkipOnParentMissing),
        vec![Some(RuleEvaluationData::WaitingOnAssets {
            waiting_on_asset_keys: [AssetKey::new("raw/customers")].into_iter().collect(),
        })]
    );
    assert!(outcome.run_requests.is_empty());
}

#[test]
fn non_observable_source_parents_are_never_waited_on() {
    init_test_logging();
    let graph = TestAssetGraph::builder()
        .asset(AssetSpec::new("ext/feed").source())
        .asset(AssetSpec::new("raw/ingest").with_parents(["ext/feed"]).eager())
        .build();
    let queryer = TestInstanceQueryer::new(Arc::clone(&graph));
    let freshness = StaticFreshnessResolver::new();
    let evaluator = TickEvaluator::new(&*graph, &queryer, &freshness, EvaluatorConfig::default());

    let outcome = evaluator.evaluate_tick(&Cursor::empty()).unwrap();

    // The source has no policy and is not materializable, so the child is a
    // root for decision purposes and its missing partition is requested.
    let child = evaluation(&outcome, "raw/ingest");
    assert_eq!(child.num_requested(), 1);
    assert!(fired_data(child, &Rule::SkipOnParentMissing).is_empty());
}

#[test]
fn discard_budget_keeps_the_latest_partitions() {
    init_test_logging();
    let keys: Vec<PartitionKey> = (0..10).map(|i| PartitionKey::new(format!("2025-01-{:02}", i + 1))).collect();
    let def = PartitionsDefinition::new(keys.clone()).unwrap();
    let graph = TestAssetGraph::builder()
        .asset(
            AssetSpec::new("mart/daily")
                .with_partitions(def)
                .with_policy(MaterializePolicy::eager(Some(3))),
        )
        .build();
    let queryer = TestInstanceQueryer::new(Arc::clone(&graph));
    let freshness = StaticFreshnessResolver::new();
    let evaluator = TickEvaluator::new(&*graph, &queryer, &freshness, EvaluatorConfig::default());

    let outcome = evaluator.evaluate_tick(&Cursor::empty()).unwrap();

    let record = evaluation(&outcome, "mart/daily");
    assert_eq!(record.num_requested(), 3);
    assert_eq!(record.num_discarded(), 7);

    // One run per surviving partition key, and only the newest keys survive.
    let requested_keys: BTreeSet<&PartitionKey> = outcome
        .run_requests
        .iter()
        .filter_map(|request| request.partition_key())
        .collect();
    assert_eq!(
        requested_keys,
        keys.iter().rev().take(3).collect::<BTreeSet<_>>()
    );
}

#[test]
fn exact_backfill_mode_skips_only_targeted_partitions() {
    init_test_logging();
    let def = PartitionsDefinition::new(["p1", "p2"].map(PartitionKey::new)).unwrap();
    let graph = TestAssetGraph::builder()
        .asset(AssetSpec::new("mart/daily").with_partitions(def).eager())
        .build();
    let queryer = TestInstanceQueryer::new(Arc::clone(&graph));
    let freshness = StaticFreshnessResolver::new();
    let evaluator = TickEvaluator::new(&*graph, &queryer, &freshness, EvaluatorConfig::default());

    let backfill: BackfillSubset =
        [AssetPartition::new(AssetKey::new("mart/daily"), "p1".into())]
            .into_iter()
            .collect();
    queryer.set_backfill(backfill);

    let outcome = evaluator.evaluate_tick(&Cursor::empty()).unwrap();

    let record = evaluation(&outcome, "mart/daily");
    assert_eq!(record.num_requested(), 1);
    assert_eq!(record.num_skipped(), 1);
    assert_eq!(outcome.run_requests.len(), 1);
    assert_eq!(
        outcome.run_requests[0].partition_key(),
        Some(&PartitionKey::new("p2"))
    );
}

#[test]
fn whole_asset_backfill_mode_skips_every_partition() {
    init_test_logging();
    let def = PartitionsDefinition::new(["p1", "p2"].map(PartitionKey::new)).unwrap();
    let policy = MaterializePolicy::eager(None)
        .without_rules([Rule::SkipOnBackfillInProgress {
            all_partitions: false,
        }])
        .with_rules([Rule::SkipOnBackfillInProgress {
            all_partitions: true,
        }]);
    let graph = TestAssetGraph::builder()
        .asset(
            AssetSpec::new("mart/daily")
                .with_partitions(def)
                .with_policy(policy),
        )
        .build();
    let queryer = TestInstanceQueryer::new(Arc::clone(&graph));
    let freshness = StaticFreshnessResolver::new();
    let evaluator = TickEvaluator::new(&*graph, &queryer, &freshness, EvaluatorConfig::default());

    let backfill: BackfillSubset =
        [AssetPartition::new(AssetKey::new("mart/daily"), "p1".into())]
            .into_iter()
            .collect();
    queryer.set_backfill(backfill);

    let outcome = evaluator.evaluate_tick(&Cursor::empty()).unwrap();

    let record = evaluation(&outcome, "mart/daily");
    assert_eq!(record.num_requested(), 0);
    assert_eq!(record.num_skipped(), 2);
    assert!(outcome.run_requests.is_empty());
}

#[test]
fn reevaluating_the_same_tick_is_deterministic() {
    init_test_logging();
    let graph = TestAssetGraph::builder()
        .asset(AssetSpec::new("raw/events").eager())
        .asset(AssetSpec::new("staging/events").with_parents(["raw/events"]).eager())
        .build();
    let queryer = TestInstanceQueryer::new(Arc::clone(&graph));
    let freshness = StaticFreshnessResolver::new();
    let evaluator = TickEvaluator::new(&*graph, &queryer, &freshness, EvaluatorConfig::default());

    let first = evaluator.evaluate_tick(&Cursor::empty()).unwrap();
    let second = evaluator.evaluate_tick(&Cursor::empty()).unwrap();

    // Run ids are freshly generated, but every decision matches.
    for (a, b) in first.evaluations.iter().zip(&second.evaluations) {
        assert_eq!(a.asset_key(), b.asset_key());
        assert_eq!(a.entries(), b.entries());
        assert_eq!(a.num_requested(), b.num_requested());
        assert_eq!(a.num_skipped(), b.num_skipped());
        assert_eq!(a.num_discarded(), b.num_discarded());
    }
    assert_eq!(first.run_requests.len(), second.run_requests.len());
}

#[test]
fn assets_in_different_units_get_separate_runs() {
    init_test_logging();
    let graph = TestAssetGraph::builder()
        .asset(AssetSpec::new("raw/events").eager().in_unit("ingest"))
        .asset(
            AssetSpec::new("mart/summary")
                .with_parents(["raw/events"])
                .eager()
                .in_unit("analytics"),
        )
        .build();
    let queryer = TestInstanceQueryer::new(Arc::clone(&graph));
    let freshness = StaticFreshnessResolver::new();
    let evaluator = TickEvaluator::new(&*graph, &queryer, &freshness, EvaluatorConfig::default());

    let outcome = evaluator.evaluate_tick(&Cursor::empty()).unwrap();

    // The child cannot join the parent's run across units: it never becomes
    // a candidate this tick and waits for the parent's record to land.
    assert_eq!(outcome.run_requests.len(), 1);
    let expected: BTreeSet<AssetKey> = [AssetKey::new("raw/events")].into_iter().collect();
    assert_eq!(outcome.run_requests[0].asset_keys(), &expected);
    let child = evaluation(&outcome, "mart/summary");
    assert_eq!(child.num_requested(), 0);
    assert!(child.entries().is_empty());
}
