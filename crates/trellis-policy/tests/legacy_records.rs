//! Decoding stored legacy records and upgrading them through a tick.

use serde_json::json;
use std::sync::Arc;

use trellis_core::AssetKey;
use trellis_policy::config::EvaluatorConfig;
use trellis_policy::cursor::{Cursor, StorageWatermark};
use trellis_policy::error::Error;
use trellis_policy::evaluation::AssetEvaluation;
use trellis_policy::pipeline::TickEvaluator;
use trellis_policy::rule::Rule;
use trellis_test_utils::{
    init_test_logging, AssetSpec, StaticFreshnessResolver, TestAssetGraph, TestInstanceQueryer,
};

fn legacy_skip_record(asset: &str) -> serde_json::Value {
    json!({
        "asset_key": asset,
        "entries": [
            {
                "evaluation": {"class": "ParentMaterializedAutoMaterializeCondition"},
                "subset": null
            },
            {
                "evaluation": {"class": "ParentOutdatedAutoMaterializeCondition"},
                "subset": null
            }
        ],
        "num_requested": 0,
        "num_skipped": 1,
        "num_discarded": 0
    })
}

#[test]
fn legacy_entries_decode_to_current_rule_identities() {
    let record = AssetEvaluation::decode(&legacy_skip_record("mart/enriched")).unwrap();
    assert_eq!(record.asset_key(), &AssetKey::new("mart/enriched"));
    assert_eq!(record.entries().len(), 2);
    assert_eq!(
        record.entries()[0].evaluation.rule_snapshot,
        Rule::MaterializeOnParentUpdated.snapshot()
    );
    assert_eq!(
        record.entries()[1].evaluation.rule_snapshot,
        Rule::SkipOnParentOutdated.snapshot()
    );
    // A record predating snapshot lists reconstructs them from its entries.
    assert_eq!(record.rule_snapshots().len(), 2);
}

#[test]
fn mixed_modern_and_legacy_entries_decode() {
    let value = json!({
        "asset_key": "mart/enriched",
        "entries": [
            {
                "evaluation": {"class": "MissingAutoMaterializeCondition"},
                "subset": null
            },
            {
                "evaluation": {
                    "rule_snapshot": Rule::SkipOnParentMissing.snapshot(),
                    "evaluation_data": null
                },
                "subset": null
            }
        ],
        "num_requested": 0,
        "num_skipped": 1,
        "num_discarded": 0
    });
    let record = AssetEvaluation::decode(&value).unwrap();
    assert_eq!(
        record.entries()[0].evaluation.rule_snapshot,
        Rule::MaterializeOnMissing.snapshot()
    );
    assert_eq!(
        record.entries()[1].evaluation.rule_snapshot,
        Rule::SkipOnParentMissing.snapshot()
    );
}

#[test]
fn unknown_legacy_class_fails_decode() {
    let value = json!({
        "asset_key": "mart/enriched",
        "entries": [
            {"evaluation": {"class": "NotARealCondition"}, "subset": null}
        ],
        "num_requested": 0,
        "num_skipped": 0,
        "num_discarded": 0
    });
    assert!(matches!(
        AssetEvaluation::decode(&value),
        Err(Error::UnknownLegacyRecord { class_name }) if class_name == "NotARealCondition"
    ));
}

/// A cursor seeded from a decoded legacy record drives a normal tick, and
/// the fresh record (never equivalent to the legacy one) rewrites it in the
/// current format.
#[test]
fn tick_upgrades_a_legacy_seeded_cursor() {
    init_test_logging();
    let graph = TestAssetGraph::builder()
        .asset(AssetSpec::new("raw/orders"))
        .asset(
            AssetSpec::new("mart/enriched")
                .with_parents(["raw/orders"])
                .eager(),
        )
        .build();
    let queryer = TestInstanceQueryer::new(Arc::clone(&graph));
    let freshness = StaticFreshnessResolver::new();
    let evaluator = TickEvaluator::new(&*graph, &queryer, &freshness, EvaluatorConfig::default());

    let watermark = queryer
        .record_materialization(trellis_core::AssetPartition::unpartitioned(AssetKey::new(
            "raw/orders",
        )));
    let legacy = AssetEvaluation::decode(&legacy_skip_record("mart/enriched")).unwrap();
    let cursor = Cursor::empty().with_updates(Some(watermark), [legacy]);

    let outcome = evaluator.evaluate_tick(&cursor).unwrap();

    let persisted = outcome
        .to_persist
        .iter()
        .find(|record| record.asset_key() == &AssetKey::new("mart/enriched"))
        .expect("legacy record must be rewritten");
    // The rewritten record carries the full snapshot list of the configured
    // policy, which the legacy record never had.
    assert_eq!(persisted.rule_snapshots().len(), 7);
    assert!(persisted
        .entries()
        .iter()
        .all(|entry| entry.evaluation.rule_snapshot.class_name.ends_with("Rule")));
    assert_eq!(outcome.cursor.evaluation_id(), 2);
}

#[test]
fn stored_watermark_raw_position_is_preserved() {
    // Watermarks round-trip as raw integers inside the cursor.
    let cursor = Cursor::empty().with_updates(Some(StorageWatermark::new(17)), []);
    let encoded = serde_json::to_value(&cursor).unwrap();
    assert_eq!(encoded["latest_storage_watermark"], json!(17));
    let decoded: Cursor = serde_json::from_value(encoded).unwrap();
    assert_eq!(
        decoded.latest_storage_watermark(),
        Some(StorageWatermark::new(17))
    );
}
