//! Decoding for legacy condition-class evaluation records.
//!
//! Early versions persisted firings as "condition" objects tagged with a
//! `class` field instead of a rule snapshot. Stored records never expire,
//! so those classes stay decodable: each maps onto the identity of the rule
//! that replaced it, reconstructing the payload where the legacy shape
//! carried one. An unknown class is a hard decode failure, not a silent
//! skip — dropping an unrecognized firing would corrupt carry-forward.

use serde_json::Value;
use std::collections::BTreeSet;

use trellis_core::AssetKey;

use crate::error::{Error, Result};
use crate::rule::{Rule, RuleEvaluation, RuleEvaluationData};

/// Decodes a legacy condition object into a rule firing.
///
/// Both freshness classes collapse onto the one freshness rule. The
/// max-materializations class carried no limit, so it decodes with the
/// historical default of 1. Key-set payloads absent from the legacy object
/// reconstruct as empty sets.
///
/// # Errors
///
/// Returns [`Error::UnknownLegacyRecord`] for an unrecognized class and a
/// serialization error if the object carries no string `class` field.
pub(crate) fn decode_legacy_evaluation(value: &Value) -> Result<RuleEvaluation> {
    let class_name = value
        .get("class")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::serialization("legacy condition has no class field"))?;

    let (rule, data) = match class_name {
        "FreshnessAutoMaterializeCondition" | "DownstreamFreshnessAutoMaterializeCondition" => {
            (Rule::MaterializeOnRequiredForFreshness, None)
        }
        "MissingAutoMaterializeCondition" => (Rule::MaterializeOnMissing, None),
        "ParentMaterializedAutoMaterializeCondition" => (
            Rule::MaterializeOnParentUpdated,
            Some(RuleEvaluationData::ParentUpdated {
                updated_asset_keys: key_set(value, "updated_asset_keys")?,
                will_update_asset_keys: key_set(value, "will_update_asset_keys")?,
            }),
        ),
        "ParentOutdatedAutoMaterializeCondition" => (
            Rule::SkipOnParentOutdated,
            Some(RuleEvaluationData::WaitingOnAssets {
                waiting_on_asset_keys: key_set(value, "waiting_on_asset_keys")?,
            }),
        ),
        "MaxMaterializationsExceededAutoMaterializeCondition" => {
            (Rule::DiscardOnMaxMaterializationsExceeded { limit: 1 }, None)
        }
        _ => {
            return Err(Error::UnknownLegacyRecord {
                class_name: class_name.to_string(),
            })
        }
    };
    Ok(RuleEvaluation::new(rule.snapshot(), data))
}

fn key_set(value: &Value, field: &str) -> Result<BTreeSet<AssetKey>> {
    match value.get(field) {
        None | Some(Value::Null) => Ok(BTreeSet::new()),
        Some(raw) => serde_json::from_value(raw.clone())
            .map_err(|err| Error::serialization(format!("invalid legacy {field}: {err}"))),
    }
}
