//! The persisted per-asset, per-tick evaluation record.
//!
//! An [`AssetEvaluation`] captures everything a tick decided about one
//! asset: which rules fired against which partitions (with their evaluation
//! data), and the requested/skipped/discarded counts. Records serve double
//! duty as the audit trail and as the previous-tick input for carry-forward,
//! so their serialized form is stable and legacy records remain decodable.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use trellis_core::{AssetKey, AssetPartition, PartitionsDefinition, RunId, SerializedPartitionsSubset};

use crate::error::{Error, Result};
use crate::legacy;
use crate::rule::{
    DecisionType, RuleEvaluation, RuleEvaluationResults, RuleSnapshot,
};

/// One rule firing paired with the partitions it applied to.
///
/// For unpartitioned assets the subset is `None` and the firing applies to
/// the asset's single unpartitioned partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationEntry {
    /// The rule firing.
    pub evaluation: RuleEvaluation,
    /// The partitions the firing applied to, or `None` for unpartitioned
    /// assets.
    pub subset: Option<SerializedPartitionsSubset>,
}

/// The persisted result of evaluating one asset on one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetEvaluation {
    asset_key: AssetKey,
    entries: Vec<EvaluationEntry>,
    num_requested: usize,
    num_skipped: usize,
    num_discarded: usize,
    rule_snapshots: BTreeSet<RuleSnapshot>,
    #[serde(default)]
    run_ids: BTreeSet<RunId>,
}

impl AssetEvaluation {
    /// Builds a record from per-rule firing results.
    ///
    /// `results_by_rule` holds every firing of the tick; partitioned subsets
    /// are serialized against `partitions_def`.
    ///
    /// # Errors
    ///
    /// Returns an error if a fired partition key is absent from the
    /// partitions definition, or if a partitioned firing arrives without one.
    pub fn from_rule_results(
        asset_key: AssetKey,
        partitions_def: Option<&PartitionsDefinition>,
        results_by_rule: Vec<(RuleEvaluation, BTreeSet<AssetPartition>)>,
        rule_snapshots: BTreeSet<RuleSnapshot>,
        num_requested: usize,
        num_skipped: usize,
        num_discarded: usize,
    ) -> Result<Self> {
        let mut entries = Vec::with_capacity(results_by_rule.len());
        for (evaluation, partitions) in results_by_rule {
            if partitions.is_empty() {
                continue;
            }
            let subset = match partitions_def {
                Some(def) => {
                    let keys: Vec<_> = partitions
                        .iter()
                        .map(|partition| {
                            partition.partition_key().cloned().ok_or_else(|| {
                                Error::internal(format!(
                                    "partitioned asset {asset_key} fired for an unpartitioned \
                                     candidate"
                                ))
                            })
                        })
                        .collect::<Result<_>>()?;
                    Some(def.serialize_subset(keys)?)
                }
                None => None,
            };
            entries.push(EvaluationEntry { evaluation, subset });
        }
        Ok(Self {
            asset_key,
            entries,
            num_requested,
            num_skipped,
            num_discarded,
            rule_snapshots,
            run_ids: BTreeSet::new(),
        })
    }

    /// The asset this record describes.
    #[must_use]
    pub fn asset_key(&self) -> &AssetKey {
        &self.asset_key
    }

    /// The per-rule firing entries.
    #[must_use]
    pub fn entries(&self) -> &[EvaluationEntry] {
        &self.entries
    }

    /// Number of partitions requested for materialization this tick.
    #[must_use]
    pub fn num_requested(&self) -> usize {
        self.num_requested
    }

    /// Number of candidate partitions skipped this tick.
    #[must_use]
    pub fn num_skipped(&self) -> usize {
        self.num_skipped
    }

    /// Number of candidate partitions discarded this tick.
    #[must_use]
    pub fn num_discarded(&self) -> usize {
        self.num_discarded
    }

    /// The identities of every rule configured for the asset this tick,
    /// whether or not it fired.
    #[must_use]
    pub fn rule_snapshots(&self) -> &BTreeSet<RuleSnapshot> {
        &self.rule_snapshots
    }

    /// The runs launched to satisfy this record's requests.
    #[must_use]
    pub fn run_ids(&self) -> &BTreeSet<RunId> {
        &self.run_ids
    }

    /// Attaches the launched run ids after run submission.
    #[must_use]
    pub fn with_run_ids(mut self, run_ids: BTreeSet<RunId>) -> Self {
        self.run_ids = run_ids;
        self
    }

    /// Decodes the firing entries into per-snapshot results against the
    /// asset's current partitions definition.
    ///
    /// Entries whose stored subset no longer matches the current
    /// partitioning scheme are dropped; a repartitioned asset starts its
    /// carry-forward history fresh.
    ///
    /// # Errors
    ///
    /// Returns an error if a decodable subset contains a partition key the
    /// current definition does not know.
    pub fn results_by_snapshot(
        &self,
        partitions_def: Option<&PartitionsDefinition>,
    ) -> Result<BTreeMap<RuleSnapshot, RuleEvaluationResults>> {
        let mut by_snapshot: BTreeMap<RuleSnapshot, RuleEvaluationResults> = BTreeMap::new();
        for entry in &self.entries {
            let Some(partitions) = self.entry_partitions(entry, partitions_def)? else {
                continue;
            };
            by_snapshot
                .entry(entry.evaluation.rule_snapshot.clone())
                .or_default()
                .push((entry.evaluation.evaluation_data.clone(), partitions));
        }
        Ok(by_snapshot)
    }

    /// The partitions this record requested or discarded: the union of
    /// materialize-rule firings minus the union of skip-rule firings.
    ///
    /// # Errors
    ///
    /// Returns an error if a decodable subset contains an unknown partition
    /// key.
    pub fn requested_or_discarded_partitions(
        &self,
        partitions_def: Option<&PartitionsDefinition>,
    ) -> Result<BTreeSet<AssetPartition>> {
        let mut materialized = BTreeSet::new();
        let mut skipped = BTreeSet::new();
        for entry in &self.entries {
            let Some(partitions) = self.entry_partitions(entry, partitions_def)? else {
                continue;
            };
            match entry.evaluation.rule_snapshot.decision_type {
                DecisionType::Materialize => materialized.extend(partitions),
                DecisionType::Skip => skipped.extend(partitions),
                DecisionType::Discard => {}
            }
        }
        Ok(materialized.difference(&skipped).cloned().collect())
    }

    /// The partitions this record evaluated: the union of materialize-rule
    /// firings. A skip or discard firing never names a partition without at
    /// least one materialize firing for it, so this covers every decision
    /// the record made.
    ///
    /// # Errors
    ///
    /// Returns an error if a decodable subset contains an unknown partition
    /// key.
    pub fn evaluated_partitions(
        &self,
        partitions_def: Option<&PartitionsDefinition>,
    ) -> Result<BTreeSet<AssetPartition>> {
        let mut evaluated = BTreeSet::new();
        for entry in &self.entries {
            if entry.evaluation.rule_snapshot.decision_type != DecisionType::Materialize {
                continue;
            }
            let Some(partitions) = self.entry_partitions(entry, partitions_def)? else {
                continue;
            };
            evaluated.extend(partitions);
        }
        Ok(evaluated)
    }

    fn entry_partitions(
        &self,
        entry: &EvaluationEntry,
        partitions_def: Option<&PartitionsDefinition>,
    ) -> Result<Option<BTreeSet<AssetPartition>>> {
        match (&entry.subset, partitions_def) {
            (None, None) => Ok(Some(
                std::iter::once(AssetPartition::unpartitioned(self.asset_key.clone())).collect(),
            )),
            (Some(subset), Some(def)) => {
                if !subset.can_deserialize(def) {
                    return Ok(None);
                }
                let keys = subset.deserialize(def)?;
                Ok(Some(
                    keys.into_iter()
                        .map(|key| AssetPartition::new(self.asset_key.clone(), key))
                        .collect(),
                ))
            }
            // Partitioning scheme changed shape entirely since the record
            // was stored.
            _ => Ok(None),
        }
    }

    /// Returns true if persisting this record would add no information over
    /// the stored one.
    ///
    /// A record that requested or discarded anything is never equivalent
    /// (its run ids are new information). Otherwise entries are compared as
    /// decoded partition sets, so two records whose subsets serialize the
    /// same partitions in different orders still compare equal. A stored
    /// subset that no longer decodes against the current partitioning makes
    /// the records non-equivalent.
    #[must_use]
    pub fn is_equivalent_to(
        &self,
        stored: &AssetEvaluation,
        partitions_def: Option<&PartitionsDefinition>,
    ) -> bool {
        if self.num_requested > 0 || self.num_discarded > 0 {
            return false;
        }
        if stored.num_requested > 0 || stored.num_discarded > 0 {
            return false;
        }
        if self.asset_key != stored.asset_key
            || self.num_skipped != stored.num_skipped
            || self.rule_snapshots != stored.rule_snapshots
        {
            return false;
        }

        // Fast path: byte-identical serialized entries.
        let serialized_self = serde_json::to_string(&self.entries);
        let serialized_stored = serde_json::to_string(&stored.entries);
        if let (Ok(a), Ok(b)) = (serialized_self, serialized_stored) {
            if a == b {
                return true;
            }
        }

        // Fallback: compare decoded firings, tolerating subset encoding
        // differences.
        match (
            self.results_by_snapshot(partitions_def),
            stored.results_by_snapshot(partitions_def),
        ) {
            (Ok(mine), Ok(theirs)) => {
                normalize_results(&mine) == normalize_results(&theirs)
                    && decoded_entry_count(&mine) == self.entries.len()
                    && decoded_entry_count(&theirs) == stored.entries.len()
            }
            _ => false,
        }
    }

    /// Decodes a persisted record, accepting both the current format and
    /// legacy condition-class records.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownLegacyRecord`] for a legacy entry naming an
    /// unknown condition class, and a serialization error for records that
    /// match neither format.
    pub fn decode(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| Error::serialization("evaluation record is not an object"))?;

        let asset_key: AssetKey = field(object, "asset_key")?;
        let num_requested: usize = field(object, "num_requested")?;
        let num_skipped: usize = field(object, "num_skipped")?;
        let num_discarded: usize = field(object, "num_discarded")?;
        let run_ids: BTreeSet<RunId> = match object.get("run_ids") {
            Some(value) => from_value(value, "run_ids")?,
            None => BTreeSet::new(),
        };

        let raw_entries = object
            .get("entries")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::serialization("evaluation record has no entries array"))?;

        let mut entries = Vec::with_capacity(raw_entries.len());
        for raw in raw_entries {
            let entry_object = raw
                .as_object()
                .ok_or_else(|| Error::serialization("evaluation entry is not an object"))?;
            let raw_evaluation = entry_object
                .get("evaluation")
                .ok_or_else(|| Error::serialization("evaluation entry has no evaluation"))?;

            let evaluation = if raw_evaluation.get("class").is_some() {
                legacy::decode_legacy_evaluation(raw_evaluation)?
            } else {
                from_value(raw_evaluation, "evaluation")?
            };
            let subset: Option<SerializedPartitionsSubset> = match entry_object.get("subset") {
                None | Some(Value::Null) => None,
                Some(value) => Some(from_value(value, "subset")?),
            };
            entries.push(EvaluationEntry { evaluation, subset });
        }

        // Legacy records carry no snapshot list; reconstruct it from the
        // entries that fired.
        let rule_snapshots: BTreeSet<RuleSnapshot> = match object.get("rule_snapshots") {
            Some(value) => from_value(value, "rule_snapshots")?,
            None => entries
                .iter()
                .map(|entry| entry.evaluation.rule_snapshot.clone())
                .collect(),
        };

        Ok(Self {
            asset_key,
            entries,
            num_requested,
            num_skipped,
            num_discarded,
            rule_snapshots,
            run_ids,
        })
    }
}

fn field<T: serde::de::DeserializeOwned>(
    object: &serde_json::Map<String, Value>,
    name: &str,
) -> Result<T> {
    let value = object
        .get(name)
        .ok_or_else(|| Error::serialization(format!("evaluation record is missing {name}")))?;
    from_value(value, name)
}

fn from_value<T: serde::de::DeserializeOwned>(value: &Value, name: &str) -> Result<T> {
    serde_json::from_value(value.clone())
        .map_err(|err| Error::serialization(format!("invalid {name}: {err}")))
}

type NormalizedResults = BTreeMap<
    (RuleSnapshot, Option<crate::rule::RuleEvaluationData>),
    BTreeSet<AssetPartition>,
>;

fn normalize_results(results: &BTreeMap<RuleSnapshot, RuleEvaluationResults>) -> NormalizedResults {
    let mut normalized: NormalizedResults = BTreeMap::new();
    for (snapshot, firings) in results {
        for (data, partitions) in firings {
            normalized
                .entry((snapshot.clone(), data.clone()))
                .or_default()
                .extend(partitions.iter().cloned());
        }
    }
    normalized
}

fn decoded_entry_count(results: &BTreeMap<RuleSnapshot, RuleEvaluationResults>) -> usize {
    results.values().map(Vec::len).sum()
}
