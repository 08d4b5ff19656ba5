//! Per-asset materialization policies.
//!
//! A [`MaterializePolicy`] is the set of rules evaluated for one asset each
//! tick. The two presets mirror the common operating modes: eager assets
//! chase upstream changes, lazy assets materialize only when freshness
//! demands it. Both carry the full complement of skip rules.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::rule::{DecisionType, Rule, RuleSnapshot};

/// The set of decision rules configured for one asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializePolicy {
    rules: BTreeSet<Rule>,
}

impl MaterializePolicy {
    /// Creates a policy from an explicit rule set.
    #[must_use]
    pub fn new(rules: impl IntoIterator<Item = Rule>) -> Self {
        Self {
            rules: rules.into_iter().collect(),
        }
    }

    /// The eager preset: materialize when missing, when parents update, or
    /// when required for freshness, holding back while upstream data is
    /// absent, stale, or backfilling.
    ///
    /// `max_materializations_per_tick` adds a discard budget; `None` means
    /// unbounded.
    #[must_use]
    pub fn eager(max_materializations_per_tick: Option<usize>) -> Self {
        let mut policy = Self::new([
            Rule::MaterializeOnMissing,
            Rule::MaterializeOnParentUpdated,
            Rule::MaterializeOnRequiredForFreshness,
            Rule::SkipOnParentOutdated,
            Rule::SkipOnParentMissing,
            Rule::SkipOnRequiredButNonexistentParents,
            Rule::SkipOnBackfillInProgress {
                all_partitions: false,
            },
        ]);
        if let Some(limit) = max_materializations_per_tick {
            policy
                .rules
                .insert(Rule::DiscardOnMaxMaterializationsExceeded { limit });
        }
        policy
    }

    /// The lazy preset: materialize only when required for freshness.
    #[must_use]
    pub fn lazy(max_materializations_per_tick: Option<usize>) -> Self {
        let mut policy = Self::new([
            Rule::MaterializeOnRequiredForFreshness,
            Rule::SkipOnParentOutdated,
            Rule::SkipOnParentMissing,
            Rule::SkipOnRequiredButNonexistentParents,
            Rule::SkipOnBackfillInProgress {
                all_partitions: false,
            },
        ]);
        if let Some(limit) = max_materializations_per_tick {
            policy
                .rules
                .insert(Rule::DiscardOnMaxMaterializationsExceeded { limit });
        }
        policy
    }

    /// Returns a copy with the given rules added.
    #[must_use]
    pub fn with_rules(mut self, rules: impl IntoIterator<Item = Rule>) -> Self {
        self.rules.extend(rules);
        self
    }

    /// Returns a copy with the given rules removed.
    #[must_use]
    pub fn without_rules(mut self, rules: impl IntoIterator<Item = Rule>) -> Self {
        for rule in rules {
            self.rules.remove(&rule);
        }
        self
    }

    /// The configured rules.
    #[must_use]
    pub fn rules(&self) -> &BTreeSet<Rule> {
        &self.rules
    }

    /// The configured rules producing the given decision kind, in stable
    /// order.
    #[must_use]
    pub fn rules_with_decision(&self, decision_type: DecisionType) -> Vec<&Rule> {
        self.rules
            .iter()
            .filter(|rule| rule.decision_type() == decision_type)
            .collect()
    }

    /// The identities of every configured rule.
    #[must_use]
    pub fn rule_snapshots(&self) -> BTreeSet<RuleSnapshot> {
        self.rules.iter().map(Rule::snapshot).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eager_preset_materializes_on_missing_updated_and_freshness() {
        let policy = MaterializePolicy::eager(None);
        let materialize = policy.rules_with_decision(DecisionType::Materialize);
        assert_eq!(
            materialize,
            vec![
                &Rule::MaterializeOnRequiredForFreshness,
                &Rule::MaterializeOnParentUpdated,
                &Rule::MaterializeOnMissing,
            ]
        );
        assert!(policy.rules_with_decision(DecisionType::Discard).is_empty());
    }

    #[test]
    fn lazy_preset_materializes_only_for_freshness() {
        let policy = MaterializePolicy::lazy(Some(2));
        assert_eq!(
            policy.rules_with_decision(DecisionType::Materialize),
            vec![&Rule::MaterializeOnRequiredForFreshness]
        );
        assert_eq!(
            policy.rules_with_decision(DecisionType::Discard),
            vec![&Rule::DiscardOnMaxMaterializationsExceeded { limit: 2 }]
        );
    }

    #[test]
    fn rule_set_deduplicates() {
        let policy = MaterializePolicy::eager(None)
            .with_rules([Rule::MaterializeOnMissing, Rule::MaterializeOnMissing]);
        assert_eq!(policy.rules().len(), 7);
    }

    #[test]
    fn without_rules_removes_by_configuration() {
        let policy = MaterializePolicy::eager(Some(5))
            .without_rules([Rule::DiscardOnMaxMaterializationsExceeded { limit: 5 }]);
        assert!(policy.rules_with_decision(DecisionType::Discard).is_empty());
    }
}
