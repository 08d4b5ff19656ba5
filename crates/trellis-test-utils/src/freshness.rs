//! Canned freshness answers for tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use trellis_core::AssetKey;
use trellis_policy::context::WillMaterializeMapping;
use trellis_policy::error::Result;
use trellis_policy::freshness::FreshnessResolver;
use trellis_policy::rule::RuleEvaluationResults;

/// A [`FreshnessResolver`] that returns pre-scripted firings per asset.
#[derive(Default)]
pub struct StaticFreshnessResolver {
    results: Mutex<BTreeMap<AssetKey, RuleEvaluationResults>>,
}

impl StaticFreshnessResolver {
    /// Creates a resolver with no freshness requirements.
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the firings returned for an asset.
    pub fn set_results(&self, asset_key: impl Into<AssetKey>, results: RuleEvaluationResults) {
        self.results
            .lock()
            .expect("resolver lock")
            .insert(asset_key.into(), results);
    }
}

impl FreshnessResolver for StaticFreshnessResolver {
    fn freshness_evaluation_results(
        &self,
        asset_key: &AssetKey,
        _will_materialize: &WillMaterializeMapping,
    ) -> Result<RuleEvaluationResults> {
        Ok(self
            .results
            .lock()
            .expect("resolver lock")
            .get(asset_key)
            .cloned()
            .unwrap_or_default())
    }
}
