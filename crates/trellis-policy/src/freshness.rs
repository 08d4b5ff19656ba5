//! The freshness collaborator interface.
//!
//! Freshness-target computation (which materializations are needed to keep
//! this asset and its downstream consumers within their freshness targets)
//! lives outside this crate. The engine consumes it through
//! [`FreshnessResolver`] and treats the returned results as authoritative
//! firings of the freshness materialize rule.

use trellis_core::AssetKey;

use crate::context::WillMaterializeMapping;
use crate::error::Result;
use crate::rule::RuleEvaluationResults;

/// Resolves which asset partitions must materialize this tick to satisfy
/// freshness targets.
pub trait FreshnessResolver {
    /// Returns the freshness-driven firings for one asset.
    ///
    /// `will_materialize` carries the partitions upstream assets will
    /// materialize this tick, so the resolver can account for data that is
    /// about to become available.
    ///
    /// # Errors
    ///
    /// Returns an error if the freshness computation fails; the error aborts
    /// the tick.
    fn freshness_evaluation_results(
        &self,
        asset_key: &AssetKey,
        will_materialize: &WillMaterializeMapping,
    ) -> Result<RuleEvaluationResults>;
}

/// Resolver for deployments without freshness targets: nothing is ever
/// required for freshness.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFreshnessTargets;

impl FreshnessResolver for NoFreshnessTargets {
    fn freshness_evaluation_results(
        &self,
        _asset_key: &AssetKey,
        _will_materialize: &WillMaterializeMapping,
    ) -> Result<RuleEvaluationResults> {
        Ok(Vec::new())
    }
}
