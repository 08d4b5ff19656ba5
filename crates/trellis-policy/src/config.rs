//! Configuration for the tick evaluator.

use serde::{Deserialize, Serialize};

/// Tunables for one evaluator instance.
///
/// All fields have defaults, so a partial config file deserializes cleanly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// When true, parent-update detection compares data versions rather than
    /// treating every re-materialization as an update.
    pub respect_materialization_data_versions: bool,

    /// Upper bound on the combined parent-partition count for which the
    /// precise (data-version-aware) update check is used. Beyond this bound
    /// the cheaper record-existence check applies.
    pub max_precise_parent_partition_checks: usize,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            respect_materialization_data_versions: true,
            max_precise_parent_partition_checks: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_precise() {
        let config = EvaluatorConfig::default();
        assert!(config.respect_materialization_data_versions);
        assert_eq!(config.max_precise_parent_partition_checks, 100);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: EvaluatorConfig =
            serde_json::from_str(r#"{"respect_materialization_data_versions": false}"#).unwrap();
        assert!(!config.respect_materialization_data_versions);
        assert_eq!(config.max_precise_parent_partition_checks, 100);
    }
}
