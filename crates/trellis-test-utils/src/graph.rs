//! In-memory asset graph for tests.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use trellis_core::{AssetKey, AssetPartition, PartitionsDefinition};
use trellis_policy::graph::{AssetGraph, ParentPartitions, PartitionMappingKind};
use trellis_policy::policy::MaterializePolicy;

/// Declarative description of one test asset.
#[derive(Debug, Clone)]
pub struct AssetSpec {
    key: AssetKey,
    parents: Vec<AssetKey>,
    partitions: Option<PartitionsDefinition>,
    policy: Option<MaterializePolicy>,
    is_source: bool,
    is_observable: bool,
    repository_unit: Option<String>,
}

impl AssetSpec {
    /// Creates an unpartitioned, policy-less asset.
    pub fn new(key: impl Into<AssetKey>) -> Self {
        Self {
            key: key.into(),
            parents: Vec::new(),
            partitions: None,
            policy: None,
            is_source: false,
            is_observable: false,
            repository_unit: None,
        }
    }

    /// Declares the asset's parents.
    pub fn with_parents(mut self, parents: impl IntoIterator<Item = impl Into<AssetKey>>) -> Self {
        self.parents = parents.into_iter().map(Into::into).collect();
        self
    }

    /// Makes the asset partitioned.
    pub fn with_partitions(mut self, partitions: PartitionsDefinition) -> Self {
        self.partitions = Some(partitions);
        self
    }

    /// Attaches a materialize policy.
    pub fn with_policy(mut self, policy: MaterializePolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Shorthand for the unbounded eager policy.
    pub fn eager(self) -> Self {
        self.with_policy(MaterializePolicy::eager(None))
    }

    /// Marks the asset as a non-observable source.
    pub fn source(mut self) -> Self {
        self.is_source = true;
        self
    }

    /// Marks the asset as an observable source.
    pub fn observable_source(mut self) -> Self {
        self.is_source = true;
        self.is_observable = true;
        self
    }

    /// Places the asset in a repository unit.
    pub fn in_unit(mut self, unit: impl Into<String>) -> Self {
        self.repository_unit = Some(unit.into());
        self
    }
}

struct AssetNode {
    partitions: Option<PartitionsDefinition>,
    policy: Option<MaterializePolicy>,
    is_source: bool,
    is_observable: bool,
    repository_unit: Option<String>,
}

/// Builder for [`TestAssetGraph`].
#[derive(Default)]
pub struct TestAssetGraphBuilder {
    specs: Vec<AssetSpec>,
    mapping_overrides: BTreeMap<(AssetKey, AssetKey), PartitionMappingKind>,
}

impl TestAssetGraphBuilder {
    /// Adds an asset.
    #[must_use]
    pub fn asset(mut self, spec: AssetSpec) -> Self {
        self.specs.push(spec);
        self
    }

    /// Overrides the mapping kind from `parent` onto `child`. Defaults to
    /// identity everywhere.
    #[must_use]
    pub fn mapping(
        mut self,
        child: impl Into<AssetKey>,
        parent: impl Into<AssetKey>,
        kind: PartitionMappingKind,
    ) -> Self {
        self.mapping_overrides
            .insert((child.into(), parent.into()), kind);
        self
    }

    /// Builds the graph. Panics on an unknown parent reference.
    #[must_use]
    pub fn build(self) -> Arc<TestAssetGraph> {
        let mut dag: DiGraph<AssetKey, ()> = DiGraph::new();
        let mut indices: BTreeMap<AssetKey, NodeIndex> = BTreeMap::new();
        let mut insertion_order: Vec<AssetKey> = Vec::new();
        let mut nodes: BTreeMap<AssetKey, AssetNode> = BTreeMap::new();

        for spec in &self.specs {
            let index = dag.add_node(spec.key.clone());
            indices.insert(spec.key.clone(), index);
            insertion_order.push(spec.key.clone());
            nodes.insert(
                spec.key.clone(),
                AssetNode {
                    partitions: spec.partitions.clone(),
                    policy: spec.policy.clone(),
                    is_source: spec.is_source,
                    is_observable: spec.is_observable,
                    repository_unit: spec.repository_unit.clone(),
                },
            );
        }
        for spec in &self.specs {
            let child = indices[&spec.key];
            for parent in &spec.parents {
                let parent_index = *indices
                    .get(parent)
                    .unwrap_or_else(|| panic!("unknown parent asset: {parent}"));
                dag.add_edge(parent_index, child, ());
            }
        }

        Arc::new(TestAssetGraph {
            dag,
            indices,
            insertion_order,
            nodes,
            mapping_overrides: self.mapping_overrides,
        })
    }
}

/// In-memory [`AssetGraph`] implementation with identity partition mappings.
pub struct TestAssetGraph {
    dag: DiGraph<AssetKey, ()>,
    indices: BTreeMap<AssetKey, NodeIndex>,
    insertion_order: Vec<AssetKey>,
    nodes: BTreeMap<AssetKey, AssetNode>,
    mapping_overrides: BTreeMap<(AssetKey, AssetKey), PartitionMappingKind>,
}

impl TestAssetGraph {
    /// Starts a builder.
    #[must_use]
    pub fn builder() -> TestAssetGraphBuilder {
        TestAssetGraphBuilder::default()
    }

    fn node(&self, asset_key: &AssetKey) -> &AssetNode {
        self.nodes
            .get(asset_key)
            .unwrap_or_else(|| panic!("unknown asset: {asset_key}"))
    }

    fn neighbors(&self, asset_key: &AssetKey, direction: Direction) -> BTreeSet<AssetKey> {
        let Some(index) = self.indices.get(asset_key) else {
            return BTreeSet::new();
        };
        self.dag
            .neighbors_directed(*index, direction)
            .map(|neighbor| self.dag[neighbor].clone())
            .collect()
    }
}

impl AssetGraph for TestAssetGraph {
    fn asset_keys(&self) -> Vec<AssetKey> {
        // Kahn's algorithm seeded in insertion order, so ties resolve the
        // same way every call.
        let mut in_degree: BTreeMap<AssetKey, usize> = self
            .insertion_order
            .iter()
            .map(|key| (key.clone(), self.parents(key).len()))
            .collect();
        let mut ready: Vec<AssetKey> = self
            .insertion_order
            .iter()
            .filter(|key| in_degree[*key] == 0)
            .cloned()
            .collect();
        let mut sorted = Vec::with_capacity(self.insertion_order.len());

        while !ready.is_empty() {
            let next = ready.remove(0);
            for child in self.children(&next) {
                let degree = in_degree.get_mut(&child).expect("known child");
                *degree -= 1;
                if *degree == 0 {
                    // Keep insertion order among newly ready nodes.
                    let position = self
                        .insertion_order
                        .iter()
                        .position(|key| *key == child)
                        .expect("known asset");
                    let insert_at = ready
                        .iter()
                        .position(|key| {
                            self.insertion_order
                                .iter()
                                .position(|candidate| candidate == key)
                                .expect("known asset")
                                > position
                        })
                        .unwrap_or(ready.len());
                    ready.insert(insert_at, child);
                }
            }
            sorted.push(next);
        }
        assert_eq!(sorted.len(), self.insertion_order.len(), "graph has a cycle");
        sorted
    }

    fn parents(&self, asset_key: &AssetKey) -> BTreeSet<AssetKey> {
        self.neighbors(asset_key, Direction::Incoming)
    }

    fn children(&self, asset_key: &AssetKey) -> BTreeSet<AssetKey> {
        self.neighbors(asset_key, Direction::Outgoing)
    }

    fn partitions_def(&self, asset_key: &AssetKey) -> Option<&PartitionsDefinition> {
        self.node(asset_key).partitions.as_ref()
    }

    fn parents_partitions(
        &self,
        asset_partition: &AssetPartition,
    ) -> trellis_policy::error::Result<ParentPartitions> {
        let mut result = ParentPartitions::default();
        for parent_key in self.parents(asset_partition.asset_key()) {
            let parent_def = self.partitions_def(&parent_key);
            match (parent_def, asset_partition.partition_key()) {
                (None, _) => {
                    result
                        .parent_partitions
                        .insert(AssetPartition::unpartitioned(parent_key));
                }
                // Unpartitioned child of a partitioned parent depends on
                // every parent partition.
                (Some(def), None) => {
                    result.parent_partitions.extend(
                        def.keys()
                            .iter()
                            .map(|key| AssetPartition::new(parent_key.clone(), key.clone())),
                    );
                }
                // Identity mapping: same key, or nonexistent if the parent
                // does not define it.
                (Some(def), Some(key)) => {
                    let parent_partition = AssetPartition::new(parent_key.clone(), key.clone());
                    if def.contains(key) {
                        result.parent_partitions.insert(parent_partition);
                    } else {
                        result.required_but_nonexistent.insert(parent_partition);
                    }
                }
            }
        }
        Ok(result)
    }

    fn is_source(&self, asset_key: &AssetKey) -> bool {
        self.node(asset_key).is_source
    }

    fn is_observable(&self, asset_key: &AssetKey) -> bool {
        self.node(asset_key).is_observable
    }

    fn partition_mapping_kind(&self, child: &AssetKey, parent: &AssetKey) -> PartitionMappingKind {
        self.mapping_overrides
            .get(&(child.clone(), parent.clone()))
            .copied()
            .unwrap_or(PartitionMappingKind::Identity)
    }

    fn repository_unit(&self, asset_key: &AssetKey) -> Option<String> {
        self.node(asset_key).repository_unit.clone()
    }

    fn materialize_policy(&self, asset_key: &AssetKey) -> Option<&MaterializePolicy> {
        self.node(asset_key).policy.as_ref()
    }
}
