//! # trellis-policy
//!
//! The decision core of the Trellis auto-materialization daemon.
//!
//! Each scheduler tick, the [`pipeline::TickEvaluator`] walks the asset
//! graph in topological order and classifies asset partitions into
//! materialize, skip, and discard decisions by running the configured
//! [`policy::MaterializePolicy`] rules. A tick produces persisted
//! [`evaluation::AssetEvaluation`] records, [`pipeline::RunRequest`]s for
//! everything that survived, and the successor [`cursor::Cursor`].
//!
//! External state enters through three trait seams the embedding daemon
//! implements:
//!
//! - [`graph::AssetGraph`] — the dependency graph and partition mappings
//! - [`query::InstanceQueryer`] — point-in-time materialization history
//! - [`freshness::FreshnessResolver`] — freshness-target computation
//!
//! # Example
//!
//! ```rust,ignore
//! use trellis_policy::config::EvaluatorConfig;
//! use trellis_policy::cursor::Cursor;
//! use trellis_policy::pipeline::TickEvaluator;
//!
//! let evaluator = TickEvaluator::new(&graph, &queryer, &freshness, EvaluatorConfig::default());
//! let outcome = evaluator.evaluate_tick(&Cursor::empty())?;
//! for request in &outcome.run_requests {
//!     submit_run(request)?;
//! }
//! record_store.write(&outcome.to_persist)?;
//! cursor_store.store(&outcome.cursor)?;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod context;
pub mod cursor;
pub mod error;
pub mod evaluation;
pub mod freshness;
pub mod graph;
mod legacy;
pub mod metrics;
pub mod pipeline;
pub mod policy;
pub mod query;
pub mod rule;

pub use config::EvaluatorConfig;
pub use cursor::{Cursor, CursorStore, InMemoryCursorStore, StorageWatermark};
pub use error::{Error, Result};
pub use evaluation::AssetEvaluation;
pub use freshness::{FreshnessResolver, NoFreshnessTargets};
pub use graph::{AssetGraph, ParentPartitions, PartitionMappingKind};
pub use pipeline::{RunRequest, TickEvaluator, TickOutcome};
pub use policy::MaterializePolicy;
pub use query::{BackfillSubset, InstanceQueryer};
pub use rule::{DecisionType, Rule, RuleEvaluation, RuleEvaluationData, RuleSnapshot};
