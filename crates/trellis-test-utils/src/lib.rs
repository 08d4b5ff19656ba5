//! Shared test utilities for Trellis integration tests.
//!
//! This crate provides:
//! - [`TestAssetGraph`]: an in-memory asset graph with a fluent builder
//! - [`TestInstanceQueryer`]: scriptable materialization history
//! - [`StaticFreshnessResolver`]: canned freshness answers
//!
//! # Example
//!
//! ```rust,ignore
//! use trellis_test_utils::{init_test_logging, TestAssetGraph, TestInstanceQueryer};
//!
//! #[test]
//! fn test_example() {
//!     init_test_logging();
//!     let graph = TestAssetGraph::builder()
//!         .asset(AssetSpec::new("raw/events").eager())
//!         .build();
//!     let queryer = TestInstanceQueryer::new(graph.clone());
//!     // ... run tick ...
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod freshness;
pub mod graph;
pub mod queryer;

pub use freshness::*;
pub use graph::*;
pub use queryer::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("trellis=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
