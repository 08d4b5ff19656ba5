//! # trellis-core
//!
//! Shared vocabulary types for the Trellis auto-materialization engine.
//!
//! This crate defines the identifiers and partition types every other
//! Trellis component speaks in:
//!
//! - **Keys**: [`AssetKey`], [`PartitionKey`], [`AssetPartition`], [`RunId`]
//! - **Partitions**: [`PartitionsDefinition`] and
//!   [`SerializedPartitionsSubset`], the durable wire form for partition
//!   sets inside persisted evaluation records
//! - **Errors**: the shared [`error::Error`] type
//! - **Observability**: logging bootstrap helpers

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod key;
pub mod observability;
pub mod partition;

pub use error::{Error, Result};
pub use key::{AssetKey, AssetPartition, PartitionKey, RunId};
pub use partition::{PartitionsDefinition, SerializedPartitionsSubset};
