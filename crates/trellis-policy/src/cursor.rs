//! Tick-to-tick persisted state.
//!
//! The [`Cursor`] is the only state the engine carries between ticks: the
//! latest evaluation record per asset plus a storage watermark marking the
//! "as of" position for delta queries. A cursor is read-only during a tick
//! and atomically replaced at tick end; tick N+1 must not begin until tick
//! N's cursor has been durably committed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use trellis_core::AssetKey;

use crate::error::{Error, Result};
use crate::evaluation::AssetEvaluation;

/// A monotonically increasing position in the materialization event log.
///
/// "Has X happened after the watermark" is the primitive every delta query
/// is phrased in.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct StorageWatermark(u64);

impl StorageWatermark {
    /// Creates a watermark from a raw event-log position.
    #[must_use]
    pub const fn new(position: u64) -> Self {
        Self(position)
    }

    /// Returns the raw event-log position.
    #[must_use]
    pub const fn position(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StorageWatermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Persisted per-tick state: the previous tick's evaluation record for each
/// asset and the storage watermark those records were computed against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Cursor {
    evaluation_id: u64,
    latest_storage_watermark: Option<StorageWatermark>,
    latest_evaluation_by_asset_key: BTreeMap<AssetKey, AssetEvaluation>,
}

impl Cursor {
    /// Creates the empty cursor used before the first tick.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns the ordinal of the tick that produced this cursor.
    #[must_use]
    pub fn evaluation_id(&self) -> u64 {
        self.evaluation_id
    }

    /// Returns the storage watermark the previous tick evaluated against.
    #[must_use]
    pub fn latest_storage_watermark(&self) -> Option<StorageWatermark> {
        self.latest_storage_watermark
    }

    /// Returns the previous tick's evaluation record for an asset, if any.
    #[must_use]
    pub fn latest_evaluation(&self, asset_key: &AssetKey) -> Option<&AssetEvaluation> {
        self.latest_evaluation_by_asset_key.get(asset_key)
    }

    /// Returns all stored evaluation records keyed by asset.
    #[must_use]
    pub fn latest_evaluations(&self) -> &BTreeMap<AssetKey, AssetEvaluation> {
        &self.latest_evaluation_by_asset_key
    }

    /// Produces the successor cursor for a completed tick.
    ///
    /// The current cursor is not modified; per-asset records are replaced
    /// by the new evaluations and the watermark advances to the position
    /// the tick evaluated against.
    #[must_use]
    pub fn with_updates(
        &self,
        watermark: Option<StorageWatermark>,
        evaluations: impl IntoIterator<Item = AssetEvaluation>,
    ) -> Self {
        let mut latest = self.latest_evaluation_by_asset_key.clone();
        for evaluation in evaluations {
            latest.insert(evaluation.asset_key().clone(), evaluation);
        }
        Self {
            evaluation_id: self.evaluation_id + 1,
            latest_storage_watermark: watermark.or(self.latest_storage_watermark),
            latest_evaluation_by_asset_key: latest,
        }
    }
}

/// Durable storage for the cursor.
///
/// A store must replace the cursor atomically: a reader sees either the
/// previous cursor or the new one, never a partial write.
pub trait CursorStore {
    /// Loads the most recently committed cursor.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be read.
    fn load(&self) -> Result<Option<Cursor>>;

    /// Atomically replaces the committed cursor.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails; the previous cursor stays
    /// committed in that case.
    fn store(&self, cursor: &Cursor) -> Result<()>;
}

/// In-memory cursor store for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryCursorStore {
    inner: Mutex<Option<Cursor>>,
}

impl InMemoryCursorStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CursorStore for InMemoryCursorStore {
    fn load(&self) -> Result<Option<Cursor>> {
        let guard = self
            .inner
            .lock()
            .map_err(|_| Error::internal("cursor store lock poisoned"))?;
        Ok(guard.clone())
    }

    fn store(&self, cursor: &Cursor) -> Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| Error::internal("cursor store lock poisoned"))?;
        *guard = Some(cursor.clone());
        Ok(())
    }
}
