//! Artifact Record - metadata sidecar for one universe's output

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dimension::DimensionValue;
use crate::universe::{sha256_hex, Universe, UniverseId};

/// Metadata stored next to every artifact as `<identity>.meta.json`.
///
/// Carries the universe's values so the aggregator can tag rows without
/// re-enumerating the grid, which is what makes aggregation a pure function
/// of the artifact directory.
///
/// ## CAS Hash Format
///
/// The `cas_hash` follows the format `sha256:<hex_digest>` of the artifact
/// file's bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactRecord {
    universe_id: UniverseId,
    universe_index: usize,
    dimensions: BTreeMap<String, DimensionValue>,
    seed: u64,
    cas_hash: String,
    size_bytes: u64,
    created_at: DateTime<Utc>,
    execution_secs: f64,
}

impl ArtifactRecord {
    /// Create a record for `universe` whose artifact has content `bytes`.
    #[must_use]
    pub fn new(universe: &Universe, bytes: &[u8], execution_secs: f64) -> Self {
        Self {
            universe_id: universe.id().clone(),
            universe_index: universe.index(),
            dimensions: universe.values_map(),
            seed: universe.seed(),
            cas_hash: content_hash(bytes),
            size_bytes: bytes.len() as u64,
            created_at: Utc::now(),
            execution_secs,
        }
    }

    /// Get the universe identity.
    #[must_use]
    pub const fn universe_id(&self) -> &UniverseId {
        &self.universe_id
    }

    /// Get the universe index at the time of execution.
    #[must_use]
    pub const fn universe_index(&self) -> usize {
        self.universe_index
    }

    /// Get the dimension values, keyed by name.
    #[must_use]
    pub const fn dimensions(&self) -> &BTreeMap<String, DimensionValue> {
        &self.dimensions
    }

    /// Get the seed passed to the analysis procedure.
    #[must_use]
    pub const fn seed(&self) -> u64 {
        self.seed
    }

    /// Get the content-addressable hash.
    #[must_use]
    pub fn cas_hash(&self) -> &str {
        &self.cas_hash
    }

    /// Get the artifact size in bytes.
    #[must_use]
    pub const fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Get the creation timestamp.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Get the wall-clock execution time in seconds.
    #[must_use]
    pub const fn execution_secs(&self) -> f64 {
        self.execution_secs
    }
}

/// `sha256:<hex>` of `bytes`.
#[must_use]
pub fn content_hash(bytes: &[u8]) -> String {
    format!("sha256:{}", sha256_hex(bytes))
}
