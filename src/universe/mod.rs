//! Universe descriptors and the universe grid
//!
//! A [`Universe`] is one concrete assignment of an option to every dimension,
//! plus its position in the enumeration order, a content-derived identity and
//! a seed.
//!
//! ## Identity and seed derivation
//!
//! ```text
//! canonical = compact JSON of {dimension: value}, keys sorted bytewise
//! identity  = hex(SHA-256(canonical))                       (64 chars)
//! seed      = u64_be(SHA-256(identity as ASCII)[0..8]) & 0xFFFF_FFFF
//! ```
//!
//! Neither depends on the universe index, the dimension declaration order,
//! the machine or the clock, so two independent runs (or two machines) agree
//! on the identity and seed of every universe.

mod run;

pub use run::{UniverseRun, UniverseState};

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::dimension::{ConstraintSet, DimensionSet, DimensionValue};
use crate::{Error, Result};

/// Content-derived, stable universe identifier (lowercase SHA-256 hex).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UniverseId(String);

impl UniverseId {
    /// Derive the identity of a values mapping.
    #[must_use]
    pub fn from_values<'a, I>(values: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a DimensionValue)>,
    {
        Self(sha256_hex(canonical_values(values).as_bytes()))
    }

    /// Wrap an identity read back from disk.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `raw` is not 64 lowercase hex characters.
    pub fn parse(raw: &str) -> Result<Self> {
        let valid = raw.len() == 64
            && raw
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(Error::config(format!("'{raw}' is not a universe identity")))
        }
    }

    /// The full hex string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }

    /// Seed derived from this identity (`< 2^32`).
    #[must_use]
    pub fn seed(&self) -> u64 {
        let digest = Sha256::digest(self.0.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(head) & 0xFFFF_FFFF
    }
}

impl fmt::Display for UniverseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical serialization of a values mapping: compact JSON, sorted keys.
#[must_use]
pub fn canonical_values<'a, I>(values: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a DimensionValue)>,
{
    let sorted: BTreeMap<&str, serde_json::Value> = values
        .into_iter()
        .map(|(name, value)| (name, value.to_json()))
        .collect();
    // A map of strings to JSON scalars cannot fail to serialize.
    serde_json::to_string(&sorted).unwrap_or_default()
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// One element of the (constrained) Cartesian product of all dimensions.
#[derive(Debug, Clone, PartialEq)]
pub struct Universe {
    index: usize,
    values: Vec<(String, DimensionValue)>,
    id: UniverseId,
    seed: u64,
}

impl Universe {
    fn new(index: usize, values: Vec<(String, DimensionValue)>) -> Self {
        let id = UniverseId::from_values(values.iter().map(|(k, v)| (k.as_str(), v)));
        let seed = id.seed();
        Self {
            index,
            values,
            id,
            seed,
        }
    }

    /// Position in the grid's enumeration order.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Chosen option per dimension, in declaration order.
    #[must_use]
    pub fn values(&self) -> &[(String, DimensionValue)] {
        &self.values
    }

    /// Option chosen for `dimension`.
    #[must_use]
    pub fn value(&self, dimension: &str) -> Option<&DimensionValue> {
        self.values
            .iter()
            .find(|(name, _)| name == dimension)
            .map(|(_, v)| v)
    }

    /// Values keyed by dimension name (sorted).
    #[must_use]
    pub fn values_map(&self) -> BTreeMap<String, DimensionValue> {
        self.values.iter().cloned().collect()
    }

    /// Content-derived identity.
    #[must_use]
    pub const fn id(&self) -> &UniverseId {
        &self.id
    }

    /// Deterministic seed.
    #[must_use]
    pub const fn seed(&self) -> u64 {
        self.seed
    }

    /// Canonical JSON of the values.
    #[must_use]
    pub fn canonical_values(&self) -> String {
        canonical_values(self.values.iter().map(|(k, v)| (k.as_str(), v)))
    }
}

impl fmt::Display for Universe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {} (", self.index, self.id.short())?;
        for (i, (name, value)) in self.values.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}={value}")?;
        }
        f.write_str(")")
    }
}

/// Ordered sequence of all universes of a dimension set, after constraints.
///
/// Without constraints `len() == dims.combination_count()` and universe `i`
/// is `dims.combination_at(i)`.
#[derive(Debug, Clone)]
pub struct UniverseGrid {
    dimensions: DimensionSet,
    universes: Vec<Universe>,
}

impl UniverseGrid {
    /// Enumerate every combination of `dimensions` in order.
    #[must_use]
    pub fn enumerate(dimensions: &DimensionSet) -> Self {
        Self::build(dimensions, None)
    }

    /// Enumerate, dropping combinations rejected by `constraints`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a constraint references an unknown
    /// dimension or option.
    pub fn with_constraints(dimensions: &DimensionSet, constraints: &ConstraintSet) -> Result<Self> {
        constraints.validate(dimensions)?;
        Ok(Self::build(dimensions, Some(constraints)))
    }

    fn build(dimensions: &DimensionSet, constraints: Option<&ConstraintSet>) -> Self {
        let names: Vec<String> = dimensions.names().map(str::to_string).collect();
        let universes = dimensions
            .combinations()
            .filter(|combo| constraints.map_or(true, |c| c.allows(dimensions, combo)))
            .enumerate()
            .map(|(index, combo)| Universe::new(index, names.iter().cloned().zip(combo).collect()))
            .collect();
        Self {
            dimensions: dimensions.clone(),
            universes,
        }
    }

    /// The dimension set this grid was enumerated from.
    #[must_use]
    pub const fn dimensions(&self) -> &DimensionSet {
        &self.dimensions
    }

    /// All universes in order.
    #[must_use]
    pub fn universes(&self) -> &[Universe] {
        &self.universes
    }

    /// Number of universes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.universes.len()
    }

    /// True if constraints removed every combination.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.universes.is_empty()
    }

    /// Universe at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Universe> {
        self.universes.get(index)
    }

    /// Universe whose values equal `values` (order-insensitive).
    #[must_use]
    pub fn find(&self, values: &BTreeMap<String, DimensionValue>) -> Option<&Universe> {
        let id = UniverseId::from_values(values.iter().map(|(k, v)| (k.as_str(), v)));
        self.find_by_id(&id)
    }

    /// Universe with the given identity.
    #[must_use]
    pub fn find_by_id(&self, id: &UniverseId) -> Option<&Universe> {
        self.universes.iter().find(|u| u.id() == id)
    }

    /// The single universe whose identity starts with `prefix`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when no universe or more than one matches.
    pub fn find_by_prefix(&self, prefix: &str) -> Result<&Universe> {
        let mut matches = self
            .universes
            .iter()
            .filter(|u| u.id().as_str().starts_with(prefix));
        match (matches.next(), matches.next()) {
            (Some(u), None) => Ok(u),
            (None, _) => Err(Error::config(format!(
                "universe id '{prefix}' matches no universe"
            ))),
            (Some(_), Some(_)) => Err(Error::config(format!(
                "universe id '{prefix}' matches more than one universe"
            ))),
        }
    }

    /// JSON manifest of the grid (`multiverse_grid.json`).
    #[must_use]
    pub fn manifest(&self) -> serde_json::Value {
        let entries: Vec<serde_json::Value> = self
            .universes
            .iter()
            .map(|u| {
                let dims: serde_json::Map<String, serde_json::Value> = u
                    .values()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect();
                serde_json::json!({
                    "index": u.index(),
                    "universe_id": u.id(),
                    "seed": u.seed(),
                    "dimensions": dims,
                })
            })
            .collect();
        serde_json::Value::Array(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn example() -> DimensionSet {
        DimensionSet::builder()
            .dimension("scaler", ["A", "B"])
            .dimension("model", ["X", "Y", "Z"])
            .build()
            .unwrap()
    }

    #[test]
    fn test_grid_order_and_indices() {
        let grid = UniverseGrid::enumerate(&example());
        let labels: Vec<String> = grid
            .universes()
            .iter()
            .map(|u| format!("{}{}", u.values()[0].1, u.values()[1].1))
            .collect();
        assert_eq!(labels, ["AX", "AY", "AZ", "BX", "BY", "BZ"]);
        for (i, u) in grid.universes().iter().enumerate() {
            assert_eq!(u.index(), i);
        }
    }

    #[test]
    fn test_identities_unique() {
        let grid = UniverseGrid::enumerate(&example());
        let ids: HashSet<&UniverseId> = grid.universes().iter().map(Universe::id).collect();
        assert_eq!(ids.len(), 6);
    }

    #[test]
    fn test_identity_ignores_declaration_order() {
        let a = DimensionValue::from("A");
        let x = DimensionValue::from("X");
        let forward = UniverseId::from_values([("scaler", &a), ("model", &x)]);
        let reverse = UniverseId::from_values([("model", &x), ("scaler", &a)]);
        assert_eq!(forward, reverse);
    }

    #[test]
    fn test_canonical_values_sorted() {
        let grid = UniverseGrid::enumerate(&example());
        assert_eq!(
            grid.universes()[0].canonical_values(),
            r#"{"model":"X","scaler":"A"}"#
        );
    }

    #[test]
    fn test_identity_is_sha256_of_canonical() {
        let grid = UniverseGrid::enumerate(&example());
        let u = &grid.universes()[0];
        assert_eq!(u.id().as_str(), sha256_hex(u.canonical_values().as_bytes()));
        assert_eq!(u.id().as_str().len(), 64);
    }

    #[test]
    fn test_seed_fits_32_bits_and_is_stable() {
        let first = UniverseGrid::enumerate(&example());
        let second = UniverseGrid::enumerate(&example());
        for (a, b) in first.universes().iter().zip(second.universes()) {
            assert!(a.seed() <= u64::from(u32::MAX));
            assert_eq!(a.seed(), b.seed());
            assert_eq!(a.seed(), a.id().seed());
        }
    }

    #[test]
    fn test_reordered_dimensions_keep_identities() {
        let reordered = DimensionSet::builder()
            .dimension("model", ["X", "Y", "Z"])
            .dimension("scaler", ["A", "B"])
            .build()
            .unwrap();
        let a: HashSet<UniverseId> = UniverseGrid::enumerate(&example())
            .universes()
            .iter()
            .map(|u| u.id().clone())
            .collect();
        let b: HashSet<UniverseId> = UniverseGrid::enumerate(&reordered)
            .universes()
            .iter()
            .map(|u| u.id().clone())
            .collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_find_by_values_and_prefix() {
        let grid = UniverseGrid::enumerate(&example());
        let values = BTreeMap::from([
            ("model".to_string(), DimensionValue::from("Y")),
            ("scaler".to_string(), DimensionValue::from("B")),
        ]);
        let found = grid.find(&values).unwrap();
        assert_eq!(found.index(), 4);

        let by_prefix = grid.find_by_prefix(found.id().as_str()).unwrap();
        assert_eq!(by_prefix.index(), 4);
        assert!(grid.find_by_prefix("").is_err());
        assert!(grid.find_by_prefix("not-hex").is_err());
    }

    #[test]
    fn test_parse_identity() {
        let grid = UniverseGrid::enumerate(&example());
        let id = grid.universes()[2].id();
        assert_eq!(&UniverseId::parse(id.as_str()).unwrap(), id);
        assert!(UniverseId::parse("abc").is_err());
        assert!(UniverseId::parse(&"G".repeat(64)).is_err());
    }

    #[test]
    fn test_manifest_shape() {
        let grid = UniverseGrid::enumerate(&example());
        let manifest = grid.manifest();
        let entries = manifest.as_array().unwrap();
        assert_eq!(entries.len(), 6);
        assert_eq!(entries[3]["index"], 3);
        assert_eq!(entries[3]["dimensions"]["scaler"], "B");
    }
}
