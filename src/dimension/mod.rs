//! Dimension Model
//!
//! A [`DimensionSet`] is the declared decision space: an ordered list of
//! named dimensions, each with an ordered, non-empty list of options.
//!
//! ## Enumeration order
//!
//! Combinations are enumerated lexicographically over dimensions in
//! declaration order, the first dimension varying slowest:
//!
//! ```text
//! scaler = [A, B], model = [X, Y, Z]
//!
//! 0: (A, X)   1: (A, Y)   2: (A, Z)
//! 3: (B, X)   4: (B, Y)   5: (B, Z)
//! ```
//!
//! This ordering is a public contract: partial runs slice into it by
//! percentage and resumed runs rely on it being stable.
//!
//! ## Example
//!
//! ```rust
//! use trueno_multiverse::dimension::{DimensionSet, DimensionValue};
//!
//! let dims = DimensionSet::builder()
//!     .dimension("scaler", ["A", "B"])
//!     .dimension("model", ["X", "Y", "Z"])
//!     .build()?;
//!
//! assert_eq!(dims.combination_count(), 6);
//! let third = dims.combination_at(2).unwrap();
//! assert_eq!(third[1], DimensionValue::from("Z"));
//! # Ok::<(), trueno_multiverse::Error>(())
//! ```

mod constraint;
mod value;

pub use constraint::{Constraint, ConstraintSet};
pub use value::DimensionValue;

use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Error, Result};

/// A named decision axis with its ordered options.
#[derive(Debug, Clone, PartialEq)]
pub struct Dimension {
    name: String,
    options: Vec<DimensionValue>,
}

impl Dimension {
    /// Dimension name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Options in declared order.
    #[must_use]
    pub fn options(&self) -> &[DimensionValue] {
        &self.options
    }

    /// Position of `value` among the options.
    #[must_use]
    pub fn position(&self, value: &DimensionValue) -> Option<usize> {
        self.options.iter().position(|o| o == value)
    }
}

/// Ordered, validated set of dimensions. Immutable once built.
///
/// Invariants: at least one dimension, unique names, every dimension has at
/// least one option, and no option appears twice within a dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct DimensionSet {
    dimensions: Vec<Dimension>,
}

impl DimensionSet {
    /// Build and validate a dimension set from `(name, options)` pairs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the set is empty, a name repeats, a
    /// dimension has no options, an option repeats or a float is not finite.
    pub fn new<I>(dimensions: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, Vec<DimensionValue>)>,
    {
        let dimensions: Vec<Dimension> = dimensions
            .into_iter()
            .map(|(name, options)| Dimension { name, options })
            .collect();

        if dimensions.is_empty() {
            return Err(Error::config("no dimensions declared"));
        }

        for (i, dim) in dimensions.iter().enumerate() {
            if dim.name.is_empty() {
                return Err(Error::config("dimension names must not be empty"));
            }
            if dimensions[..i].iter().any(|d| d.name == dim.name) {
                return Err(Error::config(format!(
                    "dimension '{}' is declared more than once",
                    dim.name
                )));
            }
            if dim.options.is_empty() {
                return Err(Error::config(format!(
                    "dimension '{}' has no options",
                    dim.name
                )));
            }
            for (j, option) in dim.options.iter().enumerate() {
                if !option.is_finite() {
                    return Err(Error::config(format!(
                        "dimension '{}' has a non-finite option",
                        dim.name
                    )));
                }
                if dim.options[..j].contains(option) {
                    return Err(Error::config(format!(
                        "dimension '{}' contains duplicate option {option}",
                        dim.name
                    )));
                }
            }
        }

        Ok(Self { dimensions })
    }

    /// Start building a dimension set in declaration order.
    #[must_use]
    pub fn builder() -> DimensionSetBuilder {
        DimensionSetBuilder::default()
    }

    /// Dimensions in declaration order.
    #[must_use]
    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    /// Look up a dimension by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Dimension> {
        self.dimensions.iter().find(|d| d.name == name)
    }

    /// Number of dimensions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.dimensions.len()
    }

    /// Always false for a validated set; provided for API completeness.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dimensions.is_empty()
    }

    /// Dimension names in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.dimensions.iter().map(|d| d.name.as_str())
    }

    /// Product of the option counts (saturating).
    #[must_use]
    pub fn combination_count(&self) -> usize {
        self.dimensions
            .iter()
            .fold(1usize, |acc, d| acc.saturating_mul(d.options.len()))
    }

    /// Option values of the combination at `index` in enumeration order,
    /// one per dimension in declaration order.
    #[must_use]
    pub fn combination_at(&self, index: usize) -> Option<Vec<DimensionValue>> {
        if index >= self.combination_count() {
            return None;
        }
        // Mixed radix decode, last dimension is the least significant digit.
        let mut rest = index;
        let mut picked = vec![0usize; self.dimensions.len()];
        for (slot, dim) in picked.iter_mut().zip(&self.dimensions).rev() {
            let radix = dim.options.len();
            *slot = rest % radix;
            rest /= radix;
        }
        Some(
            picked
                .into_iter()
                .zip(&self.dimensions)
                .map(|(i, d)| d.options[i].clone())
                .collect(),
        )
    }

    /// Iterate all combinations in enumeration order.
    pub fn combinations(&self) -> Combinations<'_> {
        Combinations {
            set: self,
            cursor: vec![0; self.dimensions.len()],
            done: false,
        }
    }
}

/// Odometer over the option indices of a [`DimensionSet`].
pub struct Combinations<'a> {
    set: &'a DimensionSet,
    cursor: Vec<usize>,
    done: bool,
}

impl Iterator for Combinations<'_> {
    type Item = Vec<DimensionValue>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = self
            .cursor
            .iter()
            .zip(&self.set.dimensions)
            .map(|(&i, d)| d.options[i].clone())
            .collect();

        // Advance the last dimension first; carry leftwards.
        self.done = true;
        for (slot, dim) in self.cursor.iter_mut().zip(&self.set.dimensions).rev() {
            *slot += 1;
            if *slot < dim.options.len() {
                self.done = false;
                break;
            }
            *slot = 0;
        }
        Some(item)
    }
}

/// Builder for [`DimensionSet`].
#[derive(Debug, Default)]
pub struct DimensionSetBuilder {
    dimensions: Vec<(String, Vec<DimensionValue>)>,
}

impl DimensionSetBuilder {
    /// Append a dimension.
    #[must_use]
    pub fn dimension<I, V>(mut self, name: impl Into<String>, options: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<DimensionValue>,
    {
        self.dimensions
            .push((name.into(), options.into_iter().map(Into::into).collect()));
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    ///
    /// See [`DimensionSet::new`].
    pub fn build(self) -> Result<DimensionSet> {
        DimensionSet::new(self.dimensions)
    }
}

impl Serialize for DimensionSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.dimensions.len()))?;
        for dim in &self.dimensions {
            map.serialize_entry(&dim.name, &dim.options)?;
        }
        map.end()
    }
}

// Deserialized through a map visitor so that declaration order in the file
// is kept, whatever map type the format would otherwise use.
impl<'de> Deserialize<'de> for DimensionSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct DimensionsVisitor;

        impl<'de> Visitor<'de> for DimensionsVisitor {
            type Value = DimensionSet;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of dimension name to a list of options")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut access: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut entries = Vec::new();
                while let Some((name, options)) =
                    access.next_entry::<String, Vec<DimensionValue>>()?
                {
                    entries.push((name, options));
                }
                DimensionSet::new(entries).map_err(serde::de::Error::custom)
            }
        }

        deserializer.deserialize_map(DimensionsVisitor)
    }
}
