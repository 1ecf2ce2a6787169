//! Constraints that prune nonsensical combinations from the grid

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{DimensionSet, DimensionValue};
use crate::{Error, Result};

/// A rule attached to one option of a dimension.
///
/// When a combination selects `value` for the owning dimension, it is kept
/// only if every `allowed_if` pair matches and no `forbidden_if` pair does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    /// Option of the owning dimension this rule applies to.
    pub value: DimensionValue,
    /// Dimension/value pairs that must all be present.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub allowed_if: BTreeMap<String, DimensionValue>,
    /// Dimension/value pairs none of which may be present.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub forbidden_if: BTreeMap<String, DimensionValue>,
}

impl Constraint {
    fn permits(&self, dims: &DimensionSet, combination: &[DimensionValue]) -> bool {
        let allowed = self
            .allowed_if
            .iter()
            .all(|(dim, value)| lookup(dims, combination, dim) == Some(value));
        let forbidden = self
            .forbidden_if
            .iter()
            .any(|(dim, value)| lookup(dims, combination, dim) == Some(value));
        allowed && !forbidden
    }
}

fn lookup<'a>(
    dims: &DimensionSet,
    combination: &'a [DimensionValue],
    name: &str,
) -> Option<&'a DimensionValue> {
    dims.dimensions()
        .iter()
        .position(|d| d.name() == name)
        .and_then(|i| combination.get(i))
}

/// Constraints keyed by the dimension they are attached to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConstraintSet {
    rules: BTreeMap<String, Vec<Constraint>>,
}

impl ConstraintSet {
    /// Empty constraint set (keeps every combination).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a constraint to `dimension`.
    #[must_use]
    pub fn with(mut self, dimension: impl Into<String>, constraint: Constraint) -> Self {
        self.rules.entry(dimension.into()).or_default().push(constraint);
        self
    }

    /// True if no constraints are declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.values().all(Vec::is_empty)
    }

    /// Check that every referenced dimension and option exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first dangling reference.
    pub fn validate(&self, dims: &DimensionSet) -> Result<()> {
        let check = |dim: &str, value: &DimensionValue| -> Result<()> {
            let dimension = dims.get(dim).ok_or_else(|| {
                Error::config(format!("constraint references unknown dimension '{dim}'"))
            })?;
            if dimension.position(value).is_none() {
                return Err(Error::config(format!(
                    "constraint references unknown option {value} of dimension '{dim}'"
                )));
            }
            Ok(())
        };

        for (dim, constraints) in &self.rules {
            for constraint in constraints {
                check(dim, &constraint.value)?;
                for (other, value) in constraint.allowed_if.iter().chain(&constraint.forbidden_if)
                {
                    check(other, value)?;
                }
            }
        }
        Ok(())
    }

    /// Whether `combination` (one value per dimension, declaration order)
    /// survives all constraints.
    #[must_use]
    pub fn allows(&self, dims: &DimensionSet, combination: &[DimensionValue]) -> bool {
        self.rules.iter().all(|(dim, constraints)| {
            let Some(current) = lookup(dims, combination, dim) else {
                return true;
            };
            constraints
                .iter()
                .filter(|c| &c.value == current)
                .all(|c| c.permits(dims, combination))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims() -> DimensionSet {
        DimensionSet::builder()
            .dimension("scaler", ["StandardScaler", "MinMaxScaler", "no-scaler"])
            .dimension(
                "feature_selector",
                ["SelectKBest_5", "SelectKBest_10", "use-all-features"],
            )
            .build()
            .unwrap()
    }

    fn constraints() -> ConstraintSet {
        ConstraintSet::new()
            .with(
                "scaler",
                Constraint {
                    value: "no-scaler".into(),
                    allowed_if: BTreeMap::from([(
                        "feature_selector".to_string(),
                        "use-all-features".into(),
                    )]),
                    forbidden_if: BTreeMap::new(),
                },
            )
            .with(
                "scaler",
                Constraint {
                    value: "MinMaxScaler".into(),
                    allowed_if: BTreeMap::new(),
                    forbidden_if: BTreeMap::from([(
                        "feature_selector".to_string(),
                        "use-all-features".into(),
                    )]),
                },
            )
    }

    #[test]
    fn test_allowed_and_forbidden() {
        let dims = dims();
        let rules = constraints();
        rules.validate(&dims).unwrap();

        let kept: Vec<String> = dims
            .combinations()
            .filter(|c| rules.allows(&dims, c))
            .map(|c| format!("{}/{}", c[0], c[1]))
            .collect();

        assert_eq!(
            kept,
            [
                "StandardScaler/SelectKBest_5",
                "StandardScaler/SelectKBest_10",
                "StandardScaler/use-all-features",
                "MinMaxScaler/SelectKBest_5",
                "MinMaxScaler/SelectKBest_10",
                "no-scaler/use-all-features",
            ]
        );
    }

    #[test]
    fn test_empty_set_allows_everything() {
        let dims = dims();
        let rules = ConstraintSet::new();
        assert!(rules.is_empty());
        assert!(dims.combinations().all(|c| rules.allows(&dims, &c)));
    }

    #[test]
    fn test_validate_unknown_dimension() {
        let rules = ConstraintSet::new().with(
            "missing",
            Constraint {
                value: "x".into(),
                allowed_if: BTreeMap::new(),
                forbidden_if: BTreeMap::new(),
            },
        );
        let err = rules.validate(&dims()).unwrap_err();
        assert!(err.to_string().contains("unknown dimension 'missing'"));
    }

    #[test]
    fn test_validate_unknown_option() {
        let rules = ConstraintSet::new().with(
            "scaler",
            Constraint {
                value: "RobustScaler".into(),
                allowed_if: BTreeMap::new(),
                forbidden_if: BTreeMap::new(),
            },
        );
        let err = rules.validate(&dims()).unwrap_err();
        assert!(err.to_string().contains("unknown option RobustScaler"));
    }

    #[test]
    fn test_deserialize_from_toml() {
        let rules: ConstraintSet = toml::from_str(
            r#"
            [[scaler]]
            value = "no-scaler"
            allowed_if = { feature_selector = "use-all-features" }
            "#,
        )
        .unwrap();
        rules.validate(&dims()).unwrap();
        assert!(!rules.is_empty());
    }
}
