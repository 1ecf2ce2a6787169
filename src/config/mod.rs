//! Configuration input
//!
//! A multiverse is declared in a TOML or JSON file:
//!
//! ```toml
//! [dimensions]
//! scaler = ["StandardScaler", "MinMaxScaler"]
//! model  = ["logreg", "rf", "svm"]
//!
//! [[constraints.scaler]]
//! value = "MinMaxScaler"
//! forbidden_if = { model = "svm" }
//!
//! [run]
//! mode = "partial-parallel"
//! partial = "0%,50%"
//! n_jobs = -1
//! output_dir = "./output"
//!
//! [executor]
//! command = ["python", "universe.py", "--settings", "{settings}"]
//! ```
//!
//! Everything except `[dimensions]` is optional. Validation happens once,
//! up front: a configuration error aborts before any universe runs.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dimension::{ConstraintSet, DimensionSet};
use crate::executor::CommandExecutor;
use crate::scheduler::{ModeName, Parallelism, PartialRange, RunMode};
use crate::universe::UniverseGrid;
use crate::{Error, Result};

/// File names probed by [`MultiverseConfig::discover`], in order.
pub const DEFAULT_CONFIG_FILES: [&str; 2] = ["multiverse.toml", "multiverse.json"];

/// Complete multiverse declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MultiverseConfig {
    /// Decision dimensions, in enumeration order
    pub dimensions: DimensionSet,
    /// Optional pruning rules
    #[serde(default, skip_serializing_if = "ConstraintSet::is_empty")]
    pub constraints: ConstraintSet,
    /// Run-level settings
    #[serde(default)]
    pub run: RunSettings,
    /// Subprocess executor; required for executing modes from the CLI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<ExecutorSettings>,
}

/// `[run]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunSettings {
    /// Run mode
    pub mode: ModeName,
    /// `"start%,end%"`, required for `partial-parallel`
    pub partial: Option<String>,
    /// Worker count: `> 0` exact, `-1` all available minus one
    pub n_jobs: i64,
    /// Re-run universes that already have an artifact
    pub force: bool,
    /// Output directory
    pub output_dir: PathBuf,
    /// Per-universe timeout in seconds
    pub timeout_secs: Option<f64>,
    /// Output directories merged by `finalize` (default: `output_dir`)
    pub sources: Vec<PathBuf>,
    /// Also write `aggregated_outputs.parquet`
    pub write_parquet: bool,
    /// Only run the universe whose identity starts with this prefix
    pub universe_id: Option<String>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            mode: ModeName::default(),
            partial: None,
            n_jobs: Parallelism::ALL_BUT_ONE,
            force: false,
            output_dir: PathBuf::from("output"),
            timeout_secs: None,
            sources: Vec::new(),
            write_parquet: false,
            universe_id: None,
        }
    }
}

/// `[executor]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutorSettings {
    /// Program and arguments; placeholders are expanded per universe
    pub command: Vec<String>,
    /// Extra environment variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl MultiverseConfig {
    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns error on syntax errors or an invalid dimension set
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document.
    ///
    /// # Errors
    ///
    /// Returns error on syntax errors or an invalid dimension set
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path`; the format follows the extension (`.toml` or `.json`).
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, has another extension, or
    /// is invalid
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        debug!(path = %path.display(), "loading configuration");
        let parsed = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&text),
            Some("json") => Self::from_json_str(&text),
            _ => {
                return Err(Error::config(format!(
                    "{}: unsupported config format (use .toml or .json)",
                    path.display()
                )))
            }
        };
        parsed.map_err(|e| match e {
            Error::Config(msg) => Error::config(format!("{}: {msg}", path.display())),
            Error::Toml(e) => Error::config(format!("{}: {e}", path.display())),
            Error::Json(e) => Error::config(format!("{}: {e}", path.display())),
            other => other,
        })
    }

    /// First of [`DEFAULT_CONFIG_FILES`] present in `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if none exists
    pub fn discover<P: AsRef<Path>>(dir: P) -> Result<PathBuf> {
        let dir = dir.as_ref();
        DEFAULT_CONFIG_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|p| p.is_file())
            .ok_or_else(|| {
                Error::config(format!(
                    "no config file given and none of {} found in {}",
                    DEFAULT_CONFIG_FILES.join(", "),
                    dir.display()
                ))
            })
    }

    /// Check everything that can be checked before running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem
    pub fn validate(&self) -> Result<()> {
        self.constraints.validate(&self.dimensions)?;
        self.run_mode()?;
        self.parallelism()?;
        self.timeout()?;
        if let Some(executor) = &self.executor {
            CommandExecutor::new(executor.command.iter().cloned())?;
        }
        Ok(())
    }

    /// The run mode, with its partial range or finalize sources resolved.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `partial-parallel` lacks a valid range
    pub fn run_mode(&self) -> Result<RunMode> {
        Ok(match self.run.mode {
            ModeName::FullParallel => RunMode::Full,
            ModeName::PartialParallel => {
                let raw = self.run.partial.as_deref().ok_or_else(|| {
                    Error::config("mode partial-parallel requires a partial range (\"start%,end%\")")
                })?;
                RunMode::Partial(PartialRange::parse(raw)?)
            }
            ModeName::Finalize => RunMode::Finalize {
                sources: self.run.sources.clone(),
            },
            ModeName::Test => RunMode::Test,
        })
    }

    /// Worker pool size from `n_jobs`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for `0` and values below `-1`
    pub fn parallelism(&self) -> Result<Parallelism> {
        Parallelism::from_n_jobs(self.run.n_jobs)
    }

    /// Per-universe timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] unless the value is a positive number of
    /// seconds
    pub fn timeout(&self) -> Result<Option<Duration>> {
        self.run
            .timeout_secs
            .map(|secs| {
                Duration::try_from_secs_f64(secs)
                    .ok()
                    .filter(|d| !d.is_zero())
                    .ok_or_else(|| Error::config(format!("invalid timeout_secs {secs}")))
            })
            .transpose()
    }

    /// Enumerate the (constrained) universe grid.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for dangling constraint references
    pub fn grid(&self) -> Result<UniverseGrid> {
        UniverseGrid::with_constraints(&self.dimensions, &self.constraints)
    }

    /// Subprocess executor from `[executor]`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the table is missing or its command empty
    pub fn command_executor(&self) -> Result<CommandExecutor> {
        let settings = self
            .executor
            .as_ref()
            .ok_or_else(|| Error::config("an [executor] command is required to run universes"))?;
        Ok(CommandExecutor::new(settings.command.iter().cloned())?.with_env(settings.env.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimension::DimensionValue;

    const TOML: &str = r#"
[dimensions]
scaler = ["StandardScaler", "MinMaxScaler"]
model = ["logreg", "rf", "svm"]
alpha = [0.1, 1.0]

[[constraints.scaler]]
value = "MinMaxScaler"
forbidden_if = { model = "svm" }

[run]
mode = "partial-parallel"
partial = "0%,50%"
n_jobs = 2
timeout_secs = 30

[executor]
command = ["python", "universe.py", "{settings}"]
env = { PYTHONHASHSEED = "0" }
"#;

    #[test]
    fn test_parse_toml() {
        let config = MultiverseConfig::from_toml_str(TOML).unwrap();
        let names: Vec<&str> = config.dimensions.names().collect();
        assert_eq!(names, ["scaler", "model", "alpha"]);
        assert_eq!(
            config.dimensions.get("alpha").unwrap().options()[1],
            DimensionValue::Float(1.0)
        );
        assert_eq!(config.parallelism().unwrap().get(), 2);
        assert_eq!(config.timeout().unwrap(), Some(Duration::from_secs(30)));
        assert_eq!(
            config.run_mode().unwrap(),
            RunMode::Partial(PartialRange::parse("0%,50%").unwrap())
        );
        // 2 * 3 * 2 minus the two MinMaxScaler/svm universes
        assert_eq!(config.grid().unwrap().len(), 10);
        let exec = config.command_executor().unwrap();
        assert_eq!(exec.program(), "python");
    }

    #[test]
    fn test_parse_json_defaults() {
        let config =
            MultiverseConfig::from_json_str(r#"{"dimensions": {"b": [1, 2], "a": [true]}}"#)
                .unwrap();
        let names: Vec<&str> = config.dimensions.names().collect();
        assert_eq!(names, ["b", "a"]);
        assert_eq!(config.run, RunSettings::default());
        assert_eq!(config.run_mode().unwrap(), RunMode::Full);
        assert!(config.command_executor().is_err());
    }

    #[test]
    fn test_invalid_configs() {
        let cases = [
            "[dimensions]\n",
            "[dimensions]\nx = []\n",
            "[dimensions]\nx = [1, 1]\n",
            "[dimensions]\nx = [1]\n[run]\nmode = \"partial-parallel\"\n",
            "[dimensions]\nx = [1]\n[run]\nn_jobs = 0\n",
            "[dimensions]\nx = [1]\n[run]\nmode = \"continue\"\n",
            "[dimensions]\nx = [1]\n[run]\ntimeout_secs = -5\n",
            "[dimensions]\nx = [1]\n[executor]\ncommand = []\n",
            "[dimensions]\nx = [1]\n[[constraints.y]]\nvalue = 1\n",
            "[dimensions]\nx = [1]\n[unknown]\n",
        ];
        for case in cases {
            assert!(MultiverseConfig::from_toml_str(case).is_err(), "{case}");
        }
    }

    #[test]
    fn test_from_path_and_discover() {
        let dir = tempfile::tempdir().unwrap();
        assert!(MultiverseConfig::discover(dir.path()).is_err());

        let json = dir.path().join("multiverse.json");
        fs::write(&json, r#"{"dimensions": {"x": ["a"]}}"#).unwrap();
        assert_eq!(MultiverseConfig::discover(dir.path()).unwrap(), json);

        let toml_path = dir.path().join("multiverse.toml");
        fs::write(&toml_path, TOML).unwrap();
        assert_eq!(MultiverseConfig::discover(dir.path()).unwrap(), toml_path);
        assert!(MultiverseConfig::from_path(&toml_path).is_ok());

        let yaml = dir.path().join("multiverse.yaml");
        fs::write(&yaml, "dimensions: {}").unwrap();
        assert!(matches!(
            MultiverseConfig::from_path(&yaml),
            Err(Error::Config(_))
        ));
    }
}
