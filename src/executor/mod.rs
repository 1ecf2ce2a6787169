//! Execution Unit Adapter
//!
//! The boundary to the opaque analysis procedure. A [`UnitExecutor`] runs
//! the procedure for one universe and leaves a CSV file at the staging path
//! it was given; the [`ExecutionAdapter`] owns everything around that call:
//! the private working directory, the timeout, artifact publication, and
//! turning failures into [`ExecutionError`] values.
//!
//! Failures are data, never panics or early returns: one universe's failure
//! must not abort the batch.
//!
//! ```text
//! ExecutionAdapter::execute(universe)
//!   ├─ .work/<short-id>-XXXX/          private temp dir (TMPDIR for the procedure)
//!   ├─ UnitExecutor::execute(invocation)
//!   │     └─ writes .work/<short-id>-XXXX/<identity>.csv
//!   └─ ArtifactStore::publish          sidecar, then rename into data/
//! ```

mod adapter;
mod command;

pub use adapter::ExecutionAdapter;
pub use command::CommandExecutor;

use std::fmt;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

use crate::control::CancelToken;
use crate::universe::{Universe, UniverseId};

/// Everything an executor needs to run one universe.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    /// Universe to run
    pub universe: &'a Universe,
    /// Where the procedure must write its CSV output
    pub artifact_path: &'a Path,
    /// Private working directory, removed after the call
    pub work_dir: &'a Path,
    /// Log file for the procedure's stdout/stderr
    pub log_path: &'a Path,
    /// Per-universe time budget
    pub timeout: Option<Duration>,
    /// Batch-level cancellation
    pub cancel: &'a CancelToken,
}

impl Invocation<'_> {
    /// Parameter set handed to the procedure.
    ///
    /// ```text
    /// {"universe_id", "universe_index", "dimensions": {...}, "seed", "artifact_path"}
    /// ```
    #[must_use]
    pub fn settings(&self) -> serde_json::Value {
        let dimensions: serde_json::Map<String, serde_json::Value> = self
            .universe
            .values()
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        serde_json::json!({
            "universe_id": self.universe.id().as_str(),
            "universe_index": self.universe.index(),
            "dimensions": dimensions,
            "seed": self.universe.seed(),
            "artifact_path": self.artifact_path.display().to_string(),
        })
    }
}

/// Runs the analysis procedure for one universe.
///
/// Implementations must block until the procedure finished, failed, timed out
/// or was cancelled, and must not touch anything outside the paths in the
/// [`Invocation`].
pub trait UnitExecutor: Send + Sync {
    /// Run the procedure. `Ok(())` means it reported success; the adapter
    /// still checks that the artifact exists.
    ///
    /// # Errors
    ///
    /// Returns an [`ExecutionFailure`] describing why the procedure failed.
    fn execute(&self, invocation: &Invocation<'_>) -> Result<(), ExecutionFailure>;
}

impl<F> UnitExecutor for F
where
    F: Fn(&Invocation<'_>) -> Result<(), ExecutionFailure> + Send + Sync,
{
    fn execute(&self, invocation: &Invocation<'_>) -> Result<(), ExecutionFailure> {
        self(invocation)
    }
}

/// Why a universe's execution failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionErrorKind {
    /// The procedure signalled failure (non-zero exit, killed by signal)
    ProcedureFailed {
        /// Exit code, `None` if terminated by a signal
        exit_code: Option<i32>,
    },
    /// The procedure exceeded its time budget and was killed
    Timeout {
        /// Budget that was exceeded
        limit: Duration,
    },
    /// Killed by a batch-level cancellation
    Interrupted,
    /// The procedure could not be started
    Spawn,
    /// Reported success but left no artifact
    MissingArtifact,
    /// Working directory or publication I/O failed
    Io,
}

impl fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProcedureFailed {
                exit_code: Some(code),
            } => write!(f, "procedure failed with exit code {code}"),
            Self::ProcedureFailed { exit_code: None } => {
                f.write_str("procedure terminated by signal")
            }
            Self::Timeout { limit } => write!(f, "timed out after {:.1}s", limit.as_secs_f64()),
            Self::Interrupted => f.write_str("interrupted"),
            Self::Spawn => f.write_str("procedure could not be started"),
            Self::MissingArtifact => f.write_str("procedure succeeded but wrote no artifact"),
            Self::Io => f.write_str("I/O failure"),
        }
    }
}

/// Failure reported by a [`UnitExecutor`], before it is tied to a universe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionFailure {
    /// Failure kind
    pub kind: ExecutionErrorKind,
    /// Captured diagnostic output
    pub diagnostics: String,
}

impl ExecutionFailure {
    /// New failure.
    pub fn new(kind: ExecutionErrorKind, diagnostics: impl Into<String>) -> Self {
        Self {
            kind,
            diagnostics: diagnostics.into(),
        }
    }

    /// Shorthand for a failed procedure with the given exit code.
    pub fn exit(code: i32, diagnostics: impl Into<String>) -> Self {
        Self::new(
            ExecutionErrorKind::ProcedureFailed {
                exit_code: Some(code),
            },
            diagnostics,
        )
    }
}

/// Per-universe execution error. Recorded on the universe's outcome; never
/// interrupts sibling executions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("universe {identity}: {kind}")]
pub struct ExecutionError {
    identity: UniverseId,
    kind: ExecutionErrorKind,
    diagnostics: String,
}

impl ExecutionError {
    /// New error for `identity`.
    pub fn new(identity: UniverseId, kind: ExecutionErrorKind, diagnostics: impl Into<String>) -> Self {
        Self {
            identity,
            kind,
            diagnostics: diagnostics.into(),
        }
    }

    /// Attach a universe to an executor failure.
    #[must_use]
    pub fn from_failure(identity: UniverseId, failure: ExecutionFailure) -> Self {
        Self::new(identity, failure.kind, failure.diagnostics)
    }

    /// Universe identity.
    #[must_use]
    pub const fn identity(&self) -> &UniverseId {
        &self.identity
    }

    /// Failure kind.
    #[must_use]
    pub const fn kind(&self) -> &ExecutionErrorKind {
        &self.kind
    }

    /// Captured output (tail of the procedure log, or the I/O error).
    #[must_use]
    pub fn diagnostics(&self) -> &str {
        &self.diagnostics
    }

    /// True for timeouts.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self.kind, ExecutionErrorKind::Timeout { .. })
    }
}
