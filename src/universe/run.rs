//! Universe Run - lifecycle of one universe within one invocation

use std::fmt;

use chrono::{DateTime, Utc};

use super::{Universe, UniverseId};
use crate::artifact::ArtifactRecord;
use crate::executor::ExecutionError;
use crate::{Error, Result};

/// State of a universe within one scheduler invocation.
///
/// ```text
/// Pending ──> Skipped                      (artifact already present)
///    └──────> Dispatched ──> Completed
///                       └──> Failed
/// ```
///
/// `Skipped`, `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniverseState {
    /// Selected, not yet decided.
    Pending,
    /// Artifact already existed; not executed.
    Skipped,
    /// Handed to a worker.
    Dispatched,
    /// Artifact written.
    Completed,
    /// Execution error recorded.
    Failed,
}

impl UniverseState {
    /// True for `Skipped`, `Completed` and `Failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Skipped | Self::Completed | Self::Failed)
    }
}

impl fmt::Display for UniverseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Skipped => "skipped",
            Self::Dispatched => "dispatched",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Outcome record of one universe in one invocation. Kept in memory only;
/// the artifact on disk is the durable completion record.
#[derive(Debug, Clone)]
pub struct UniverseRun {
    universe_id: UniverseId,
    index: usize,
    state: UniverseState,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    artifact: Option<ArtifactRecord>,
    error: Option<ExecutionError>,
}

impl UniverseRun {
    /// New run in `Pending` state.
    #[must_use]
    pub fn new(universe: &Universe) -> Self {
        Self {
            universe_id: universe.id().clone(),
            index: universe.index(),
            state: UniverseState::Pending,
            started_at: None,
            ended_at: None,
            artifact: None,
            error: None,
        }
    }

    /// Universe identity.
    #[must_use]
    pub const fn universe_id(&self) -> &UniverseId {
        &self.universe_id
    }

    /// Universe index in the grid.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> UniverseState {
        self.state
    }

    /// When the universe was dispatched.
    #[must_use]
    pub const fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// When the universe reached a terminal state after dispatch.
    #[must_use]
    pub const fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Artifact written by this run, if completed.
    #[must_use]
    pub const fn artifact(&self) -> Option<&ArtifactRecord> {
        self.artifact.as_ref()
    }

    /// Error recorded by this run, if failed.
    #[must_use]
    pub const fn error(&self) -> Option<&ExecutionError> {
        self.error.as_ref()
    }

    /// `Pending -> Skipped`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTransition`] from any other state.
    pub fn skip(&mut self) -> Result<()> {
        self.transition(UniverseState::Pending, UniverseState::Skipped)
    }

    /// `Pending -> Dispatched`, stamping `started_at`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTransition`] from any other state.
    pub fn dispatch(&mut self) -> Result<()> {
        self.transition(UniverseState::Pending, UniverseState::Dispatched)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// `Dispatched -> Completed`, stamping `ended_at`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTransition`] from any other state.
    pub fn complete(&mut self, artifact: ArtifactRecord) -> Result<()> {
        self.transition(UniverseState::Dispatched, UniverseState::Completed)?;
        self.ended_at = Some(Utc::now());
        self.artifact = Some(artifact);
        Ok(())
    }

    /// `Dispatched -> Failed`, stamping `ended_at`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTransition`] from any other state.
    pub fn fail(&mut self, error: ExecutionError) -> Result<()> {
        self.transition(UniverseState::Dispatched, UniverseState::Failed)?;
        self.ended_at = Some(Utc::now());
        self.error = Some(error);
        Ok(())
    }

    fn transition(&mut self, from: UniverseState, to: UniverseState) -> Result<()> {
        if self.state != from {
            return Err(Error::InvalidTransition {
                identity: self.universe_id.to_string(),
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        self.state = to;
        Ok(())
    }
}
