use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::{ExecutionError, ExecutionErrorKind, ExecutionFailure, Invocation, UnitExecutor};
use crate::artifact::{ArtifactRecord, ArtifactStore};
use crate::control::CancelToken;
use crate::universe::Universe;

/// Runs one universe through a [`UnitExecutor`] and publishes its artifact.
#[derive(Debug)]
pub struct ExecutionAdapter<E> {
    executor: E,
    store: ArtifactStore,
    timeout: Option<Duration>,
}

impl<E: UnitExecutor> ExecutionAdapter<E> {
    /// Adapter writing into `store`.
    pub const fn new(executor: E, store: ArtifactStore) -> Self {
        Self {
            executor,
            store,
            timeout: None,
        }
    }

    /// Per-universe time budget passed to the executor.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Artifact store this adapter publishes into.
    #[must_use]
    pub const fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Configured timeout.
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Execute `universe` and publish its artifact.
    ///
    /// The private working directory is removed afterwards regardless of the
    /// outcome. On success exactly one artifact exists at
    /// `data/<identity>.csv`, overwriting any previous one.
    ///
    /// # Errors
    ///
    /// Returns an [`ExecutionError`] when the procedure fails, times out, is
    /// interrupted, leaves no artifact, or publication fails.
    pub fn execute(
        &self,
        universe: &Universe,
        cancel: &CancelToken,
    ) -> Result<ArtifactRecord, ExecutionError> {
        let id = universe.id();
        let io_error = |e: std::io::Error| {
            ExecutionError::new(id.clone(), ExecutionErrorKind::Io, e.to_string())
        };

        let work_root = self.store.work_dir();
        fs::create_dir_all(&work_root).map_err(io_error)?;
        fs::create_dir_all(self.store.logs_dir()).map_err(io_error)?;
        let work_dir = tempfile::Builder::new()
            .prefix(&format!("{}-", id.short()))
            .tempdir_in(&work_root)
            .map_err(io_error)?;

        let staged = work_dir.path().join(format!("{id}.csv"));
        let log_path = self.store.log_path(id);
        let invocation = Invocation {
            universe,
            artifact_path: &staged,
            work_dir: work_dir.path(),
            log_path: &log_path,
            timeout: self.timeout,
            cancel,
        };

        debug!(universe = %id.short(), index = universe.index(), "executing universe");
        let started = Instant::now();
        self.executor
            .execute(&invocation)
            .map_err(|failure| ExecutionError::from_failure(id.clone(), failure))?;
        let elapsed = started.elapsed().as_secs_f64();

        let record = self
            .publish(universe, &staged, elapsed)
            .map_err(|failure| ExecutionError::from_failure(id.clone(), failure))?;
        info!(
            universe = %id.short(),
            index = universe.index(),
            secs = elapsed,
            "universe completed"
        );

        if let Err(e) = work_dir.close() {
            warn!(universe = %id.short(), error = %e, "failed to remove working directory");
        }
        Ok(record)
    }

    fn publish(
        &self,
        universe: &Universe,
        staged: &Path,
        elapsed: f64,
    ) -> Result<ArtifactRecord, ExecutionFailure> {
        if !staged.is_file() {
            return Err(ExecutionFailure::new(
                ExecutionErrorKind::MissingArtifact,
                format!("expected artifact at {}", staged.display()),
            ));
        }
        let io = |e: crate::Error| ExecutionFailure::new(ExecutionErrorKind::Io, e.to_string());

        let bytes = fs::read(staged).map_err(|e| io(e.into()))?;
        let record = ArtifactRecord::new(universe, &bytes, elapsed);
        self.store.publish(&record, staged).map_err(io)?;
        Ok(record)
    }
}
