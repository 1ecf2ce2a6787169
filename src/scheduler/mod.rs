//! Scheduler
//!
//! Drives one invocation end to end:
//!
//! ```text
//! run(mode)
//!   ├─ Finalize ──────────────────────────────► aggregate::finalize(sources)
//!   └─ Full | Partial | Test
//!        ├─ write multiverse_grid.json
//!        ├─ select        (mode slice, optional id prefix)
//!        ├─ resume filter (artifact exists && !force  =>  skipped)
//!        ├─ dispatch      (rayon pool of `parallelism` workers)
//!        ├─ collect       (Pending -> Dispatched -> Completed | Failed)
//!        └─ aggregate     (aggregated_outputs.csv)
//! ```
//!
//! No retries: a failed universe stays failed for this invocation and is
//! re-attempted by the next one, because only completed universes leave an
//! artifact behind.

mod mode;
mod summary;

pub use mode::{ModeName, Parallelism, PartialRange, RunMode};
pub use summary::{ExecutionTimes, MissingReport, RunReport, RunSummary};

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use crate::aggregate::{self, AggregationReport};
use crate::artifact::{write_atomic, ArtifactRecord, ArtifactStore};
use crate::control::CancelToken;
use crate::executor::{ExecutionAdapter, ExecutionError, UnitExecutor};
use crate::universe::{Universe, UniverseGrid, UniverseId, UniverseRun};
use crate::{Error, Result};

/// Grid manifest written at the start of every executing run.
pub const GRID_MANIFEST: &str = "multiverse_grid.json";

/// Consolidated CSV output.
pub const AGGREGATED_CSV: &str = "aggregated_outputs.csv";

/// Consolidated Parquet output.
pub const AGGREGATED_PARQUET: &str = "aggregated_outputs.parquet";

/// Enumerates, selects, dispatches and aggregates universes.
///
/// # Example
///
/// ```rust
/// use trueno_multiverse::dimension::DimensionSet;
/// use trueno_multiverse::executor::{ExecutionFailure, Invocation};
/// use trueno_multiverse::scheduler::{Parallelism, RunMode, Scheduler};
/// use trueno_multiverse::universe::UniverseGrid;
///
/// fn analysis(inv: &Invocation<'_>) -> Result<(), ExecutionFailure> {
///     std::fs::write(inv.artifact_path, format!("seed\n{}\n", inv.universe.seed()))
///         .map_err(|e| ExecutionFailure::new(trueno_multiverse::executor::ExecutionErrorKind::Io, e.to_string()))
/// }
///
/// let dims = DimensionSet::builder()
///     .dimension("scaler", ["A", "B"])
///     .dimension("model", ["X", "Y", "Z"])
///     .build()?;
/// let out = tempfile::tempdir()?;
/// let scheduler = Scheduler::new(UniverseGrid::enumerate(&dims), analysis, out.path())
///     .with_parallelism(Parallelism::new(2));
///
/// let report = scheduler.run(&RunMode::Full)?;
/// assert!(report.is_success());
/// assert_eq!(report.aggregation.dataset.num_rows(), 6);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug)]
pub struct Scheduler<E> {
    grid: UniverseGrid,
    adapter: ExecutionAdapter<E>,
    parallelism: Parallelism,
    force: bool,
    cancel: CancelToken,
    universe_prefix: Option<String>,
    write_parquet: bool,
}

impl<E: UnitExecutor> Scheduler<E> {
    /// Scheduler over `grid` writing into `output_dir`.
    pub fn new(grid: UniverseGrid, executor: E, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            grid,
            adapter: ExecutionAdapter::new(executor, ArtifactStore::new(output_dir)),
            parallelism: Parallelism::default(),
            force: false,
            cancel: CancelToken::new(),
            universe_prefix: None,
            write_parquet: false,
        }
    }

    /// Worker pool size.
    #[must_use]
    pub const fn with_parallelism(mut self, parallelism: Parallelism) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Re-run universes whose artifact already exists.
    #[must_use]
    pub const fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Per-universe time budget.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.adapter = self.adapter.with_timeout(timeout);
        self
    }

    /// Token that stops the batch when cancelled.
    #[must_use]
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Restrict execution to the one universe whose identity starts with
    /// `prefix`.
    #[must_use]
    pub fn with_universe_prefix(mut self, prefix: Option<String>) -> Self {
        self.universe_prefix = prefix;
        self
    }

    /// Also write `aggregated_outputs.parquet`.
    #[must_use]
    pub const fn with_parquet(mut self, enabled: bool) -> Self {
        self.write_parquet = enabled;
        self
    }

    /// The enumerated grid.
    #[must_use]
    pub const fn grid(&self) -> &UniverseGrid {
        &self.grid
    }

    /// The output directory.
    #[must_use]
    pub const fn store(&self) -> &ArtifactStore {
        self.adapter.store()
    }

    /// Configured worker count.
    #[must_use]
    pub const fn parallelism(&self) -> Parallelism {
        self.parallelism
    }

    /// Run one invocation in `mode`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an unmatched universe prefix and I/O
    /// errors on the output directory. Failing universes and unparsable
    /// artifacts are reported in the [`RunReport`], not as errors.
    pub fn run(&self, mode: &RunMode) -> Result<RunReport> {
        info!(mode = %mode, universes = self.grid.len(), output = %self.store().root().display(), "starting run");

        let all = self.grid.universes();
        let slice: Vec<&Universe> = match mode {
            RunMode::Finalize { sources } => {
                return finalize(self.store(), sources, self.write_parquet);
            }
            RunMode::Full => all.iter().collect(),
            RunMode::Partial(range) => {
                let bounds = range.bounds(all.len());
                info!(range = %range, start = bounds.start, end = bounds.end, "partial slice");
                all[bounds].iter().collect()
            }
            RunMode::Test => match all {
                [] => Vec::new(),
                [only] => vec![only],
                [first, .., last] => vec![first, last],
            },
        };

        self.store().ensure()?;
        self.write_manifest()?;
        let selected = self.narrow_to_prefix(slice)?;
        let summary = self.execute(&selected)?;
        info!(
            completed = summary.completed(),
            skipped = summary.skipped(),
            failed = summary.failed(),
            pending = summary.pending(),
            "execution finished"
        );

        let missing = self.check_missing()?;
        let aggregation = aggregate::aggregate(self.store());
        write_outputs(self.store().root(), &aggregation, self.write_parquet)?;

        Ok(RunReport {
            mode: mode.clone(),
            summary: Some(summary),
            missing: Some(missing),
            aggregation,
        })
    }

    /// A configured universe prefix replaces the mode's slice with the one
    /// matching universe.
    fn narrow_to_prefix<'g>(&'g self, slice: Vec<&'g Universe>) -> Result<Vec<&'g Universe>> {
        let Some(prefix) = &self.universe_prefix else {
            return Ok(slice);
        };
        let universe = self.grid.find_by_prefix(prefix)?;
        info!(universe = %universe.id(), "running a single universe");
        Ok(vec![universe])
    }

    /// Run `universes`, skipping those with an artifact unless forced.
    ///
    /// # Errors
    ///
    /// Returns error if the worker pool cannot be built
    pub fn execute(&self, universes: &[&Universe]) -> Result<RunSummary> {
        let mut runs: Vec<UniverseRun> = universes.iter().map(|u| UniverseRun::new(u)).collect();

        let mut pending = Vec::new();
        for (run, universe) in runs.iter_mut().zip(universes) {
            if !self.force && self.store().has_artifact(universe.id()) {
                debug!(universe = %universe.id().short(), "artifact exists, skipping");
                run.skip()?;
            } else {
                pending.push((run, *universe));
            }
        }

        let total = pending.len();
        info!(
            dispatch = total,
            skipped = universes.len() - total,
            workers = self.parallelism.get(),
            "dispatching universes"
        );

        let done = AtomicUsize::new(0);
        let work = |(run, universe): &mut (&mut UniverseRun, &Universe)| -> Result<()> {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            run.dispatch()?;
            let outcome = self.adapter.execute(universe, &self.cancel);
            let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
            record(run, outcome, finished, total)
        };

        if self.parallelism.is_sequential() || total <= 1 {
            pending.iter_mut().try_for_each(work)?;
        } else {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.parallelism.get())
                .thread_name(|i| format!("universe-worker-{i}"))
                .build()
                .map_err(|e| Error::Other(format!("failed to build worker pool: {e}")))?;
            pool.install(|| pending.par_iter_mut().with_max_len(1).try_for_each(work))?;
        }

        if self.cancel.is_cancelled() {
            warn!("run interrupted, unstarted universes left pending");
        }
        Ok(RunSummary::new(runs))
    }

    /// Grid identities vs. artifacts currently in the output directory.
    ///
    /// # Errors
    ///
    /// Returns error if the artifact directory cannot be read
    pub fn check_missing(&self) -> Result<MissingReport> {
        let expected: BTreeSet<UniverseId> =
            self.grid.universes().iter().map(|u| u.id().clone()).collect();
        let report = MissingReport::compare(&expected, &self.store().identities()?);
        if !report.missing.is_empty() {
            warn!(count = report.missing.len(), "universes without artifact");
        }
        if !report.extra.is_empty() {
            warn!(count = report.extra.len(), "artifacts not belonging to the current grid");
        }
        Ok(report)
    }

    fn write_manifest(&self) -> Result<()> {
        let path = self.store().root().join(GRID_MANIFEST);
        write_atomic(&path, &serde_json::to_vec_pretty(&self.grid.manifest())?)?;
        debug!(path = %path.display(), "grid manifest written");
        Ok(())
    }
}

/// Aggregation-only pass: merge `sources` (or `output` itself when empty)
/// and write the consolidated files into `output`. Needs no executor.
///
/// # Errors
///
/// Returns error if the consolidated files cannot be written
pub fn finalize(output: &ArtifactStore, sources: &[PathBuf], write_parquet: bool) -> Result<RunReport> {
    let stores: Vec<ArtifactStore> = if sources.is_empty() {
        vec![output.clone()]
    } else {
        sources.iter().cloned().map(ArtifactStore::new).collect()
    };
    info!(sources = stores.len(), "finalizing");
    let aggregation = aggregate::finalize(&stores);
    write_outputs(output.root(), &aggregation, write_parquet)?;
    Ok(RunReport {
        mode: RunMode::Finalize {
            sources: sources.to_vec(),
        },
        summary: None,
        missing: None,
        aggregation,
    })
}

fn write_outputs(root: &Path, aggregation: &AggregationReport, write_parquet: bool) -> Result<()> {
    let csv = root.join(AGGREGATED_CSV);
    aggregation.dataset.write_csv(&csv)?;
    if write_parquet {
        aggregation.dataset.write_parquet(root.join(AGGREGATED_PARQUET))?;
    }
    info!(rows = aggregation.dataset.num_rows(), path = %csv.display(), "aggregated output written");
    Ok(())
}

fn record(
    run: &mut UniverseRun,
    outcome: std::result::Result<ArtifactRecord, ExecutionError>,
    finished: usize,
    total: usize,
) -> Result<()> {
    match outcome {
        Ok(artifact) => {
            info!(progress = %format!("{finished}/{total}"), universe = %run.universe_id().short(), "universe done");
            run.complete(artifact)
        }
        Err(err) => {
            error!(progress = %format!("{finished}/{total}"), error = %err, "universe failed");
            run.fail(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimension::DimensionSet;
    use crate::executor::{ExecutionFailure, Invocation};

    fn grid() -> UniverseGrid {
        let dims = DimensionSet::builder()
            .dimension("scaler", ["A", "B"])
            .dimension("model", ["X", "Y", "Z"])
            .build()
            .unwrap();
        UniverseGrid::enumerate(&dims)
    }

    fn write_seed(inv: &Invocation<'_>) -> std::result::Result<(), ExecutionFailure> {
        std::fs::write(inv.artifact_path, format!("seed\n{}\n", inv.universe.seed())).unwrap();
        Ok(())
    }

    fn executed(dir: &Path) -> Vec<usize> {
        let store = ArtifactStore::new(dir);
        let mut out: Vec<usize> = grid()
            .universes()
            .iter()
            .filter(|u| store.has_artifact(u.id()))
            .map(Universe::index)
            .collect();
        out.sort_unstable();
        out
    }

    #[test]
    fn test_modes_select_slices() {
        let cases = [
            (RunMode::Full, vec![0, 1, 2, 3, 4, 5]),
            (RunMode::Partial(PartialRange::parse("0%,50%").unwrap()), vec![0, 1, 2]),
            (RunMode::Partial(PartialRange::parse("50%,100%").unwrap()), vec![3, 4, 5]),
            (RunMode::Test, vec![0, 5]),
        ];
        for (mode, expected) in cases {
            let dir = tempfile::tempdir().unwrap();
            let s = Scheduler::new(grid(), write_seed, dir.path());
            let report = s.run(&mode).unwrap();
            assert_eq!(report.summary.unwrap().total(), expected.len(), "{mode}");
            assert_eq!(executed(dir.path()), expected, "{mode}");
        }
    }

    #[test]
    fn test_finalize_executes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let s = Scheduler::new(grid(), write_seed, dir.path());
        let report = s.run(&RunMode::Finalize { sources: vec![] }).unwrap();
        assert!(report.summary.is_none());
        assert!(executed(dir.path()).is_empty());
    }

    #[test]
    fn test_prefix_overrides_mode_slice() {
        let dir = tempfile::tempdir().unwrap();
        let g = grid();
        let target = g.universes()[4].id().as_str()[..16].to_string();
        let s = Scheduler::new(g, write_seed, dir.path()).with_universe_prefix(Some(target));
        let first_half = RunMode::Partial(PartialRange::parse("0%,50%").unwrap());
        s.run(&first_half).unwrap();
        assert_eq!(executed(dir.path()), [4]);

        let s = s.with_universe_prefix(Some("zz".into()));
        assert!(matches!(s.run(&RunMode::Full), Err(Error::Config(_))));
    }

    #[test]
    fn test_run_writes_manifest_and_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let s = Scheduler::new(grid(), write_seed, dir.path())
            .with_parallelism(Parallelism::sequential())
            .with_parquet(true);
        let report = s.run(&RunMode::Full).unwrap();
        assert_eq!(report.exit_code(), 0);
        assert!(dir.path().join(GRID_MANIFEST).is_file());
        assert!(dir.path().join(AGGREGATED_CSV).is_file());
        assert!(dir.path().join(AGGREGATED_PARQUET).is_file());
        assert!(report.missing.unwrap().is_complete());
    }

    #[test]
    fn test_cancelled_before_dispatch_leaves_pending() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let s = Scheduler::new(grid(), write_seed, dir.path()).with_cancel_token(cancel);
        let report = s.run(&RunMode::Full).unwrap();
        let summary = report.summary.as_ref().unwrap();
        assert_eq!(summary.pending(), 6);
        assert_eq!(report.exit_code(), 1);
    }
}
