//! Run summary - per-universe outcomes of one invocation

use std::collections::BTreeSet;
use std::fmt;

use crate::aggregate::AggregationReport;
use crate::artifact::ArtifactRecord;
use crate::executor::ExecutionError;
use crate::universe::{UniverseId, UniverseRun, UniverseState};

use super::RunMode;

/// Wall-clock statistics over the universes executed by one run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutionTimes {
    /// Universes measured.
    pub count: usize,
    /// Sum of execution times in seconds.
    pub total_secs: f64,
    /// Mean execution time in seconds.
    pub mean_secs: f64,
    /// Fastest universe in seconds.
    pub min_secs: f64,
    /// Slowest universe in seconds.
    pub max_secs: f64,
}

impl fmt::Display for ExecutionTimes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "avg {:.2}s (min {:.2}s; max {:.2}s), total {:.2}s",
            self.mean_secs, self.min_secs, self.max_secs, self.total_secs
        )
    }
}

/// Outcomes of every selected universe, in grid order.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    runs: Vec<UniverseRun>,
}

impl RunSummary {
    /// Summary over `runs`.
    #[must_use]
    pub fn new(mut runs: Vec<UniverseRun>) -> Self {
        runs.sort_by_key(UniverseRun::index);
        Self { runs }
    }

    /// All runs.
    #[must_use]
    pub fn runs(&self) -> &[UniverseRun] {
        &self.runs
    }

    /// Number of selected universes.
    #[must_use]
    pub fn total(&self) -> usize {
        self.runs.len()
    }

    fn count(&self, state: UniverseState) -> usize {
        self.runs.iter().filter(|r| r.state() == state).count()
    }

    /// Universes executed successfully in this invocation.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.count(UniverseState::Completed)
    }

    /// Universes whose artifact already existed.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count(UniverseState::Skipped)
    }

    /// Universes that failed (including timeouts and interrupts).
    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(UniverseState::Failed)
    }

    /// Universes never dispatched because the batch was cancelled.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.count(UniverseState::Pending)
    }

    /// Execution errors in grid order.
    #[must_use]
    pub fn failures(&self) -> Vec<&ExecutionError> {
        self.runs.iter().filter_map(UniverseRun::error).collect()
    }

    /// Share of dispatched universes that completed, `None` if nothing ran.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> Option<f64> {
        let attempted = self.completed() + self.failed();
        (attempted > 0).then(|| self.completed() as f64 / attempted as f64)
    }

    /// Execution-time statistics over the universes completed by this run.
    /// Skipped universes were not timed and are left out.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn execution_times(&self) -> Option<ExecutionTimes> {
        let secs: Vec<f64> = self
            .runs
            .iter()
            .filter_map(UniverseRun::artifact)
            .map(ArtifactRecord::execution_secs)
            .collect();
        if secs.is_empty() {
            return None;
        }
        let total_secs: f64 = secs.iter().sum();
        Some(ExecutionTimes {
            count: secs.len(),
            total_secs,
            mean_secs: total_secs / secs.len() as f64,
            min_secs: secs.iter().copied().fold(f64::INFINITY, f64::min),
            max_secs: secs.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        })
    }

    /// True if every selected universe is completed or skipped.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.runs
            .iter()
            .all(|r| matches!(r.state(), UniverseState::Completed | UniverseState::Skipped))
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} universes: {} completed, {} skipped, {} failed",
            self.total(),
            self.completed(),
            self.skipped(),
            self.failed()
        )?;
        let pending = self.pending();
        if pending > 0 {
            write!(f, ", {pending} not started")?;
        }
        if let Some(rate) = self.success_rate() {
            write!(f, "\n  success rate: {:.1}%", rate * 100.0)?;
        }
        if let Some(times) = self.execution_times() {
            write!(f, "\n  execution time: {times}")?;
        }
        for err in self.failures() {
            write!(f, "\n  failed: {err}")?;
            if let Some(line) = err.diagnostics().lines().rev().find(|l| !l.trim().is_empty()) {
                write!(f, "\n    {}", line.trim())?;
            }
        }
        Ok(())
    }
}

/// Grid identities compared against the artifacts on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MissingReport {
    /// In the grid, no artifact
    pub missing: BTreeSet<UniverseId>,
    /// Artifact present, not in the grid (stale config or foreign run)
    pub extra: BTreeSet<UniverseId>,
}

impl MissingReport {
    /// Compare `expected` identities against `present` ones.
    #[must_use]
    pub fn compare(expected: &BTreeSet<UniverseId>, present: &BTreeSet<UniverseId>) -> Self {
        Self {
            missing: expected.difference(present).cloned().collect(),
            extra: present.difference(expected).cloned().collect(),
        }
    }

    /// True if the artifact directory matches the grid exactly.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty()
    }
}

/// Everything one invocation did.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Mode that ran
    pub mode: RunMode,
    /// Per-universe outcomes (`None` for finalize)
    pub summary: Option<RunSummary>,
    /// Grid vs. artifacts after execution (`None` for finalize)
    pub missing: Option<MissingReport>,
    /// Consolidated dataset and unmerged artifacts
    pub aggregation: AggregationReport,
}

impl RunReport {
    /// True when nothing failed, nothing was left unstarted and every
    /// artifact could be merged.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.summary.as_ref().map_or(true, RunSummary::is_success) && self.aggregation.is_clean()
    }

    /// Process exit status: `0` on success, `1` otherwise.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        u8::from(!self.is_success())
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "mode: {}", self.mode)?;
        if let Some(summary) = &self.summary {
            writeln!(f, "{summary}")?;
        }
        if let Some(missing) = &self.missing {
            if !missing.is_complete() {
                writeln!(
                    f,
                    "{} universes without artifact, {} artifacts not in grid",
                    missing.missing.len(),
                    missing.extra.len()
                )?;
            }
        }
        write!(f, "{}", self.aggregation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactRecord;
    use crate::dimension::DimensionSet;
    use crate::executor::ExecutionErrorKind;
    use crate::universe::UniverseGrid;

    fn grid() -> UniverseGrid {
        let dims = DimensionSet::builder()
            .dimension("x", [1, 2, 3, 4])
            .build()
            .unwrap();
        UniverseGrid::enumerate(&dims)
    }

    fn mixed_summary() -> RunSummary {
        let grid = grid();
        let us = grid.universes();
        let mut runs: Vec<UniverseRun> = us.iter().map(UniverseRun::new).collect();
        runs[0].skip().unwrap();
        runs[1].dispatch().unwrap();
        runs[1].complete(ArtifactRecord::new(&us[1], b"a\n", 1.5)).unwrap();
        runs[2].dispatch().unwrap();
        runs[2]
            .fail(ExecutionError::new(
                us[2].id().clone(),
                ExecutionErrorKind::ProcedureFailed { exit_code: Some(1) },
                "Traceback\nValueError: bad\n",
            ))
            .unwrap();
        runs.reverse();
        RunSummary::new(runs)
    }

    #[test]
    fn test_counts() {
        let summary = mixed_summary();
        assert_eq!(summary.total(), 4);
        assert_eq!(summary.completed(), 1);
        assert_eq!(summary.skipped(), 1);
        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.pending(), 1);
        assert_eq!(summary.failures().len(), 1);
        assert!(!summary.is_success());
        // sorted back into grid order
        assert_eq!(summary.runs()[0].index(), 0);
    }

    #[test]
    fn test_display_lists_failures() {
        let text = mixed_summary().to_string();
        assert!(text.starts_with("4 universes: 1 completed, 1 skipped, 1 failed, 1 not started"));
        assert!(text.contains("procedure failed with exit code 1"));
        assert!(text.contains("ValueError: bad"));
    }

    #[test]
    fn test_execution_times_over_completed_runs() {
        let grid = grid();
        let us = grid.universes();
        let mut runs: Vec<UniverseRun> = us.iter().map(UniverseRun::new).collect();
        for (run, secs) in runs.iter_mut().zip([0.5, 1.5, 4.0]) {
            run.dispatch().unwrap();
            let universe = &us[run.index()];
            run.complete(ArtifactRecord::new(universe, b"a\n", secs)).unwrap();
        }
        runs[3].skip().unwrap();
        let summary = RunSummary::new(runs);

        let times = summary.execution_times().unwrap();
        assert_eq!(times.count, 3);
        assert!((times.total_secs - 6.0).abs() < 1e-9);
        assert!((times.mean_secs - 2.0).abs() < 1e-9);
        assert!((times.min_secs - 0.5).abs() < 1e-9);
        assert!((times.max_secs - 4.0).abs() < 1e-9);
        assert_eq!(summary.success_rate(), Some(1.0));
        assert!(summary
            .to_string()
            .contains("execution time: avg 2.00s (min 0.50s; max 4.00s), total 6.00s"));
    }

    #[test]
    fn test_display_success_rate_and_times() {
        let summary = mixed_summary();
        assert_eq!(summary.success_rate(), Some(0.5));
        let text = summary.to_string();
        assert!(text.contains("success rate: 50.0%"));
        assert!(text.contains("execution time: avg 1.50s"));
    }

    #[test]
    fn test_nothing_executed_has_no_statistics() {
        let grid = grid();
        let mut runs: Vec<UniverseRun> = grid.universes().iter().map(UniverseRun::new).collect();
        runs.iter_mut().for_each(|r| r.skip().unwrap());
        let summary = RunSummary::new(runs);
        assert_eq!(summary.success_rate(), None);
        assert_eq!(summary.execution_times(), None);
        assert!(!summary.to_string().contains("execution time"));
    }

    #[test]
    fn test_empty_summary_is_success() {
        assert!(RunSummary::default().is_success());
    }

    #[test]
    fn test_missing_report() {
        let grid = grid();
        let ids: Vec<UniverseId> = grid.universes().iter().map(|u| u.id().clone()).collect();
        let expected: BTreeSet<_> = ids[..3].iter().cloned().collect();
        let present: BTreeSet<_> = ids[1..].iter().cloned().collect();

        let report = MissingReport::compare(&expected, &present);
        assert_eq!(report.missing, BTreeSet::from([ids[0].clone()]));
        assert_eq!(report.extra, BTreeSet::from([ids[3].clone()]));
        assert!(!report.is_complete());
        assert!(MissingReport::compare(&expected, &expected).is_complete());
    }

    #[test]
    fn test_report_exit_code() {
        let report = RunReport {
            mode: RunMode::Full,
            summary: Some(mixed_summary()),
            missing: None,
            aggregation: AggregationReport::default(),
        };
        assert_eq!(report.exit_code(), 1);

        let finalize = RunReport {
            mode: RunMode::Finalize { sources: vec![] },
            summary: None,
            missing: None,
            aggregation: AggregationReport::default(),
        };
        assert_eq!(finalize.exit_code(), 0);
    }
}
