//! Run modes, partial ranges and worker-pool sizing

use std::fmt;
use std::num::NonZeroUsize;
use std::ops::Range;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// What an invocation does, decided once before anything runs.
#[derive(Debug, Clone, PartialEq)]
pub enum RunMode {
    /// Run every universe of the grid.
    Full,
    /// Run a contiguous percentage slice of the grid (one machine's share).
    Partial(PartialRange),
    /// Run nothing; merge the artifacts of one or more output directories.
    /// An empty list means the scheduler's own output directory.
    Finalize {
        /// Output directories of the partial runs
        sources: Vec<PathBuf>,
    },
    /// Smoke test: the first and the last universe only.
    Test,
}

impl RunMode {
    /// Name used in config files and on the command line.
    #[must_use]
    pub const fn name(&self) -> ModeName {
        match self {
            Self::Full => ModeName::FullParallel,
            Self::Partial(_) => ModeName::PartialParallel,
            Self::Finalize { .. } => ModeName::Finalize,
            Self::Test => ModeName::Test,
        }
    }

    /// Whether this mode executes universes.
    #[must_use]
    pub const fn executes(&self) -> bool {
        !matches!(self, Self::Finalize { .. })
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Partial(range) => write!(f, "{} {range}", self.name()),
            _ => write!(f, "{}", self.name()),
        }
    }
}

/// Mode names accepted by configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModeName {
    /// `full-parallel`
    #[default]
    FullParallel,
    /// `partial-parallel`
    PartialParallel,
    /// `finalize`
    Finalize,
    /// `test`
    Test,
}

impl fmt::Display for ModeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::FullParallel => "full-parallel",
            Self::PartialParallel => "partial-parallel",
            Self::Finalize => "finalize",
            Self::Test => "test",
        })
    }
}

impl FromStr for ModeName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "full-parallel" => Ok(Self::FullParallel),
            "partial-parallel" => Ok(Self::PartialParallel),
            "finalize" => Ok(Self::Finalize),
            "test" => Ok(Self::Test),
            other => Err(Error::config(format!(
                "unknown mode '{other}' (expected full-parallel, partial-parallel, finalize or test)"
            ))),
        }
    }
}

/// Percentage slice `[start, end)` of the ordered universe sequence.
///
/// For `N` universes the slice is `floor(start·N/100) .. floor(end·N/100)`,
/// so ranges that tile `[0, 100]` partition the grid for every `N`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PartialRange {
    start: f64,
    end: f64,
}

impl PartialRange {
    /// Range from two percentages.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] unless `0 <= start <= end <= 100`.
    pub fn new(start: f64, end: f64) -> Result<Self> {
        if !(start.is_finite() && end.is_finite()) || start < 0.0 || end > 100.0 || start > end {
            return Err(Error::config(format!(
                "invalid partial range {start}%,{end}%: need 0 <= start <= end <= 100"
            )));
        }
        Ok(Self { start, end })
    }

    /// Parse `"start%,end%"` (the `%` signs are optional).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the string is malformed or out of range.
    pub fn parse(raw: &str) -> Result<Self> {
        let malformed = || Error::config(format!("malformed partial range '{raw}', expected \"start%,end%\""));
        let (start, end) = raw.split_once(',').ok_or_else(malformed)?;
        let pct = |part: &str| -> Result<f64> {
            let part = part.trim();
            part.strip_suffix('%')
                .unwrap_or(part)
                .trim()
                .parse::<f64>()
                .map_err(|_| malformed())
        };
        Self::new(pct(start)?, pct(end)?)
    }

    /// Start percentage.
    #[must_use]
    pub const fn start(&self) -> f64 {
        self.start
    }

    /// End percentage.
    #[must_use]
    pub const fn end(&self) -> f64 {
        self.end
    }

    /// Index range selected out of `total` universes.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn bounds(&self, total: usize) -> Range<usize> {
        let at = |pct: f64| ((pct * total as f64 / 100.0).floor() as usize).min(total);
        at(self.start)..at(self.end)
    }
}

impl FromStr for PartialRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for PartialRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%,{}%", self.start, self.end)
    }
}

/// Number of universes executed concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parallelism(NonZeroUsize);

impl Parallelism {
    /// Sentinel `n_jobs` value for "all available units minus one".
    pub const ALL_BUT_ONE: i64 = -1;

    /// Exactly `workers` workers (at least one).
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self(NonZeroUsize::new(workers).unwrap_or(NonZeroUsize::MIN))
    }

    /// One worker: universes run one after another on the calling thread.
    #[must_use]
    pub const fn sequential() -> Self {
        Self(NonZeroUsize::MIN)
    }

    /// Available parallel execution units minus one, minimum one.
    #[must_use]
    pub fn available() -> Self {
        let units = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);
        Self::new(units.saturating_sub(1))
    }

    /// From the `n_jobs` setting: positive is exact, `-1` is
    /// [`Self::available`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for `0` and anything below `-1`.
    pub fn from_n_jobs(n_jobs: i64) -> Result<Self> {
        match n_jobs {
            Self::ALL_BUT_ONE => Ok(Self::available()),
            n if n > 0 => usize::try_from(n)
                .map(Self::new)
                .map_err(|_| Error::config(format!("n_jobs {n} is too large"))),
            n => Err(Error::config(format!(
                "invalid n_jobs {n}: use a positive worker count or -1"
            ))),
        }
    }

    /// Worker count.
    #[must_use]
    pub const fn get(self) -> usize {
        self.0.get()
    }

    /// True for a single worker.
    #[must_use]
    pub const fn is_sequential(self) -> bool {
        self.0.get() == 1
    }
}

impl Default for Parallelism {
    fn default() -> Self {
        Self::available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_partial_range() {
        let r = PartialRange::parse("0%,50%").unwrap();
        assert_eq!((r.start(), r.end()), (0.0, 50.0));
        let r = PartialRange::parse(" 25 , 75% ").unwrap();
        assert_eq!((r.start(), r.end()), (25.0, 75.0));
        assert_eq!(r.to_string(), "25%,75%");
    }

    #[test]
    fn test_parse_partial_range_rejects() {
        for raw in ["", "50%", "a%,b%", "60%,40%", "-1%,10%", "0%,101%", "NaN,5"] {
            assert!(PartialRange::parse(raw).is_err(), "{raw} should be rejected");
        }
    }

    #[test]
    fn test_bounds_example() {
        let first = PartialRange::parse("0%,50%").unwrap();
        let second = PartialRange::parse("50%,100%").unwrap();
        assert_eq!(first.bounds(6), 0..3);
        assert_eq!(second.bounds(6), 3..6);
    }

    #[test]
    fn test_bounds_floor() {
        let r = PartialRange::new(0.0, 33.0).unwrap();
        // floor(0.33 * 10) = 3
        assert_eq!(r.bounds(10), 0..3);
        assert_eq!(PartialRange::new(0.0, 100.0).unwrap().bounds(0), 0..0);
    }

    #[test]
    fn test_n_jobs() {
        assert_eq!(Parallelism::from_n_jobs(4).unwrap().get(), 4);
        assert!(Parallelism::from_n_jobs(1).unwrap().is_sequential());
        assert!(Parallelism::from_n_jobs(-1).unwrap().get() >= 1);
        assert!(Parallelism::from_n_jobs(0).is_err());
        assert!(Parallelism::from_n_jobs(-2).is_err());
    }

    #[test]
    fn test_mode_names() {
        assert_eq!("partial-parallel".parse::<ModeName>().unwrap(), ModeName::PartialParallel);
        assert!("continue".parse::<ModeName>().is_err());
        assert_eq!(RunMode::Test.name().to_string(), "test");
        assert!(!RunMode::Finalize { sources: vec![] }.executes());
        let partial = RunMode::Partial(PartialRange::parse("0%,50%").unwrap());
        assert_eq!(partial.to_string(), "partial-parallel 0%,50%");
    }
}
