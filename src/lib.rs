//! # Trueno-Multiverse: Multiverse Analysis Execution Engine
//!
//! **Version**: 0.1.0
//!
//! Runs one opaque analysis procedure once for every combination ("universe")
//! of a set of named decision dimensions, and merges every universe's tabular
//! output into one consolidated dataset.
//!
//! ## Design Principles
//!
//! - **Deterministic grid**: enumeration order, identities and seeds are pure
//!   functions of the declared dimensions
//! - **Artifacts are the ledger**: a universe is complete exactly when its
//!   artifact file exists; re-running continues where the last run stopped
//! - **Failures are data**: one universe failing, timing out or producing an
//!   unreadable artifact never aborts the batch
//! - **Distributed by slicing**: machines run disjoint percentage slices and a
//!   finalize pass merges their output directories
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use trueno_multiverse::config::MultiverseConfig;
//! use trueno_multiverse::scheduler::Scheduler;
//!
//! let config = MultiverseConfig::from_path("multiverse.toml")?;
//! let scheduler = Scheduler::new(
//!     config.grid()?,
//!     config.command_executor()?,
//!     &config.run.output_dir,
//! )
//! .with_parallelism(config.parallelism()?)
//! .with_timeout(config.timeout()?);
//!
//! let report = scheduler.run(&config.run_mode()?)?;
//! println!("{report}");
//! # Ok::<(), trueno_multiverse::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod aggregate;
pub mod artifact;
pub mod config;
pub mod control;
pub mod dimension;
pub mod error;
pub mod executor;
pub mod scheduler;
pub mod storage;
pub mod universe;

pub use error::{Error, Result};

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global `tracing` subscriber, logging to stderr.
///
/// Use `RUST_LOG` environment variable to override the default filter.
/// Calling it twice is harmless.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,trueno_multiverse=info"));

    // Err only if a subscriber is already installed.
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
