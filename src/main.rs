//! trueno-multiverse - run a multiverse analysis from the command line

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use trueno_multiverse::artifact::ArtifactStore;
use trueno_multiverse::config::MultiverseConfig;
use trueno_multiverse::control::CancelToken;
use trueno_multiverse::scheduler::{self, ModeName, RunMode, Scheduler};

#[derive(Parser, Debug)]
#[command(name = "trueno-multiverse")]
#[command(about = "Run an analysis once per universe of a decision grid and aggregate the results")]
#[command(version)]
struct Cli {
    /// Config file (.toml or .json); defaults to multiverse.toml / multiverse.json
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// full-parallel, partial-parallel, finalize or test
    #[arg(long)]
    mode: Option<ModeName>,

    /// Percentage slice for partial-parallel, e.g. "0%,50%"
    #[arg(long)]
    partial: Option<String>,

    /// Worker count (-1 = all available units minus one)
    #[arg(long, allow_hyphen_values = true)]
    n_jobs: Option<i64>,

    /// Re-run universes that already have an artifact
    #[arg(long)]
    force: bool,

    /// Output directory
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Only run the universe whose identity starts with this prefix
    #[arg(long)]
    universe_id: Option<String>,

    /// Per-universe timeout in seconds
    #[arg(long)]
    timeout_secs: Option<f64>,

    /// Output directory of a partial run to merge (finalize; repeatable)
    #[arg(long = "source")]
    sources: Vec<PathBuf>,

    /// Also write aggregated_outputs.parquet
    #[arg(long)]
    parquet: bool,
}

impl Cli {
    fn apply(self, config: &mut MultiverseConfig) {
        let run = &mut config.run;
        if let Some(mode) = self.mode {
            run.mode = mode;
        }
        if self.partial.is_some() {
            run.partial = self.partial;
        }
        if let Some(n_jobs) = self.n_jobs {
            run.n_jobs = n_jobs;
        }
        run.force |= self.force;
        if let Some(dir) = self.output_dir {
            run.output_dir = dir;
        }
        if self.universe_id.is_some() {
            run.universe_id = self.universe_id;
        }
        if self.timeout_secs.is_some() {
            run.timeout_secs = self.timeout_secs;
        }
        if !self.sources.is_empty() {
            run.sources = self.sources;
        }
        run.write_parquet |= self.parquet;
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    trueno_multiverse::init_logging();

    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => MultiverseConfig::discover(".")?,
    };
    let mut config = MultiverseConfig::from_path(&path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    cli.apply(&mut config);
    config.validate()?;

    let mode = config.run_mode()?;
    let run = &config.run;

    let report = match mode {
        RunMode::Finalize { sources } => {
            let output = ArtifactStore::new(&run.output_dir);
            scheduler::finalize(&output, &sources, run.write_parquet)?
        }
        mode => {
            let grid = config.grid()?;
            info!(universes = grid.len(), config = %path.display(), "grid enumerated");

            let cancel = CancelToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, killing in-flight universes");
                    on_interrupt.cancel();
                }
            });

            let scheduler = Scheduler::new(grid, config.command_executor()?, &run.output_dir)
                .with_parallelism(config.parallelism()?)
                .with_force(run.force)
                .with_timeout(config.timeout()?)
                .with_cancel_token(cancel)
                .with_universe_prefix(run.universe_id.clone())
                .with_parquet(run.write_parquet);

            tokio::task::spawn_blocking(move || scheduler.run(&mode))
                .await
                .context("scheduler task panicked")??
        }
    };

    println!("{report}");
    Ok(ExitCode::from(report.exit_code()))
}
