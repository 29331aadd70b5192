//! # Simulation Orchestrator
//!
//! The binary owns run configuration and the user-facing lifecycle: argument
//! parsing, optional TOML run file, logger and thread-pool setup, progress
//! display, and the final failure-rate digest. All simulation logic lives in
//! the library; `main` only composes it.

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use latentsim::aggregate::ConditionSummary;
use latentsim::estimate::Method;
use latentsim::grid;
use latentsim::runner::{run_grid_resumable, SimulationConfig};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::process;

#[derive(Parser, Debug)]
#[clap(
    name = "latentsim",
    version,
    about = "Monte Carlo comparison of latent-variable regression methods."
)]
struct Args {
    /// Replicates per condition (default 1000).
    #[clap(long)]
    replications: Option<usize>,

    /// Base seed for the whole grid (default 42).
    #[clap(long)]
    seed: Option<u64>,

    /// Output / checkpoint CSV, one row per condition.
    #[clap(long, default_value = "summaries.csv")]
    output: PathBuf,

    /// Keep existing rows in the output file and only run missing conditions.
    #[clap(long)]
    resume: bool,

    /// Wall-clock budget per SEM fit in milliseconds; 0 disables (default 2000).
    #[clap(long)]
    sem_time_budget_ms: Option<u64>,

    /// Worker threads (default: rayon's choice).
    #[clap(long)]
    threads: Option<usize>,

    /// Optional TOML run file carrying the same fields; explicit flags win.
    #[clap(long)]
    config: Option<PathBuf>,
}

/// The TOML run-file schema. Every field optional; flags override.
#[derive(Debug, Default, Deserialize)]
struct RunFile {
    replications: Option<usize>,
    seed: Option<u64>,
    sem_time_budget_ms: Option<u64>,
}

fn load_run_file(path: &PathBuf) -> Result<RunFile, String> {
    let text = fs::read_to_string(path)
        .map_err(|e| format!("cannot read config file {}: {e}", path.display()))?;
    toml::from_str(&text).map_err(|e| format!("cannot parse {}: {e}", path.display()))
}

fn failure_digest(summaries: &[ConditionSummary]) {
    if summaries.is_empty() {
        return;
    }
    let mean_failure: f64 = summaries
        .iter()
        .map(|s| s.method(Method::Sem).failure_rate)
        .sum::<f64>()
        / summaries.len() as f64;
    log::info!(
        "SEM failure rate across {} newly run conditions: {:.2}%",
        summaries.len(),
        mean_failure * 100.0
    );
    for summary in summaries {
        let rate = summary.method(Method::Sem).failure_rate;
        if rate > 0.10 {
            log::warn!(
                "condition [{}]: SEM failed in {:.1}% of replicates",
                summary.condition.key(),
                rate * 100.0
            );
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let run_file = match &args.config {
        Some(path) => match load_run_file(path) {
            Ok(file) => file,
            Err(message) => {
                eprintln!("Error: {message}");
                process::exit(1);
            }
        },
        None => RunFile::default(),
    };
    let defaults = SimulationConfig::default();
    let config = SimulationConfig {
        replications: args
            .replications
            .or(run_file.replications)
            .unwrap_or(defaults.replications),
        base_seed: args.seed.or(run_file.seed).unwrap_or(defaults.base_seed),
        sem_time_budget_ms: args
            .sem_time_budget_ms
            .or(run_file.sem_time_budget_ms)
            .unwrap_or(defaults.sem_time_budget_ms),
    };

    if let Some(threads) = args.threads {
        if let Err(e) = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
        {
            eprintln!("Error: could not configure {threads} worker threads: {e}");
            process::exit(1);
        }
    }

    if !args.resume && args.output.exists() {
        if let Err(e) = fs::remove_file(&args.output) {
            eprintln!(
                "Error: cannot overwrite {}: {e} (use --resume to keep it)",
                args.output.display()
            );
            process::exit(1);
        }
    }

    let conditions = grid::full_grid();
    log::info!(
        "running {} conditions x {} replicates (base seed {})",
        conditions.len(),
        config.replications,
        config.base_seed
    );

    let bar = ProgressBar::new(conditions.len() as u64);
    if let Ok(style) =
        ProgressStyle::with_template("[{elapsed_precise}] {bar:40} {pos}/{len} conditions")
    {
        bar.set_style(style);
    }

    match run_grid_resumable(&config, &conditions, &args.output, Some(&bar)) {
        Ok(summaries) => {
            bar.finish();
            failure_digest(&summaries);
            println!("Summary table written to {}", args.output.display());
        }
        Err(e) => {
            bar.abandon();
            eprintln!("Error: simulation failed: {e}");
            process::exit(1);
        }
    }
}
