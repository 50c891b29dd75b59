//! Hyperparameter sweep runner.
//!
//! Usage:
//!   hs-sweep run <definition.yaml> [--concurrency K] [--run-cap N] [--output report.json]
//!   hs-sweep plan <definition.yaml> [--limit N]
//!
//! Exit codes: 0 completed, 1 no trials attempted or invalid definition,
//! 2 cancelled, 3 failure threshold exceeded.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use hs_runner::{SweepConfig, SweepController, SweepDefinition, SweepReport};

/// Unbounded strategies print this many trials unless `--limit` is given.
const DEFAULT_PLAN_LIMIT: usize = 20;

#[derive(Parser)]
#[command(name = "hs-sweep")]
#[command(about = "Run hyperparameter sweeps over an external training program")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a sweep
    Run {
        /// Sweep definition (YAML or JSON)
        definition: PathBuf,

        /// Number of trials run at once
        #[arg(short, long)]
        concurrency: Option<usize>,

        /// Maximum number of trials
        #[arg(long)]
        run_cap: Option<usize>,

        /// Seed for the random and model-guided strategies
        #[arg(long)]
        seed: Option<u64>,

        /// Directory for per-run logs and metric files
        #[arg(long)]
        run_dir: Option<PathBuf>,

        /// Write the sweep report as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the commands a sweep would run without running them
    Plan {
        /// Sweep definition (YAML or JSON)
        definition: PathBuf,

        /// Maximum number of trials to print
        #[arg(short, long)]
        limit: Option<usize>,
    },
}

fn load(path: &Path) -> anyhow::Result<SweepConfig> {
    SweepConfig::from_path(path)
        .with_context(|| format!("failed to load sweep definition {}", path.display()))
}

fn plan(definition: PathBuf, limit: Option<usize>) -> anyhow::Result<i32> {
    let sweep = SweepDefinition::from_config(load(&definition)?)?;
    let mut generator = sweep.trial_generator()?;
    let limit = limit
        .or(sweep.budget.run_cap)
        .or(generator.size())
        .unwrap_or(DEFAULT_PLAN_LIMIT);

    println!(
        "{} ({} search, {} {})",
        sweep.name, sweep.method, sweep.objective.goal, sweep.objective.name
    );
    match generator.size() {
        Some(size) => println!("search space: {size} combinations"),
        None => println!("search space: unbounded"),
    }
    for trial in generator.suggest(limit, &[]) {
        let command = sweep.template.render(&trial)?;
        println!("[{:>4}] {command}", trial.number);
    }
    Ok(0)
}

async fn run(
    definition: PathBuf,
    concurrency: Option<usize>,
    run_cap: Option<usize>,
    seed: Option<u64>,
    run_dir: Option<PathBuf>,
    output: Option<PathBuf>,
) -> anyhow::Result<i32> {
    let mut config = load(&definition)?;
    if let Some(concurrency) = concurrency {
        config.concurrency = concurrency;
    }
    if run_cap.is_some() {
        config.run_cap = run_cap;
    }
    if seed.is_some() {
        config.seed = seed;
    }
    if run_dir.is_some() {
        config.run_dir = run_dir;
    }

    let sweep = SweepDefinition::from_config(config)?;
    let controller = SweepController::local(sweep)?;

    let stop = controller.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping sweep");
            stop.stop();
        }
    });

    let report = controller.run().await?;
    print_summary(&report);

    if let Some(path) = output {
        let file = File::create(&path)
            .with_context(|| format!("failed to create report {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &report)?;
        writer.flush()?;
        info!(path = %path.display(), "report written");
    }

    Ok(report.exit_code())
}

fn print_summary(report: &SweepReport) {
    println!("sweep {} ({}): {:?}", report.name, report.sweep_id, report.phase);
    println!(
        "trials: {} recorded, {} failed",
        report.results.len(),
        report.failed_count()
    );
    match &report.best {
        Some(best) => {
            let params: Vec<String> = best
                .trial
                .parameters
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect();
            println!(
                "best: trial {} {} = {} [{}]",
                best.trial.number,
                report.objective.name,
                best.metric().map_or_else(|| "n/a".to_string(), |v| v.to_string()),
                params.join(", ")
            );
        }
        None => println!("best: none"),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = match "info".parse() {
        Ok(directive) => EnvFilter::from_default_env().add_directive(directive),
        Err(_) => EnvFilter::from_default_env(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let outcome = match cli.command {
        Commands::Run {
            definition,
            concurrency,
            run_cap,
            seed,
            run_dir,
            output,
        } => run(definition, concurrency, run_cap, seed, run_dir, output).await,
        Commands::Plan { definition, limit } => plan(definition, limit),
    };

    let code = match outcome {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            1
        }
    };
    std::process::exit(code);
}
