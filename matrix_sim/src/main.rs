//! Matrix node simulator CLI
//!
//! Runs the kernel through deterministic scenarios and reports the outcome.

use anyhow::Context;
use clap::Parser;
use matrix_sim::scenarios::ScenarioId;
use matrix_sim::{NodeConfig, ScenarioResult, ScenarioRunner, SimConfig, SimExport};
use std::path::PathBuf;
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Matrix node deterministic simulation CLI
#[derive(Parser, Debug)]
#[command(name = "matrix-sim")]
#[command(about = "Run deterministic simulation scenarios against the Matrix kernel", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long)]
    seed: Option<u64>,

    /// Number of agents per scenario
    #[arg(short, long)]
    agents: Option<usize>,

    /// Scenario to run (ecosystem, faulty_rule, flood, guest_agents, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of consecutive seeds to test (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Steps per scenario
    #[arg(short = 'n', long)]
    steps: Option<u64>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Write per-step frames of a single scenario to this JSON file
    #[arg(long)]
    export: Option<PathBuf>,

    /// Node configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write a default configuration to --config and exit
    #[arg(long, requires = "config")]
    init: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber).context("failed to set tracing subscriber")?;

    if args.init {
        if let Some(path) = &args.config {
            NodeConfig::write_default(path)
                .with_context(|| format!("writing {}", path.display()))?;
            info!("Wrote default configuration to {}", path.display());
        }
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => NodeConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?
            .to_sim_config(),
        None => SimConfig::default(),
    };
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(agents) = args.agents {
        config.num_agents = agents;
    }
    if let Some(steps) = args.steps {
        config.num_steps = steps;
    }
    if config.seed == 0 {
        config.seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
    }

    if !args.json {
        info!("Matrix simulator v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        match args.scenario.parse() {
            Ok(scenario) => vec![scenario],
            Err(e) => {
                eprintln!("Error: {}", e);
                eprintln!("Available scenarios: ecosystem, faulty_rule, flood, guest_agents, all");
                std::process::exit(1);
            }
        }
    };

    if let Some(export_path) = &args.export {
        if scenarios.len() > 1 || args.seeds > 1 {
            eprintln!("Error: --export only supports a single scenario and seed");
            std::process::exit(1);
        }
        let result = ScenarioRunner::from_config(config.clone()).run(scenarios[0]).await;
        let mut export = SimExport::new(scenarios[0].name(), result.seed);
        for frame in result.frames.iter().cloned() {
            export.add_frame(frame);
        }
        export.finalize(result.passed, result.registry.clone());
        export
            .write_to_file(export_path)
            .with_context(|| format!("writing {}", export_path.display()))?;
        info!("Exported {} frames to {}", export.frames.len(), export_path.display());
        report(&result);
        if !result.passed {
            std::process::exit(1);
        }
        return Ok(());
    }

    let base_seed = config.seed;
    let mut all_results: Vec<ScenarioResult> = Vec::new();
    for seed_offset in 0..args.seeds {
        let runner = ScenarioRunner::from_config(SimConfig {
            seed: base_seed.wrapping_add(seed_offset as u64),
            ..config.clone()
        });
        for scenario in &scenarios {
            let result = runner.run(*scenario).await;
            if !args.json {
                report(&result);
            }
            all_results.push(result);
        }
    }

    let total = all_results.len();
    let failed: Vec<&ScenarioResult> = all_results.iter().filter(|r| !r.passed).collect();

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": total - failed.len(),
            "failed": failed.len(),
            "results": all_results.iter().map(|r| {
                serde_json::json!({
                    "scenario": r.scenario.name(),
                    "seed": r.seed,
                    "passed": r.passed,
                    "steps": r.total_steps,
                    "time_secs": r.final_time_secs,
                    "agents": r.final_agent_count,
                    "metrics": r.metrics,
                    "failure_reason": r.failure_reason,
                })
            }).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        if failed.is_empty() {
            info!("All {} scenario runs passed", total);
        } else {
            error!("{}/{} scenario runs failed", failed.len(), total);
            for result in &failed {
                error!(
                    "  - {} seed={}: {}",
                    result.scenario.name(),
                    result.seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    if !failed.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}

fn report(result: &ScenarioResult) {
    if result.passed {
        info!(
            "✓ {} (seed={}) PASSED in {} steps ({:.1}s virtual)",
            result.scenario.name(),
            result.seed,
            result.total_steps,
            result.final_time_secs
        );
    } else {
        error!(
            "✗ {} (seed={}) FAILED: {}",
            result.scenario.name(),
            result.seed,
            result.failure_reason.as_deref().unwrap_or("unknown")
        );
    }
}
