//! # qkdsim-runner
//!
//! CLI for the QKD fault-telemetry pipeline.
//!
//! Entry point for running fault-conditioned telemetry synthesis against a
//! trusted-node topology and consolidating the per-scenario files into one
//! labeled training dataset.

use clap::{Parser, Subcommand, ValueEnum};
use qkdsim_common::SimTime;
use qkdsim_faults::{FaultScenario, SCENARIO_NAMES};
use qkdsim_model::{load_topology, Topology};
use qkdsim_runner::{
    consolidate, default_failed_relay, run_all_scenarios, run_scenario, scenario_file,
    RunSettings, RunnerError,
};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// CLI Configuration
// ============================================================================

/// Fault scenario selector for `run`.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum ScenarioArg {
    /// Baseline operation, label 0.
    Normal,
    /// Eavesdropper-style QBER ramp, label 1.
    Qber,
    /// Gradual component degradation, label 2.
    Degrade,
    /// Trusted-relay outage, label 3.
    #[value(name = "node_fail")]
    NodeFail,
    /// Detector blinding attack, label 4.
    Blinding,
    /// Trojan-horse probing, label 5.
    Trojan,
}

impl ScenarioArg {
    fn name(&self) -> &'static str {
        match self {
            ScenarioArg::Normal => "normal",
            ScenarioArg::Qber => "qber",
            ScenarioArg::Degrade => "degrade",
            ScenarioArg::NodeFail => "node_fail",
            ScenarioArg::Blinding => "blinding",
            ScenarioArg::Trojan => "trojan",
        }
    }
}

impl std::fmt::Display for ScenarioArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// QKDSim - QKD fault telemetry synthesizer
#[derive(Parser, Debug)]
#[command(name = "qkdsim")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one fault scenario and write its telemetry file
    Run(RunArgs),
    /// Run all six scenarios and write one telemetry file per scenario
    RunAll(RunAllArgs),
    /// Merge the six per-scenario files into one labeled dataset
    Consolidate(ConsolidateArgs),
    /// List the available fault scenarios and their class labels
    Scenarios,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Fault scenario to activate
    #[arg(long, value_enum, default_value_t = ScenarioArg::Normal)]
    fault: ScenarioArg,

    /// Output CSV path (defaults to ./data/dataset_<fault>.csv)
    #[arg(long)]
    output: Option<PathBuf>,

    /// Topology YAML file (defaults to the built-in Tokyo reference network)
    #[arg(long)]
    topology: Option<PathBuf>,

    /// Links hit by node_fail (defaults to the links incident to the relay
    /// nearest the detector end)
    #[arg(long)]
    affected_links: Vec<String>,

    #[command(flatten)]
    settings: SettingsArgs,
}

#[derive(Parser, Debug)]
struct RunAllArgs {
    /// Directory receiving the six dataset_<scenario>.csv files
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Topology YAML file (defaults to the built-in Tokyo reference network)
    #[arg(long)]
    topology: Option<PathBuf>,

    /// Skip the consolidation step after the six runs
    #[arg(long)]
    no_consolidate: bool,

    /// Consolidated dataset path (defaults to <data-dir>/dataset_full.csv)
    #[arg(long)]
    output: Option<PathBuf>,

    #[command(flatten)]
    settings: SettingsArgs,
}

#[derive(Parser, Debug)]
struct ConsolidateArgs {
    /// Directory holding the six per-scenario telemetry files
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Consolidated dataset path
    #[arg(long, default_value = "./data/dataset_full.csv")]
    output: PathBuf,
}

#[derive(Parser, Debug)]
struct SettingsArgs {
    /// Simulated duration in seconds
    #[arg(long, default_value_t = 1.0)]
    duration: f64,

    /// Number of sampling intervals
    #[arg(long, default_value_t = 100)]
    samples: usize,

    /// Light-source operating frequency in Hz
    #[arg(long, default_value_t = 1e6)]
    source_frequency: f64,

    /// RNG seed
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

impl SettingsArgs {
    fn to_settings(&self) -> Result<RunSettings, RunnerError> {
        if !(self.duration > 0.0) || !self.duration.is_finite() {
            return Err(RunnerError::Settings(
                "duration must be a positive number of seconds".into(),
            ));
        }
        Ok(RunSettings {
            duration: SimTime::from_ps((self.duration * 1e12) as u64),
            samples: self.samples,
            source_frequency_hz: self.source_frequency,
            seed: self.seed,
        })
    }
}

fn load_or_default_topology(path: &Option<PathBuf>) -> Result<Topology, RunnerError> {
    match path {
        Some(p) => Ok(load_topology(p)?),
        None => Ok(Topology::tokyo_reference()),
    }
}

// ============================================================================
// Entry Point
// ============================================================================


fn main() -> Result<(), RunnerError> {
    // Initialize tracing subscriber with RUST_LOG env filter
    // Default to "warn" level if RUST_LOG is not set
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            let settings = args.settings.to_settings()?;
            let topology = load_or_default_topology(&args.topology)?;
            let affected = if args.affected_links.is_empty() {
                default_failed_relay(&topology)
                    .map(|relay| topology.links_incident(&relay))
                    .unwrap_or_default()
            } else {
                args.affected_links.clone()
            };
            let scenario =
                FaultScenario::standard(args.fault.name(), settings.duration, affected)
                    .map_err(|e| RunnerError::Settings(e.to_string()))?;
            let output = args
                .output
                .unwrap_or_else(|| scenario_file(&PathBuf::from("./data"), scenario.name()));

            let mut engine =
                qkdsim_channel::Bb84Engine::new(settings.seed, scenario.label() as u64);
            let summary = run_scenario(&topology, &scenario, &settings, &mut engine, &output)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::RunAll(args) => {
            let settings = args.settings.to_settings()?;
            let topology = load_or_default_topology(&args.topology)?;
            let summaries = run_all_scenarios(&topology, &settings, &args.data_dir)?;
            if !args.no_consolidate {
                let output = args
                    .output
                    .unwrap_or_else(|| args.data_dir.join("dataset_full.csv"));
                let rows = consolidate(&args.data_dir, &output)?;
                tracing::info!(rows, output = %output.display(), "dataset consolidated");
            }
            println!("{}", serde_json::to_string_pretty(&summaries)?);
        }
        Commands::Consolidate(args) => {
            let rows = consolidate(&args.data_dir, &args.output)?;
            tracing::info!(rows, output = %args.output.display(), "dataset consolidated");
            println!(
                "{}",
                serde_json::json!({
                    "output": args.output,
                    "rows": rows,
                })
            );
        }
        Commands::Scenarios => {
            for name in SCENARIO_NAMES {
                let label = qkdsim_faults::FaultScenario::label_for(name)
                    .map_err(|e| RunnerError::Settings(e.to_string()))?;
                println!("{label}  {name}");
            }
        }
    }

    Ok(())
}
