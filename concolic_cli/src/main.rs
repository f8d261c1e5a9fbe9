mod probe_target;

use clap::{Parser, ValueEnum};
use concolic_core::dispatcher;
use concolic_core::{BranchMode, BridgeConfig, ConcolicTrace, EntryKind, HaltController};
use log::{info, warn};
use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Instruction id to break on; may be repeated.
    #[clap(long = "break-on")]
    break_on: Vec<u64>,
    #[clap(short, long, default_value_t = 4)]
    runs: u64,
    #[clap(long, default_value_t = 0)]
    seed: u64,
    /// Ignore branch verdicts (legacy notification-only bridge).
    #[clap(long)]
    notify_only: bool,
    #[clap(long, value_enum, default_value_t = OutputFormat::Summary)]
    format: OutputFormat,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum OutputFormat {
    Summary,
    Json,
}

struct LoggingHaltController;

impl HaltController for LoggingHaltController {
    fn on_halt(&self, hit: u64) {
        info!("target halted at breakpoint hit #{hit}");
    }
}

#[derive(Serialize, Debug)]
struct RunReport {
    run: u64,
    input: i64,
    result: i64,
    fingerprint: String,
    new_path: bool,
    trace: ConcolicTrace,
}

#[derive(Serialize, Debug)]
struct SessionReport {
    runs: Vec<RunReport>,
    distinct_paths: usize,
    dropped_events: u64,
    trigger_count: u64,
}

fn load_config(cli: &Cli) -> Result<BridgeConfig, anyhow::Error> {
    let mut config = match &cli.config_file {
        Some(config_path) => {
            info!("Loading configuration from specified path: {config_path:?}");
            BridgeConfig::load_from_file(config_path)?
        }
        None => {
            let default_config_path = PathBuf::from("bridge.toml");
            if default_config_path.exists() {
                info!("No config file specified, loading default: {default_config_path:?}");
                BridgeConfig::load_from_file(&default_config_path)?
            } else {
                info!("No config file specified and 'bridge.toml' not found, using defaults");
                BridgeConfig::default()
            }
        }
    };

    config.breakpoints.ids.extend(cli.break_on.iter().copied());
    if cli.notify_only {
        config.branch_mode = BranchMode::NotifyOnly;
    }
    Ok(config)
}

/// Arms the process-wide bridge and runs the probe target on seeded inputs.
fn run_session(config: &BridgeConfig, runs: u64, seed: u64) -> Result<SessionReport, anyhow::Error> {
    let recorder = Arc::new(
        config
            .trace
            .build_recorder(config.breakpoints.build_handler()),
    );
    dispatcher::arm_with_config(recorder.clone(), recorder.clone(), config)?;
    dispatcher::attach_controller(Arc::new(LoggingHaltController));

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut explored: Vec<ConcolicTrace> = Vec::new();
    let mut reports = Vec::new();
    let mut dropped_events = 0;

    for run in 0..runs {
        let input = (rng.next_u64() % 16) as i64;
        let result = probe_target::classify(input);
        dropped_events += recorder.dropped();
        let trace = recorder.take();

        let new_path = !explored.iter().any(|known| known.starts_with(&trace));
        if new_path {
            explored.retain(|known| !trace.starts_with(known));
            explored.push(trace.clone());
        }
        reports.push(RunReport {
            run,
            input,
            result,
            fingerprint: trace.fingerprint(),
            new_path,
            trace,
        });
    }

    if dropped_events > 0 {
        warn!("{dropped_events} events dropped; raise trace.max-entries to keep full traces");
    }

    Ok(SessionReport {
        runs: reports,
        distinct_paths: explored.len(),
        dropped_events,
        trigger_count: dispatcher::trigger_count(),
    })
}

fn print_summary(report: &SessionReport) {
    for run in &report.runs {
        println!(
            "run {:>3}: input={:>3} result={:>3} path={} {}",
            run.run,
            run.input,
            run.result,
            &run.fingerprint[..8],
            if run.new_path { "(new)" } else { "" }
        );
        for entry in run.trace.entries() {
            let kind = match entry.kind {
                EntryKind::Step => "step  ",
                EntryKind::Branch => "branch",
            };
            println!(
                "    {kind} {:#010x} {:<14} {:?}",
                entry.event.id(),
                probe_target::probe_name(entry.event.id()),
                entry.event.concrete_arguments()
            );
        }
    }
    println!(
        "Runs: {}, Distinct paths: {}, Dropped events: {}, Breakpoint hits: {}",
        report.runs.len(),
        report.distinct_paths,
        report.dropped_events,
        report.trigger_count
    );
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::init();
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    info!("Effective configuration: {config:?}");

    let report = run_session(&config, cli.runs, cli.seed)?;
    match cli.format {
        OutputFormat::Summary => print_summary(&report),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }
    Ok(())
}
