//! # splitload CLI
//!
//! Runs phased load scenarios against a primary/replica computer service.
//!
//! ## Usage
//!
//! ```bash
//! # Built-in scenario against a local stack
//! splitload preset standard --target http://localhost:8080
//!
//! # Print a preset as TOML to start a custom scenario
//! splitload preset heavy --dump > heavy.toml
//!
//! # Run and validate scenario files
//! splitload run --config heavy.toml --output report.json --prometheus-out run.prom
//! splitload check-config --config heavy.toml
//! ```
//!
//! Exit codes: 0 pass, 1 threshold or correctness failure, 2 bad configuration,
//! 3 client setup failure, 4 report sink failure.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use splitload_core::presets::{self, PRESETS};
use splitload_core::report::{emit_all, ConsoleSink, JsonFileSink, PrometheusSink, ReportSink};
use splitload_core::{HttpApiClient, LoadError, MetricsRegistry, RunConfig, RunReport, Scheduler};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "splitload")]
#[command(version)]
#[command(about = "Phased load generator and consistency prober for primary/replica services", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Target base URL, overrides the scenario
    #[arg(short, long, global = true, env = "BASE_URL")]
    target: Option<String>,

    /// Write the JSON report here
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    /// Write Prometheus text metrics here
    #[arg(long, global = true)]
    prometheus_out: Option<PathBuf>,

    /// Seed worker randomness
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// Skip the console report
    #[arg(long, global = true)]
    quiet: bool,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scenario file
    Run {
        /// Scenario TOML
        #[arg(short, long, default_value = "splitload.toml")]
        config: PathBuf,
    },

    /// Run a built-in scenario
    Preset {
        /// standard, heavy or exploratory
        name: String,

        /// Print the scenario as TOML instead of running it
        #[arg(long)]
        dump: bool,
    },

    /// Validate a scenario file and print its phase plan
    CheckConfig {
        /// Scenario TOML
        #[arg(short, long, default_value = "splitload.toml")]
        config: PathBuf,
    },
}

fn init_logging(verbose: bool, json: bool) {
    let env_filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(fmt::layer().json().with_current_span(false))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    let code = match dispatch(&cli).await {
        Ok(code) => code,
        Err(err) => {
            error!("{:#}", err);
            err.downcast_ref::<LoadError>()
                .map_or(2, LoadError::exit_code)
        }
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

async fn dispatch(cli: &Cli) -> anyhow::Result<i32> {
    match &cli.command {
        Commands::Run { config } => {
            let scenario = RunConfig::load(config)
                .with_context(|| format!("loading {}", config.display()))?;
            run_scenario(cli, scenario).await
        }
        Commands::Preset { name, dump } => {
            let scenario = presets::preset(name)
                .with_context(|| format!("available presets: {}", PRESETS.join(", ")))?;
            if *dump {
                print!("{}", toml::to_string_pretty(&scenario)?);
                return Ok(0);
            }
            run_scenario(cli, scenario).await
        }
        Commands::CheckConfig { config } => {
            let scenario = RunConfig::load(config)
                .with_context(|| format!("loading {}", config.display()))?;
            print_plan(&scenario)?;
            Ok(0)
        }
    }
}

fn print_plan(scenario: &RunConfig) -> anyhow::Result<()> {
    println!("Target: {}", scenario.base_url);
    for spec in scenario.phase_specs()? {
        println!(
            "  {:<24} {:>5}s -> {:>5}s  peak {:>4}  {}",
            spec.name,
            spec.ramp.start_offset().as_secs(),
            spec.ramp.end().as_secs(),
            spec.ramp.peak(),
            spec.operation.label()
        );
    }
    println!("Thresholds: {}", scenario.rules()?.len());
    Ok(())
}

async fn run_scenario(cli: &Cli, mut scenario: RunConfig) -> anyhow::Result<i32> {
    if let Some(target) = &cli.target {
        scenario.base_url = target.clone();
    }
    if let Some(path) = &cli.output {
        scenario.output.json_path = Some(path.clone());
    }
    if let Some(path) = &cli.prometheus_out {
        scenario.output.prometheus_path = Some(path.clone());
    }
    if cli.seed.is_some() {
        scenario.seed = cli.seed;
    }
    if cli.quiet {
        scenario.output.console = false;
    }
    scenario.validate()?;

    let phases = scenario.phase_specs()?;
    let rules = scenario.rules()?;
    let client = HttpApiClient::new(
        &scenario.base_url,
        scenario.request_timeout(),
        scenario.max_idle_per_host,
    )?;
    let metrics = Arc::new(MetricsRegistry::new());
    let scheduler = Scheduler::new(
        phases,
        Arc::new(client),
        metrics.clone(),
        scenario.scheduler_config(),
    );

    info!(
        "Run {} against {}: {} phases, {:?} planned",
        scheduler.run_id(),
        scenario.base_url,
        scenario.phases.len(),
        scheduler.planned_duration()
    );

    let stop = scheduler.stop_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, retiring workers");
            stop.cancel();
        }
    });

    let outcome = scheduler.run().await;
    let report = RunReport::build(&outcome, &metrics, &rules);

    let mut sinks: Vec<Box<dyn ReportSink>> = Vec::new();
    if scenario.output.console {
        sinks.push(Box::new(ConsoleSink));
    }
    if let Some(path) = &scenario.output.json_path {
        sinks.push(Box::new(JsonFileSink { path: path.clone() }));
    }
    if let Some(path) = &scenario.output.prometheus_path {
        sinks.push(Box::new(PrometheusSink { path: path.clone() }));
    }
    emit_all(&report, &sinks)?;

    for violation in report.verdict.violations() {
        warn!("Threshold violated: {} {}", violation.selector, violation.expression);
    }
    if report.passed() {
        info!("Run {} passed", report.run_id);
        Ok(0)
    } else {
        error!("Run {} failed", report.run_id);
        Ok(1)
    }
}
