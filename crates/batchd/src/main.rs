//! batchd: the BatchGrid daemon.
//!
//! Assembles the planner, allocator, supervisor and control loop:
//! - `plan` sizes, schedules and allocates one batch without launching it
//! - `simulate` runs cycles against the in-memory fleet on a virtual clock
//! - `run` drives the control loop in real time until Ctrl-C
//!
//! # Usage
//!
//! ```text
//! batchd --config batch.toml --scenario fleet.toml simulate --cycles 20
//! ```

mod scenario;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{info, warn};

use batchgrid_controller::Controller;
use batchgrid_core::{BatchConfig, ConstantModel, FormulaModel, OperationKind, OperationModel};
use batchgrid_placement::{FreeCapacity, allocate};
use batchgrid_planner::{Anchor, PlanParams, landing_order, plan_target, schedule_or_serialize};

use crate::scenario::Scenario;

/// How often `run` moves the simulated clock.
const SIM_TICK: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "batchd", about = "BatchGrid batch scheduling daemon", version)]
struct Cli {
    /// Engine configuration (TOML). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Fleet scenario (TOML). A small built-in fleet is used when omitted.
    #[arg(long, global = true)]
    scenario: Option<PathBuf>,

    /// Operation model used for planning and for the simulated fleet.
    #[arg(long, value_enum, default_value = "formula", global = true)]
    model: ModelKind,

    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModelKind {
    /// Platform formulas.
    Formula,
    /// Fixed per-thread constants.
    Constant,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Plan one batch and print plan, schedule and allocation as JSON.
    Plan {
        /// Target to plan for. Defaults to the scenario's primary target.
        #[arg(long)]
        target: Option<String>,
    },
    /// Run cycles against the simulated fleet on a virtual clock.
    Simulate {
        /// Number of control-loop cycles.
        #[arg(long, default_value = "10")]
        cycles: u32,
    },
    /// Run the control loop in real time against the simulated fleet.
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = match &cli.config {
        Some(path) => BatchConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => BatchConfig::default(),
    };
    let scenario = match &cli.scenario {
        Some(path) => Scenario::from_file(path)?,
        None => Scenario::builtin(),
    };

    match cli.model {
        ModelKind::Formula => dispatch(cli.command, config, scenario, FormulaModel::default()).await,
        ModelKind::Constant => dispatch(cli.command, config, scenario, ConstantModel::default()).await,
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,batchd=debug,batchgrid=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn dispatch<M>(command: Command, config: BatchConfig, scenario: Scenario, model: M) -> anyhow::Result<()>
where
    M: OperationModel + Clone + Send + Sync + 'static,
{
    match command {
        Command::Plan { target } => plan(&config, &scenario, &model, target),
        Command::Simulate { cycles } => simulate(config, &scenario, model, cycles).await,
        Command::Run => run(config, &scenario, model).await,
    }
}

fn plan<M: OperationModel>(
    config: &BatchConfig,
    scenario: &Scenario,
    model: &M,
    target: Option<String>,
) -> anyhow::Result<()> {
    config.validate()?;
    let target_id = target
        .or_else(|| scenario.primary.clone())
        .ok_or_else(|| anyhow!("no --target given and the scenario has no primary target"))?;
    let snapshot = scenario
        .target(&target_id)
        .ok_or_else(|| anyhow!("target {target_id} is not in the scenario"))?;

    let hosts = scenario.capacities(&config.reserve);
    let blocked = HashSet::new();
    let grow_cost = config.thread_cost.for_kind(OperationKind::Grow);
    let fleet_threads = FreeCapacity::new(&hosts, &blocked).thread_capacity(grow_cost);
    let params = PlanParams::from_config(config, u32::try_from(fleet_threads).unwrap_or(u32::MAX).max(1));

    let plan = plan_target(model, snapshot, &scenario.actor, &params)?;
    let schedule = schedule_or_serialize(&plan.durations, config.safety_gap(), config.schedule_policy, Anchor::Earliest)?;
    let allocation = allocate(&plan, &landing_order(config.schedule_policy), &hosts, &blocked);

    let out = serde_json::json!({
        "plan": plan,
        "schedule": schedule,
        "allocation": allocation,
        "degraded": allocation.degraded(),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

async fn simulate<M>(config: BatchConfig, scenario: &Scenario, model: M, cycles: u32) -> anyhow::Result<()>
where
    M: OperationModel + Clone + Send + Sync + 'static,
{
    let fleet = Arc::new(scenario.build_fleet(model.clone(), config.thread_cost.clone()));
    let mut controller = Controller::new(Arc::clone(&fleet), model, config)?;
    info!(cycles, hosts = scenario.hosts.len(), "simulation starting");

    for cycle in 1..=cycles {
        let report = controller.run_cycle_at(fleet.now()).await;
        for outcome in &report.outcomes {
            println!("{}", outcome.to_json()?);
        }
        for error in &report.errors {
            warn!(cycle, error = %error, "target skipped");
        }
        fleet.advance(report.next_pass_in);
    }

    info!(
        passes = controller.outcomes().total(),
        degraded = controller.outcomes().degraded_total(),
        extracted = fleet.extracted_total(),
        landed = fleet.landed_jobs(),
        "simulation finished"
    );
    Ok(())
}

async fn run<M>(config: BatchConfig, scenario: &Scenario, model: M) -> anyhow::Result<()>
where
    M: OperationModel + Clone + Send + Sync + 'static,
{
    info!("batchd starting against the simulated fleet");

    let fleet = Arc::new(scenario.build_fleet(model.clone(), config.thread_cost.clone()));
    let mut controller = Controller::new(Arc::clone(&fleet), model, config)?;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut clock_shutdown = shutdown_rx.clone();

    // ── Background tasks ───────────────────────────────────────

    // Keeps the simulated clock in step with wall time.
    let clock_fleet = Arc::clone(&fleet);
    let clock_handle = tokio::spawn(async move {
        let mut tick = tokio::time::interval(SIM_TICK);
        loop {
            tokio::select! {
                _ = tick.tick() => clock_fleet.advance(SIM_TICK),
                _ = clock_shutdown.changed() => break,
            }
        }
    });

    let controller_handle = tokio::spawn(async move {
        controller.run(shutdown_rx).await;
        controller
    });

    tokio::signal::ctrl_c().await.context("installing Ctrl-C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let controller = controller_handle.await?;
    let _ = clock_handle.await;

    info!(
        passes = controller.outcomes().total(),
        extracted = fleet.extracted_total(),
        "batchd stopped"
    );
    Ok(())
}
