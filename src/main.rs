use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use log::{info, warn};
use std::fs;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

mod cli;
mod config;

use cli::Cli;
use cli::commands::{Commands, RunArgs};
use config::Config;
use vloop::controller::{RunProjection, RunSpec};
use vloop::domain::{AbortReason, ERROR_EXIT_CODE, Event, Policy, RunOutcome, RunSnapshot, RunState};
use vloop::manager::RunManager;
use vloop::storage::{EventSink, JsonlEventLog};
use vloop::watchdog::Watchdog;

fn setup_logging(level: Option<&str>) -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vloop")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("vloop.log");

    // Setup env_logger with file output
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level.unwrap_or("info")))
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

/// Returns the process exit code
fn run_application(cli: &Cli, config: &Config) -> Result<i32> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    match &cli.command {
        Commands::Run(args) => handle_run_command(args, config, cli.is_verbose()),
        Commands::Start(args) => handle_start_command(args, cli).map(|_| 0),
        Commands::Status { run_id } => handle_status_command(run_id, config).map(|_| 0),
        Commands::Log { run_id, json } => handle_log_command(run_id, *json, config).map(|_| 0),
        Commands::List => handle_list_command(config).map(|_| 0),
        Commands::Validate => handle_validate_command(config).map(|_| 0),
    }
}

fn apply_overrides(mut policy: Policy, args: &RunArgs) -> Policy {
    if let Some(max) = args.max_iterations {
        policy = policy.with_max_iterations(max);
    }
    if let Some(command) = &args.verify {
        policy.verify_command.command = command.clone();
    }
    if let Some(ms) = args.stall_threshold_ms {
        policy = policy.with_stall_threshold_ms(ms);
    }
    policy
}

fn workdir(args: &RunArgs) -> Result<PathBuf> {
    match &args.workdir {
        Some(dir) => Ok(dir.clone()),
        None => std::env::current_dir().context("Failed to resolve working directory"),
    }
}

fn open_log(config: &Config) -> Result<JsonlEventLog> {
    JsonlEventLog::new(&config.storage.log_dir)
        .context(format!("Failed to open run logs at {}", config.storage.log_dir.display()))
}

fn handle_run_command(args: &RunArgs, config: &Config, verbose: bool) -> Result<i32> {
    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(run_task(args, config, verbose))
}

async fn run_task(args: &RunArgs, config: &Config, verbose: bool) -> Result<i32> {
    let workdir = workdir(args)?;
    let policy = apply_overrides(config.policy.clone(), args);
    let registry = Arc::new(config.build_registry(&workdir)?);
    let sink: Arc<dyn EventSink> = Arc::new(open_log(config)?);

    let watchdog = Arc::new(Watchdog::new(config.watchdog.tick_config()));
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let watchdog_task = tokio::spawn(Arc::clone(&watchdog).run(stop_rx));

    let mut manager = RunManager::new(registry, sink, watchdog);
    let mut spec = RunSpec::new(&args.task, policy).with_workdir(&workdir);
    if let Some(run_id) = &args.run_id {
        spec = spec.with_run_id(run_id);
    }
    let run_id = manager.start(spec).context("Failed to start run")?;
    println!("{} {}", "Run:".green(), run_id);

    let publisher = manager.publisher(&run_id)?;
    let interrupted_id = run_id.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run {}", interrupted_id);
            let event = Event::run_aborted(&interrupted_id, 0, AbortReason::Cancelled, "interrupted");
            if let Err(e) = publisher.send(event) {
                warn!("Failed to cancel run {}: {}", interrupted_id, e);
            }
        }
    });

    let outcome = manager.wait(&run_id).await;
    interrupt.abort();
    let _ = stop_tx.send(true);
    let _ = watchdog_task.await;

    let outcome = outcome.context(format!("Run {} failed", run_id))?;
    if verbose && let Ok(snapshot) = manager.status(&run_id) {
        print_snapshot(&snapshot);
    }
    print_outcome(&outcome);
    Ok(outcome.exit_code())
}

fn print_outcome(outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Passed { iteration } => {
            println!("{} verified at iteration {}", "PASSED".green().bold(), iteration);
        }
        RunOutcome::Aborted {
            reason,
            iteration,
            diagnostics,
        } => {
            println!("{} {} at iteration {}", "ABORTED".red().bold(), reason, iteration);
            if !diagnostics.is_empty() {
                println!("{}", diagnostics.dimmed());
            }
        }
    }
}

fn handle_start_command(args: &RunArgs, cli: &Cli) -> Result<()> {
    let run_id = args.run_id.clone().unwrap_or_else(vloop::id::generate_run_id);
    let exe = std::env::current_exe().context("Failed to locate vloop executable")?;

    let mut command = std::process::Command::new(exe);
    if let Some(path) = &cli.config {
        command.arg("--config").arg(path);
    }
    command.arg("run").arg(&args.task).arg("--run-id").arg(&run_id);
    if let Some(max) = args.max_iterations {
        command.arg("--max-iterations").arg(max.to_string());
    }
    if let Some(verify) = &args.verify {
        command.arg("--verify").arg(verify);
    }
    if let Some(ms) = args.stall_threshold_ms {
        command.arg("--stall-threshold-ms").arg(ms.to_string());
    }
    command.arg("--workdir").arg(workdir(args)?);

    let child = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("Failed to spawn background run")?;

    info!("Started run {} as pid {}", run_id, child.id());
    println!("{}", run_id);
    Ok(())
}

fn load_events(run_id: &str, config: &Config) -> Result<Vec<Event>> {
    let events = open_log(config)?
        .load(run_id)
        .context(format!("Failed to read log of {}", run_id))?;
    if events.is_empty() {
        return Err(eyre!("Run not found: {}", run_id));
    }
    Ok(events)
}

fn format_time(ms: u64) -> String {
    chrono::DateTime::from_timestamp_millis(ms as i64)
        .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn colored_state(state: RunState) -> ColoredString {
    let s = state.to_string();
    match state {
        RunState::Passed => s.green(),
        RunState::Aborted => s.red(),
        RunState::Stalled => s.yellow(),
        _ => s.cyan(),
    }
}

fn print_snapshot(snapshot: &RunSnapshot) {
    println!("{} {}", "Run:".green(), snapshot.run_id);
    println!("  Task:       {}", snapshot.task);
    println!("  State:      {}", colored_state(snapshot.state));
    println!("  Iteration:  {}", snapshot.iteration);
    if let Some(reason) = snapshot.abort_reason {
        println!("  Reason:     {}", reason.to_string().red());
    }
    println!("  Events:     {}", snapshot.event_count);
    println!("  Failures:   {}", snapshot.failure_count);
    println!("  Started:    {}", format_time(snapshot.created_at));
    println!("  Activity:   {}", format_time(snapshot.last_activity));
    if let Some(diagnostics) = &snapshot.last_diagnostics {
        println!("  Diagnostics:");
        for line in diagnostics.lines().take(20) {
            println!("    {}", line.dimmed());
        }
    }
}

fn handle_status_command(run_id: &str, config: &Config) -> Result<()> {
    info!("Getting status for run: {}", run_id);
    let events = load_events(run_id, config)?;
    print_snapshot(&RunProjection::replay(run_id, &events).snapshot());
    Ok(())
}

fn handle_log_command(run_id: &str, json: bool, config: &Config) -> Result<()> {
    info!("Printing log for run: {} (json: {})", run_id, json);
    for event in load_events(run_id, config)? {
        if json {
            println!("{}", serde_json::to_string(&event).context("Failed to encode event")?);
            continue;
        }
        let route = match (&event.source, &event.target) {
            (Some(source), Some(target)) => format!("{} -> {}", source, target),
            (Some(source), None) => source.to_string(),
            (None, Some(target)) => format!("-> {}", target),
            (None, None) => String::new(),
        };
        println!(
            "{:>4} {} {:<18} it={:<3} {}",
            event.seq,
            format_time(event.timestamp).dimmed(),
            event.kind.to_string().cyan(),
            event.iteration,
            route
        );
    }
    Ok(())
}

fn handle_list_command(config: &Config) -> Result<()> {
    info!("Listing runs");
    let log = open_log(config)?;
    let run_ids = log.list_runs().context("Failed to list runs")?;
    if run_ids.is_empty() {
        println!("{}", "No runs".dimmed());
        return Ok(());
    }
    for run_id in run_ids {
        let events = log.load(&run_id).context(format!("Failed to read log of {}", run_id))?;
        let snapshot = RunProjection::replay(&run_id, &events).snapshot();
        println!(
            "{:<28} {:<10} it={:<3} {}",
            snapshot.run_id,
            colored_state(snapshot.state),
            snapshot.iteration,
            snapshot.task
        );
    }
    Ok(())
}

fn handle_validate_command(config: &Config) -> Result<()> {
    let workdir = std::env::current_dir().context("Failed to resolve working directory")?;
    let registry = config.build_registry(&workdir)?;
    registry.validate(&config.policy).context("Policy rejected")?;

    let chain: Vec<String> = registry.causal_chain().iter().map(|id| id.to_string()).collect();
    println!("{} {}", "Valid:".green(), chain.join(" -> "));
    println!("  Max iterations: {}", config.policy.max_iterations);
    println!("  Verify command: {}", config.policy.verify_command.command);
    println!("  Stall recovery: {:?}", config.policy.stall_recovery);
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let code = match Config::load(cli.config.as_ref()).context("Failed to load configuration") {
        Ok(config) => {
            if let Err(e) = setup_logging(config.log_level.as_deref()).context("Failed to setup logging") {
                eprintln!("{} {:?}", "Warning:".yellow(), e);
            }
            info!("Starting with config from: {:?}", cli.config);
            run_application(&cli, &config).unwrap_or_else(|e| {
                eprintln!("{} {:?}", "Error:".red(), e);
                ERROR_EXIT_CODE
            })
        }
        Err(e) => {
            eprintln!("{} {:?}", "Error:".red(), e);
            ERROR_EXIT_CODE
        }
    };

    std::process::exit(code);
}
