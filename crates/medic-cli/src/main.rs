//! AutoMergeMedic CLI
//!
//! Drives reconciliation runs against a YAML scenario, or against GitHub
//! when built with the `github` feature.

mod scenario;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

use medic_core::{lifecycle, MedicConfig, PrState};
use medic_runtime::{
    InMemoryCommandQueue, ManualClock, Reconciler, RecordingNotifier, RunReport, Scheduler,
    StatusApi,
};

use scenario::Scenario;

#[derive(Parser)]
#[command(name = "medic", version, about = "Self-healing reconciler for automerge PRs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (YAML or JSON); defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a config file and print the effective settings
    ValidateConfig {
        /// Path to the config file
        path: PathBuf,
    },

    /// Show drift and classification for every PR in a scenario
    Classify {
        /// Path to the scenario file
        scenario: PathBuf,
    },

    /// Run reconciliation passes over a scenario with a simulated clock
    Run {
        /// Path to the scenario file
        scenario: PathBuf,

        /// Number of runs, one cadence apart
        #[arg(long, default_value_t = 1)]
        runs: usize,

        /// Print run reports as JSON
        #[arg(long)]
        json: bool,

        /// Print Prometheus metrics after the last run
        #[arg(long)]
        metrics: bool,
    },

    /// Run on the configured cadence until interrupted
    Watch {
        /// Path to the scenario file that seeds the state store
        scenario: PathBuf,

        /// Poll live status from GitHub instead of the scenario
        #[arg(long)]
        github: bool,
    },

    /// List legal lifecycle transitions
    Transitions {
        /// Only show edges leaving this state (e.g. CHECKS_FAILED)
        #[arg(long)]
        from: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over -v
    let default = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::ValidateConfig { path } => cmd_validate_config(&path),
        Commands::Classify { scenario } => {
            let config = load_config(cli.config.as_deref())?;
            cmd_classify(&config, &scenario)
        }
        Commands::Run {
            scenario,
            runs,
            json,
            metrics,
        } => {
            let config = load_config(cli.config.as_deref())?;
            cmd_run(config, &scenario, runs, json, metrics).await
        }
        Commands::Watch { scenario, github } => {
            let config = load_config(cli.config.as_deref())?;
            cmd_watch(config, &scenario, github).await
        }
        Commands::Transitions { from } => cmd_transitions(from.as_deref()),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<MedicConfig> {
    match path {
        Some(path) => MedicConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(MedicConfig::default()),
    }
}

fn cmd_validate_config(path: &Path) -> anyhow::Result<()> {
    let config = MedicConfig::from_file(path)
        .with_context(|| format!("Failed to load config {}", path.display()))?;

    println!("Config OK: {}", path.display());
    println!();
    println!("Staleness thresholds:");
    for (state, threshold) in config.staleness.thresholds() {
        println!("  {:<18} {}", state, humantime_display(threshold));
    }
    println!();
    println!("Retry limits:");
    for action in medic_core::RemediationAction::BUDGETED {
        let max = config.retry_limits.max_for(action).unwrap_or(0);
        println!("  {:<18} {}", action, max);
    }
    println!();
    println!("Budget scope:     {:?}", config.budget_scope);
    println!(
        "Circuit breaker:  window {} / min {} / ratio {} / cooldown {}",
        config.circuit_breaker.window_size,
        config.circuit_breaker.min_samples,
        config.circuit_breaker.failure_ratio,
        humantime_display(config.circuit_breaker.cooldown),
    );
    println!(
        "Scheduler:        every {} / deadline {} / concurrency {}",
        humantime_display(config.scheduler.cadence),
        humantime_display(config.scheduler.run_deadline),
        config.scheduler.max_concurrency,
    );
    println!("Retention:        {}", humantime_display(config.retention));

    Ok(())
}

fn cmd_classify(config: &MedicConfig, path: &Path) -> anyhow::Result<()> {
    let scenario = Scenario::from_file(path)?;
    let now = scenario.start();

    for entry in &scenario.prs {
        let record = entry.record(now)?;
        let (drift, result) =
            medic_core::reconcile_and_classify(config, &record, &entry.live, now);

        println!("{} [{}]", record.pr, record.state);
        if let Some(correction) = &drift.correction {
            println!(
                "  drift:          {} -> {}{}",
                correction.from,
                correction.to,
                if correction.legal_edge { "" } else { " (not applied)" }
            );
        }
        match result {
            Some(result) => {
                println!("  classification: {}", result.classification);
                println!("  decision:       {}", result.decision);
                println!("  reason:         {}", result.reason);
            }
            None => println!("  not stale"),
        }
    }

    Ok(())
}

async fn cmd_run(
    config: MedicConfig,
    path: &Path,
    runs: usize,
    json: bool,
    metrics: bool,
) -> anyhow::Result<()> {
    if runs == 0 {
        anyhow::bail!("--runs must be at least 1");
    }

    let scenario = Scenario::from_file(path)?;
    let start = scenario.start();
    let (store, api) = scenario.seed(start)?;
    let queue = Arc::new(InMemoryCommandQueue::default());
    queue.fail_next(scenario.queue_failures);
    let notifier = Arc::new(RecordingNotifier::new());
    let clock = Arc::new(ManualClock::new(start));
    let cadence = config.scheduler.cadence;

    let reconciler = Reconciler::builder()
        .config(config)
        .store(store.clone())
        .status_api(api)
        .command_queue(queue.clone())
        .notifier(notifier.clone())
        .clock(clock.clone())
        .build()?;

    for run in 1..=runs {
        if run > 1 {
            clock.advance(cadence);
        }
        let report = reconciler.run_once().await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print_report(run, &report);
        }
    }

    if !json {
        println!();
        println!("Commands enqueued: {}", queue.commands().len());
        for (pr, reason) in notifier.escalations() {
            println!("Escalated {}: {}", pr, reason);
        }
        for trip in notifier.breaker_trips() {
            println!(
                "Breaker tripped: {} failures in {} outcomes",
                trip.failures(),
                trip.window.len()
            );
        }
    }

    if metrics {
        print!("{}", reconciler.metrics().encode_text()?);
    }

    Ok(())
}

async fn cmd_watch(config: MedicConfig, path: &Path, github: bool) -> anyhow::Result<()> {
    let scenario = Scenario::from_file(path)?;
    let (store, scripted) = scenario.seed(chrono::Utc::now())?;
    let status_api: Arc<dyn StatusApi> = if github {
        github_status_api(&config)?
    } else {
        scripted
    };
    let cadence = config.scheduler.cadence;

    let reconciler = Arc::new(
        Reconciler::builder()
            .config(config)
            .store(store)
            .status_api(status_api)
            .command_queue(Arc::new(InMemoryCommandQueue::default()))
            .notifier(Arc::new(RecordingNotifier::new()))
            .build()?,
    );

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
            let _ = tx.send(true);
        }
    });

    let mut run = 0;
    let stats = Scheduler::new(reconciler)
        .run_every(cadence, rx, |report| {
            run += 1;
            print_report(run, report);
        })
        .await;

    println!("Stopped after {} runs ({} failed)", stats.runs, stats.failed_runs);
    Ok(())
}

#[cfg(feature = "github")]
fn github_status_api(config: &MedicConfig) -> anyhow::Result<Arc<dyn StatusApi>> {
    let api = medic_runtime::GithubStatusApi::from_config(&config.github, config.calls.timeout)
        .context("Failed to set up GitHub client")?;
    Ok(Arc::new(api))
}

#[cfg(not(feature = "github"))]
fn github_status_api(_config: &MedicConfig) -> anyhow::Result<Arc<dyn StatusApi>> {
    anyhow::bail!("Built without the `github` feature")
}

fn cmd_transitions(from: Option<&str>) -> anyhow::Result<()> {
    let edges: Vec<_> = match from {
        Some(raw) => {
            let state = parse_state(raw)?;
            lifecycle::transitions_from(state).collect()
        }
        None => lifecycle::TRANSITIONS.iter().collect(),
    };

    for edge in edges {
        println!("{:<18} -> {:<18} {}", edge.from, edge.to, edge.trigger);
    }
    Ok(())
}

fn parse_state(raw: &str) -> anyhow::Result<PrState> {
    let normalized = raw.trim().to_ascii_uppercase().replace('-', "_");
    serde_json::from_value(serde_json::Value::String(normalized))
        .with_context(|| format!("Unknown state: {}", raw))
}

fn print_report(run: usize, report: &RunReport) {
    let summary = report.summary();
    println!(
        "Run {} at {} (breaker {} -> {})",
        run,
        report.started_at.format("%Y-%m-%d %H:%M:%S"),
        report.breaker_at_start,
        report.breaker_at_end
    );
    for pr in &report.prs {
        let drift = match &pr.drift {
            Some(c) => format!(" drift {}->{}", c.from, c.to),
            None => String::new(),
        };
        println!(
            "  {:<24} {:<18} {}{}",
            pr.pr.to_string(),
            pr.state_before,
            describe(&pr.outcome),
            drift
        );
    }
    println!(
        "  {} candidates: {} dispatched, {} escalated, {} no action, {} recovered, {} skipped, {} conflicts, {} failed",
        summary.candidates,
        summary.dispatched,
        summary.escalated,
        summary.no_action,
        summary.recovered,
        summary.skipped,
        summary.conflicts,
        summary.failed
    );
    if report.purged > 0 {
        println!("  purged {} terminal records", report.purged);
    }
}

fn describe(outcome: &medic_runtime::PrOutcome) -> String {
    use medic_runtime::PrOutcome;

    match outcome {
        PrOutcome::Dispatched {
            command,
            attempt_number,
            duplicate,
            ..
        } => format!(
            "{} (attempt {}){}",
            command,
            attempt_number,
            if *duplicate { " duplicate" } else { "" }
        ),
        PrOutcome::Escalated { reason } => format!("escalated: {}", reason),
        PrOutcome::NoAction { reason } => format!("no action: {}", reason),
        PrOutcome::Recovered { state } => format!("recovered to {}", state),
        PrOutcome::DispatchFailed { action, error } => format!("{} failed: {}", action, error),
        PrOutcome::Error { error } => format!("error: {}", error),
        other => other.label().to_string(),
    }
}

fn humantime_display(duration: std::time::Duration) -> String {
    humantime::format_duration(duration).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_state_accepts_loose_spelling() {
        assert_eq!(parse_state("checks_failed").unwrap(), PrState::ChecksFailed);
        assert_eq!(parse_state("needs-intervention").unwrap(), PrState::NeedsIntervention);
        assert!(parse_state("stuck").is_err());
    }

    #[test]
    fn test_sample_config_loads() {
        let config = MedicConfig::from_yaml(include_str!("../../../medic.yaml")).unwrap();
        assert_eq!(config.scheduler.cadence, std::time::Duration::from_secs(300));
        assert_eq!(config.classification.transient_signatures.len(), 1);
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from(["medic", "-v", "run", "demos/scenario.yaml", "--runs", "3"])
            .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Run {
                runs,
                json,
                metrics,
                ..
            } => {
                assert_eq!(runs, 3);
                assert!(!json);
                assert!(!metrics);
            }
            _ => panic!("expected run"),
        }
    }
}
