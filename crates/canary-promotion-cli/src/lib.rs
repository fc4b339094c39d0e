//! Command surface for the canary promotion engine.
//!
//! `canary run` is the long-lived worker: one tick per interval, policy
//! re-read from the file and the environment before every tick. The other
//! commands run a single tick or read the persisted tables for operators.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use canary_promotion_core::{now_utc, parse_rfc3339_utc, ConfigWarning, PolicyConfig};
use canary_promotion_store_sqlite::{
    CandidateRecord, DecisionRecord, LivenessIssueSeverity, LivenessReport, SnapshotRecord,
    SqliteCanaryStore, TickReport,
};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "canary")]
#[command(about = "Continuous canary promotion engine")]
pub struct Cli {
    #[arg(long, default_value = "./canary.sqlite3")]
    db: PathBuf,

    /// YAML policy file, re-read at every tick.
    #[arg(long)]
    policy: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the periodic tick loop.
    Run(RunArgs),
    /// Run exactly one tick.
    Tick(TickArgs),
    Policy {
        #[command(subcommand)]
        command: PolicyCommand,
    },
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommand,
    },
    Candidates {
        #[command(subcommand)]
        command: CandidatesCommand,
    },
    Decisions {
        #[command(subcommand)]
        command: DecisionsCommand,
    },
    Health {
        #[command(subcommand)]
        command: HealthCommand,
    },
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Stop after this many ticks (runs forever when omitted).
    #[arg(long)]
    max_ticks: Option<u64>,
    /// Override the policy's tick interval.
    #[arg(long)]
    interval_secs: Option<u64>,
}

#[derive(Debug, Args)]
pub struct TickArgs {
    /// Evaluate as of this RFC3339 UTC instant instead of now.
    #[arg(long)]
    at: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum PolicyCommand {
    Show,
}

#[derive(Debug, Subcommand)]
pub enum SnapshotCommand {
    Latest(JsonArgs),
}

#[derive(Debug, Subcommand)]
pub enum CandidatesCommand {
    List(CandidatesListArgs),
}

#[derive(Debug, Subcommand)]
pub enum DecisionsCommand {
    List(DecisionsListArgs),
}

#[derive(Debug, Subcommand)]
pub enum HealthCommand {
    Check(HealthCheckArgs),
}

#[derive(Debug, Args)]
pub struct JsonArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct CandidatesListArgs {
    #[arg(long, default_value_t = 20)]
    limit: usize,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct DecisionsListArgs {
    #[arg(long)]
    model_id: Option<String>,
    #[arg(long, default_value_t = 20)]
    limit: usize,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct HealthCheckArgs {
    /// Defaults to three tick intervals.
    #[arg(long)]
    max_staleness_secs: Option<u64>,
    #[arg(long)]
    at: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LoopSummary {
    pub ticks: u64,
    pub failed_ticks: u64,
}

#[derive(Debug, Serialize)]
struct PolicyView<'a> {
    policy: &'a PolicyConfig,
    warnings: &'a [ConfigWarning],
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when the store cannot be opened or migrated, or the
/// requested command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let policy_path = cli.policy.as_deref();

    if let Command::Policy {
        command: PolicyCommand::Show,
    } = cli.command
    {
        let (policy, warnings) = load_policy(policy_path);
        let view = PolicyView {
            policy: &policy,
            warnings: &warnings,
        };
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    let mut store = SqliteCanaryStore::open(&cli.db)?;
    store.migrate()?;

    match cli.command {
        Command::Run(args) => {
            let summary = run_loop(&mut store, policy_path, &args);
            println!("{}", serde_json::to_string(&summary)?);
            Ok(())
        }
        Command::Tick(args) => {
            let (policy, _) = load_policy(policy_path);
            let at = parse_optional_utc(args.at.as_deref())?;
            let report = store.run_tick(&policy, at)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_tick_report(&report);
            }
            Ok(())
        }
        Command::Policy { .. } => Ok(()),
        Command::Snapshot {
            command: SnapshotCommand::Latest(args),
        } => {
            let latest = store.latest_snapshot()?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&latest)?);
            } else {
                match latest {
                    Some(record) => print_snapshot(&record),
                    None => println!("no snapshots recorded"),
                }
            }
            Ok(())
        }
        Command::Candidates {
            command: CandidatesCommand::List(args),
        } => {
            let candidates = store.list_candidates(args.limit)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&candidates)?);
            } else {
                print_candidates(&candidates);
            }
            Ok(())
        }
        Command::Decisions {
            command: DecisionsCommand::List(args),
        } => {
            let decisions = store.list_decisions(args.model_id.as_deref(), args.limit)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&decisions)?);
            } else {
                print_decisions(&decisions);
            }
            Ok(())
        }
        Command::Health {
            command: HealthCommand::Check(args),
        } => {
            let (policy, _) = load_policy(policy_path);
            let max_staleness_secs = args
                .max_staleness_secs
                .unwrap_or_else(|| policy.tick_interval_secs.saturating_mul(3));
            let max_staleness = time::Duration::seconds(
                i64::try_from(max_staleness_secs).context("max staleness out of range")?,
            );
            let at = parse_optional_utc(args.at.as_deref())?;
            let report = store.liveness_check(at, max_staleness)?;

            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_liveness(&report);
            }

            if !report.healthy {
                return Err(anyhow!(
                    "liveness check failed: {}",
                    report
                        .issues
                        .iter()
                        .map(|item| format!("{}:{}", item.code, item.message))
                        .collect::<Vec<_>>()
                        .join("; ")
                ));
            }
            Ok(())
        }
    }
}

/// Runs ticks back to back, one per interval. A failed tick is logged with
/// its cause chain and the loop carries on; a tick that overruns the interval
/// delays the next one instead of overlapping it.
pub fn run_loop(store: &mut SqliteCanaryStore, policy_path: Option<&Path>, args: &RunArgs) -> LoopSummary {
    let mut summary = LoopSummary {
        ticks: 0,
        failed_ticks: 0,
    };

    loop {
        let started = Instant::now();
        let (policy, _) = load_policy(policy_path);

        match store.run_tick(&policy, now_utc()) {
            Ok(report) => {
                if let Some(decision) = &report.decision {
                    if decision.finalized {
                        info!(model_id = %decision.model_id, "model promoted");
                    }
                }
            }
            Err(err) => {
                summary.failed_ticks += 1;
                error!(error = %err, "tick failed");
                for cause in err.chain().skip(1) {
                    error!(cause = %cause, "caused by");
                }
            }
        }
        summary.ticks += 1;

        if args.max_ticks.is_some_and(|max| summary.ticks >= max) {
            break;
        }

        let interval = std::time::Duration::from_secs(
            args.interval_secs.unwrap_or(policy.tick_interval_secs),
        );
        let elapsed = started.elapsed();
        if elapsed >= interval {
            if !interval.is_zero() {
                warn!(
                    elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                    "tick overran its interval, starting the next one late"
                );
            }
            continue;
        }
        std::thread::sleep(interval - elapsed);
    }

    info!(ticks = summary.ticks, failed_ticks = summary.failed_ticks, "loop stopped");
    summary
}

/// Loads the policy for one tick and logs every rejected value.
pub fn load_policy(path: Option<&Path>) -> (PolicyConfig, Vec<ConfigWarning>) {
    let (policy, warnings) = PolicyConfig::load(path, |key| std::env::var(key).ok());
    for warning in &warnings {
        warn!(
            source = %warning.source,
            key = %warning.key,
            message = %warning.message,
            "policy warning"
        );
    }
    (policy, warnings)
}

fn parse_optional_utc(raw: Option<&str>) -> Result<OffsetDateTime> {
    match raw {
        Some(value) => parse_rfc3339_utc(value).with_context(|| format!("invalid --at value: {value}")),
        None => Ok(now_utc()),
    }
}

fn print_tick_report(report: &TickReport) {
    println!(
        "tick_at={} snapshot_id={} reused={} prod={} cand={}",
        report.tick_at,
        report.snapshot_id,
        if report.snapshot_reused { "yes" } else { "no" },
        report.snapshot.prod_count,
        report.snapshot.cand_count
    );
    println!(
        "guard={} reason={}",
        if report.guard.passed { "pass" } else { "fail" },
        report.guard.reason
    );
    println!(
        "ranked={} skipped={}",
        report.ranked.len(),
        report.skipped.len()
    );
    match &report.decision {
        Some(decision) => println!(
            "decision model_id={} decision={} reason={} recorded={} finalized={} state={}",
            decision.model_id,
            decision.decision.as_str(),
            decision.reason,
            decision.recorded,
            decision.finalized,
            decision.state.as_str()
        ),
        None => println!("decision=none"),
    }
}

fn print_snapshot(record: &SnapshotRecord) {
    let snapshot = &record.snapshot;
    println!("snapshot_id={} tick_at={}", record.snapshot_id, record.tick_at);
    println!(
        "{:<6} {:<8} {:<9} {:<9} {:<12} avg_cost",
        "track", "samples", "success", "halluc", "p95_latency"
    );
    println!("{}", "-".repeat(60));
    for (track, summary) in [("prod", snapshot.prod()), ("cand", snapshot.cand())] {
        println!(
            "{:<6} {:<8} {:<9.4} {:<9.4} {:<12.1} {:.5}",
            track,
            summary.count,
            summary.success_rate,
            summary.hallu_rate,
            summary.p95_latency,
            summary.avg_cost
        );
    }
    match &record.guard {
        Some(guard) => println!(
            "guard={} reason={}",
            if guard.passed { "pass" } else { "fail" },
            guard.reason
        ),
        None => println!("guard=missing"),
    }
}

fn print_candidates(candidates: &[CandidateRecord]) {
    println!(
        "{:<4} {:<28} {:<9} {:<9} {:<9} {:<8} {:<8} window_to",
        "rank", "model_id", "score", "succ_pp", "hall_pp", "p95_rel", "cost_rel"
    );
    println!("{}", "-".repeat(110));
    for record in candidates {
        let item = &record.candidate;
        println!(
            "{:<4} {:<28} {:<9.4} {:<9.3} {:<9.3} {:<8.3} {:<8.3} {}",
            item.rank,
            item.model_id,
            item.promotion_score,
            item.success_pp,
            item.halluc_pp,
            item.p95_rel,
            item.cost_rel,
            canary_promotion_core::format_rfc3339(item.window.to).unwrap_or_default()
        );
    }
}

fn print_decisions(decisions: &[DecisionRecord]) {
    println!(
        "{:<26} {:<28} {:<14} {:<21} reason",
        "decision_id", "model_id", "decision", "decision_ts"
    );
    println!("{}", "-".repeat(110));
    for item in decisions {
        println!(
            "{:<26} {:<28} {:<14} {:<21} {}",
            item.decision_id,
            item.model_id,
            item.decision.as_str(),
            item.decision_ts,
            item.reason
        );
    }
}

fn print_liveness(report: &LivenessReport) {
    println!("contract={}", report.contract_version);
    println!(
        "latest_tick_at={} staleness_secs={} max_staleness_secs={} snapshots={} finalized_models={}",
        report.latest_tick_at.as_deref().unwrap_or("n/a"),
        report
            .staleness_secs
            .map_or_else(|| "n/a".to_string(), |value| value.to_string()),
        report.max_staleness_secs,
        report.snapshot_count,
        report.finalized_models
    );
    println!("healthy={}", if report.healthy { "yes" } else { "no" });
    if !report.issues.is_empty() {
        let formatted = report
            .issues
            .iter()
            .map(|item| {
                let severity = match item.severity {
                    LivenessIssueSeverity::Warning => "warning",
                    LivenessIssueSeverity::Error => "error",
                };
                format!("{severity}:{}:{}", item.code, item.message)
            })
            .collect::<Vec<_>>()
            .join(" | ");
        println!("issues={formatted}");
    }
}
