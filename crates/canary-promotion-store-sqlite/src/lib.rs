#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use canary_promotion_core::{
    confirmation_reached, evaluate_guard, format_rfc3339, gate_candidate, next_state,
    parse_rfc3339_utc, rank_candidates, AggregateSnapshot, CandidateWindowSummaries,
    DecisionHistoryEntry, DecisionKind, FeedbackSample, GuardResult, MetricWindow, PolicyConfig,
    PromotionCandidate, PromotionState, SkippedCandidate, Track,
};
use rusqlite::types::{Type, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime, UtcOffset};
use tracing::{debug, info, warn};
use ulid::Ulid;

const CANARY_MIGRATION_VERSION: i64 = 1;
const FEEDBACK_TABLE: &str = "feedback_events";
const FEEDBACK_COLUMNS: &[&str] = &[
    "track",
    "model_id",
    "occurred_at",
    "failed",
    "hallucination",
    "latency_ms",
    "cost",
];

const SCHEMA_CANARY_V1: &str = r"
CREATE TABLE IF NOT EXISTS aggregate_snapshots (
  snapshot_id TEXT PRIMARY KEY,
  tick_at TEXT NOT NULL,
  window_from TEXT NOT NULL,
  window_to TEXT NOT NULL,
  prod_count INTEGER NOT NULL CHECK (prod_count >= 0),
  cand_count INTEGER NOT NULL CHECK (cand_count >= 0),
  prod_success_rate REAL NOT NULL,
  cand_success_rate REAL NOT NULL,
  prod_hallu_rate REAL NOT NULL,
  cand_hallu_rate REAL NOT NULL,
  prod_p95_latency REAL NOT NULL,
  cand_p95_latency REAL NOT NULL,
  prod_avg_cost REAL NOT NULL,
  cand_avg_cost REAL NOT NULL,
  UNIQUE(window_from, window_to)
);

CREATE TRIGGER IF NOT EXISTS trg_aggregate_snapshots_no_update
BEFORE UPDATE ON aggregate_snapshots
BEGIN
  SELECT RAISE(FAIL, 'aggregate_snapshots is immutable');
END;

CREATE TRIGGER IF NOT EXISTS trg_aggregate_snapshots_no_delete
BEFORE DELETE ON aggregate_snapshots
BEGIN
  SELECT RAISE(FAIL, 'aggregate_snapshots is immutable');
END;

CREATE INDEX IF NOT EXISTS idx_aggregate_snapshots_tick_at
  ON aggregate_snapshots(tick_at);

CREATE TABLE IF NOT EXISTS guard_results (
  snapshot_id TEXT PRIMARY KEY,
  passed INTEGER NOT NULL CHECK (passed IN (0, 1)),
  reason TEXT NOT NULL,
  violations_json TEXT NOT NULL DEFAULT '[]',
  prod_samples INTEGER NOT NULL,
  cand_samples INTEGER NOT NULL,
  success_pp REAL,
  halluc_pp REAL,
  p95_rel REAL,
  cost_rel REAL,
  FOREIGN KEY (snapshot_id) REFERENCES aggregate_snapshots(snapshot_id)
);

CREATE TABLE IF NOT EXISTS promotion_candidates (
  model_id TEXT NOT NULL,
  window_from TEXT NOT NULL,
  window_to TEXT NOT NULL,
  rank INTEGER NOT NULL CHECK (rank >= 1),
  success_pp REAL NOT NULL,
  halluc_pp REAL NOT NULL,
  p95_rel REAL NOT NULL,
  cost_rel REAL NOT NULL,
  promotion_score REAL NOT NULL,
  cand_samples INTEGER NOT NULL,
  prod_samples INTEGER NOT NULL,
  selection_policy TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (model_id, window_from, window_to)
);

CREATE INDEX IF NOT EXISTS idx_promotion_candidates_window_rank
  ON promotion_candidates(window_to, rank);

CREATE TABLE IF NOT EXISTS promotion_decisions (
  decision_id TEXT PRIMARY KEY,
  model_id TEXT NOT NULL,
  decision TEXT NOT NULL CHECK (decision IN ('hold', 'promote', 'promote_final')),
  reason TEXT NOT NULL,
  decision_ts TEXT NOT NULL,
  decision_bucket INTEGER NOT NULL,
  UNIQUE(model_id, decision, decision_bucket)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_promotion_decisions_single_final
  ON promotion_decisions(model_id) WHERE decision = 'promote_final';

CREATE INDEX IF NOT EXISTS idx_promotion_decisions_model_ts
  ON promotion_decisions(model_id, decision_ts);

CREATE TRIGGER IF NOT EXISTS trg_promotion_decisions_no_update
BEFORE UPDATE ON promotion_decisions
BEGIN
  SELECT RAISE(FAIL, 'promotion_decisions is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_promotion_decisions_no_delete
BEFORE DELETE ON promotion_decisions
BEGIN
  SELECT RAISE(FAIL, 'promotion_decisions is append-only');
END;
";

pub struct SqliteCanaryStore {
    conn: Connection,
}

/// Outcome of one tick, as committed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TickReport {
    pub tick_at: String,
    pub snapshot_id: String,
    pub snapshot_reused: bool,
    pub snapshot: AggregateSnapshot,
    pub guard: GuardResult,
    pub candidate_window: MetricWindow,
    pub ranked: Vec<PromotionCandidate>,
    pub skipped: Vec<SkippedCandidate>,
    pub malformed_feedback_rows: usize,
    pub coerced_feedback_values: usize,
    pub decision: Option<TickDecision>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TickDecision {
    pub model_id: String,
    pub decision: DecisionKind,
    pub reason: String,
    pub recorded: bool,
    pub finalized: bool,
    pub state: PromotionState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotRecord {
    pub snapshot_id: String,
    pub tick_at: String,
    pub snapshot: AggregateSnapshot,
    pub guard: Option<GuardResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandidateRecord {
    pub candidate: PromotionCandidate,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DecisionRecord {
    pub decision_id: String,
    pub model_id: String,
    pub decision: DecisionKind,
    pub reason: String,
    pub decision_ts: String,
    pub decision_bucket: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LivenessIssueSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LivenessIssue {
    pub code: String,
    pub severity: LivenessIssueSeverity,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LivenessReport {
    pub contract_version: String,
    pub healthy: bool,
    pub checked_at: String,
    pub latest_tick_at: Option<String>,
    pub staleness_secs: Option<i64>,
    pub max_staleness_secs: i64,
    pub snapshot_count: u64,
    pub finalized_models: u64,
    pub issues: Vec<LivenessIssue>,
}

impl SqliteCanaryStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Creates the engine's tables. Safe to call on every start.
    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        ensure_feedback_compatibility(&self.conn)?;

        self.conn
            .execute_batch(SCHEMA_CANARY_V1)
            .context("failed to apply canary promotion schema")?;

        let now = format_rfc3339(canary_promotion_core::now_utc())
            .context("failed to format migration timestamp")?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![CANARY_MIGRATION_VERSION, now],
            )
            .context("failed to register canary promotion schema migration")?;

        Ok(())
    }

    /// Runs Aggregate, Guard, Score/Rank and Decide for the tick at `now` as
    /// one transaction. Any error rolls back every write of the tick.
    ///
    /// Replaying a tick with the same `now` and policy writes nothing new.
    #[allow(clippy::too_many_lines)]
    pub fn run_tick(&mut self, policy: &PolicyConfig, now: OffsetDateTime) -> Result<TickReport> {
        policy.validate().context("refusing to tick with an invalid policy")?;
        let now = whole_seconds(now);
        let tick_at = format_rfc3339(now).context("failed to format tick timestamp")?;
        let global_window = MetricWindow::ending_at(now, policy.global_window())
            .context("invalid global window")?;
        let candidate_window = MetricWindow::ending_at(now, policy.candidate_window())
            .context("invalid candidate window")?;

        debug!(tick_at = %tick_at, "tick started");

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start tick transaction")?;

        let global_scan = list_feedback(&tx, global_window)?;
        let snapshot = AggregateSnapshot::aggregate(global_window, &global_scan.samples);
        let (snapshot_id, snapshot_reused) = insert_snapshot(&tx, &snapshot, &tick_at)?;

        let guard = evaluate_guard(&snapshot, &policy.guard);
        insert_guard_result(&tx, &snapshot_id, &guard)?;
        if guard.passed {
            info!(
                snapshot_id = %snapshot_id,
                prod_samples = guard.prod_samples,
                cand_samples = guard.cand_samples,
                "guard passed"
            );
        } else {
            warn!(
                snapshot_id = %snapshot_id,
                reason = %guard.reason,
                prod_samples = guard.prod_samples,
                cand_samples = guard.cand_samples,
                "guard failed"
            );
        }

        let candidate_scan = list_feedback(&tx, candidate_window)?;
        let summaries = CandidateWindowSummaries::aggregate(
            candidate_window,
            &candidate_scan.samples,
            policy.baseline_model_id.as_deref(),
        );
        let ranking = rank_candidates(&summaries, &policy.weights, policy.top_k);
        for skipped in &ranking.skipped {
            warn!(model_id = %skipped.model_id, reason = %skipped.reason, "candidate skipped");
        }

        for candidate in &ranking.ranked {
            upsert_candidate(&tx, candidate, &tick_at)?;
        }

        let decision = match ranking.top() {
            Some(top) => Some(decide(&tx, top, &guard, policy, now, &tick_at)?),
            None => {
                debug!("no rankable candidates in window");
                None
            }
        };

        tx.commit().context("failed to commit tick transaction")?;

        let malformed_feedback_rows = global_scan.malformed_rows + candidate_scan.malformed_rows;
        if malformed_feedback_rows > 0 {
            warn!(rows = malformed_feedback_rows, "malformed feedback rows ignored");
        }
        let coerced_feedback_values = global_scan.coerced_values + candidate_scan.coerced_values;
        if coerced_feedback_values > 0 {
            warn!(values = coerced_feedback_values, "mistyped feedback values read as null");
        }
        info!(
            tick_at = %tick_at,
            snapshot_id = %snapshot_id,
            snapshot_reused,
            ranked = ranking.ranked.len(),
            skipped = ranking.skipped.len(),
            decision = decision.as_ref().map_or("none", |item| item.decision.as_str()),
            "tick finished"
        );

        Ok(TickReport {
            tick_at,
            snapshot_id,
            snapshot_reused,
            snapshot,
            guard,
            candidate_window,
            ranked: ranking.ranked,
            skipped: ranking.skipped,
            malformed_feedback_rows,
            coerced_feedback_values,
            decision,
        })
    }

    pub fn list_feedback(&self, window: MetricWindow) -> Result<Vec<FeedbackSample>> {
        Ok(list_feedback(&self.conn, window)?.samples)
    }

    pub fn latest_snapshot(&self) -> Result<Option<SnapshotRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT snapshot_id, tick_at, window_from, window_to,
                        prod_count, cand_count,
                        prod_success_rate, cand_success_rate,
                        prod_hallu_rate, cand_hallu_rate,
                        prod_p95_latency, cand_p95_latency,
                        prod_avg_cost, cand_avg_cost
                 FROM aggregate_snapshots
                 ORDER BY tick_at DESC, rowid DESC
                 LIMIT 1",
                [],
                parse_snapshot_row,
            )
            .optional()
            .context("failed to query latest snapshot")?;

        let Some((snapshot_id, tick_at, snapshot)) = record else {
            return Ok(None);
        };

        let guard = self
            .conn
            .query_row(
                "SELECT passed, reason, violations_json, prod_samples, cand_samples,
                        success_pp, halluc_pp, p95_rel, cost_rel
                 FROM guard_results
                 WHERE snapshot_id = ?1",
                params![snapshot_id],
                parse_guard_row,
            )
            .optional()
            .context("failed to query guard result")?;

        Ok(Some(SnapshotRecord {
            snapshot_id,
            tick_at,
            snapshot,
            guard,
        }))
    }

    /// Candidate rows, newest window first and best rank first within it.
    pub fn list_candidates(&self, limit: usize) -> Result<Vec<CandidateRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT model_id, window_from, window_to, rank,
                    success_pp, halluc_pp, p95_rel, cost_rel, promotion_score,
                    cand_samples, prod_samples, selection_policy, updated_at
             FROM promotion_candidates
             ORDER BY window_to DESC, rank ASC, model_id ASC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![sql_i64(limit)?], parse_candidate_row)?;
        collect_rows(rows)
    }

    /// Ledger rows, newest first, optionally for one model.
    pub fn list_decisions(&self, model_id: Option<&str>, limit: usize) -> Result<Vec<DecisionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT decision_id, model_id, decision, reason, decision_ts, decision_bucket
             FROM promotion_decisions
             WHERE ?1 IS NULL OR model_id = ?1
             ORDER BY decision_ts DESC, rowid DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![model_id, sql_i64(limit)?], parse_decision_row)?;
        collect_rows(rows)
    }

    pub fn model_state(&self, model_id: &str) -> Result<PromotionState> {
        model_state(&self.conn, model_id)
    }

    /// Reports whether ticks are still landing. Staleness of
    /// `aggregate_snapshots` is the liveness signal.
    pub fn liveness_check(&self, now: OffsetDateTime, max_staleness: Duration) -> Result<LivenessReport> {
        let latest_tick_at: Option<String> = self
            .conn
            .query_row("SELECT MAX(tick_at) FROM aggregate_snapshots", [], |row| {
                row.get(0)
            })
            .context("failed to query latest tick")?;
        let snapshot_count = count(&self.conn, "SELECT COUNT(*) FROM aggregate_snapshots")?;
        let finalized_models = count(
            &self.conn,
            "SELECT COUNT(*) FROM promotion_decisions WHERE decision = 'promote_final'",
        )?;

        let mut issues = Vec::new();
        let staleness_secs = match latest_tick_at.as_deref() {
            None => {
                issues.push(LivenessIssue {
                    code: "no_snapshots".to_string(),
                    severity: LivenessIssueSeverity::Error,
                    message: "no aggregate snapshot has been recorded yet".to_string(),
                });
                None
            }
            Some(raw) => {
                let latest = parse_rfc3339_utc(raw)
                    .with_context(|| format!("invalid stored tick_at: {raw}"))?;
                let staleness = (now - latest).whole_seconds();
                if staleness > max_staleness.whole_seconds() {
                    issues.push(LivenessIssue {
                        code: "snapshot_stale".to_string(),
                        severity: LivenessIssueSeverity::Error,
                        message: format!(
                            "latest snapshot is {staleness}s old (max {}s)",
                            max_staleness.whole_seconds()
                        ),
                    });
                }
                Some(staleness)
            }
        };

        let healthy = !issues
            .iter()
            .any(|item| item.severity == LivenessIssueSeverity::Error);

        Ok(LivenessReport {
            contract_version: "liveness_check.v1".to_string(),
            healthy,
            checked_at: format_rfc3339(now).context("failed to format check timestamp")?,
            latest_tick_at,
            staleness_secs,
            max_staleness_secs: max_staleness.whole_seconds(),
            snapshot_count,
            finalized_models,
            issues,
        })
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn decide(
    conn: &Connection,
    top: &PromotionCandidate,
    guard: &GuardResult,
    policy: &PolicyConfig,
    now: OffsetDateTime,
    tick_at: &str,
) -> Result<TickDecision> {
    let current = model_state(conn, &top.model_id)?;
    let outcome = gate_candidate(
        top,
        &policy.promotion,
        Some(guard),
        policy.require_guard_pass,
    );

    if current.is_terminal() {
        debug!(model_id = %top.model_id, "model already finalized, no decision recorded");
        return Ok(TickDecision {
            model_id: top.model_id.clone(),
            decision: outcome.decision,
            reason: outcome.reason,
            recorded: false,
            finalized: false,
            state: current,
        });
    }

    let bucket = decision_bucket(now, policy.dedupe_window_secs);
    let recorded = insert_decision(
        conn,
        &top.model_id,
        outcome.decision,
        &outcome.reason,
        tick_at,
        bucket,
    )?;
    let mut state = next_state(current, &outcome);
    info!(
        model_id = %top.model_id,
        decision = outcome.decision.as_str(),
        reason = %outcome.reason,
        recorded,
        "decision evaluated"
    );

    let mut finalized = false;
    if outcome.decision == DecisionKind::Promote {
        let history = decision_history(conn, &top.model_id, tick_at, policy.confirmation.count)?;
        if confirmation_reached(&history, now, &policy.confirmation) {
            let reason = format!(
                "confirmed_consecutive_promotes(count={},mode={})",
                policy.confirmation.count,
                policy.confirmation.mode.as_str()
            );
            finalized = insert_decision(
                conn,
                &top.model_id,
                DecisionKind::PromoteFinal,
                &reason,
                tick_at,
                bucket,
            )?;
            state = PromotionState::PromoteFinal;
            if finalized {
                info!(model_id = %top.model_id, reason = %reason, "promotion finalized");
            }
        }
    }

    Ok(TickDecision {
        model_id: top.model_id.clone(),
        decision: outcome.decision,
        reason: outcome.reason,
        recorded,
        finalized,
        state,
    })
}

/// Feedback rows read for one window.
struct FeedbackScan {
    samples: Vec<FeedbackSample>,
    /// Rows without a usable track, model id or timestamp.
    malformed_rows: usize,
    /// Flag or metric values of the wrong type, read as null.
    coerced_values: usize,
}

fn list_feedback(conn: &Connection, window: MetricWindow) -> Result<FeedbackScan> {
    // Text bounds are widened by one second because fractional-second
    // timestamps do not sort lexicographically against whole-second bounds;
    // the exact half-open filter runs on the parsed values.
    let lower = window
        .from
        .checked_sub(Duration::SECOND)
        .ok_or_else(|| anyhow!("window start out of range"))?;
    let upper = window
        .to
        .checked_add(Duration::SECOND)
        .ok_or_else(|| anyhow!("window end out of range"))?;
    let lower = format_rfc3339(lower).context("invalid window start")?;
    let upper = format_rfc3339(upper).context("invalid window end")?;

    let mut stmt = conn
        .prepare(
            "SELECT track, model_id, occurred_at, failed, hallucination, latency_ms, cost
             FROM feedback_events
             WHERE occurred_at >= ?1 AND occurred_at < ?2",
        )
        .context("failed to prepare feedback query")?;
    let mut rows = stmt
        .query(params![lower, upper])
        .context("failed to query feedback events")?;

    let mut scan = FeedbackScan {
        samples: Vec::new(),
        malformed_rows: 0,
        coerced_values: 0,
    };
    while let Some(row) = rows.next().context("failed to read feedback row")? {
        // Columns are loosely typed; nothing here may fail the tick.
        let (Some(track), Some(model_id), Some(occurred_at)) = (
            text_value(row.get_ref(0)?).and_then(Track::parse),
            text_value(row.get_ref(1)?),
            text_value(row.get_ref(2)?).and_then(|raw| parse_rfc3339_utc(raw).ok()),
        ) else {
            scan.malformed_rows += 1;
            continue;
        };
        if !window.contains(occurred_at) {
            continue;
        }

        let failed = flag_value(row.get_ref(3)?);
        let hallucination = flag_value(row.get_ref(4)?);
        let latency_ms = metric_value(row.get_ref(5)?);
        let cost = metric_value(row.get_ref(6)?);
        scan.coerced_values += [
            failed.is_none(),
            hallucination.is_none(),
            latency_ms.is_none(),
            cost.is_none(),
        ]
        .into_iter()
        .filter(|rejected| *rejected)
        .count();

        scan.samples.push(FeedbackSample {
            track,
            model_id: model_id.to_string(),
            occurred_at,
            failed: failed.flatten(),
            hallucination: hallucination.flatten(),
            latency_ms: latency_ms.flatten(),
            cost: cost.flatten(),
        });
    }

    Ok(scan)
}

fn text_value(value: ValueRef<'_>) -> Option<&str> {
    match value {
        ValueRef::Text(raw) => std::str::from_utf8(raw).ok(),
        _ => None,
    }
}

/// `Some(None)` for SQL NULL, `None` when the value cannot be a flag.
fn flag_value(value: ValueRef<'_>) -> Option<Option<bool>> {
    match value {
        ValueRef::Null => Some(None),
        ValueRef::Integer(raw) => Some(Some(raw != 0)),
        ValueRef::Real(raw) if raw.is_finite() => Some(Some(raw != 0.0)),
        ValueRef::Text(raw) => match std::str::from_utf8(raw).ok()?.trim() {
            "1" | "true" | "TRUE" | "True" => Some(Some(true)),
            "0" | "false" | "FALSE" | "False" => Some(Some(false)),
            _ => None,
        },
        ValueRef::Real(_) | ValueRef::Blob(_) => None,
    }
}

/// `Some(None)` for SQL NULL, `None` when the value is not a finite number.
#[allow(clippy::cast_precision_loss)]
fn metric_value(value: ValueRef<'_>) -> Option<Option<f64>> {
    let number = match value {
        ValueRef::Null => return Some(None),
        ValueRef::Integer(raw) => raw as f64,
        ValueRef::Real(raw) => raw,
        ValueRef::Text(raw) => std::str::from_utf8(raw).ok()?.trim().parse::<f64>().ok()?,
        ValueRef::Blob(_) => return None,
    };
    number.is_finite().then_some(Some(number))
}

fn insert_snapshot(
    conn: &Connection,
    snapshot: &AggregateSnapshot,
    tick_at: &str,
) -> Result<(String, bool)> {
    let window_from = format_rfc3339(snapshot.window.from).context("invalid window start")?;
    let window_to = format_rfc3339(snapshot.window.to).context("invalid window end")?;

    let inserted = conn
        .execute(
            "INSERT OR IGNORE INTO aggregate_snapshots(
                snapshot_id, tick_at, window_from, window_to,
                prod_count, cand_count,
                prod_success_rate, cand_success_rate,
                prod_hallu_rate, cand_hallu_rate,
                prod_p95_latency, cand_p95_latency,
                prod_avg_cost, cand_avg_cost
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                Ulid::new().to_string(),
                tick_at,
                window_from,
                window_to,
                sql_i64(snapshot.prod_count)?,
                sql_i64(snapshot.cand_count)?,
                snapshot.prod_success_rate,
                snapshot.cand_success_rate,
                snapshot.prod_hallu_rate,
                snapshot.cand_hallu_rate,
                snapshot.prod_p95_latency,
                snapshot.cand_p95_latency,
                snapshot.prod_avg_cost,
                snapshot.cand_avg_cost,
            ],
        )
        .context("failed to insert aggregate snapshot")?;

    let snapshot_id: String = conn
        .query_row(
            "SELECT snapshot_id FROM aggregate_snapshots WHERE window_from = ?1 AND window_to = ?2",
            params![window_from, window_to],
            |row| row.get(0),
        )
        .context("failed to resolve aggregate snapshot id")?;

    Ok((snapshot_id, inserted == 0))
}

fn insert_guard_result(conn: &Connection, snapshot_id: &str, guard: &GuardResult) -> Result<()> {
    let violations_json =
        serde_json::to_string(&guard.violations).context("failed to serialize guard violations")?;

    conn.execute(
        "INSERT OR IGNORE INTO guard_results(
            snapshot_id, passed, reason, violations_json, prod_samples, cand_samples,
            success_pp, halluc_pp, p95_rel, cost_rel
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            snapshot_id,
            i64::from(guard.passed),
            guard.reason,
            violations_json,
            sql_i64(guard.prod_samples)?,
            sql_i64(guard.cand_samples)?,
            guard.success_pp,
            guard.halluc_pp,
            guard.p95_rel,
            guard.cost_rel,
        ],
    )
    .context("failed to insert guard result")?;

    Ok(())
}

fn upsert_candidate(conn: &Connection, candidate: &PromotionCandidate, updated_at: &str) -> Result<()> {
    let window_from = format_rfc3339(candidate.window.from).context("invalid window start")?;
    let window_to = format_rfc3339(candidate.window.to).context("invalid window end")?;

    conn.execute(
        "INSERT INTO promotion_candidates(
            model_id, window_from, window_to, rank,
            success_pp, halluc_pp, p95_rel, cost_rel, promotion_score,
            cand_samples, prod_samples, selection_policy, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
         ON CONFLICT(model_id, window_from, window_to) DO UPDATE SET
           rank = excluded.rank,
           success_pp = excluded.success_pp,
           halluc_pp = excluded.halluc_pp,
           p95_rel = excluded.p95_rel,
           cost_rel = excluded.cost_rel,
           promotion_score = excluded.promotion_score,
           cand_samples = excluded.cand_samples,
           prod_samples = excluded.prod_samples,
           selection_policy = excluded.selection_policy,
           updated_at = excluded.updated_at",
        params![
            candidate.model_id,
            window_from,
            window_to,
            sql_i64(candidate.rank)?,
            candidate.success_pp,
            candidate.halluc_pp,
            candidate.p95_rel,
            candidate.cost_rel,
            candidate.promotion_score,
            sql_i64(candidate.cand_samples)?,
            sql_i64(candidate.prod_samples)?,
            candidate.selection_policy,
            updated_at,
        ],
    )
    .with_context(|| format!("failed to upsert candidate {}", candidate.model_id))?;

    Ok(())
}

/// Returns `true` when a new ledger row was written, `false` when the
/// uniqueness constraints absorbed it.
fn insert_decision(
    conn: &Connection,
    model_id: &str,
    decision: DecisionKind,
    reason: &str,
    decision_ts: &str,
    decision_bucket: i64,
) -> Result<bool> {
    let inserted = conn
        .execute(
            "INSERT OR IGNORE INTO promotion_decisions(
                decision_id, model_id, decision, reason, decision_ts, decision_bucket
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                Ulid::new().to_string(),
                model_id,
                decision.as_str(),
                reason,
                decision_ts,
                decision_bucket,
            ],
        )
        .with_context(|| format!("failed to record {} decision for {model_id}", decision.as_str()))?;

    Ok(inserted > 0)
}

fn model_state(conn: &Connection, model_id: &str) -> Result<PromotionState> {
    let finalized = conn
        .query_row(
            "SELECT 1 FROM promotion_decisions
             WHERE model_id = ?1 AND decision = 'promote_final'
             LIMIT 1",
            params![model_id],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query finalized state")?
        .is_some();

    let latest: Option<String> = conn
        .query_row(
            "SELECT decision FROM promotion_decisions
             WHERE model_id = ?1 AND decision IN ('hold', 'promote')
             ORDER BY decision_ts DESC, rowid DESC
             LIMIT 1",
            params![model_id],
            |row| row.get(0),
        )
        .optional()
        .context("failed to query latest decision")?;

    let latest = latest
        .as_deref()
        .map(|raw| DecisionKind::parse(raw).ok_or_else(|| anyhow!("invalid stored decision: {raw}")))
        .transpose()?;

    Ok(PromotionState::from_ledger(latest, finalized))
}

/// Newest-first `hold`/`promote` entries at or before `until`.
fn decision_history(
    conn: &Connection,
    model_id: &str,
    until: &str,
    limit: usize,
) -> Result<Vec<DecisionHistoryEntry>> {
    let mut stmt = conn
        .prepare(
            "SELECT decision, decision_ts FROM promotion_decisions
             WHERE model_id = ?1 AND decision IN ('hold', 'promote') AND decision_ts <= ?2
             ORDER BY decision_ts DESC, rowid DESC
             LIMIT ?3",
        )
        .context("failed to prepare decision history query")?;
    let rows = stmt.query_map(params![model_id, until, sql_i64(limit)?], |row| {
        let decision_raw: String = row.get(0)?;
        let decision_ts_raw: String = row.get(1)?;
        Ok(DecisionHistoryEntry {
            decision: DecisionKind::parse(&decision_raw).ok_or_else(|| {
                conversion_error(0, Type::Text, format!("invalid decision: {decision_raw}"))
            })?,
            decision_ts: parse_timestamp(1, &decision_ts_raw)?,
        })
    })?;

    collect_rows(rows)
}

fn decision_bucket(now: OffsetDateTime, dedupe_window_secs: u64) -> i64 {
    let width = i64::try_from(dedupe_window_secs).unwrap_or(i64::MAX).max(1);
    now.unix_timestamp().div_euclid(width)
}

fn whole_seconds(value: OffsetDateTime) -> OffsetDateTime {
    let value = value.to_offset(UtcOffset::UTC);
    value.replace_nanosecond(0).unwrap_or(value)
}

fn parse_snapshot_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, AggregateSnapshot)> {
    let snapshot_id: String = row.get(0)?;
    let tick_at: String = row.get(1)?;
    let window_from: String = row.get(2)?;
    let window_to: String = row.get(3)?;

    let snapshot = AggregateSnapshot {
        window: MetricWindow {
            from: parse_timestamp(2, &window_from)?,
            to: parse_timestamp(3, &window_to)?,
        },
        prod_count: parse_count(row, 4)?,
        cand_count: parse_count(row, 5)?,
        prod_success_rate: row.get(6)?,
        cand_success_rate: row.get(7)?,
        prod_hallu_rate: row.get(8)?,
        cand_hallu_rate: row.get(9)?,
        prod_p95_latency: row.get(10)?,
        cand_p95_latency: row.get(11)?,
        prod_avg_cost: row.get(12)?,
        cand_avg_cost: row.get(13)?,
    };

    Ok((snapshot_id, tick_at, snapshot))
}

fn parse_guard_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<GuardResult> {
    let passed: i64 = row.get(0)?;
    let violations_json: String = row.get(2)?;
    let violations: Vec<String> = serde_json::from_str(&violations_json).map_err(|err| {
        conversion_error(2, Type::Text, format!("invalid violations_json: {err}"))
    })?;

    Ok(GuardResult {
        passed: passed != 0,
        reason: row.get(1)?,
        violations,
        prod_samples: parse_count(row, 3)?,
        cand_samples: parse_count(row, 4)?,
        success_pp: row.get(5)?,
        halluc_pp: row.get(6)?,
        p95_rel: row.get(7)?,
        cost_rel: row.get(8)?,
    })
}

fn parse_candidate_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CandidateRecord> {
    let window_from: String = row.get(1)?;
    let window_to: String = row.get(2)?;
    let rank_i64: i64 = row.get(3)?;
    let rank = usize::try_from(rank_i64)
        .map_err(|_| conversion_error(3, Type::Integer, format!("invalid rank: {rank_i64}")))?;

    Ok(CandidateRecord {
        candidate: PromotionCandidate {
            model_id: row.get(0)?,
            window: MetricWindow {
                from: parse_timestamp(1, &window_from)?,
                to: parse_timestamp(2, &window_to)?,
            },
            rank,
            success_pp: row.get(4)?,
            halluc_pp: row.get(5)?,
            p95_rel: row.get(6)?,
            cost_rel: row.get(7)?,
            promotion_score: row.get(8)?,
            cand_samples: parse_count(row, 9)?,
            prod_samples: parse_count(row, 10)?,
            selection_policy: row.get(11)?,
        },
        updated_at: row.get(12)?,
    })
}

fn parse_decision_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DecisionRecord> {
    let decision_raw: String = row.get(2)?;
    let decision = DecisionKind::parse(&decision_raw).ok_or_else(|| {
        conversion_error(2, Type::Text, format!("invalid decision: {decision_raw}"))
    })?;

    Ok(DecisionRecord {
        decision_id: row.get(0)?,
        model_id: row.get(1)?,
        decision,
        reason: row.get(3)?,
        decision_ts: row.get(4)?,
        decision_bucket: row.get(5)?,
    })
}

fn parse_count(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<u64> {
    let raw: i64 = row.get(index)?;
    u64::try_from(raw)
        .map_err(|_| conversion_error(index, Type::Integer, format!("invalid count: {raw}")))
}

fn parse_timestamp(index: usize, raw: &str) -> rusqlite::Result<OffsetDateTime> {
    parse_rfc3339_utc(raw).map_err(|err| conversion_error(index, Type::Text, err.to_string()))
}

fn conversion_error(index: usize, kind: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn sql_i64<T>(value: T) -> Result<i64>
where
    T: TryInto<i64> + Copy + std::fmt::Display,
{
    value
        .try_into()
        .map_err(|_| anyhow!("value {value} does not fit in an sqlite integer"))
}

fn count(conn: &Connection, query: &str) -> Result<u64> {
    let raw: i64 = conn
        .query_row(query, [], |row| row.get(0))
        .with_context(|| format!("failed to run count query: {query}"))?;
    u64::try_from(raw).with_context(|| format!("negative count: {raw}"))
}

fn ensure_feedback_compatibility(conn: &Connection) -> Result<()> {
    if !table_exists(conn, FEEDBACK_TABLE)? {
        return Err(anyhow!(
            "feedback compatibility check failed: expected table {FEEDBACK_TABLE}"
        ));
    }

    ensure_table_has_columns(conn, FEEDBACK_TABLE, FEEDBACK_COLUMNS)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

fn ensure_table_has_columns(conn: &Connection, table_name: &str, columns: &[&str]) -> Result<()> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name})"))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut available = Vec::new();
    while let Some(row) = rows.next()? {
        available.push(row.get::<_, String>(1)?);
    }

    for required in columns {
        if !available.iter().any(|candidate| candidate == required) {
            return Err(anyhow!(
                "feedback compatibility check failed: missing column {table_name}.{required}"
            ));
        }
    }

    Ok(())
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

/// Creates a minimal `feedback_events` table shaped like the ingestion
/// pipeline's. Used by tests and local demos.
pub fn ensure_feedback_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS feedback_events (
            event_id INTEGER PRIMARY KEY AUTOINCREMENT,
            track TEXT NOT NULL,
            model_id TEXT NOT NULL,
            occurred_at TEXT NOT NULL,
            failed INTEGER,
            hallucination INTEGER,
            latency_ms REAL,
            cost REAL
         );
         CREATE INDEX IF NOT EXISTS idx_feedback_events_occurred_at
           ON feedback_events(occurred_at);",
    )
    .context("failed to create feedback_events table")?;

    Ok(())
}

pub fn seed_feedback_events(conn: &Connection, samples: &[FeedbackSample]) -> Result<usize> {
    let mut stmt = conn
        .prepare(
            "INSERT INTO feedback_events(
                track, model_id, occurred_at, failed, hallucination, latency_ms, cost
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .context("failed to prepare feedback insert")?;

    for sample in samples {
        let occurred_at =
            format_rfc3339(sample.occurred_at).context("failed to format occurred_at")?;
        stmt.execute(params![
            sample.track.as_str(),
            sample.model_id,
            occurred_at,
            sample.failed.map(i64::from),
            sample.hallucination.map(i64::from),
            sample.latency_ms,
            sample.cost,
        ])
        .context("failed to seed feedback event")?;
    }

    Ok(samples.len())
}
