#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use canary_promotion_core::{parse_rfc3339_utc, FeedbackSample, Track};
use canary_promotion_store_sqlite::{ensure_feedback_table, seed_feedback_events, SqliteCanaryStore};
use rusqlite::Connection;
use serde_json::Value;
use time::Duration;
use ulid::Ulid;

fn canary(db_path: &Path, args: &[&str], env: &[(&str, &str)]) -> Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_canary"));
    command.arg("--db").arg(db_path).args(args);
    for (key, value) in env {
        command.env(key, value);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run canary command {:?}: {err}", args),
    }
}

fn parse_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout json: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn seeded_db() -> PathBuf {
    let db_path = std::env::temp_dir().join(format!("canary-flow-{}.sqlite3", Ulid::new()));
    let conn = match Connection::open(&db_path) {
        Ok(value) => value,
        Err(err) => panic!("failed to open setup db: {err}"),
    };
    if let Err(err) = ensure_feedback_table(&conn) {
        panic!("failed to create feedback table: {err}");
    }

    let anchor = match parse_rfc3339_utc("2026-02-07T12:00:00Z") {
        Ok(value) => value,
        Err(err) => panic!("invalid fixture timestamp: {err}"),
    };
    let samples: Vec<FeedbackSample> = (0..250_i64)
        .flat_map(|index| {
            let occurred_at = anchor - Duration::seconds(30 + index);
            [
                FeedbackSample {
                    track: Track::Prod,
                    model_id: "prod-main".to_string(),
                    occurred_at,
                    failed: Some(index % 10 == 0),
                    hallucination: None,
                    latency_ms: Some(500.0),
                    cost: Some(0.010),
                },
                FeedbackSample {
                    track: Track::Cand,
                    model_id: "cand-a".to_string(),
                    occurred_at,
                    failed: Some(index % 25 == 0),
                    hallucination: None,
                    latency_ms: Some(490.0),
                    cost: None,
                },
            ]
        })
        .collect();
    if let Err(err) = seed_feedback_events(&conn, &samples) {
        panic!("failed to seed feedback: {err}");
    }

    db_path
}

#[test]
fn hold_resets_streak_and_final_is_recorded_once() {
    let db_path = seeded_db();
    let hold_env = [("CANARY_PROMOTION_MIN_CAND_SAMPLES", "100000")];
    let schedule: [(&str, &[(&str, &str)]); 7] = [
        ("2026-02-07T12:00:00Z", &[]),
        ("2026-02-07T12:01:00Z", &[]),
        ("2026-02-07T12:02:00Z", &hold_env),
        ("2026-02-07T12:03:00Z", &[]),
        ("2026-02-07T12:04:00Z", &[]),
        ("2026-02-07T12:05:00Z", &[]),
        ("2026-02-07T12:06:00Z", &[]),
    ];

    let mut finalized_at = Vec::new();
    for (at, env) in schedule {
        let output = canary(&db_path, &["tick", "--at", at, "--json"], env);
        assert!(
            output.status.success(),
            "tick at {at} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        if parse_json(&output)["decision"]["finalized"] == Value::Bool(true) {
            finalized_at.push(at);
        }
    }
    assert_eq!(finalized_at, vec!["2026-02-07T12:05:00Z"]);

    let decisions = canary(
        &db_path,
        &["decisions", "list", "--model-id", "cand-a", "--json"],
        &[],
    );
    assert!(decisions.status.success());
    let payload = parse_json(&decisions);
    let Some(rows) = payload.as_array() else {
        panic!("expected decision array, got {payload}");
    };
    let codes: Vec<&str> = rows
        .iter()
        .rev()
        .filter_map(|row| row["decision"].as_str())
        .collect();
    assert_eq!(
        codes,
        vec!["promote", "promote", "hold", "promote", "promote", "promote", "promote_final"]
    );

    let candidates = canary(&db_path, &["candidates", "list", "--limit", "1", "--json"], &[]);
    assert!(candidates.status.success());
    let candidate_rows = parse_json(&candidates);
    assert_eq!(
        candidate_rows[0]["candidate"]["model_id"],
        Value::String("cand-a".to_string())
    );
    assert_eq!(candidate_rows[0]["candidate"]["rank"], Value::Number(1_u64.into()));

    let latest = canary(&db_path, &["snapshot", "latest", "--json"], &[]);
    assert!(latest.status.success());
    let snapshot = parse_json(&latest);
    assert_eq!(
        snapshot["tick_at"],
        Value::String("2026-02-07T12:06:00Z".to_string())
    );

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn run_loop_stops_after_max_ticks_and_reports_summary() {
    let db_path = seeded_db();

    let output = canary(
        &db_path,
        &["run", "--max-ticks", "2", "--interval-secs", "0"],
        &[],
    );
    assert!(
        output.status.success(),
        "run failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let summary = parse_json(&output);
    assert_eq!(summary["ticks"], Value::Number(2_u64.into()));
    assert_eq!(summary["failed_ticks"], Value::Number(0_u64.into()));

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn run_loop_keeps_ticking_after_failed_ticks() {
    let db_path = seeded_db();
    let store = match SqliteCanaryStore::open(&db_path) {
        Ok(value) => value,
        Err(err) => panic!("failed to open store: {err}"),
    };
    if let Err(err) = store.migrate() {
        panic!("failed to migrate store: {err}");
    }
    drop(store);

    let conn = match Connection::open(&db_path) {
        Ok(value) => value,
        Err(err) => panic!("failed to reopen db: {err}"),
    };
    if let Err(err) = conn.execute_batch(
        "CREATE TRIGGER trg_test_reject_candidates
         BEFORE INSERT ON promotion_candidates
         BEGIN
           SELECT RAISE(FAIL, 'candidate writes disabled');
         END;",
    ) {
        panic!("failed to install rejecting trigger: {err}");
    }
    drop(conn);

    let output = canary(
        &db_path,
        &["run", "--max-ticks", "3", "--interval-secs", "0"],
        &[],
    );
    assert!(
        output.status.success(),
        "run should survive failed ticks: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let summary = parse_json(&output);
    assert_eq!(summary["ticks"], Value::Number(3_u64.into()));
    assert_eq!(summary["failed_ticks"], Value::Number(3_u64.into()));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(stderr.matches("tick failed").count(), 3, "stderr={stderr}");
    assert!(stderr.contains("candidate writes disabled"), "stderr={stderr}");

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn text_output_is_human_readable() {
    let db_path = seeded_db();

    let tick = canary(&db_path, &["tick", "--at", "2026-02-07T12:00:00Z"], &[]);
    assert!(tick.status.success());
    let stdout = String::from_utf8_lossy(&tick.stdout);
    assert!(stdout.contains("guard=pass"), "stdout={stdout}");
    assert!(stdout.contains("decision model_id=cand-a decision=promote"), "stdout={stdout}");

    let decisions = canary(&db_path, &["decisions", "list"], &[]);
    assert!(decisions.status.success());
    assert!(String::from_utf8_lossy(&decisions.stdout).contains("all_thresholds_met"));

    let _ = std::fs::remove_file(&db_path);
}
