use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::guard::GuardResult;
use crate::policy::{ConfirmationPolicy, PromotionThresholds};
use crate::ranking::PromotionCandidate;
use crate::DecisionKind;

pub const REASON_ALL_THRESHOLDS_MET: &str = "all_thresholds_met";
pub const REASON_INSUFFICIENT_CAND_SAMPLES: &str = "insufficient_cand_samples";
pub const REASON_INSUFFICIENT_PROD_SAMPLES: &str = "insufficient_prod_samples";
pub const REASON_HALLUC_PP_EXCEEDED: &str = "halluc_pp_exceeded";
pub const REASON_P95_REL_EXCEEDED: &str = "p95_rel_exceeded";
pub const REASON_COST_REL_EXCEEDED: &str = "cost_rel_exceeded";
pub const REASON_GUARD_FAILED: &str = "guard_failed";
pub const REASON_CONFIRMED: &str = "confirmed_consecutive_promotes";

/// Per-model promotion state. `PromoteFinal` is terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PromotionState {
    Unscored,
    Hold,
    PromoteCandidate,
    PromoteFinal,
}

impl PromotionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unscored => "UNSCORED",
            Self::Hold => "HOLD",
            Self::PromoteCandidate => "PROMOTE_CANDIDATE",
            Self::PromoteFinal => "PROMOTE_FINAL",
        }
    }

    /// State implied by a model's ledger: its newest decision, or final when
    /// one was ever recorded.
    #[must_use]
    pub fn from_ledger(latest: Option<DecisionKind>, finalized: bool) -> Self {
        if finalized {
            return Self::PromoteFinal;
        }
        match latest {
            None => Self::Unscored,
            Some(DecisionKind::Hold) => Self::Hold,
            Some(DecisionKind::Promote) => Self::PromoteCandidate,
            Some(DecisionKind::PromoteFinal) => Self::PromoteFinal,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == Self::PromoteFinal
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct GateOutcome {
    pub decision: DecisionKind,
    pub reasons: Vec<String>,
    pub reason: String,
}

/// One `hold`/`promote` ledger entry used for the confirmation check.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct DecisionHistoryEntry {
    pub decision: DecisionKind,
    #[serde(with = "time::serde::rfc3339")]
    pub decision_ts: OffsetDateTime,
}

/// Applies the per-candidate thresholds. Every failed threshold is listed.
#[must_use]
pub fn gate_candidate(
    candidate: &PromotionCandidate,
    thresholds: &PromotionThresholds,
    guard: Option<&GuardResult>,
    require_guard_pass: bool,
) -> GateOutcome {
    let mut reasons = Vec::new();

    if candidate.cand_samples < thresholds.min_cand_samples {
        reasons.push(REASON_INSUFFICIENT_CAND_SAMPLES.to_string());
    }
    if candidate.prod_samples < thresholds.min_prod_samples {
        reasons.push(REASON_INSUFFICIENT_PROD_SAMPLES.to_string());
    }
    if candidate.halluc_pp > thresholds.halluc_pp_max {
        reasons.push(REASON_HALLUC_PP_EXCEEDED.to_string());
    }
    if candidate.p95_rel > thresholds.p95_rel_max {
        reasons.push(REASON_P95_REL_EXCEEDED.to_string());
    }
    if candidate.cost_rel > thresholds.cost_rel_max {
        reasons.push(REASON_COST_REL_EXCEEDED.to_string());
    }
    if require_guard_pass && !guard.is_some_and(|result| result.passed) {
        reasons.push(REASON_GUARD_FAILED.to_string());
    }

    if reasons.is_empty() {
        return GateOutcome {
            decision: DecisionKind::Promote,
            reasons: vec![REASON_ALL_THRESHOLDS_MET.to_string()],
            reason: REASON_ALL_THRESHOLDS_MET.to_string(),
        };
    }

    GateOutcome {
        decision: DecisionKind::Hold,
        reason: reasons.join(";"),
        reasons,
    }
}

#[must_use]
pub fn next_state(current: PromotionState, outcome: &GateOutcome) -> PromotionState {
    if current.is_terminal() {
        return current;
    }
    match outcome.decision {
        DecisionKind::Hold => PromotionState::Hold,
        DecisionKind::Promote => PromotionState::PromoteCandidate,
        DecisionKind::PromoteFinal => PromotionState::PromoteFinal,
    }
}

/// True when the newest `policy.count` entries of `history` (newest first)
/// are all `promote`. In lookback mode only entries inside
/// `[now - lookback, now]` are considered, so stale promotes never count.
#[must_use]
pub fn confirmation_reached(
    history: &[DecisionHistoryEntry],
    now: OffsetDateTime,
    policy: &ConfirmationPolicy,
) -> bool {
    if policy.count == 0 {
        return false;
    }

    // A lookback reaching before the representable range bounds nothing.
    let earliest = policy
        .lookback()
        .and_then(|lookback| now.checked_sub(lookback));
    let recent: Vec<&DecisionHistoryEntry> = history
        .iter()
        .filter(|entry| entry.decision != DecisionKind::PromoteFinal)
        .filter(|entry| entry.decision_ts <= now)
        .filter(|entry| match earliest {
            Some(earliest) => entry.decision_ts >= earliest,
            None => true,
        })
        .take(policy.count)
        .collect();

    recent.len() == policy.count
        && recent
            .iter()
            .all(|entry| entry.decision == DecisionKind::Promote)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{ConfirmationMode, PolicyConfig};
    use crate::{parse_rfc3339_utc, MetricWindow};
    use time::Duration;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn start() -> OffsetDateTime {
        must_ok(parse_rfc3339_utc("2026-02-07T12:00:00Z"))
    }

    fn candidate() -> PromotionCandidate {
        PromotionCandidate {
            model_id: "cand-a".to_string(),
            window: must_ok(MetricWindow::ending_at(start(), Duration::HOUR)),
            rank: 1,
            success_pp: 3.0,
            halluc_pp: -0.5,
            p95_rel: 1.04,
            cost_rel: 0.9,
            promotion_score: 1.352,
            cand_samples: 500,
            prod_samples: 500,
            selection_policy: "fixture".to_string(),
        }
    }

    fn guard(passed: bool) -> GuardResult {
        GuardResult {
            passed,
            reason: (if passed { "ok" } else { "p95_rel_above_max(1.200>1.100)" }).to_string(),
            violations: Vec::new(),
            prod_samples: 500,
            cand_samples: 500,
            success_pp: None,
            halluc_pp: None,
            p95_rel: None,
            cost_rel: None,
        }
    }

    fn entry(decision: DecisionKind, at: OffsetDateTime) -> DecisionHistoryEntry {
        DecisionHistoryEntry {
            decision,
            decision_ts: at,
        }
    }

    #[test]
    fn candidate_meeting_all_thresholds_is_promoted() {
        let outcome = gate_candidate(&candidate(), &PolicyConfig::default().promotion, None, false);
        assert_eq!(outcome.decision, DecisionKind::Promote);
        assert_eq!(outcome.reason, REASON_ALL_THRESHOLDS_MET);
    }

    #[test]
    fn hold_lists_every_failed_threshold() {
        let mut weak = candidate();
        weak.cand_samples = 10;
        weak.p95_rel = 1.5;
        weak.cost_rel = 2.0;

        let outcome = gate_candidate(&weak, &PolicyConfig::default().promotion, None, false);
        assert_eq!(outcome.decision, DecisionKind::Hold);
        assert_eq!(
            outcome.reason,
            "insufficient_cand_samples;p95_rel_exceeded;cost_rel_exceeded"
        );
        assert_eq!(outcome.reasons.len(), 3);
    }

    #[test]
    fn failed_guard_only_blocks_when_required() {
        let thresholds = PolicyConfig::default().promotion;
        let failing = guard(false);

        let advisory = gate_candidate(&candidate(), &thresholds, Some(&failing), false);
        assert_eq!(advisory.decision, DecisionKind::Promote);

        let required = gate_candidate(&candidate(), &thresholds, Some(&failing), true);
        assert_eq!(required.decision, DecisionKind::Hold);
        assert_eq!(required.reason, REASON_GUARD_FAILED);

        let passing = gate_candidate(&candidate(), &thresholds, Some(&guard(true)), true);
        assert_eq!(passing.decision, DecisionKind::Promote);
    }

    #[test]
    fn final_state_is_terminal() {
        let starved = PromotionCandidate {
            cand_samples: 0,
            ..candidate()
        };
        let hold = gate_candidate(&starved, &PolicyConfig::default().promotion, None, false);

        assert_eq!(next_state(PromotionState::PromoteFinal, &hold), PromotionState::PromoteFinal);
        assert_eq!(next_state(PromotionState::Unscored, &hold), PromotionState::Hold);
        assert_eq!(
            PromotionState::from_ledger(Some(DecisionKind::Hold), true),
            PromotionState::PromoteFinal
        );
        assert_eq!(PromotionState::from_ledger(None, false), PromotionState::Unscored);
    }

    #[test]
    fn interrupted_streak_emits_exactly_one_final() {
        let policy = PolicyConfig::default().confirmation;
        let sequence = [
            DecisionKind::Promote,
            DecisionKind::Promote,
            DecisionKind::Hold,
            DecisionKind::Promote,
            DecisionKind::Promote,
            DecisionKind::Promote,
        ];

        let mut history: Vec<DecisionHistoryEntry> = Vec::new();
        let mut state = PromotionState::Unscored;
        let mut finals = Vec::new();

        for (index, decision) in sequence.iter().enumerate() {
            if state.is_terminal() {
                break;
            }
            let now = start() + Duration::minutes(i64::try_from(index).unwrap_or_default());
            history.insert(0, entry(*decision, now));
            state = next_state(
                state,
                &GateOutcome {
                    decision: *decision,
                    reasons: Vec::new(),
                    reason: String::new(),
                },
            );

            if *decision == DecisionKind::Promote && confirmation_reached(&history, now, &policy) {
                finals.push(index);
                state = PromotionState::PromoteFinal;
            }
        }

        assert_eq!(finals, vec![5]);
        assert_eq!(state, PromotionState::PromoteFinal);
    }

    #[test]
    fn lookback_excludes_stale_promotes() {
        let now = start();
        let history = vec![
            entry(DecisionKind::Promote, now),
            entry(DecisionKind::Promote, now - Duration::minutes(10)),
            entry(DecisionKind::Promote, now - Duration::minutes(20)),
        ];

        let within = PolicyConfig::default().confirmation;
        assert!(!confirmation_reached(&history, now, &within));

        let spacing_free = ConfirmationPolicy {
            mode: ConfirmationMode::Consecutive,
            ..within
        };
        assert!(confirmation_reached(&history, now, &spacing_free));
    }

    #[test]
    fn unbounded_lookback_confirms_without_overflow() {
        let now = start();
        let history = vec![
            entry(DecisionKind::Promote, now),
            entry(DecisionKind::Promote, now - Duration::days(400)),
            entry(DecisionKind::Promote, now - Duration::days(800)),
        ];
        let policy = ConfirmationPolicy {
            lookback_secs: u64::MAX,
            ..PolicyConfig::default().confirmation
        };

        assert!(confirmation_reached(&history, now, &policy));
        let earliest_representable = time::PrimitiveDateTime::MIN.assume_utc();
        assert!(!confirmation_reached(&history, earliest_representable, &policy));
    }

    #[test]
    fn too_few_decisions_never_confirm() {
        let now = start();
        let history = vec![
            entry(DecisionKind::Promote, now),
            entry(DecisionKind::Promote, now - Duration::minutes(1)),
        ];
        assert!(!confirmation_reached(
            &history,
            now,
            &PolicyConfig::default().confirmation
        ));
    }
}
