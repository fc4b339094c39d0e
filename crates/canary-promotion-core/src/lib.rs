//! Pure decision logic for continuous canary promotion.
//!
//! Every tick the host aggregates two traffic populations (`prod` and `cand`),
//! evaluates a global safety guard, ranks candidate models against a baseline
//! and records promotion decisions behind a consecutive-pass confirmation gate.
//! This crate owns the math and the state machine; persistence and scheduling
//! live in the store and CLI crates.

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime, UtcOffset};

pub mod decision;
pub mod guard;
pub mod metrics;
pub mod policy;
pub mod ranking;

pub use decision::{
    confirmation_reached, gate_candidate, next_state, DecisionHistoryEntry, GateOutcome,
    PromotionState,
};
pub use guard::{evaluate_guard, GuardResult};
pub use metrics::{
    percentile_cont, safe_ratio, summarize, AggregateSnapshot, CandidateWindowSummaries,
    FeedbackSample, TrackSummary,
};
pub use policy::{
    ConfigWarning, ConfirmationMode, ConfirmationPolicy, GuardThresholds, PolicyConfig,
    PromotionThresholds, ScoreWeights, MAX_WINDOW_SECS,
};
pub use ranking::{
    compare_candidates, rank_candidates, score_candidate, PromotionCandidate, RankingOutcome,
    SkippedCandidate,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum PromotionError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("computation error: {0}")]
    Computation(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Track {
    Prod,
    Cand,
}

impl Track {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Prod => "prod",
            Self::Cand => "cand",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "prod" => Some(Self::Prod),
            "cand" => Some(Self::Cand),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Hold,
    Promote,
    PromoteFinal,
}

impl DecisionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hold => "hold",
            Self::Promote => "promote",
            Self::PromoteFinal => "promote_final",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "hold" => Some(Self::Hold),
            "promote" => Some(Self::Promote),
            "promote_final" => Some(Self::PromoteFinal),
            _ => None,
        }
    }
}

/// Half-open interval `[from, to)` a summary was computed over.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MetricWindow {
    #[serde(with = "time::serde::rfc3339")]
    pub from: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub to: OffsetDateTime,
}

impl MetricWindow {
    /// Builds the window of `length` ending at `to`.
    ///
    /// # Errors
    /// Returns [`PromotionError::Validation`] for a non-positive length or one
    /// reaching past the representable date range.
    pub fn ending_at(to: OffsetDateTime, length: Duration) -> Result<Self, PromotionError> {
        if length <= Duration::ZERO {
            return Err(PromotionError::Validation(
                "window length MUST be positive".to_string(),
            ));
        }

        let from = to.checked_sub(length).ok_or_else(|| {
            PromotionError::Validation(format!("window of {length} before {to} is out of range"))
        })?;
        Ok(Self { from, to })
    }

    #[must_use]
    pub fn contains(&self, at: OffsetDateTime) -> bool {
        at >= self.from && at < self.to
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`PromotionError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, PromotionError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| PromotionError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(PromotionError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`PromotionError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, PromotionError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            PromotionError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

/// Current wall clock in UTC, truncated to whole seconds so that window bounds
/// round-trip through their stored text form unchanged.
#[must_use]
pub fn now_utc() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc().to_offset(UtcOffset::UTC);
    now.replace_nanosecond(0).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn track_and_decision_codes_round_trip() {
        for track in [Track::Prod, Track::Cand] {
            assert_eq!(Track::parse(track.as_str()), Some(track));
        }
        for kind in [
            DecisionKind::Hold,
            DecisionKind::Promote,
            DecisionKind::PromoteFinal,
        ] {
            assert_eq!(DecisionKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(Track::parse("shadow"), None);
        assert_eq!(DecisionKind::parse("rollback"), None);
    }

    #[test]
    fn window_is_half_open() {
        let to = must_ok(parse_rfc3339_utc("2026-02-07T12:00:00Z"));
        let window = must_ok(MetricWindow::ending_at(to, Duration::hours(1)));

        assert!(window.contains(window.from));
        assert!(!window.contains(window.to));
        assert!(window.contains(to - Duration::SECOND));
    }

    #[test]
    fn window_rejects_non_positive_length() {
        let to = must_ok(parse_rfc3339_utc("2026-02-07T12:00:00Z"));
        assert!(MetricWindow::ending_at(to, Duration::ZERO).is_err());
    }

    #[test]
    fn window_reaching_past_the_date_range_is_an_error() {
        let to = must_ok(parse_rfc3339_utc("2026-02-07T12:00:00Z"));
        let err = match MetricWindow::ending_at(to, Duration::seconds(i64::MAX)) {
            Ok(window) => panic!("expected out-of-range error, got {window:?}"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn parse_rejects_non_utc_offsets() {
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00+02:00").is_err());
        assert!(parse_rfc3339_utc("not-a-time").is_err());
    }

    #[test]
    fn now_utc_has_no_subsecond_component() {
        assert_eq!(now_utc().nanosecond(), 0);
    }
}
