use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::metrics::{safe_ratio, CandidateWindowSummaries, TrackSummary};
use crate::policy::ScoreWeights;
use crate::{MetricWindow, PromotionError};

/// One scored candidate, keyed by `(model_id, window.from, window.to)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromotionCandidate {
    pub model_id: String,
    pub window: MetricWindow,
    pub rank: usize,
    pub success_pp: f64,
    pub halluc_pp: f64,
    pub p95_rel: f64,
    pub cost_rel: f64,
    pub promotion_score: f64,
    pub cand_samples: u64,
    pub prod_samples: u64,
    pub selection_policy: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SkippedCandidate {
    pub model_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankingOutcome {
    pub ranked: Vec<PromotionCandidate>,
    pub skipped: Vec<SkippedCandidate>,
    pub scored_total: usize,
}

impl RankingOutcome {
    #[must_use]
    pub fn top(&self) -> Option<&PromotionCandidate> {
        self.ranked.first()
    }
}

/// Scores one candidate against the baseline.
///
/// Derived values are rounded to six decimals so that persisted rows and tie
/// detection do not depend on floating point noise.
///
/// # Errors
/// Returns [`PromotionError::Computation`] when the candidate or baseline
/// summary is malformed or the score is not finite.
pub fn score_candidate(
    model_id: &str,
    candidate: &TrackSummary,
    baseline: &TrackSummary,
    weights: &ScoreWeights,
    window: MetricWindow,
) -> Result<PromotionCandidate, PromotionError> {
    if model_id.trim().is_empty() {
        return Err(PromotionError::Computation(
            "model_id MUST be non-empty".to_string(),
        ));
    }
    if candidate.count == 0 {
        return Err(PromotionError::Computation(
            "candidate has no samples in window".to_string(),
        ));
    }
    candidate
        .validate()
        .map_err(|err| PromotionError::Computation(format!("candidate summary: {err}")))?;
    baseline
        .validate()
        .map_err(|err| PromotionError::Computation(format!("baseline summary: {err}")))?;

    let success_pp = round6((candidate.success_rate - baseline.success_rate) * 100.0);
    let halluc_pp = round6((candidate.hallu_rate - baseline.hallu_rate) * 100.0);
    let p95_rel = round6(safe_ratio(candidate.p95_latency, baseline.p95_latency));
    let cost_rel = round6(safe_ratio(candidate.avg_cost, baseline.avg_cost));

    let score = weights.success * success_pp
        + weights.hallu * (-halluc_pp)
        + weights.p95 * (1.0 - p95_rel)
        + weights.cost * (1.0 - cost_rel);
    if !score.is_finite() {
        return Err(PromotionError::Computation(format!(
            "promotion score is not finite: {score}"
        )));
    }

    Ok(PromotionCandidate {
        model_id: model_id.to_string(),
        window,
        rank: 0,
        success_pp,
        halluc_pp,
        p95_rel,
        cost_rel,
        promotion_score: round6(score),
        cand_samples: candidate.count,
        prod_samples: baseline.count,
        selection_policy: selection_policy(weights),
    })
}

/// Total order used for ranking: higher score first, then lower `halluc_pp`,
/// lower `p95_rel`, lower `cost_rel`, more candidate samples and finally
/// `model_id` so that identical inputs always produce identical output.
#[must_use]
pub fn compare_candidates(lhs: &PromotionCandidate, rhs: &PromotionCandidate) -> Ordering {
    rhs.promotion_score
        .total_cmp(&lhs.promotion_score)
        .then_with(|| lhs.halluc_pp.total_cmp(&rhs.halluc_pp))
        .then_with(|| lhs.p95_rel.total_cmp(&rhs.p95_rel))
        .then_with(|| lhs.cost_rel.total_cmp(&rhs.cost_rel))
        .then_with(|| rhs.cand_samples.cmp(&lhs.cand_samples))
        .then_with(|| lhs.model_id.cmp(&rhs.model_id))
}

/// Scores every candidate with traffic, ranks them and keeps the top `top_k`.
///
/// A candidate that cannot be scored is reported in `skipped` and never
/// prevents the others from being ranked.
#[must_use]
pub fn rank_candidates(
    summaries: &CandidateWindowSummaries,
    weights: &ScoreWeights,
    top_k: usize,
) -> RankingOutcome {
    let mut scored = Vec::new();
    let mut skipped = Vec::new();

    for (model_id, summary) in &summaries.candidates {
        if summary.count == 0 {
            continue;
        }

        match score_candidate(
            model_id,
            summary,
            &summaries.baseline,
            weights,
            summaries.window,
        ) {
            Ok(candidate) => scored.push(candidate),
            Err(err) => skipped.push(SkippedCandidate {
                model_id: model_id.clone(),
                reason: err.to_string(),
            }),
        }
    }

    let scored_total = scored.len();
    scored.sort_by(compare_candidates);
    scored.truncate(top_k);
    for (index, candidate) in scored.iter_mut().enumerate() {
        candidate.rank = index + 1;
    }

    RankingOutcome {
        ranked: scored,
        skipped,
        scored_total,
    }
}

fn selection_policy(weights: &ScoreWeights) -> String {
    format!(
        "weighted_score(success={:.2},hallu={:.2},p95={:.2},cost={:.2})",
        weights.success, weights.hallu, weights.p95, weights.cost
    )
}

fn round6(value: f64) -> f64 {
    if !value.is_finite() {
        return value;
    }
    (value * 1_000_000.0).round() / 1_000_000.0
}
