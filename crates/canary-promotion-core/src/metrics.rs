use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{MetricWindow, PromotionError, Track};

/// One raw feedback record as produced by the ingestion pipeline.
///
/// Optional fields mirror nullable columns: missing flags count as `false`,
/// missing latency/cost are left out of the quantile and the mean.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedbackSample {
    pub track: Track,
    pub model_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
    pub failed: Option<bool>,
    pub hallucination: Option<bool>,
    pub latency_ms: Option<f64>,
    pub cost: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct TrackSummary {
    pub count: u64,
    pub success_rate: f64,
    pub hallu_rate: f64,
    pub p95_latency: f64,
    pub avg_cost: f64,
}

impl TrackSummary {
    /// Checks that a summary is usable for scoring.
    ///
    /// # Errors
    /// Returns [`PromotionError::Computation`] for rates outside `[0, 1]` or
    /// negative / non-finite latency and cost.
    pub fn validate(&self) -> Result<(), PromotionError> {
        for (name, value) in [
            ("success_rate", self.success_rate),
            ("hallu_rate", self.hallu_rate),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(PromotionError::Computation(format!(
                    "{name} MUST be in [0.0, 1.0], got {value}"
                )));
            }
        }

        for (name, value) in [
            ("p95_latency", self.p95_latency),
            ("avg_cost", self.avg_cost),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(PromotionError::Computation(format!(
                    "{name} MUST be finite and >= 0, got {value}"
                )));
            }
        }

        Ok(())
    }
}

/// Tick-level global summary: prod vs. every candidate combined.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregateSnapshot {
    pub window: MetricWindow,
    pub prod_count: u64,
    pub cand_count: u64,
    pub prod_success_rate: f64,
    pub cand_success_rate: f64,
    pub prod_hallu_rate: f64,
    pub cand_hallu_rate: f64,
    pub prod_p95_latency: f64,
    pub cand_p95_latency: f64,
    pub prod_avg_cost: f64,
    pub cand_avg_cost: f64,
}

impl AggregateSnapshot {
    #[must_use]
    pub fn from_summaries(window: MetricWindow, prod: &TrackSummary, cand: &TrackSummary) -> Self {
        Self {
            window,
            prod_count: prod.count,
            cand_count: cand.count,
            prod_success_rate: prod.success_rate,
            cand_success_rate: cand.success_rate,
            prod_hallu_rate: prod.hallu_rate,
            cand_hallu_rate: cand.hallu_rate,
            prod_p95_latency: prod.p95_latency,
            cand_p95_latency: cand.p95_latency,
            prod_avg_cost: prod.avg_cost,
            cand_avg_cost: cand.avg_cost,
        }
    }

    /// Aggregates the global window. Samples outside `window` are ignored.
    #[must_use]
    pub fn aggregate(window: MetricWindow, samples: &[FeedbackSample]) -> Self {
        let prod = summarize(
            samples
                .iter()
                .filter(|item| item.track == Track::Prod && window.contains(item.occurred_at)),
        );
        let cand = summarize(
            samples
                .iter()
                .filter(|item| item.track == Track::Cand && window.contains(item.occurred_at)),
        );
        Self::from_summaries(window, &prod, &cand)
    }

    #[must_use]
    pub fn prod(&self) -> TrackSummary {
        TrackSummary {
            count: self.prod_count,
            success_rate: self.prod_success_rate,
            hallu_rate: self.prod_hallu_rate,
            p95_latency: self.prod_p95_latency,
            avg_cost: self.prod_avg_cost,
        }
    }

    #[must_use]
    pub fn cand(&self) -> TrackSummary {
        TrackSummary {
            count: self.cand_count,
            success_rate: self.cand_success_rate,
            hallu_rate: self.cand_hallu_rate,
            p95_latency: self.cand_p95_latency,
            avg_cost: self.cand_avg_cost,
        }
    }
}

/// Short-window summaries used for ranking: the baseline plus one entry per
/// candidate `model_id` (ordered by `model_id`).
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateWindowSummaries {
    pub window: MetricWindow,
    pub baseline: TrackSummary,
    pub candidates: BTreeMap<String, TrackSummary>,
}

impl CandidateWindowSummaries {
    /// Partitions the candidate window. The baseline is the prod track,
    /// restricted to `baseline_model_id` when one is configured; that model is
    /// never ranked as its own candidate.
    #[must_use]
    pub fn aggregate(
        window: MetricWindow,
        samples: &[FeedbackSample],
        baseline_model_id: Option<&str>,
    ) -> Self {
        let in_window = |item: &&FeedbackSample| window.contains(item.occurred_at);

        let baseline = summarize(samples.iter().filter(in_window).filter(|item| {
            item.track == Track::Prod
                && (baseline_model_id.is_none()
                    || baseline_model_id == Some(item.model_id.as_str()))
        }));

        let mut grouped: BTreeMap<&str, Vec<&FeedbackSample>> = BTreeMap::new();
        for item in samples.iter().filter(in_window) {
            if item.track != Track::Cand {
                continue;
            }
            if baseline_model_id == Some(item.model_id.as_str()) {
                continue;
            }
            grouped.entry(item.model_id.as_str()).or_default().push(item);
        }

        let candidates = grouped
            .into_iter()
            .map(|(model_id, rows)| (model_id.to_string(), summarize(rows)))
            .collect();

        Self {
            window,
            baseline,
            candidates,
        }
    }
}

/// Reduces one partition. An empty partition yields `count = 0` and `0.0`
/// for every derived value.
#[allow(clippy::cast_precision_loss)]
pub fn summarize<'a, I>(samples: I) -> TrackSummary
where
    I: IntoIterator<Item = &'a FeedbackSample>,
{
    let mut count = 0_u64;
    let mut successes = 0_u64;
    let mut hallucinations = 0_u64;
    let mut latencies = Vec::new();
    let mut cost_total = 0.0_f64;
    let mut cost_count = 0_u64;

    for sample in samples {
        count += 1;
        if !sample.failed.unwrap_or(false) {
            successes += 1;
        }
        if sample.hallucination.unwrap_or(false) {
            hallucinations += 1;
        }
        if let Some(latency) = sample.latency_ms.filter(|value| value.is_finite()) {
            latencies.push(latency);
        }
        if let Some(cost) = sample.cost.filter(|value| value.is_finite()) {
            cost_total += cost;
            cost_count += 1;
        }
    }

    if count == 0 {
        return TrackSummary::default();
    }

    TrackSummary {
        count,
        success_rate: successes as f64 / count as f64,
        hallu_rate: hallucinations as f64 / count as f64,
        p95_latency: percentile_cont(&latencies, 0.95),
        avg_cost: if cost_count == 0 {
            0.0
        } else {
            cost_total / cost_count as f64
        },
    }
}

/// Continuous empirical quantile (linear interpolation between order
/// statistics). Returns `0.0` for an empty input.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn percentile_cont(values: &[f64], rank: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let rank = rank.clamp(0.0, 1.0);
    let position = rank * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    if lower == upper {
        return sorted[lower];
    }

    let fraction = position - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}

/// `numerator / denominator`, or exactly `1.0` when the baseline is zero,
/// missing or the result would not be finite.
#[must_use]
pub fn safe_ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 || !denominator.is_finite() || !numerator.is_finite() {
        return 1.0;
    }

    let ratio = numerator / denominator;
    if ratio.is_finite() {
        ratio
    } else {
        1.0
    }
}
