use serde::{Deserialize, Serialize};

use crate::metrics::{safe_ratio, AggregateSnapshot};
use crate::policy::GuardThresholds;

/// Global safety verdict for one tick, independent of any candidate ranking.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GuardResult {
    pub passed: bool,
    pub reason: String,
    pub violations: Vec<String>,
    pub prod_samples: u64,
    pub cand_samples: u64,
    pub success_pp: Option<f64>,
    pub halluc_pp: Option<f64>,
    pub p95_rel: Option<f64>,
    pub cost_rel: Option<f64>,
}

/// Evaluates the guard without short-circuiting: every violated constraint is
/// collected so `reason` is a complete diagnostic.
#[must_use]
pub fn evaluate_guard(snapshot: &AggregateSnapshot, thresholds: &GuardThresholds) -> GuardResult {
    let prod_samples = snapshot.prod_count;
    let cand_samples = snapshot.cand_count;

    if prod_samples < thresholds.min_required_samples
        || cand_samples < thresholds.min_required_samples
    {
        let violations = vec![format!(
            "insufficient_samples(prod={prod_samples},cand={cand_samples},min={})",
            thresholds.min_required_samples
        )];
        return GuardResult {
            passed: false,
            reason: violations.join(";"),
            violations,
            prod_samples,
            cand_samples,
            success_pp: None,
            halluc_pp: None,
            p95_rel: None,
            cost_rel: None,
        };
    }

    let success_pp = (snapshot.cand_success_rate - snapshot.prod_success_rate) * 100.0;
    let halluc_pp = (snapshot.cand_hallu_rate - snapshot.prod_hallu_rate) * 100.0;
    let p95_rel = safe_ratio(snapshot.cand_p95_latency, snapshot.prod_p95_latency);
    let cost_rel = safe_ratio(snapshot.cand_avg_cost, snapshot.prod_avg_cost);

    let mut violations = Vec::new();
    if success_pp < thresholds.success_pp_min {
        violations.push(format!(
            "success_pp_below_min({success_pp:.3}<{:.3})",
            thresholds.success_pp_min
        ));
    }
    if halluc_pp > thresholds.halluc_pp_max {
        violations.push(format!(
            "halluc_pp_above_max({halluc_pp:.3}>{:.3})",
            thresholds.halluc_pp_max
        ));
    }
    if p95_rel > thresholds.p95_rel_max {
        violations.push(format!(
            "p95_rel_above_max({p95_rel:.3}>{:.3})",
            thresholds.p95_rel_max
        ));
    }
    if cost_rel > thresholds.cost_rel_max {
        violations.push(format!(
            "cost_rel_above_max({cost_rel:.3}>{:.3})",
            thresholds.cost_rel_max
        ));
    }

    let passed = violations.is_empty();
    GuardResult {
        passed,
        reason: if passed {
            "ok".to_string()
        } else {
            violations.join(";")
        },
        violations,
        prod_samples,
        cand_samples,
        success_pp: Some(success_pp),
        halluc_pp: Some(halluc_pp),
        p95_rel: Some(p95_rel),
        cost_rel: Some(cost_rel),
    }
}
