//! Pure numeric core of the SLO monitor: percentile/mean and error-budget
//! arithmetic (§4.G, §8 testable properties 12-13). Kept free of any I/O or
//! shared state so it can be exercised directly against literal samples.

use super::types::{Baseline, Direction, RegressionAlert, Severity};

/// Nearest-rank percentile over ascending-sorted `samples`:
/// `index = ceil(p/100 * N) - 1`. Empty input yields 0.
pub fn percentile(samples: &[f64], p: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let n = sorted.len() as f64;
    let rank = (p / 100.0 * n).ceil() as usize;
    let index = rank.saturating_sub(1).min(sorted.len() - 1);
    sorted[index]
}

pub fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}

pub fn stddev(samples: &[f64]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let m = mean(samples);
    let variance = samples.iter().map(|s| (s - m).powi(2)).sum::<f64>() / samples.len() as f64;
    variance.sqrt()
}

pub struct BudgetResult {
    pub error_budget_used: f64,
    pub error_budget_remaining: f64,
    pub passing: bool,
    pub severity: Severity,
}

/// `direction=lower`: a violation is `actual > target`. `direction=higher`:
/// a violation is `actual < target`. Severity thresholds on usage
/// (`1 - remaining/budget`): >=1.0 critical, >=0.8 warning, else ok.
pub fn evaluate_budget(actual: f64, target: f64, error_budget: f64, direction: Direction) -> BudgetResult {
    let error_budget_used = match direction {
        Direction::Lower => {
            if actual > target && target != 0.0 {
                (actual - target) / target
            } else {
                0.0
            }
        }
        Direction::Higher => {
            if actual < target && target != 0.0 {
                (target - actual) / target
            } else {
                0.0
            }
        }
    };

    let error_budget_remaining = (error_budget - error_budget_used).max(0.0);
    let passing = error_budget_used == 0.0 || error_budget_remaining > 0.0;

    let usage = if error_budget > 0.0 { 1.0 - error_budget_remaining / error_budget } else { 1.0 };
    let severity = if usage >= 1.0 {
        Severity::Critical
    } else if usage >= 0.8 {
        Severity::Warning
    } else {
        Severity::Ok
    };

    BudgetResult { error_budget_used, error_budget_remaining, passing, severity }
}

/// Compares the mean of all but the last 10 samples ("historical") against
/// the mean of the last 10 ("recent"); requires at least `lookback` samples
/// total before reporting anything (§4.G).
pub fn detect_regression(metric: impl Into<String>, baseline: &Baseline, threshold: f64, lookback: usize) -> Option<RegressionAlert> {
    if baseline.len() < lookback || baseline.len() <= 10 {
        return None;
    }
    let samples: Vec<f64> = baseline.samples().iter().copied().collect();
    let split = samples.len() - 10;
    let historical = mean(&samples[..split]);
    let recent = mean(&samples[split..]);
    if historical == 0.0 {
        return None;
    }
    let change = (recent - historical) / historical;
    if change.abs() <= threshold {
        return None;
    }
    let severity = if change.abs() > 2.0 * threshold { Severity::Critical } else { Severity::Warning };
    Some(RegressionAlert { metric: metric.into(), change, severity })
}
