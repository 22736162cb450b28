//! Wire types for the SLO Monitor (component G, §3 "SLO").

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Higher,
    Lower,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Ok,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slo {
    pub name: String,
    pub metric_name: String,
    pub target: f64,
    pub window_secs: u64,
    pub percentile: Option<f64>,
    pub error_budget: f64,
    #[serde(default = "default_direction")]
    pub direction: Direction,
    pub query: Option<String>,
}

fn default_direction() -> Direction {
    Direction::Lower
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SloStatus {
    pub name: String,
    pub target: f64,
    pub actual: f64,
    pub passing: bool,
    pub error_budget: f64,
    pub error_budget_used: f64,
    pub error_budget_remaining: f64,
    pub severity: Severity,
    pub last_checked: chrono::DateTime<chrono::Utc>,
}

/// Bounded circular buffer of numeric samples for one metric id, used for
/// regression comparison (§4.G).
#[derive(Debug, Clone)]
pub struct Baseline {
    capacity: usize,
    samples: VecDeque<f64>,
}

impl Baseline {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, samples: VecDeque::with_capacity(capacity) }
    }

    pub fn push(&mut self, sample: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &VecDeque<f64> {
        &self.samples
    }
}

#[derive(Debug, Clone)]
pub struct RegressionAlert {
    pub metric: String,
    pub change: f64,
    pub severity: Severity,
}

#[derive(Debug, Clone)]
pub struct SloConfig {
    pub check_interval_secs: u64,
    pub baseline_cap: usize,
    pub history_cap: usize,
    pub regression_lookback: usize,
    pub regression_threshold: f64,
}

impl Default for SloConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            baseline_cap: 100,
            history_cap: 1000,
            regression_lookback: 50,
            regression_threshold: 0.2,
        }
    }
}
