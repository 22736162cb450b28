//! SLO Monitor (component G): periodic percentile/rate checks against an
//! externally supplied metrics backend, error-budget accounting, and
//! regression detection over per-metric baselines.

pub mod export;
mod math;
mod types;

pub use math::{detect_regression, evaluate_budget, mean, percentile, stddev};
pub use types::{Baseline, Direction, RegressionAlert, Severity, Slo, SloConfig, SloStatus};

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tooling::async_utils::timeout::{with_timeout, TimeoutError};
use tracing::{info, warn};

use crate::events::{EventBus, SloEvent};

/// Bound on how long a single metrics-backend call may take before a check
/// pass treats that SLO as sample-less for this tick, rather than stalling
/// the whole periodic loop on one slow backend.
const METRICS_FETCH_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// The SLO monitor never collects samples itself; callers supply a
/// collector behind this trait (§6 "Metrics backend"). A test double is a
/// closure-backed implementation over `Arc<Mutex<Vec<f64>>>`.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn samples(&self, metric_name: &str, window_secs: u64) -> Vec<f64>;
}

/// Always returns no samples; used when no real backend is wired up yet so
/// the monitor can still run its ticking loop without panicking.
pub struct EmptyMetricsSource;

#[async_trait]
impl MetricsSource for EmptyMetricsSource {
    async fn samples(&self, _metric_name: &str, _window_secs: u64) -> Vec<f64> {
        Vec::new()
    }
}

struct Inner {
    config: SloConfig,
    slos: Mutex<BTreeMap<String, Slo>>,
    baselines: Mutex<BTreeMap<String, Baseline>>,
    history: Mutex<Vec<SloStatus>>,
    metrics: Arc<dyn MetricsSource>,
    events: Arc<EventBus>,
}

/// Cheaply cloneable handle over the registered SLO set, baseline buffers,
/// and bounded violation history.
#[derive(Clone)]
pub struct SloMonitor(Arc<Inner>);

impl SloMonitor {
    pub fn new(config: SloConfig, metrics: Arc<dyn MetricsSource>, events: Arc<EventBus>) -> Self {
        let monitor = Self(Arc::new(Inner {
            config,
            slos: Mutex::new(BTreeMap::new()),
            baselines: Mutex::new(BTreeMap::new()),
            history: Mutex::new(Vec::new()),
            metrics,
            events,
        }));
        monitor.register_defaults();
        monitor
    }

    /// Registers the default SLO set: latency percentiles for TTFT/RPC/
    /// search, a cache hit-rate SLO, an error-rate SLO, and availability.
    fn register_defaults(&self) {
        for slo in default_slos() {
            self.register(slo);
        }
    }

    pub fn register(&self, slo: Slo) {
        self.0.slos.lock().insert(slo.name.clone(), slo);
    }

    pub fn slos(&self) -> Vec<Slo> {
        self.0.slos.lock().values().cloned().collect()
    }

    /// Runs one check pass over every registered SLO: samples the metrics
    /// backend, computes actual/error-budget/severity, appends to the
    /// bounded history, and emits a `violation` event when not passing.
    /// Also feeds each SLO's samples into its regression baseline and
    /// emits `regression` on a detected alert.
    pub async fn check_once(&self) -> Vec<SloStatus> {
        let slos = self.slos();
        let mut statuses = Vec::with_capacity(slos.len());

        for slo in &slos {
            let fetch = async { Ok::<_, std::convert::Infallible>(self.0.metrics.samples(&slo.metric_name, slo.window_secs).await) };
            let samples = match with_timeout(METRICS_FETCH_TIMEOUT, fetch).await {
                Ok(samples) => samples,
                Err(TimeoutError::Timeout(_)) => {
                    warn!(metric = slo.metric_name, "metrics backend fetch timed out, treating as no samples");
                    Vec::new()
                }
                Err(TimeoutError::OperationFailed(never)) => match never {},
            };
            let actual = match slo.percentile {
                Some(p) => percentile(&samples, p),
                None => mean(&samples),
            };

            let budget = evaluate_budget(actual, slo.target, slo.error_budget, slo.direction);
            let status = SloStatus {
                name: slo.name.clone(),
                target: slo.target,
                actual,
                passing: budget.passing,
                error_budget: slo.error_budget,
                error_budget_used: budget.error_budget_used,
                error_budget_remaining: budget.error_budget_remaining,
                severity: budget.severity,
                last_checked: chrono::Utc::now(),
            };

            if !status.passing {
                warn!(slo = slo.name, actual, target = slo.target, severity = ?status.severity, "SLO violation");
                self.0.events.emit_slo(SloEvent::Violation {
                    slo_name: slo.name.clone(),
                    actual,
                    target: slo.target,
                    severity: status.severity,
                });
            }

            {
                let mut history = self.0.history.lock();
                history.push(status.clone());
                if history.len() > self.0.config.history_cap {
                    let overflow = history.len() - self.0.config.history_cap;
                    history.drain(0..overflow);
                }
            }

            self.record_samples_and_check_regression(&slo.metric_name, &samples);

            statuses.push(status);
        }

        statuses
    }

    fn record_samples_and_check_regression(&self, metric_name: &str, samples: &[f64]) {
        if samples.is_empty() {
            return;
        }
        let alert = {
            let mut baselines = self.0.baselines.lock();
            let baseline = baselines
                .entry(metric_name.to_string())
                .or_insert_with(|| Baseline::new(self.0.config.baseline_cap));
            for sample in samples {
                baseline.push(*sample);
            }
            detect_regression(metric_name, baseline, self.0.config.regression_threshold, self.0.config.regression_lookback)
        };
        if let Some(alert) = alert {
            info!(metric = alert.metric, change = alert.change, severity = ?alert.severity, "regression detected");
            self.0.events.emit_slo(SloEvent::Regression {
                metric: alert.metric,
                change: alert.change,
                severity: alert.severity,
            });
        }
    }

    pub fn history(&self) -> Vec<SloStatus> {
        self.0.history.lock().clone()
    }

    /// Runs [`Self::check_once`] on a `tokio::time::interval` until
    /// `shutdown` fires. Intended to be spawned once by
    /// [`crate::runtime::Runtime`]; tests call [`Self::check_once`]
    /// directly instead of spinning up the loop.
    pub async fn run_forever(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(self.0.config.check_interval_secs));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.check_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

fn default_slos() -> Vec<Slo> {
    vec![
        Slo {
            name: "ttft_p95".to_string(),
            metric_name: "llm.ttft_ms".to_string(),
            target: 2000.0,
            window_secs: 300,
            percentile: Some(95.0),
            error_budget: 0.05,
            direction: Direction::Lower,
            query: None,
        },
        Slo {
            name: "rpc_p99".to_string(),
            metric_name: "rpc.latency_ms".to_string(),
            target: 500.0,
            window_secs: 300,
            percentile: Some(99.0),
            error_budget: 0.01,
            direction: Direction::Lower,
            query: None,
        },
        Slo {
            name: "search_p95".to_string(),
            metric_name: "search.latency_ms".to_string(),
            target: 800.0,
            window_secs: 300,
            percentile: Some(95.0),
            error_budget: 0.02,
            direction: Direction::Lower,
            query: None,
        },
        Slo {
            name: "cache_hit_rate".to_string(),
            metric_name: "cache.hit_rate".to_string(),
            target: 0.9,
            window_secs: 300,
            percentile: None,
            error_budget: 0.05,
            direction: Direction::Higher,
            query: None,
        },
        Slo {
            name: "error_rate".to_string(),
            metric_name: "requests.error_rate".to_string(),
            target: 0.01,
            window_secs: 300,
            percentile: None,
            error_budget: 0.5,
            direction: Direction::Lower,
            query: None,
        },
        Slo {
            name: "availability".to_string(),
            metric_name: "service.availability".to_string(),
            target: 0.999,
            window_secs: 3600,
            percentile: None,
            error_budget: 0.1,
            direction: Direction::Higher,
            query: None,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedSource {
        samples: Vec<f64>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MetricsSource for FixedSource {
        async fn samples(&self, _metric_name: &str, _window_secs: u64) -> Vec<f64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.samples.clone()
        }
    }

    #[tokio::test]
    async fn default_slos_are_registered_and_checkable() {
        let source = Arc::new(FixedSource { samples: vec![100.0, 200.0, 300.0], calls: AtomicUsize::new(0) });
        let monitor = SloMonitor::new(SloConfig::default(), source, Arc::new(EventBus::new()));
        assert_eq!(monitor.slos().len(), 6);
        let statuses = monitor.check_once().await;
        assert_eq!(statuses.len(), 6);
    }

    #[tokio::test]
    async fn s6_violation_matches_spec_scenario() {
        let source = Arc::new(FixedSource { samples: vec![450.0], calls: AtomicUsize::new(0) });
        let monitor = SloMonitor::new(SloConfig::default(), source, Arc::new(EventBus::new()));
        monitor.register(Slo {
            name: "custom".to_string(),
            metric_name: "custom.metric".to_string(),
            target: 300.0,
            window_secs: 60,
            percentile: None,
            error_budget: 0.01,
            direction: Direction::Lower,
            query: None,
        });
        let statuses = monitor.check_once().await;
        let custom = statuses.iter().find(|s| s.name == "custom").unwrap();
        assert_eq!(custom.error_budget_used, 0.5);
        assert!(!custom.passing);
        assert_eq!(custom.severity, Severity::Critical);
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let source = Arc::new(FixedSource { samples: vec![1.0], calls: AtomicUsize::new(0) });
        let monitor = SloMonitor::new(SloConfig { history_cap: 3, ..SloConfig::default() }, source, Arc::new(EventBus::new()));
        for _ in 0..5 {
            monitor.check_once().await;
        }
        assert_eq!(monitor.history().len(), 3);
    }
}
