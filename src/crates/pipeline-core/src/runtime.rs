//! Runtime wiring (component I): owns every subsystem's long-lived state
//! and is the one place that constructs them from a single configuration
//! value, loaded from `PIPELINE_`-prefixed environment variables via
//! [`tooling::config::ConfigBuilder`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tooling::config::{build_env_key, get_env_bool, get_env_parse_or, ConfigBuilder};
use tooling::rate_limit::RateLimiter;
use tooling::validation::Validator;
use tracing::info;

use crate::bus::{BusConfig, MessageBus};
use crate::context::{ContextConfig, SharedContextManager};
use crate::error::{PipelineError, Result};
use crate::events::EventBus;
use crate::factory::{build_graph, PipelineConfig, TemplateRegistry};
use crate::graph::{GraphDefinition, GraphExecutor};
use crate::handlers::{HandlerRegistry, ToolRegistry};
use crate::monitor::PipelineMonitor;
use crate::slo::{EmptyMetricsSource, MetricsSource, SloConfig, SloMonitor};

/// Flattened configuration for every subsystem, loadable as one unit from
/// `PIPELINE_*` environment variables. Kept flat (rather than nesting the
/// subsystems' own config structs) so [`ConfigBuilder::from_env`] stays a
/// single pass of `get_env_*` calls; [`Self::bus_config`] etc. rebuild the
/// nested structs the subsystems actually want.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub bus_max_queue_size: usize,
    pub bus_default_ttl_ms: u64,
    pub bus_max_retries: u32,
    pub bus_rate_limit_per_sec: usize,
    pub context_max_entries: usize,
    pub context_max_scan_iterations: usize,
    pub context_versioning: bool,
    pub graph_default_concurrency: usize,
    pub slo_check_interval_secs: u64,
    pub slo_baseline_cap: usize,
    pub slo_history_cap: usize,
    pub slo_regression_lookback: usize,
    pub slo_regression_threshold: f64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let bus = BusConfig::default();
        let context = ContextConfig::default();
        let slo = SloConfig::default();
        Self {
            bus_max_queue_size: bus.max_queue_size,
            bus_default_ttl_ms: bus.default_ttl_ms,
            bus_max_retries: bus.max_retries,
            bus_rate_limit_per_sec: 1_000,
            context_max_entries: context.max_entries,
            context_max_scan_iterations: context.max_scan_iterations,
            context_versioning: context.versioning,
            graph_default_concurrency: 10,
            slo_check_interval_secs: slo.check_interval_secs,
            slo_baseline_cap: slo.baseline_cap,
            slo_history_cap: slo.history_cap,
            slo_regression_lookback: slo.regression_lookback,
            slo_regression_threshold: slo.regression_threshold,
        }
    }
}

impl RuntimeConfig {
    pub fn bus_config(&self) -> BusConfig {
        BusConfig {
            max_queue_size: self.bus_max_queue_size,
            default_ttl_ms: self.bus_default_ttl_ms,
            max_retries: self.bus_max_retries,
        }
    }

    pub fn context_config(&self) -> ContextConfig {
        ContextConfig {
            max_entries: self.context_max_entries,
            max_scan_iterations: self.context_max_scan_iterations,
            versioning: self.context_versioning,
        }
    }

    pub fn slo_config(&self) -> SloConfig {
        SloConfig {
            check_interval_secs: self.slo_check_interval_secs,
            baseline_cap: self.slo_baseline_cap,
            history_cap: self.slo_history_cap,
            regression_lookback: self.slo_regression_lookback,
            regression_threshold: self.slo_regression_threshold,
        }
    }
}

impl ConfigBuilder for RuntimeConfig {
    fn validate(&self) -> tooling::Result<()> {
        if self.graph_default_concurrency == 0 {
            return Err(tooling::ToolingError::General(
                "graph_default_concurrency must be non-zero".to_string(),
            ));
        }
        if self.bus_max_queue_size == 0 {
            return Err(tooling::ToolingError::General(
                "bus_max_queue_size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    fn from_env(prefix: &str) -> tooling::Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            bus_max_queue_size: get_env_parse_or(&build_env_key(prefix, "BUS_MAX_QUEUE_SIZE"), defaults.bus_max_queue_size)?,
            bus_default_ttl_ms: get_env_parse_or(&build_env_key(prefix, "BUS_DEFAULT_TTL_MS"), defaults.bus_default_ttl_ms)?,
            bus_max_retries: get_env_parse_or(&build_env_key(prefix, "BUS_MAX_RETRIES"), defaults.bus_max_retries)?,
            bus_rate_limit_per_sec: get_env_parse_or(
                &build_env_key(prefix, "BUS_RATE_LIMIT_PER_SEC"),
                defaults.bus_rate_limit_per_sec,
            )?,
            context_max_entries: get_env_parse_or(&build_env_key(prefix, "CONTEXT_MAX_ENTRIES"), defaults.context_max_entries)?,
            context_max_scan_iterations: get_env_parse_or(
                &build_env_key(prefix, "CONTEXT_MAX_SCAN_ITERATIONS"),
                defaults.context_max_scan_iterations,
            )?,
            context_versioning: get_env_bool(&build_env_key(prefix, "CONTEXT_VERSIONING"))?.unwrap_or(defaults.context_versioning),
            graph_default_concurrency: get_env_parse_or(
                &build_env_key(prefix, "GRAPH_DEFAULT_CONCURRENCY"),
                defaults.graph_default_concurrency,
            )?,
            slo_check_interval_secs: get_env_parse_or(
                &build_env_key(prefix, "SLO_CHECK_INTERVAL_SECS"),
                defaults.slo_check_interval_secs,
            )?,
            slo_baseline_cap: get_env_parse_or(&build_env_key(prefix, "SLO_BASELINE_CAP"), defaults.slo_baseline_cap)?,
            slo_history_cap: get_env_parse_or(&build_env_key(prefix, "SLO_HISTORY_CAP"), defaults.slo_history_cap)?,
            slo_regression_lookback: get_env_parse_or(
                &build_env_key(prefix, "SLO_REGRESSION_LOOKBACK"),
                defaults.slo_regression_lookback,
            )?,
            slo_regression_threshold: get_env_parse_or(
                &build_env_key(prefix, "SLO_REGRESSION_THRESHOLD"),
                defaults.slo_regression_threshold,
            )?,
        })
    }

    /// Every field is already env-or-default resolved by [`Self::from_env`]
    /// (each `get_env_*` call falls back to `Self::default()` itself), so
    /// unlike a config struct with optional/sentinel fields there is
    /// nothing in `self` left to fill in from `other`. `self` wins outright;
    /// `other` only exists to satisfy the trait's merge-with-defaults shape.
    fn merge(&mut self, _other: Self) -> &mut Self {
        self
    }
}

/// The conventional prefix for `RuntimeConfig::from_env_with_defaults`.
pub const ENV_PREFIX: &str = "PIPELINE_";

/// Owns the event bus and every subsystem built on top of it. One
/// `Runtime` corresponds to one running service instance; executions
/// within it share the bus, context store, and monitors, but each gets
/// its own [`GraphExecutor`] built from [`Runtime::executor`].
pub struct Runtime {
    pub events: Arc<EventBus>,
    pub bus: MessageBus,
    pub context: SharedContextManager,
    pub slo: SloMonitor,
    pub monitor: PipelineMonitor,
    pub handlers: Arc<HandlerRegistry>,
    pub templates: TemplateRegistry,
    config: RuntimeConfig,
    bus_rate_limiter: RateLimiter,
    shutdown_tx: watch::Sender<bool>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig, tools: Arc<dyn ToolRegistry>) -> Self {
        Self::with_metrics_source(config, tools, Arc::new(EmptyMetricsSource))
    }

    pub fn with_metrics_source(
        config: RuntimeConfig,
        tools: Arc<dyn ToolRegistry>,
        metrics: Arc<dyn MetricsSource>,
    ) -> Self {
        let events = Arc::new(EventBus::new());
        let bus = MessageBus::new(config.bus_config(), events.clone());
        let context = SharedContextManager::new(config.context_config(), events.clone());
        let slo = SloMonitor::new(config.slo_config(), metrics, events.clone());
        let monitor = PipelineMonitor::new(events.clone());
        let handlers = Arc::new(HandlerRegistry::new(tools));
        let bus_rate_limiter = RateLimiter::new(config.bus_rate_limit_per_sec, Duration::from_secs(1));
        let (shutdown_tx, _) = watch::channel(false);

        info!(
            graph_default_concurrency = config.graph_default_concurrency,
            bus_max_queue_size = config.bus_max_queue_size,
            "pipeline runtime initialized"
        );

        Self {
            events,
            bus,
            context,
            slo,
            monitor,
            handlers,
            templates: TemplateRegistry::new(),
            config,
            bus_rate_limiter,
            shutdown_tx,
        }
    }

    /// Validates a declarative pipeline request before it ever reaches the
    /// factory: `name` must be non-empty and `concurrency`, when set, must
    /// be non-zero. Mirrors the checks the factory's own template
    /// construction assumes hold.
    pub fn validate_pipeline_config(&self, config: &PipelineConfig) -> Result<()> {
        Validator::new(config.name.clone(), "name")
            .not_empty()
            .validate()
            .map_err(|e| PipelineError::validation(e.to_string()))?;

        if let Some(concurrency) = config.concurrency {
            Validator::new(concurrency, "concurrency")
                .min(1)
                .validate()
                .map_err(|e| PipelineError::validation(e.to_string()))?;
        }
        Ok(())
    }

    /// Builds a [`GraphDefinition`] from a declarative config via the
    /// shared [`TemplateRegistry`], after running [`Self::validate_pipeline_config`].
    pub fn build_graph(&self, config: &PipelineConfig) -> Result<GraphDefinition> {
        self.validate_pipeline_config(config)?;
        build_graph(config, &self.templates)
    }

    /// Concurrency a graph should run at when `PipelineConfig.concurrency`
    /// was left unset.
    pub fn default_concurrency(&self) -> usize {
        self.config.graph_default_concurrency
    }

    /// Builds an executor for `graph`, wired to this runtime's shared
    /// handler registry and event bus. `concurrency` defaults to
    /// [`Self::default_concurrency`] when `None`.
    ///
    /// `execution_id` must be the exact id the caller later passes to
    /// [`GraphExecutor::run`]: every [`crate::events::GraphEvent`] the
    /// executor emits carries that id, and [`PipelineMonitor`] keys its
    /// per-execution metrics (including the critical path) on it. Passing
    /// a different id here than at `run()` time silently orphans the
    /// registered dependency topology under an id no event ever matches.
    pub fn executor(&self, graph: GraphDefinition, execution_id: impl Into<String>, concurrency: Option<usize>) -> GraphExecutor {
        let dependencies = graph
            .nodes
            .iter()
            .map(|n| (n.id.clone(), n.dependencies.clone()))
            .collect();
        self.monitor.register_graph(execution_id, dependencies);
        GraphExecutor::new(
            graph,
            self.handlers.clone(),
            self.events.clone(),
            concurrency.unwrap_or(self.config.graph_default_concurrency),
        )
    }

    /// Token-bucket guarded send: backs the bus's own best-effort queueing
    /// with an explicit rate limit so a misbehaving producer cannot flood
    /// a recipient's queue faster than the configured ceiling.
    pub async fn send_rate_limited(&self, draft: crate::bus::MessageDraft) -> Result<crate::bus::CorrelationId> {
        if !self.bus_rate_limiter.check().await {
            return Err(PipelineError::RateLimited(format!(
                "bus send rate exceeds {}/s",
                self.config.bus_rate_limit_per_sec
            )));
        }
        self.bus.send(draft).await
    }

    /// Spawns the background tasks that feed [`PipelineMonitor`] from the
    /// graph event channel and drive [`SloMonitor::run_forever`]. Returns
    /// their join handles so an embedder can await clean shutdown.
    pub fn spawn_background_tasks(&self) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
        let mut graph_rx = self.events.graph.subscribe();
        let monitor = self.monitor.clone();
        let monitor_task = tokio::spawn(async move {
            while let Ok(event) = graph_rx.recv().await {
                monitor.on_graph_event(&event);
            }
        });

        let slo = self.slo.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        let slo_task = tokio::spawn(async move {
            slo.run_forever(shutdown_rx).await;
        });

        (monitor_task, slo_task)
    }

    /// Signals [`Self::spawn_background_tasks`]' SLO loop to stop. The
    /// monitor-feed task exits on its own once every `EventBus::graph`
    /// sender is dropped.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::PipelineType;
    use crate::handlers::NullToolRegistry;

    #[test]
    fn default_config_round_trips_through_subsystem_configs() {
        let config = RuntimeConfig::default();
        assert_eq!(config.bus_config().max_queue_size, config.bus_max_queue_size);
        assert_eq!(config.context_config().max_entries, config.context_max_entries);
        assert_eq!(config.slo_config().check_interval_secs, config.slo_check_interval_secs);
    }

    #[test]
    fn env_override_survives_from_env_with_defaults() {
        std::env::set_var("PIPELINETEST_GRAPH_DEFAULT_CONCURRENCY", "7");
        let config = RuntimeConfig::from_env_with_defaults("PIPELINETEST_").unwrap();
        std::env::remove_var("PIPELINETEST_GRAPH_DEFAULT_CONCURRENCY");
        assert_eq!(config.graph_default_concurrency, 7);
    }

    #[test]
    fn zero_concurrency_fails_validation() {
        let mut config = RuntimeConfig::default();
        config.graph_default_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn runtime_builds_graph_from_declarative_config() {
        let runtime = Runtime::new(RuntimeConfig::default(), Arc::new(NullToolRegistry));
        let pipeline_config = PipelineConfig {
            pipeline_type: PipelineType::QuickFix,
            name: "fix-the-thing".to_string(),
            description: None,
            parameters: Default::default(),
            timeout_ms: None,
            retry_policy: None,
            concurrency: None,
        };
        let graph = runtime.build_graph(&pipeline_config).unwrap();
        assert!(!graph.nodes.is_empty());
    }

    #[tokio::test]
    async fn empty_pipeline_name_is_rejected() {
        let runtime = Runtime::new(RuntimeConfig::default(), Arc::new(NullToolRegistry));
        let pipeline_config = PipelineConfig {
            pipeline_type: PipelineType::QuickFix,
            name: String::new(),
            description: None,
            parameters: Default::default(),
            timeout_ms: None,
            retry_policy: None,
            concurrency: None,
        };
        assert!(runtime.build_graph(&pipeline_config).is_err());
    }
}
