//! CLI driver for the pipeline orchestration core.
//!
//! A thin local entry point over `pipeline-core`: validate a pipeline
//! definition, inspect the graph a config would produce, or run it end to
//! end against a null tool registry. Not an HTTP surface and carries no
//! auth -- see the library crate for the actual orchestration logic.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use pipeline_core::factory::PipelineConfig;
use pipeline_core::handlers::NullToolRegistry;
use pipeline_core::runtime::{Runtime, RuntimeConfig, ENV_PREFIX};
use tooling::config::ConfigBuilder;
use anyhow::Context as _;
use tooling::error::format_error_chain;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pipeline")]
#[command(about = "Pipeline orchestration core CLI", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a YAML pipeline config against the factory's templates
    Validate {
        /// Path to a YAML PipelineConfig
        file: PathBuf,
    },

    /// Build the graph a config would produce, without running it
    Inspect {
        /// Path to a YAML PipelineConfig
        file: PathBuf,
    },

    /// Run a pipeline config to completion
    Run {
        /// Path to a YAML PipelineConfig
        file: PathBuf,

        /// Node concurrency (defaults to the runtime's configured default)
        #[arg(short, long)]
        concurrency: Option<usize>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run())
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { file } => {
            println!("Validating: {}", file.display());
            validate(&file)?;
        }
        Commands::Inspect { file } => {
            println!("Inspecting: {}", file.display());
            inspect(&file)?;
        }
        Commands::Run { file, concurrency } => {
            println!("Running: {}", file.display());
            run_pipeline(&file, concurrency).await?;
        }
    }

    Ok(())
}

fn load_config(file: &PathBuf) -> anyhow::Result<PipelineConfig> {
    let contents = std::fs::read_to_string(file).context(format!("failed to read {}", file.display()))?;
    let config: PipelineConfig =
        serde_yaml::from_str(&contents).context(format!("failed to parse {} as a pipeline config", file.display()))?;
    Ok(config)
}

fn build_runtime() -> anyhow::Result<Runtime> {
    let config = RuntimeConfig::from_env_with_defaults(ENV_PREFIX).map_err(|e| anyhow::anyhow!(format_error_chain(&e)))?;
    Ok(Runtime::new(config, Arc::new(NullToolRegistry)))
}

fn validate(file: &PathBuf) -> anyhow::Result<()> {
    let config = load_config(file)?;
    let runtime = build_runtime()?;
    match runtime.build_graph(&config) {
        Ok(graph) => {
            println!("valid: {} nodes, {} entry node(s)", graph.nodes.len(), graph.entry_nodes.len());
            Ok(())
        }
        Err(e) => Err(anyhow::anyhow!(format_error_chain(&e))),
    }
}

fn inspect(file: &PathBuf) -> anyhow::Result<()> {
    let config = load_config(file)?;
    let runtime = build_runtime()?;
    let graph = runtime.build_graph(&config).map_err(|e| anyhow::anyhow!(format_error_chain(&e)))?;

    println!("graph: {} ({})", graph.name, graph.id);
    println!("entry nodes: {}", graph.entry_nodes.join(", "));
    for node in &graph.nodes {
        let deps = if node.dependencies.is_empty() {
            "-".to_string()
        } else {
            node.dependencies.join(", ")
        };
        println!("  {:<20} type={:<10} depends_on=[{}]", node.id, format!("{:?}", node.node_type), deps);
    }
    Ok(())
}

async fn run_pipeline(file: &PathBuf, concurrency: Option<usize>) -> anyhow::Result<()> {
    let config = load_config(file)?;
    let runtime = build_runtime()?;
    let graph = runtime.build_graph(&config).map_err(|e| anyhow::anyhow!(format_error_chain(&e)))?;

    let execution_id = uuid::Uuid::new_v4().to_string();
    let executor = runtime.executor(graph, execution_id.clone(), concurrency);
    let timeout = config.timeout_ms.map(std::time::Duration::from_millis);

    let result = executor.run(execution_id, timeout).await;

    if result.success {
        println!("completed in {}ms", result.duration_ms);
    } else {
        println!("failed after {}ms: {}", result.duration_ms, result.error.as_deref().unwrap_or("unknown error"));
    }
    for node in &result.node_executions {
        println!("  {:<20} {:?} attempts={}", node.node_id, node.status, node.attempts);
    }

    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}
