//! Integration tests for pipeline-cli's config-loading surface.
//!
//! `pipeline-cli` is binary-only, so these exercise the same path the
//! `validate`/`inspect`/`run` subcommands take: parse a YAML file into a
//! [`pipeline_core::factory::PipelineConfig`] and hand it to the factory.

use std::fs;

use pipeline_core::factory::PipelineConfig;
use pipeline_core::handlers::NullToolRegistry;
use pipeline_core::runtime::{Runtime, RuntimeConfig};
use std::sync::Arc;
use tempfile::TempDir;

fn write_yaml(dir: &TempDir, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, contents).unwrap();
    path
}

#[test]
fn minimal_quick_fix_config_parses() {
    let dir = TempDir::new().unwrap();
    let path = write_yaml(
        &dir,
        "quick_fix.yaml",
        r#"
type: quick_fix
name: patch-the-thing
"#,
    );

    let contents = fs::read_to_string(&path).unwrap();
    let config: PipelineConfig = serde_yaml::from_str(&contents).unwrap();
    assert_eq!(config.name, "patch-the-thing");
    assert!(config.concurrency.is_none());
}

#[test]
fn config_with_all_optional_fields_parses() {
    let dir = TempDir::new().unwrap();
    let path = write_yaml(
        &dir,
        "full.yaml",
        r#"
type: development
name: feature-x
description: builds feature x end to end
timeout_ms: 60000
concurrency: 4
parameters:
  ticket: ABC-123
retry_policy:
  max_retries: 3
  backoff_ms: 500
  exponential: true
"#,
    );

    let contents = fs::read_to_string(&path).unwrap();
    let config: PipelineConfig = serde_yaml::from_str(&contents).unwrap();
    assert_eq!(config.description.as_deref(), Some("builds feature x end to end"));
    assert_eq!(config.timeout_ms, Some(60_000));
    assert_eq!(config.concurrency, Some(4));
    assert!(config.retry_policy.unwrap().exponential);
}

#[test]
fn malformed_yaml_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_yaml(
        &dir,
        "broken.yaml",
        r#"
type: development
name: [this is not a string
"#,
    );

    let contents = fs::read_to_string(&path).unwrap();
    let result: Result<PipelineConfig, _> = serde_yaml::from_str(&contents);
    assert!(result.is_err());
}

#[test]
fn unknown_pipeline_type_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_yaml(
        &dir,
        "unknown.yaml",
        r#"
type: not_a_real_pipeline_type
name: whatever
"#,
    );

    let contents = fs::read_to_string(&path).unwrap();
    let result: Result<PipelineConfig, _> = serde_yaml::from_str(&contents);
    assert!(result.is_err());
}

#[tokio::test]
async fn parsed_config_builds_and_runs_against_the_runtime() {
    let dir = TempDir::new().unwrap();
    let path = write_yaml(
        &dir,
        "testing.yaml",
        r#"
type: testing
name: run-the-suite
"#,
    );

    let contents = fs::read_to_string(&path).unwrap();
    let config: PipelineConfig = serde_yaml::from_str(&contents).unwrap();

    let runtime = Runtime::new(RuntimeConfig::default(), Arc::new(NullToolRegistry));
    let graph = runtime.build_graph(&config).unwrap();
    let executor = runtime.executor(graph, "cli-test-execution", None);
    let result = executor.run("cli-test-execution", None).await;
    assert!(result.success);

    let metrics = runtime.monitor.metrics_for("cli-test-execution").unwrap();
    assert!(!metrics.dependencies.is_empty());
}
