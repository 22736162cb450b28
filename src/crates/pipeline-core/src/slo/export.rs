//! Alert-rule and dashboard generation for a Prometheus/Grafana-compatible
//! external stack (§6 "Metrics backend"). This module only produces the
//! YAML/JSON documents; it never talks to Prometheus or Grafana directly.

use serde::Serialize;

use super::types::{Direction, Slo};

#[derive(Debug, Serialize)]
pub struct PrometheusRuleGroup {
    pub groups: Vec<RuleGroup>,
}

#[derive(Debug, Serialize)]
pub struct RuleGroup {
    pub name: String,
    pub rules: Vec<AlertRule>,
}

#[derive(Debug, Serialize)]
pub struct AlertRule {
    pub alert: String,
    pub expr: String,
    #[serde(rename = "for")]
    pub for_: String,
    pub labels: RuleLabels,
    pub annotations: RuleAnnotations,
}

#[derive(Debug, Serialize)]
pub struct RuleLabels {
    pub severity: String,
}

#[derive(Debug, Serialize)]
pub struct RuleAnnotations {
    pub summary: String,
}

/// Builds one Prometheus alerting rule per registered SLO: the comparison
/// direction in `expr` mirrors the SLO's own `direction` (`>` for `lower`,
/// `<` for `higher`), not a fixed operator.
pub fn prometheus_rules(slos: &[Slo]) -> PrometheusRuleGroup {
    let rules = slos
        .iter()
        .map(|slo| {
            let op = match slo.direction {
                Direction::Lower => ">",
                Direction::Higher => "<",
            };
            let metric_expr = match slo.percentile {
                Some(p) => format!(
                    "histogram_quantile({}, rate({}_bucket[{}s]))",
                    p / 100.0,
                    slo.metric_name,
                    slo.window_secs
                ),
                None => format!("avg_over_time({}[{}s])", slo.metric_name, slo.window_secs),
            };
            AlertRule {
                alert: format!("SloViolation_{}", slo.name),
                expr: format!("{metric_expr} {op} {}", slo.target),
                for_: "5m".to_string(),
                labels: RuleLabels { severity: "page".to_string() },
                annotations: RuleAnnotations {
                    summary: format!("SLO '{}' is violating its target of {}", slo.name, slo.target),
                },
            }
        })
        .collect();

    PrometheusRuleGroup {
        groups: vec![RuleGroup { name: "pipeline_slo".to_string(), rules }],
    }
}

pub fn prometheus_rules_yaml(slos: &[Slo]) -> crate::error::Result<String> {
    Ok(serde_yaml::to_string(&prometheus_rules(slos))?)
}

#[derive(Debug, Serialize)]
pub struct GrafanaDashboard {
    pub title: String,
    pub panels: Vec<GrafanaPanel>,
}

#[derive(Debug, Serialize)]
pub struct GrafanaPanel {
    pub title: String,
    #[serde(rename = "type")]
    pub panel_type: String,
    pub targets: Vec<GrafanaTarget>,
}

#[derive(Debug, Serialize)]
pub struct GrafanaTarget {
    pub expr: String,
}

/// One graph panel per registered SLO, laid out as a minimal dashboard
/// skeleton; the embedding application is responsible for positioning,
/// thresholds, and import into an actual Grafana instance.
pub fn grafana_dashboard(slos: &[Slo]) -> GrafanaDashboard {
    let panels = slos
        .iter()
        .map(|slo| GrafanaPanel {
            title: slo.name.clone(),
            panel_type: "graph".to_string(),
            targets: vec![GrafanaTarget {
                expr: match slo.percentile {
                    Some(p) => format!("histogram_quantile({}, rate({}_bucket[5m]))", p / 100.0, slo.metric_name),
                    None => format!("avg_over_time({}[5m])", slo.metric_name),
                },
            }],
        })
        .collect();

    GrafanaDashboard { title: "Pipeline SLOs".to_string(), panels }
}

pub fn grafana_dashboard_json(slos: &[Slo]) -> crate::error::Result<String> {
    tooling::serialization::to_stable_json(&grafana_dashboard(slos))
        .map_err(|e| crate::error::PipelineError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slo::types::Direction;

    fn sample_slo() -> Slo {
        Slo {
            name: "rpc_p99".to_string(),
            metric_name: "rpc.latency_ms".to_string(),
            target: 500.0,
            window_secs: 300,
            percentile: Some(99.0),
            error_budget: 0.01,
            direction: Direction::Lower,
            query: None,
        }
    }

    #[test]
    fn prometheus_rules_use_direction_specific_operator() {
        let rules = prometheus_rules(&[sample_slo()]);
        assert_eq!(rules.groups.len(), 1);
        assert!(rules.groups[0].rules[0].expr.contains('>'));
    }

    #[test]
    fn grafana_dashboard_has_one_panel_per_slo() {
        let dashboard = grafana_dashboard(&[sample_slo()]);
        assert_eq!(dashboard.panels.len(), 1);
        assert_eq!(dashboard.panels[0].title, "rpc_p99");
    }

    #[test]
    fn rules_serialize_to_yaml() {
        let yaml = prometheus_rules_yaml(&[sample_slo()]).unwrap();
        assert!(yaml.contains("pipeline_slo"));
    }
}
