//! `${node.path.segments}` variable substitution with type preservation and
//! prototype-pollution defenses (§4.A of the orchestration spec this module
//! implements).

use std::collections::BTreeMap;

use dashmap::DashMap;
use regex::Regex;

use crate::value::Value;

const DENYLIST: [&str; 3] = ["__proto__", "constructor", "prototype"];

/// Abstracts the `outputs` lookup so the substitution engine works over a
/// plain `BTreeMap` in tests and over the concurrent `DashMap` the live
/// [`crate::graph::types::ExecutionContext`] uses, without cloning the
/// whole map on every substitution call.
pub trait OutputsLookup {
    fn lookup(&self, key: &str) -> Option<Value>;
}

impl OutputsLookup for BTreeMap<String, Value> {
    fn lookup(&self, key: &str) -> Option<Value> {
        self.get(key).cloned()
    }
}

impl OutputsLookup for DashMap<String, Value> {
    fn lookup(&self, key: &str) -> Option<Value> {
        self.get(key).map(|r| r.value().clone())
    }
}

fn token_pattern() -> Regex {
    Regex::new(r"\$\{([^}]+)\}").expect("token pattern is a fixed valid regex")
}

/// Resolve `${head.a.b.c}` against `outputs[head]`, walking `.`-separated
/// segments. Returns `None` (leave the token as-is) when `head` is absent,
/// any segment is unresolvable, or a segment hits the prototype-pollution
/// denylist.
fn resolve_path(path: &str, outputs: &impl OutputsLookup) -> Option<Value> {
    let mut segments = path.split('.');
    let head = segments.next()?;
    let mut current = outputs.lookup(head)?;
    for segment in segments {
        if DENYLIST.contains(&segment) {
            return None;
        }
        current = current.get_field(segment)?.clone();
    }
    Some(current)
}

/// Implements the type-preservation rule: a template that IS exactly one
/// `${...}` token returns the resolved value with its native type;
/// anything else is string-spliced.
pub fn substitute_variables(template: &str, outputs: &impl OutputsLookup) -> Value {
    let pattern = token_pattern();

    if let Some(caps) = pattern.captures(template) {
        let whole = caps.get(0).unwrap();
        if whole.start() == 0 && whole.end() == template.len() {
            let path = caps.get(1).unwrap().as_str();
            return match resolve_path(path, outputs) {
                Some(value) => value,
                None => Value::String(template.to_string()),
            };
        }
    }

    let mut result = String::with_capacity(template.len());
    let mut last_end = 0;
    for caps in pattern.captures_iter(template) {
        let whole = caps.get(0).unwrap();
        let path = caps.get(1).unwrap().as_str();
        result.push_str(&template[last_end..whole.start()]);
        match resolve_path(path, outputs) {
            Some(value) => result.push_str(&value.canonical_string()),
            None => result.push_str(whole.as_str()),
        }
        last_end = whole.end();
    }
    result.push_str(&template[last_end..]);
    Value::String(result)
}

/// Applies [`substitute_variables`] recursively into a node's `config`,
/// preserving map/list structure and element types; only string leaves are
/// substituted.
pub fn resolve_node_config(config: &Value, outputs: &impl OutputsLookup) -> Value {
    match config {
        Value::String(s) => substitute_variables(s, outputs),
        Value::List(items) => Value::List(
            items
                .iter()
                .map(|item| resolve_node_config(item, outputs))
                .collect(),
        ),
        Value::Map(map) => Value::Map(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_node_config(v, outputs)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outputs_with(node: &str, value: Value) -> BTreeMap<String, Value> {
        BTreeMap::from([(node.to_string(), value)])
    }

    #[test]
    fn single_bare_token_preserves_native_type() {
        let outputs = outputs_with(
            "source",
            Value::Map(BTreeMap::from([(
                "data".to_string(),
                Value::List(vec!["a".into(), "b".into(), "c".into()]),
            )])),
        );
        let resolved = substitute_variables("${source.data}", &outputs);
        assert_eq!(
            resolved,
            Value::List(vec!["a".into(), "b".into(), "c".into()])
        );
    }

    #[test]
    fn surrounding_text_forces_string_splice() {
        let outputs = outputs_with("A", Value::Map(BTreeMap::from([("passed".to_string(), Value::Number(5.0)), ("total".to_string(), Value::Number(5.0))])));
        let resolved = substitute_variables("${A.passed} === ${A.total}", &outputs);
        assert_eq!(resolved, Value::String("5 === 5".to_string()));
    }

    #[test]
    fn missing_head_leaves_token_unchanged() {
        let outputs = BTreeMap::new();
        let resolved = substitute_variables("${missing.field}", &outputs);
        assert_eq!(resolved, Value::String("${missing.field}".to_string()));
    }

    #[test]
    fn denylisted_segment_leaves_whole_token_unchanged() {
        let mut inner = BTreeMap::new();
        inner.insert("__proto__".to_string(), Value::String("polluted".to_string()));
        let outputs = outputs_with("n", Value::Map(inner));
        let resolved = substitute_variables("${n.__proto__}", &outputs);
        assert_eq!(resolved, Value::String("${n.__proto__}".to_string()));
    }

    #[test]
    fn resolve_node_config_recurses_into_maps_and_lists() {
        let outputs = outputs_with("n", Value::Map(BTreeMap::from([("v".to_string(), Value::Number(3.0))])));
        let config = Value::Map(BTreeMap::from([(
            "items".to_string(),
            Value::List(vec![Value::String("${n.v}".to_string()), Value::Bool(true)]),
        )]));
        let resolved = resolve_node_config(&config, &outputs);
        let expected = Value::Map(BTreeMap::from([(
            "items".to_string(),
            Value::List(vec![Value::Number(3.0), Value::Bool(true)]),
        )]));
        assert_eq!(resolved, expected);
    }
}
