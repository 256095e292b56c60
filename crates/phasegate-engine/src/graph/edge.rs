use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// An edge connecting two phase nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Source node id.
    pub from: String,
    /// Target node id.
    pub to: String,
    /// Condition that must hold to traverse this edge.
    #[serde(default)]
    pub condition: EdgeCondition,
    /// Forward dependency or bounded retry loop.
    #[serde(default)]
    pub kind: EdgeKind,
}

/// Condition for traversing an edge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EdgeCondition {
    /// Traverse when the source succeeded.
    #[default]
    Always,
    /// Traverse when the source failed after exhausting its retry policy.
    OnFailure,
    /// Traverse on success when the expression holds against the run context.
    /// Supported: `key == "value"`, `key != "value"`, `key contains "substr"`,
    /// `key matches "regex"`.
    Conditional { expr: String },
}

/// Edge type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EdgeKind {
    #[default]
    Forward,
    /// Loops back to an ancestor. Exempt from the acyclicity check but
    /// bounded by `max_iterations`, which has no default.
    Retry { max_iterations: u32 },
}

impl Edge {
    /// Create an unconditional forward edge.
    pub fn always(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::Always,
            kind: EdgeKind::Forward,
        }
    }

    /// Create the alternate edge taken once the source has failed for good.
    pub fn on_failure(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::OnFailure,
            kind: EdgeKind::Forward,
        }
    }

    /// Create a conditional forward edge.
    pub fn conditional(
        from: impl Into<String>,
        to: impl Into<String>,
        expr: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::Conditional { expr: expr.into() },
            kind: EdgeKind::Forward,
        }
    }

    /// Turn this edge into a retry loop bounded by `max_iterations`.
    pub fn retry(mut self, max_iterations: u32) -> Self {
        self.kind = EdgeKind::Retry { max_iterations };
        self
    }

    pub fn is_retry(&self) -> bool {
        matches!(self.kind, EdgeKind::Retry { .. })
    }

    /// Stable label used in errors and audit records.
    pub fn label(&self) -> String {
        format!("{}->{}", self.from, self.to)
    }

    /// Whether this edge fires given the source's final outcome.
    pub fn fires(&self, source_succeeded: bool, context: &HashMap<String, serde_json::Value>) -> bool {
        match &self.condition {
            EdgeCondition::Always => source_succeeded,
            EdgeCondition::OnFailure => !source_succeeded,
            EdgeCondition::Conditional { expr } => {
                source_succeeded && evaluate_condition(expr, context)
            }
        }
    }
}

/// Evaluate a simple conditional expression against context data.
///
/// Non-string values are compared by their JSON text, so `score == "3"`
/// matches the number 3. Returns `false` for unparseable expressions.
pub fn evaluate_condition(expr: &str, context: &HashMap<String, serde_json::Value>) -> bool {
    let expr = expr.trim();
    let lookup = |key: &str| context.get(key).map(display_value);

    // key matches "regex"
    if let Some((key, pattern)) = parse_operator(expr, " matches ") {
        let Ok(re) = Regex::new(pattern) else {
            return false;
        };
        return lookup(key).is_some_and(|s| re.is_match(&s));
    }

    // key contains "value"
    if let Some((key, substr)) = parse_operator(expr, " contains ") {
        return lookup(key).is_some_and(|s| s.contains(substr));
    }

    // key != "value"
    if let Some((key, value)) = parse_operator(expr, "!=") {
        return lookup(key).is_some_and(|s| s != value);
    }

    // key == "value"
    if let Some((key, value)) = parse_operator(expr, "==") {
        return lookup(key).is_some_and(|s| s == value);
    }

    false
}

fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Parse `key OP "value"` expressions, returning (key, value).
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let (key, val) = expr.split_once(op)?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key, val.trim().trim_matches('"')))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(pairs: &[(&str, serde_json::Value)]) -> HashMap<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_edge_builders() {
        let e = Edge::always("a", "b");
        assert_eq!(e.label(), "a->b");
        assert!(!e.is_retry());

        let e = Edge::on_failure("a", "c").retry(2);
        assert!(matches!(e.condition, EdgeCondition::OnFailure));
        assert_eq!(e.kind, EdgeKind::Retry { max_iterations: 2 });
    }

    #[test]
    fn test_fires_by_outcome() {
        let empty = HashMap::new();
        assert!(Edge::always("a", "b").fires(true, &empty));
        assert!(!Edge::always("a", "b").fires(false, &empty));
        assert!(Edge::on_failure("a", "b").fires(false, &empty));
        assert!(!Edge::on_failure("a", "b").fires(true, &empty));
    }

    #[test]
    fn test_conditional_requires_success() {
        let c = ctx(&[("verdict", serde_json::json!("pass"))]);
        let edge = Edge::conditional("a", "b", r#"verdict == "pass""#);
        assert!(edge.fires(true, &c));
        assert!(!edge.fires(false, &c));
    }

    #[test]
    fn test_condition_operators() {
        let c = ctx(&[
            ("status", serde_json::json!("success")),
            ("output", serde_json::json!("The file was created successfully.")),
            ("score", serde_json::json!(3)),
        ]);
        assert!(evaluate_condition(r#"status == "success""#, &c));
        assert!(evaluate_condition(r#"status != "failure""#, &c));
        assert!(evaluate_condition(r#"output contains "created""#, &c));
        assert!(!evaluate_condition(r#"output contains "deleted""#, &c));
        assert!(evaluate_condition(r#"output matches "^The .* success""#, &c));
        assert!(evaluate_condition(r#"score == "3""#, &c));
    }

    #[test]
    fn test_condition_missing_key_or_garbage() {
        let c = HashMap::new();
        assert!(!evaluate_condition(r#"missing == "value""#, &c));
        assert!(!evaluate_condition("this is not valid", &c));
        assert!(!evaluate_condition(r#"x matches "([""#, &ctx(&[("x", serde_json::json!("a"))])));
    }

    #[test]
    fn test_toml_shape() {
        let edge: Edge = toml::from_str(
            r#"
            from = "validate"
            to = "ingest"
            condition = { type = "on_failure" }
            kind = { type = "retry", max_iterations = 2 }
            "#,
        )
        .unwrap();
        assert_eq!(edge.kind, EdgeKind::Retry { max_iterations: 2 });
        assert_eq!(edge.condition, EdgeCondition::OnFailure);
    }
}
