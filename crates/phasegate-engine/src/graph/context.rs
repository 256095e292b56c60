use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Accumulated run context passed to every executor.
///
/// Keys are strings; values are JSON. Node outputs, gate amendments and
/// `<node>_status` markers all land here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunContext {
    data: HashMap<String, serde_json::Value>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(data: HashMap<String, serde_json::Value>) -> Self {
        Self { data }
    }

    /// Build from a JSON object. Non-object input is stored under `input`.
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Object(map) => Self {
                data: map.into_iter().collect(),
            },
            serde_json::Value::Null => Self::default(),
            other => {
                let mut ctx = Self::default();
                ctx.set("input", other);
                ctx
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.data.insert(key.into(), value);
    }

    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data
            .insert(key.into(), serde_json::Value::String(value.into()));
    }

    /// Merge a JSON object into the context (overwrites on conflict).
    /// Non-object amendments are stored under `amendment`.
    pub fn merge_json(&mut self, value: &serde_json::Value) {
        match value {
            serde_json::Value::Object(map) => {
                for (k, v) in map {
                    self.data.insert(k.clone(), v.clone());
                }
            }
            serde_json::Value::Null => {}
            other => {
                self.data.insert("amendment".into(), other.clone());
            }
        }
    }

    /// Record a node's output.
    ///
    /// With no output keys the whole output is stored under the node id.
    /// Otherwise each listed key is copied from the output object; a
    /// non-object output is stored under every listed key.
    pub fn ingest_output(&mut self, node_id: &str, output_keys: &[String], output: &serde_json::Value) {
        if output.is_null() {
            return;
        }
        if output_keys.is_empty() {
            self.data.insert(node_id.to_string(), output.clone());
            return;
        }

        if let Some(obj) = output.as_object() {
            for key in output_keys {
                if let Some(val) = obj.get(key) {
                    self.data.insert(key.clone(), val.clone());
                }
            }
            return;
        }

        for key in output_keys {
            self.data.insert(key.clone(), output.clone());
        }
    }

    pub fn data(&self) -> &HashMap<String, serde_json::Value> {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_operations() {
        let mut ctx = RunContext::new();
        ctx.set_str("name", "Alice");
        ctx.set("count", serde_json::json!(42));

        assert_eq!(ctx.get_str("name"), Some("Alice"));
        assert_eq!(ctx.get("count"), Some(&serde_json::json!(42)));
        assert_eq!(ctx.get("missing"), None);
    }

    #[test]
    fn test_merge_amendment() {
        let mut ctx = RunContext::from_json(serde_json::json!({"a": 1, "b": 2}));
        ctx.merge_json(&serde_json::json!({"b": "overwritten", "c": 3}));
        assert_eq!(ctx.get("a"), Some(&serde_json::json!(1)));
        assert_eq!(ctx.get_str("b"), Some("overwritten"));
        assert_eq!(ctx.get("c"), Some(&serde_json::json!(3)));

        ctx.merge_json(&serde_json::json!("free text"));
        assert_eq!(ctx.get_str("amendment"), Some("free text"));
    }

    #[test]
    fn test_ingest_selected_keys() {
        let mut ctx = RunContext::new();
        let output = serde_json::json!({"findings": "Rust is fast", "score": 9.5, "noise": true});
        ctx.ingest_output("research", &["findings".into(), "score".into()], &output);

        assert_eq!(ctx.get_str("findings"), Some("Rust is fast"));
        assert_eq!(ctx.get("score"), Some(&serde_json::json!(9.5)));
        assert!(ctx.get("noise").is_none());
    }

    #[test]
    fn test_ingest_whole_output_under_node_id() {
        let mut ctx = RunContext::new();
        ctx.ingest_output("ingest", &[], &serde_json::json!({"rows": 10}));
        assert_eq!(ctx.get("ingest"), Some(&serde_json::json!({"rows": 10})));

        ctx.ingest_output("silent", &[], &serde_json::Value::Null);
        assert!(ctx.get("silent").is_none());
    }

    #[test]
    fn test_non_object_input() {
        let ctx = RunContext::from_json(serde_json::json!([1, 2]));
        assert_eq!(ctx.get("input"), Some(&serde_json::json!([1, 2])));
    }
}
