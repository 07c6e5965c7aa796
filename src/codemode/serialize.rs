//! Placeholder-safe serialization for `executeCode` return values (§4.G).
//!
//! The reference implementation evaluates arbitrary JavaScript, whose return
//! value can contain constructs JSON cannot represent directly: functions,
//! `BigInt`, `Symbol`, `Date`, `RegExp`, `Error`, `Set`/`Map`, typed arrays,
//! `undefined`, and structures that reference themselves. This module models
//! that value space as [`ScriptValue`] nodes inside a [`ScriptGraph`] (nodes
//! reference each other by index rather than by Rust reference, which is
//! what lets a value legitimately be cyclic) and renders it to a printable,
//! JSON-safe [`serde_json::Value`] using the placeholder scheme named in the
//! specification.

use std::collections::HashSet;

use serde_json::{Map, Value};

/// One node in a `ScriptGraph`. Composite variants (`Array`/`Object`/
/// `Set`/`Map`) hold indices into the owning graph rather than owned
/// children, so a node can legally point back at an ancestor.
#[derive(Debug, Clone)]
pub enum ScriptValue {
    Json(Value),
    Undefined,
    Function { name: Option<String> },
    BigInt(String),
    Symbol(Option<String>),
    Date(String),
    RegExp(String),
    Error { name: String, message: String, stack: Option<String> },
    Set(Vec<usize>),
    Map(Vec<(usize, usize)>),
    TypedArray { kind: String, len: usize },
    Array(Vec<usize>),
    Object(Vec<(String, usize)>),
}

/// A graph of `ScriptValue` nodes. `root()` is always node 0.
#[derive(Debug, Clone, Default)]
pub struct ScriptGraph {
    nodes: Vec<ScriptValue>,
}

impl ScriptGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node, returning its index for use as a child reference.
    pub fn push(&mut self, value: ScriptValue) -> usize {
        self.nodes.push(value);
        self.nodes.len() - 1
    }

    pub fn root(&self) -> usize {
        0
    }

    /// A graph whose single root node is a plain JSON value — the common
    /// case when a tool call's structured result comes back untouched.
    pub fn from_json(value: Value) -> Self {
        let mut graph = Self::new();
        graph.push(ScriptValue::Json(value));
        graph
    }

    /// Render `root` to a printable JSON value, substituting the scheme's
    /// placeholders for anything JSON cannot represent directly. A back-edge
    /// to a node currently being visited renders as
    /// `"[Circular: <path>]"` instead of recursing forever.
    pub fn render(&self, root: usize) -> Value {
        let mut visiting = HashSet::new();
        self.render_node(root, "$", &mut visiting)
    }

    fn render_node(&self, index: usize, path: &str, visiting: &mut HashSet<usize>) -> Value {
        if visiting.contains(&index) {
            return Value::String(format!("[Circular: {path}]"));
        }
        let Some(node) = self.nodes.get(index) else {
            return Value::Null;
        };
        visiting.insert(index);
        let rendered = match node {
            ScriptValue::Json(value) => value.clone(),
            ScriptValue::Undefined => Value::String("[undefined]".to_string()),
            ScriptValue::Function { name } => {
                Value::String(format!("[Function: {}]", name.as_deref().unwrap_or("anonymous")))
            }
            ScriptValue::BigInt(digits) => Value::String(format!("[BigInt: {digits}]")),
            ScriptValue::Symbol(description) => {
                Value::String(format!("[Symbol: {}]", description.as_deref().unwrap_or("")))
            }
            ScriptValue::Date(iso) => Value::String(format!("[Date: {iso}]")),
            ScriptValue::RegExp(pattern) => Value::String(format!("[RegExp: {pattern}]")),
            ScriptValue::Error { name, message, stack } => {
                let mut obj = Map::new();
                obj.insert("__type".to_string(), Value::String("Error".to_string()));
                obj.insert("name".to_string(), Value::String(name.clone()));
                obj.insert("message".to_string(), Value::String(message.clone()));
                if let Some(stack) = stack {
                    obj.insert("stack".to_string(), Value::String(stack.clone()));
                }
                Value::Object(obj)
            }
            ScriptValue::Set(items) => {
                let values: Vec<Value> = items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| self.render_node(*item, &format!("{path}[{i}]"), visiting))
                    .collect();
                let mut obj = Map::new();
                obj.insert("__type".to_string(), Value::String("Set".to_string()));
                obj.insert("values".to_string(), Value::Array(values));
                Value::Object(obj)
            }
            ScriptValue::Map(entries) => {
                let rendered_entries: Vec<Value> = entries
                    .iter()
                    .enumerate()
                    .map(|(i, (key, value))| {
                        Value::Array(vec![
                            self.render_node(*key, &format!("{path}[{i}].key"), visiting),
                            self.render_node(*value, &format!("{path}[{i}].value"), visiting),
                        ])
                    })
                    .collect();
                let mut obj = Map::new();
                obj.insert("__type".to_string(), Value::String("Map".to_string()));
                obj.insert("entries".to_string(), Value::Array(rendered_entries));
                Value::Object(obj)
            }
            ScriptValue::TypedArray { kind, len } => Value::String(format!("[{kind}: length {len}]")),
            ScriptValue::Array(items) => Value::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| self.render_node(*item, &format!("{path}[{i}]"), visiting))
                    .collect(),
            ),
            ScriptValue::Object(fields) => {
                let mut obj = Map::new();
                for (key, child) in fields {
                    obj.insert(
                        key.clone(),
                        self.render_node(*child, &format!("{path}.{key}"), visiting),
                    );
                }
                Value::Object(obj)
            }
        };
        visiting.remove(&index);
        rendered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_json_passes_through_untouched() {
        let graph = ScriptGraph::from_json(serde_json::json!({"y": 2}));
        assert_eq!(graph.render(graph.root()), serde_json::json!({"y": 2}));
    }

    #[test]
    fn undefined_renders_as_bracketed_placeholder() {
        let mut graph = ScriptGraph::new();
        let root = graph.push(ScriptValue::Undefined);
        assert_eq!(graph.render(root), Value::String("[undefined]".to_string()));
    }

    #[test]
    fn date_renders_with_iso_payload() {
        let mut graph = ScriptGraph::new();
        let root = graph.push(ScriptValue::Date("2026-07-28T00:00:00Z".to_string()));
        assert_eq!(
            graph.render(root),
            Value::String("[Date: 2026-07-28T00:00:00Z]".to_string())
        );
    }

    #[test]
    fn error_renders_as_tagged_object() {
        let mut graph = ScriptGraph::new();
        let root = graph.push(ScriptValue::Error {
            name: "TypeError".to_string(),
            message: "bad arg".to_string(),
            stack: None,
        });
        let rendered = graph.render(root);
        assert_eq!(rendered["__type"], "Error");
        assert_eq!(rendered["name"], "TypeError");
    }

    #[test]
    fn self_referencing_object_renders_circular_placeholder() {
        let mut graph = ScriptGraph::new();
        let obj_index = graph.push(ScriptValue::Object(vec![]));
        graph.nodes[obj_index] = ScriptValue::Object(vec![("self".to_string(), obj_index)]);

        let rendered = graph.render(obj_index);
        assert_eq!(rendered["self"], Value::String("[Circular: $.self]".to_string()));
    }

    #[test]
    fn set_and_map_render_tagged_collections() {
        let mut graph = ScriptGraph::new();
        let one = graph.push(ScriptValue::Json(serde_json::json!(1)));
        let two = graph.push(ScriptValue::Json(serde_json::json!(2)));
        let set_index = graph.push(ScriptValue::Set(vec![one, two]));
        let rendered = graph.render(set_index);
        assert_eq!(rendered["__type"], "Set");
        assert_eq!(rendered["values"], serde_json::json!([1, 2]));

        let key = graph.push(ScriptValue::Json(serde_json::json!("k")));
        let value = graph.push(ScriptValue::Json(serde_json::json!("v")));
        let map_index = graph.push(ScriptValue::Map(vec![(key, value)]));
        let rendered_map = graph.render(map_index);
        assert_eq!(rendered_map["__type"], "Map");
    }
}
