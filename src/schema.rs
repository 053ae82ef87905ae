//! Diagnostic views over discovered keys: the hierarchy tree behind
//! `--show-keys-hier` and the draft JSON Schema behind `--show-json-schema`.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use crate::types::Type;

/// Structural tree of discovered key paths.
#[derive(Debug, Clone, Default)]
pub struct KeyHierarchy {
    pub name: String,
    pub sub: BTreeMap<String, KeyHierarchy>,
}

impl KeyHierarchy {
    pub fn root() -> Self {
        KeyHierarchy { name: ".".to_string(), sub: BTreeMap::new() }
    }

    /// Register a path in the tree.
    pub fn add(&mut self, path: &[String]) {
        let Some(first) = path.first() else {
            return;
        };

        let child = self
            .sub
            .entry(first.clone())
            .or_insert_with(|| KeyHierarchy { name: first.clone(), sub: BTreeMap::new() });

        child.add(&path[1..]);
    }

    /// Expose the tree as a JSON value: leaves render as their name,
    /// interior nodes as `{name: [children]}`.
    pub fn hierarchy(&self) -> Value {
        if self.sub.is_empty() {
            return Value::String(self.name.clone());
        }

        let children: Vec<Value> = self.sub.values().map(|s| s.hierarchy()).collect();

        json!({ self.name.clone(): children })
    }
}

/// Draft JSON Schema node derived from the type lattice.
#[derive(Debug, Default)]
pub struct JsonSchema {
    types: Vec<&'static str>,
    properties: BTreeMap<String, JsonSchema>,
    items: Option<Box<JsonSchema>>,
}

impl JsonSchema {
    /// Register a key path with its merged scalar type.
    ///
    /// Interior `[n]` segments turn the containing node into an array
    /// schema; other segments become object properties.
    pub fn add_key(&mut self, path: &[String], t: Type) {
        let Some(first) = path.first() else {
            self.add_type(t);
            return;
        };

        if first.starts_with('[') {
            self.add_type(Type::Array);
            self.items.get_or_insert_with(Default::default).add_key(&path[1..], t);
        } else {
            self.add_type(Type::Object);
            self.properties.entry(first.clone()).or_default().add_key(&path[1..], t);
        }
    }

    fn add_type(&mut self, t: Type) {
        let name = match t {
            Type::String => "string",
            Type::Int => "integer",
            Type::Float => "number",
            Type::Bool => "boolean",
            Type::Null => "null",
            Type::Object => "object",
            Type::Array => "array",
            // Collapsed subtrees and absent cells carry no schema type.
            Type::Json | Type::Absent => return,
        };

        if !self.types.contains(&name) {
            self.types.push(name);
        }
    }

    pub fn to_value(&self) -> Value {
        let mut out = Map::new();

        match self.types.len() {
            0 => {}
            1 => {
                out.insert("type".to_string(), json!(self.types[0]));
            }
            _ => {
                out.insert("type".to_string(), json!(self.types));
            }
        }

        if !self.properties.is_empty() {
            let props: Map<String, Value> =
                self.properties.iter().map(|(k, v)| (k.clone(), v.to_value())).collect();
            out.insert("properties".to_string(), Value::Object(props));
        }

        if let Some(items) = &self.items {
            out.insert("items".to_string(), items.to_value());
        }

        Value::Object(out)
    }
}
