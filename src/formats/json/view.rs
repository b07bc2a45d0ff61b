//! Template-facing view of a JSON document.
//!
//! Objects and arrays are exposed lazily as [`JsonNode`]s addressed by JSON
//! pointer into a shared root, so large payloads are not copied into engine
//! values up front. Iterating a node is charged against the conversion's
//! [`ExecutionGuard`].

use std::fmt;
use std::sync::Arc;

use minijinja::value::{Enumerator, Object, ObjectRepr, Value};
use serde_json::Value as JsonValue;

use crate::runtime::guard::{ExecutionGuard, GuardedIter};

#[derive(Debug)]
pub struct JsonNode {
    root: Arc<JsonValue>,
    pointer: String,
    guard: Arc<ExecutionGuard>,
}

/// Wrap the value at `pointer` for templates: containers become nodes,
/// scalars become plain engine values, a dangling pointer is undefined.
pub fn json_value(root: &Arc<JsonValue>, pointer: &str, guard: &Arc<ExecutionGuard>) -> Value {
    match root.pointer(pointer) {
        Some(JsonValue::Object(_)) | Some(JsonValue::Array(_)) => Value::from_object(JsonNode {
            root: root.clone(),
            pointer: pointer.to_string(),
            guard: guard.clone(),
        }),
        Some(scalar) => Value::from_serialize(scalar),
        None => Value::UNDEFINED,
    }
}

fn escape_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

impl JsonNode {
    fn node(&self) -> Option<&JsonValue> {
        self.root.pointer(&self.pointer)
    }

    pub fn pointer(&self) -> &str {
        &self.pointer
    }

    /// The subtree this node points at.
    pub fn to_json(&self) -> JsonValue {
        self.node().cloned().unwrap_or(JsonValue::Null)
    }

    fn child(&self, token: &str) -> Value {
        let pointer = format!("{}/{}", self.pointer, escape_token(token));
        json_value(&self.root, &pointer, &self.guard)
    }
}

impl Object for JsonNode {
    fn repr(self: &Arc<Self>) -> ObjectRepr {
        match self.node() {
            Some(JsonValue::Array(_)) => ObjectRepr::Seq,
            _ => ObjectRepr::Map,
        }
    }

    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        match self.node()? {
            JsonValue::Object(map) => {
                let key = key.as_str()?;
                map.contains_key(key).then(|| self.child(key))
            }
            JsonValue::Array(items) => {
                let index = key.as_i64()?;
                let index = if index < 0 {
                    index + items.len() as i64
                } else {
                    index
                };
                let index = usize::try_from(index).ok().filter(|i| *i < items.len())?;
                Some(self.child(&index.to_string()))
            }
            _ => None,
        }
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        let items: Vec<Value> = match self.node() {
            Some(JsonValue::Object(map)) => map.keys().map(|k| Value::from(k.as_str())).collect(),
            Some(JsonValue::Array(items)) => (0..items.len())
                .map(|i| self.child(&i.to_string()))
                .collect(),
            _ => return Enumerator::Empty,
        };
        Enumerator::Iter(Box::new(GuardedIter::new(
            items.into_iter(),
            self.guard.clone(),
        )))
    }

    fn enumerator_len(self: &Arc<Self>) -> Option<usize> {
        match self.node()? {
            JsonValue::Object(map) => Some(map.len()),
            JsonValue::Array(items) => Some(items.len()),
            _ => None,
        }
    }

    fn render(self: &Arc<Self>, f: &mut fmt::Formatter<'_>) -> fmt::Result
    where
        Self: Sized + 'static,
    {
        match self.node() {
            Some(node) => write!(f, "{node}"),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minijinja::{context, Environment};
    use serde_json::json;

    fn render_with(doc: JsonValue, guard: ExecutionGuard, template: &str) -> String {
        let guard = Arc::new(guard);
        let msg = json_value(&Arc::new(doc), "", &guard);
        Environment::new()
            .render_str(template, context! { msg => msg })
            .unwrap()
    }

    fn render(doc: JsonValue, template: &str) -> String {
        render_with(doc, ExecutionGuard::unbounded(), template)
    }

    #[test]
    fn test_scalar_and_nested_access() {
        let doc = json!({
            "name": { "family": "Doe", "given": ["Jane", "Q"] },
            "age": 42,
            "active": true,
            "a/b": "slash"
        });
        assert_eq!(
            render(doc, "{{ msg.name.family }} {{ msg.name.given[0] }} {{ msg.name.given[-1] }} {{ msg.age + 1 }} {{ msg.active }} {{ msg['a/b'] }}"),
            "Doe Jane Q 43 true slash"
        );
    }

    #[test]
    fn test_iteration_and_length() {
        let doc = json!({ "items": [{ "v": 1 }, { "v": 2 }], "m": { "x": 1, "y": 2 } });
        assert_eq!(
            render(doc, "{% for i in msg.items %}{{ i.v }}{% endfor %}|{{ msg.items|length }}|{% for k, v in msg.m|items %}{{ k }}={{ v }};{% endfor %}"),
            "12|2|x=1;y=2;"
        );
    }

    #[test]
    fn test_containers_render_as_compact_json() {
        let doc = json!({ "a": [1, 2], "b": { "c": null } });
        assert_eq!(render(doc, "{{ msg.a }} {{ msg.b }}"), "[1,2] {\"c\":null}");
    }

    #[test]
    fn test_missing_keys_are_undefined() {
        let doc = json!({ "a": 1 });
        assert_eq!(
            render(doc, "{{ msg.b is undefined }} {{ msg.a.b is undefined }}"),
            "true true"
        );
    }

    #[test]
    fn test_iteration_is_charged_to_guard() {
        let doc = json!({ "items": [1, 2, 3, 4, 5] });
        let out = render_with(
            doc,
            ExecutionGuard::new(None, 2),
            "{% for i in msg.items %}{{ i }}{% endfor %}",
        );
        assert_eq!(out, "12");
    }

    #[test]
    fn test_to_json_returns_subtree() {
        let root = Arc::new(json!({ "p": { "id": "1" } }));
        let node = JsonNode {
            root,
            pointer: "/p".to_string(),
            guard: Arc::new(ExecutionGuard::unbounded()),
        };
        assert_eq!(node.to_json(), json!({ "id": "1" }));
        assert_eq!(node.pointer(), "/p");
    }
}
