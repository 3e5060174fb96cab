use std::sync::Arc;

use reflex_core::guard::CustomGuard;
use reflex_core::{Guard, ValidationError, ValidationErrorCode, Workflow};
use serde_json::{json, Value};

/// Recovers the JSON name a custom guard should serialize as. Guards carry
/// no identity of their own beyond the closure they wrap, so this maps
/// back to a name by pointer identity (`Arc::ptr_eq`) rather than a derived
/// `Eq`/`Hash` impl, which a `dyn Fn` cannot provide.
#[derive(Default)]
pub struct GuardNameMap(Vec<(CustomGuard, String)>);

impl GuardNameMap {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn insert(&mut self, guard: CustomGuard, name: impl Into<String>) {
        self.0.push((guard, name.into()));
    }

    fn lookup(&self, guard: &CustomGuard) -> Option<&str> {
        self.0.iter().find(|(g, _)| Arc::ptr_eq(&g.0, &guard.0)).map(|(_, name)| name.as_str())
    }
}

#[derive(Default)]
pub struct SerializeOptions<'a> {
    pub guard_names: Option<&'a GuardNameMap>,
}

fn schema_error(wf_id: &str, message: impl Into<String>) -> ValidationError {
    ValidationError::new(ValidationErrorCode::SchemaViolation, wf_id, message)
}

/// Serializes `workflow` to pretty-printed JSON. Built-in guards serialize
/// directly; a `Custom` guard requires `options.guard_names` to recover a
/// `{"type": "custom", "name": "..."}` reference, or serialization fails.
pub fn serialize_workflow(workflow: &Workflow, options: SerializeOptions) -> Result<String, ValidationError> {
    let mut nodes = serde_json::Map::new();
    for (key, node) in &workflow.nodes {
        let mut node_json = serde_json::Map::new();
        node_json.insert("id".into(), json!(node.id));
        if let Some(description) = &node.description {
            node_json.insert("description".into(), json!(description));
        }
        node_json.insert("spec".into(), Value::Object(node.spec.clone()));
        if let Some(invoke) = &node.invokes {
            let return_map: Vec<Value> = invoke
                .return_map
                .iter()
                .map(|m| json!({"parentKey": m.parent_key, "childKey": m.child_key}))
                .collect();
            node_json.insert("invokes".into(), json!({"workflowId": invoke.workflow_id, "returnMap": return_map}));
        }
        if !node.inputs.is_empty() {
            let inputs: Vec<Value> = node.inputs.iter().map(|i| json!({"key": i.key, "required": i.required})).collect();
            node_json.insert("inputs".into(), Value::Array(inputs));
        }
        if !node.outputs.is_empty() {
            let outputs: Vec<Value> = node.outputs.iter().map(|o| json!({"key": o.key, "guaranteed": o.guaranteed})).collect();
            node_json.insert("outputs".into(), Value::Array(outputs));
        }
        nodes.insert(key.clone(), Value::Object(node_json));
    }

    let mut edges = Vec::with_capacity(workflow.edges.len());
    for edge in &workflow.edges {
        let mut edge_json = serde_json::Map::new();
        edge_json.insert("id".into(), json!(edge.id));
        edge_json.insert("from".into(), json!(edge.from));
        edge_json.insert("to".into(), json!(edge.to));
        edge_json.insert("event".into(), json!(edge.event));
        if let Some(guard) = &edge.guard {
            edge_json.insert("guard".into(), serialize_guard(guard, &workflow.id, &edge.id, options.guard_names)?);
        }
        edges.push(Value::Object(edge_json));
    }

    let mut out = serde_json::Map::new();
    out.insert("id".into(), json!(workflow.id));
    out.insert("entry".into(), json!(workflow.entry));
    out.insert("nodes".into(), Value::Object(nodes));
    out.insert("edges".into(), Value::Array(edges));
    if let Some(metadata) = &workflow.metadata {
        out.insert("metadata".into(), metadata.clone());
    }
    let out = Value::Object(out);

    serde_json::to_string_pretty(&out).map_err(|e| schema_error(&workflow.id, format!("failed to serialize: {e}")))
}

fn serialize_guard(guard: &Guard, wf_id: &str, edge_id: &str, guard_names: Option<&GuardNameMap>) -> Result<Value, ValidationError> {
    match guard {
        Guard::Exists(key) => Ok(json!({"type": "exists", "key": key})),
        Guard::NotExists(key) => Ok(json!({"type": "not-exists", "key": key})),
        Guard::Equals(key, value) => Ok(json!({"type": "equals", "key": key, "value": value})),
        Guard::NotEquals(key, value) => Ok(json!({"type": "not-equals", "key": key, "value": value})),
        Guard::Custom(custom) => {
            let name = guard_names
                .and_then(|names| names.lookup(custom))
                .ok_or_else(|| schema_error(wf_id, format!("edge '{edge_id}': custom guard has no name in GuardNameMap (cannot serialize)")))?;
            Ok(json!({"type": "custom", "name": name}))
        }
    }
}
