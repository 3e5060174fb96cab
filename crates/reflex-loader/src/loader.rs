use std::collections::HashMap;

use reflex_core::{
    Edge, Guard, InputDecl, InvocationSpec, Node, OutputDecl, ReturnMapping, ValidationError,
    ValidationErrorCode, Workflow,
};
use serde_json::Value;

/// Maps a custom guard name (from a JSON `{"type": "custom", "name": "..."}`
/// guard reference) to the `Guard` an embedder wants it resolved to.
pub type GuardRegistry = HashMap<String, Guard>;

#[derive(Default)]
pub struct LoadOptions<'a> {
    pub guards: Option<&'a GuardRegistry>,
}

fn schema_error(wf_id: &str, message: impl Into<String>) -> ValidationError {
    ValidationError::new(ValidationErrorCode::SchemaViolation, wf_id, message)
}

fn require_str<'a>(obj: &'a serde_json::Map<String, Value>, field: &str, wf_id: &str) -> Result<&'a str, ValidationError> {
    obj.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| schema_error(wf_id, format!("missing required field: {field}")))
}

/// Parses and validates a JSON workflow definition, resolving any `custom`
/// guard references against `options.guards`. Does not register the
/// workflow; the caller passes the result to `Registry::register` for
/// structural validation.
pub fn load_workflow(data: &str, options: LoadOptions) -> Result<Workflow, ValidationError> {
    let root: Value = serde_json::from_str(data)
        .map_err(|e| schema_error("<unknown>", format!("invalid JSON: {e}")))?;
    let root = root
        .as_object()
        .ok_or_else(|| schema_error("<unknown>", "workflow definition must be a JSON object"))?;

    let id = require_str(root, "id", "<unknown>")?.to_string();
    let entry = require_str(root, "entry", &id)?.to_string();
    let nodes_value = root
        .get("nodes")
        .and_then(Value::as_object)
        .ok_or_else(|| schema_error(&id, "missing required field: nodes"))?;
    let edges_value = root
        .get("edges")
        .and_then(Value::as_array)
        .ok_or_else(|| schema_error(&id, "missing required field: edges"))?;

    let mut workflow = Workflow::new(id.clone(), entry);
    workflow.metadata = root.get("metadata").cloned();

    for (key, node_value) in nodes_value {
        let node_obj = node_value
            .as_object()
            .ok_or_else(|| schema_error(&id, format!("node '{key}': must be a JSON object")))?;
        let node_id = require_str(node_obj, "id", &id)
            .map_err(|_| schema_error(&id, format!("node '{key}': missing required field: id")))?
            .to_string();
        let spec = node_obj
            .get("spec")
            .and_then(Value::as_object)
            .ok_or_else(|| schema_error(&id, format!("node '{key}': missing required field: spec")))?
            .clone();

        let invokes = match node_obj.get("invokes") {
            None | Some(Value::Null) => None,
            Some(invoke_value) => Some(parse_invocation_spec(invoke_value, &id, &node_id)?),
        };

        let inputs = match node_obj.get("inputs") {
            None => Vec::new(),
            Some(v) => parse_input_decls(v, &id, &node_id)?,
        };
        let outputs = match node_obj.get("outputs") {
            None => Vec::new(),
            Some(v) => parse_output_decls(v, &id, &node_id)?,
        };

        let mut node = Node::new(node_id);
        node.description = node_obj.get("description").and_then(Value::as_str).map(str::to_string);
        node.spec = spec;
        node.invokes = invokes;
        node.inputs = inputs;
        node.outputs = outputs;
        workflow = workflow.with_node(node);
    }

    for (index, edge_value) in edges_value.iter().enumerate() {
        let edge_obj = edge_value
            .as_object()
            .ok_or_else(|| schema_error(&id, format!("edge at index {index}: must be a JSON object")))?;
        let edge_id = require_str(edge_obj, "id", &id)
            .map_err(|_| schema_error(&id, format!("edge at index {index}: missing required field: id")))?
            .to_string();
        let from = require_str(edge_obj, "from", &id)
            .map_err(|_| schema_error(&id, format!("edge '{edge_id}': missing required field: from")))?
            .to_string();
        let to = require_str(edge_obj, "to", &id)
            .map_err(|_| schema_error(&id, format!("edge '{edge_id}': missing required field: to")))?
            .to_string();
        let event = require_str(edge_obj, "event", &id)
            .map_err(|_| schema_error(&id, format!("edge '{edge_id}': missing required field: event")))?
            .to_string();

        let guard = match edge_obj.get("guard") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(resolve_guard_json(raw, &id, &edge_id, options.guards)?),
        };

        workflow = workflow.with_edge(Edge { id: edge_id, from, to, event, guard });
    }

    Ok(workflow)
}

fn parse_invocation_spec(value: &Value, wf_id: &str, node_id: &str) -> Result<InvocationSpec, ValidationError> {
    let obj = value
        .as_object()
        .ok_or_else(|| schema_error(wf_id, format!("node '{node_id}': invokes must be a JSON object")))?;
    let workflow_id = obj
        .get("workflowId")
        .and_then(Value::as_str)
        .ok_or_else(|| schema_error(wf_id, format!("node '{node_id}': invokes requires 'workflowId'")))?
        .to_string();
    let return_map = match obj.get("returnMap") {
        None => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                let mapping = item
                    .as_object()
                    .ok_or_else(|| schema_error(wf_id, format!("node '{node_id}': returnMap entries must be objects")))?;
                let parent_key = mapping
                    .get("parentKey")
                    .and_then(Value::as_str)
                    .ok_or_else(|| schema_error(wf_id, format!("node '{node_id}': returnMap entry missing 'parentKey'")))?
                    .to_string();
                let child_key = mapping
                    .get("childKey")
                    .and_then(Value::as_str)
                    .ok_or_else(|| schema_error(wf_id, format!("node '{node_id}': returnMap entry missing 'childKey'")))?
                    .to_string();
                Ok(ReturnMapping { parent_key, child_key })
            })
            .collect::<Result<Vec<_>, ValidationError>>()?,
        Some(_) => return Err(schema_error(wf_id, format!("node '{node_id}': returnMap must be an array"))),
    };
    Ok(InvocationSpec { workflow_id, return_map })
}

fn parse_input_decls(value: &Value, wf_id: &str, node_id: &str) -> Result<Vec<InputDecl>, ValidationError> {
    let items = value
        .as_array()
        .ok_or_else(|| schema_error(wf_id, format!("node '{node_id}': inputs must be an array")))?;
    items
        .iter()
        .map(|item| {
            let obj = item
                .as_object()
                .ok_or_else(|| schema_error(wf_id, format!("node '{node_id}': input declarations must be objects")))?;
            let key = obj
                .get("key")
                .and_then(Value::as_str)
                .ok_or_else(|| schema_error(wf_id, format!("node '{node_id}': input declaration missing 'key'")))?
                .to_string();
            let required = obj.get("required").and_then(Value::as_bool).unwrap_or(false);
            Ok(InputDecl { key, required })
        })
        .collect()
}

fn parse_output_decls(value: &Value, wf_id: &str, node_id: &str) -> Result<Vec<OutputDecl>, ValidationError> {
    let items = value
        .as_array()
        .ok_or_else(|| schema_error(wf_id, format!("node '{node_id}': outputs must be an array")))?;
    items
        .iter()
        .map(|item| {
            let obj = item
                .as_object()
                .ok_or_else(|| schema_error(wf_id, format!("node '{node_id}': output declarations must be objects")))?;
            let key = obj
                .get("key")
                .and_then(Value::as_str)
                .ok_or_else(|| schema_error(wf_id, format!("node '{node_id}': output declaration missing 'key'")))?
                .to_string();
            let guaranteed = obj.get("guaranteed").and_then(Value::as_bool).unwrap_or(false);
            Ok(OutputDecl { key, guaranteed })
        })
        .collect()
}

fn resolve_guard_json(raw: &Value, wf_id: &str, edge_id: &str, guards: Option<&GuardRegistry>) -> Result<Guard, ValidationError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| schema_error(wf_id, format!("edge '{edge_id}': invalid guard JSON")))?;
    let guard_type = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| schema_error(wf_id, format!("edge '{edge_id}': guard missing or invalid 'type' field")))?;

    match guard_type {
        "exists" | "not-exists" => {
            let key = obj
                .get("key")
                .and_then(Value::as_str)
                .ok_or_else(|| schema_error(wf_id, format!("edge '{edge_id}': guard type '{guard_type}' requires 'key' field")))?
                .to_string();
            Ok(if guard_type == "exists" { Guard::Exists(key) } else { Guard::NotExists(key) })
        }
        "equals" | "not-equals" => {
            let key = obj
                .get("key")
                .and_then(Value::as_str)
                .ok_or_else(|| schema_error(wf_id, format!("edge '{edge_id}': guard type '{guard_type}' requires 'key' field")))?
                .to_string();
            let value = obj
                .get("value")
                .cloned()
                .ok_or_else(|| schema_error(wf_id, format!("edge '{edge_id}': guard type '{guard_type}' requires 'value' field")))?;
            Ok(if guard_type == "equals" { Guard::Equals(key, value) } else { Guard::NotEquals(key, value) })
        }
        "custom" => {
            let name = obj
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| schema_error(wf_id, format!("edge '{edge_id}': custom guard requires 'name' field")))?;
            guards
                .and_then(|g| g.get(name))
                .cloned()
                .ok_or_else(|| {
                    ValidationError::new(
                        ValidationErrorCode::UnknownGuardReference,
                        wf_id,
                        format!("edge '{edge_id}': custom guard '{name}' not found in guard registry"),
                    )
                })
        }
        other => Err(schema_error(wf_id, format!("edge '{edge_id}': unknown guard type '{other}'"))),
    }
}
