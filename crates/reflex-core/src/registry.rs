//! Workflow definitions, and the registry that validates and stores them.
//!
//! A `Workflow` is plain data: an embedder builds one directly (or via
//! `reflex-loader`) and hands it to `Registry::register`, which runs the
//! structural checks in a fixed order and rejects the first one that
//! fails. Once registered, a workflow is immutable and shared by `Arc`
//! across every session that runs it.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ValidationError, ValidationErrorCode};
use crate::guard::Guard;

pub type NodeSpec = serde_json::Map<String, Value>;

/// A declared input a node expects to find on the blackboard. Advisory
/// only: `Registry::verify` can warn about a missing required input, but
/// nothing prevents a node from reading keys it never declared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputDecl {
    pub key: String,
    pub required: bool,
}

/// A declared output a node may produce. `guaranteed` means every
/// execution of the node writes the key; `verify` only reasons about
/// guaranteed outputs when checking downstream required inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDecl {
    pub key: String,
    pub guaranteed: bool,
}

/// How a sub-workflow's terminal blackboard entries get copied back into
/// the invoking workflow's scope on completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnMapping {
    pub parent_key: String,
    pub child_key: String,
}

/// Marks a node as a sub-workflow invocation: instead of (or in addition
/// to) running agent-driven guard/edge logic, the engine pushes a stack
/// frame and transfers control to `workflow_id`'s entry node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationSpec {
    pub workflow_id: String,
    pub return_map: Vec<ReturnMapping>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub description: Option<String>,
    pub spec: NodeSpec,
    pub invokes: Option<InvocationSpec>,
    pub inputs: Vec<InputDecl>,
    pub outputs: Vec<OutputDecl>,
}

impl Node {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: None,
            spec: NodeSpec::new(),
            invokes: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Edge {
    pub id: String,
    pub from: String,
    pub to: String,
    pub event: String,
    pub guard: Option<Guard>,
}

#[derive(Debug, Clone)]
pub struct Workflow {
    pub id: String,
    pub entry: String,
    pub nodes: BTreeMap<String, Node>,
    pub edges: Vec<Edge>,
    /// Free-form embedder data the kernel never reads, carried through
    /// load/serialize for round-trip fidelity (e.g. authoring tool
    /// provenance, a display name). Opaque, like `Node::spec`.
    pub metadata: Option<Value>,
}

impl Workflow {
    pub fn new(id: impl Into<String>, entry: impl Into<String>) -> Self {
        Self { id: id.into(), entry: entry.into(), nodes: BTreeMap::new(), edges: Vec::new(), metadata: None }
    }

    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.insert(node.id.clone(), node);
        self
    }

    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn edges_from(&self, node_id: &str) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.from == node_id)
    }

    pub fn is_terminal(&self, node_id: &str) -> bool {
        self.edges.iter().all(|e| e.from != node_id)
    }

    fn terminal_node_ids(&self) -> Vec<&str> {
        self.nodes.keys().map(String::as_str).filter(|id| self.is_terminal(id)).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VerifyWarningCode {
    MissingRequiredInput,
    ReturnMapKeyNotInChildOutputs,
}

impl VerifyWarningCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerifyWarningCode::MissingRequiredInput => "MISSING_REQUIRED_INPUT",
            VerifyWarningCode::ReturnMapKeyNotInChildOutputs => "RETURNMAP_KEY_NOT_IN_CHILD_OUTPUTS",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyWarning {
    pub code: VerifyWarningCode,
    pub node_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerifyReport {
    pub warnings: Vec<VerifyWarning>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Validated, registered workflows, keyed by id. Registration is the only
/// mutation; reads (`get`, `has`, `list`) and the advisory `verify` pass
/// take a brief read lock.
#[derive(Default)]
pub struct Registry {
    workflows: RwLock<BTreeMap<String, Arc<Workflow>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self { workflows: RwLock::new(BTreeMap::new()) }
    }

    /// Registers `workflow`, running structural validation in this order:
    /// uniqueness of the workflow id, non-empty, valid entry node,
    /// node-id/key consistency, valid edge endpoints, at least one
    /// terminal node, then acyclicity. The first failing check is
    /// returned; later checks never run once an earlier one fails.
    pub fn register(&self, workflow: Workflow) -> Result<(), ValidationError> {
        let mut guard = self.workflows.write().expect("registry lock poisoned");
        if guard.contains_key(&workflow.id) {
            return Err(ValidationError::new(
                ValidationErrorCode::DuplicateWorkflowId,
                workflow.id.clone(),
                format!("workflow '{}' is already registered", workflow.id),
            ));
        }

        validate_not_empty(&workflow)?;
        validate_entry_node(&workflow)?;
        validate_node_ids(&workflow)?;
        validate_edges(&workflow)?;
        validate_has_terminal_nodes(&workflow)?;
        validate_acyclic(&workflow)?;

        warn_invocation_refs(&workflow, &guard);
        guard.insert(workflow.id.clone(), Arc::new(workflow));
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<Workflow>> {
        self.workflows.read().expect("registry lock poisoned").get(id).cloned()
    }

    pub fn has(&self, id: &str) -> bool {
        self.workflows.read().expect("registry lock poisoned").contains_key(id)
    }

    pub fn list(&self) -> Vec<String> {
        self.workflows.read().expect("registry lock poisoned").keys().cloned().collect()
    }

    /// Advisory static analysis beyond what registration enforces: walks
    /// the workflow in topological order tracking which guaranteed outputs
    /// have been produced so far, flagging required inputs nothing upstream
    /// guarantees, and (for invocation nodes) return-map keys the child
    /// workflow's terminal nodes don't guarantee as outputs. Never fails;
    /// an unverifiable workflow still runs, it just gets warnings.
    pub fn verify(&self, id: &str) -> Result<VerifyReport, ValidationError> {
        let workflow = self.get(id).ok_or_else(|| {
            ValidationError::new(ValidationErrorCode::WorkflowNotFound, id, format!("workflow '{id}' is not registered"))
        })?;

        let order = topological_order(&workflow).expect("registered workflow must be acyclic");
        let mut report = VerifyReport::default();
        let mut produced: HashSet<String> = HashSet::new();

        for node_id in &order {
            let node = workflow.node(node_id).expect("topological order only contains known nodes");

            for input in &node.inputs {
                if input.required && !produced.contains(&input.key) {
                    report.warnings.push(VerifyWarning {
                        code: VerifyWarningCode::MissingRequiredInput,
                        node_id: node_id.clone(),
                        message: format!("node '{node_id}' requires input '{}' but no upstream node guarantees it", input.key),
                    });
                }
            }

            if let Some(invoke) = &node.invokes {
                if let Some(child) = self.get(&invoke.workflow_id) {
                    if terminals_declare_any_output(&child) {
                        let child_outputs = guaranteed_outputs_at_terminals(&child);
                        for mapping in &invoke.return_map {
                            if !child_outputs.contains(&mapping.child_key) {
                                report.warnings.push(VerifyWarning {
                                    code: VerifyWarningCode::ReturnMapKeyNotInChildOutputs,
                                    node_id: node_id.clone(),
                                    message: format!(
                                        "node '{node_id}' maps child key '{}' from workflow '{}' but no terminal node guarantees that output",
                                        mapping.child_key, invoke.workflow_id
                                    ),
                                });
                            }
                        }
                    }
                    // Children whose terminals declare no outputs at all have
                    // nothing to check the return map against and are skipped
                    // entirely, rather than flagging every mapping.
                }
            }

            for output in &node.outputs {
                if output.guaranteed {
                    produced.insert(output.key.clone());
                }
            }
        }

        Ok(report)
    }
}

/// Whether the workflow's terminal nodes declare any output at all
/// (guaranteed or not). A child with no declared outputs anywhere has no
/// contract for `verify` to check a return-mapping against.
fn terminals_declare_any_output(workflow: &Workflow) -> bool {
    workflow
        .terminal_node_ids()
        .into_iter()
        .filter_map(|id| workflow.node(id))
        .any(|node| !node.outputs.is_empty())
}

fn guaranteed_outputs_at_terminals(workflow: &Workflow) -> HashSet<String> {
    let mut outputs = HashSet::new();
    for node_id in workflow.terminal_node_ids() {
        if let Some(node) = workflow.node(node_id) {
            for output in &node.outputs {
                if output.guaranteed {
                    outputs.insert(output.key.clone());
                }
            }
        }
    }
    outputs
}

fn validate_not_empty(workflow: &Workflow) -> Result<(), ValidationError> {
    if workflow.nodes.is_empty() {
        return Err(ValidationError::new(
            ValidationErrorCode::EmptyWorkflow,
            workflow.id.clone(),
            "workflow has no nodes",
        ));
    }
    Ok(())
}

fn validate_entry_node(workflow: &Workflow) -> Result<(), ValidationError> {
    if !workflow.nodes.contains_key(&workflow.entry) {
        return Err(ValidationError::new(
            ValidationErrorCode::InvalidEntryNode,
            workflow.id.clone(),
            format!("entry node '{}' does not exist", workflow.entry),
        ));
    }
    Ok(())
}

fn validate_node_ids(workflow: &Workflow) -> Result<(), ValidationError> {
    for (key, node) in &workflow.nodes {
        if key != &node.id {
            return Err(ValidationError::new(
                ValidationErrorCode::NodeIdMismatch,
                workflow.id.clone(),
                format!("node stored under key '{key}' has id '{}'", node.id),
            ));
        }
    }
    Ok(())
}

fn validate_edges(workflow: &Workflow) -> Result<(), ValidationError> {
    for edge in &workflow.edges {
        if !workflow.nodes.contains_key(&edge.from) {
            return Err(ValidationError::new(
                ValidationErrorCode::InvalidEdge,
                workflow.id.clone(),
                format!("edge '{}' has unknown source node '{}'", edge.id, edge.from),
            ));
        }
        if !workflow.nodes.contains_key(&edge.to) {
            return Err(ValidationError::new(
                ValidationErrorCode::InvalidEdge,
                workflow.id.clone(),
                format!("edge '{}' has unknown target node '{}'", edge.id, edge.to),
            ));
        }
    }
    Ok(())
}

fn validate_has_terminal_nodes(workflow: &Workflow) -> Result<(), ValidationError> {
    if workflow.terminal_node_ids().is_empty() {
        return Err(ValidationError::new(
            ValidationErrorCode::NoTerminalNodes,
            workflow.id.clone(),
            "every node has at least one outgoing edge, so nothing can ever complete",
        ));
    }
    Ok(())
}

/// Hand-rolled Kahn's algorithm. Returns `Ok(order)` when the workflow is
/// acyclic; the order is used by `verify`. `validate_acyclic` only cares
/// about the error path, where the remaining in-degree set names exactly
/// the nodes stuck in (or downstream of) a cycle.
fn topological_order(workflow: &Workflow) -> Result<Vec<String>, Vec<String>> {
    let mut in_degree: BTreeMap<&str, usize> = workflow.nodes.keys().map(|k| (k.as_str(), 0)).collect();
    for edge in &workflow.edges {
        if let Some(count) = in_degree.get_mut(edge.to.as_str()) {
            *count += 1;
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, &count)| count == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(workflow.nodes.len());

    while let Some(node_id) = queue.pop_front() {
        order.push(node_id.to_string());
        for edge in workflow.edges_from(node_id) {
            if let Some(count) = in_degree.get_mut(edge.to.as_str()) {
                *count -= 1;
                if *count == 0 {
                    queue.push_back(edge.to.as_str());
                }
            }
        }
    }

    if order.len() == workflow.nodes.len() {
        Ok(order)
    } else {
        let stuck: Vec<String> = in_degree
            .into_iter()
            .filter(|(_, count)| *count > 0)
            .map(|(id, _)| id.to_string())
            .collect();
        Err(stuck)
    }
}

fn validate_acyclic(workflow: &Workflow) -> Result<(), ValidationError> {
    match topological_order(workflow) {
        Ok(_) => Ok(()),
        Err(stuck) => Err(ValidationError::new(
            ValidationErrorCode::CycleDetected,
            workflow.id.clone(),
            format!("cycle detected among nodes: {}", stuck.join(", ")),
        )
        .with_details(Value::Array(stuck.into_iter().map(Value::String).collect()))),
    }
}

fn warn_invocation_refs(workflow: &Workflow, registered: &BTreeMap<String, Arc<Workflow>>) {
    for node in workflow.nodes.values() {
        if let Some(invoke) = &node.invokes {
            if !registered.contains_key(&invoke.workflow_id) {
                tracing::warn!(
                    workflow_id = %workflow.id,
                    node_id = %node.id,
                    target = %invoke.workflow_id,
                    "node invokes a workflow that is not (yet) registered"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_workflow() -> Workflow {
        Workflow::new("linear", "start")
            .with_node(Node::new("start"))
            .with_node(Node::new("end"))
            .with_edge(Edge { id: "e1".into(), from: "start".into(), to: "end".into(), event: "ok".into(), guard: None })
    }

    #[test]
    fn registers_valid_workflow() {
        let registry = Registry::new();
        registry.register(linear_workflow()).unwrap();
        assert!(registry.has("linear"));
    }

    #[test]
    fn rejects_empty_workflow() {
        let registry = Registry::new();
        let err = registry.register(Workflow::new("empty", "start")).unwrap_err();
        assert_eq!(err.code, ValidationErrorCode::EmptyWorkflow);
    }

    #[test]
    fn rejects_invalid_entry_node() {
        let registry = Registry::new();
        let wf = Workflow::new("w", "missing").with_node(Node::new("start"));
        let err = registry.register(wf).unwrap_err();
        assert_eq!(err.code, ValidationErrorCode::InvalidEntryNode);
    }

    #[test]
    fn rejects_dangling_edge() {
        let registry = Registry::new();
        let wf = Workflow::new("w", "start")
            .with_node(Node::new("start"))
            .with_edge(Edge { id: "e1".into(), from: "start".into(), to: "ghost".into(), event: "ok".into(), guard: None });
        let err = registry.register(wf).unwrap_err();
        assert_eq!(err.code, ValidationErrorCode::InvalidEdge);
    }

    #[test]
    fn rejects_workflow_with_no_terminal_nodes() {
        let registry = Registry::new();
        let wf = Workflow::new("w", "a")
            .with_node(Node::new("a"))
            .with_node(Node::new("b"))
            .with_edge(Edge { id: "e1".into(), from: "a".into(), to: "b".into(), event: "ok".into(), guard: None })
            .with_edge(Edge { id: "e2".into(), from: "b".into(), to: "a".into(), event: "ok".into(), guard: None });
        let err = registry.register(wf).unwrap_err();
        assert_eq!(err.code, ValidationErrorCode::NoTerminalNodes);
    }

    #[test]
    fn detects_cycle_with_terminal_node_present() {
        let registry = Registry::new();
        let wf = Workflow::new("w", "a")
            .with_node(Node::new("a"))
            .with_node(Node::new("b"))
            .with_node(Node::new("c"))
            .with_edge(Edge { id: "e1".into(), from: "a".into(), to: "b".into(), event: "ok".into(), guard: None })
            .with_edge(Edge { id: "e2".into(), from: "b".into(), to: "a".into(), event: "ok".into(), guard: None })
            .with_edge(Edge { id: "e3".into(), from: "a".into(), to: "c".into(), event: "ok".into(), guard: None });
        let err = registry.register(wf).unwrap_err();
        assert_eq!(err.code, ValidationErrorCode::CycleDetected);
        let details = err.details.unwrap();
        let stuck = details.as_array().unwrap();
        assert!(stuck.contains(&Value::String("a".into())));
        assert!(stuck.contains(&Value::String("b".into())));
    }

    #[test]
    fn rejects_duplicate_registration() {
        let registry = Registry::new();
        registry.register(linear_workflow()).unwrap();
        let err = registry.register(linear_workflow()).unwrap_err();
        assert_eq!(err.code, ValidationErrorCode::DuplicateWorkflowId);
    }

    #[test]
    fn verify_on_unregistered_workflow_is_workflow_not_found() {
        let registry = Registry::new();
        let err = registry.verify("ghost").unwrap_err();
        assert_eq!(err.code, ValidationErrorCode::WorkflowNotFound);
    }

    #[test]
    fn verify_flags_missing_required_input() {
        let registry = Registry::new();
        let mut needs_x = Node::new("needs_x");
        needs_x.inputs.push(InputDecl { key: "x".into(), required: true });
        let wf = Workflow::new("w", "needs_x").with_node(needs_x);
        registry.register(wf).unwrap();
        let report = registry.verify("w").unwrap();
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].code, VerifyWarningCode::MissingRequiredInput);
    }

    #[test]
    fn verify_clean_when_input_guaranteed_upstream() {
        let registry = Registry::new();
        let mut produces_x = Node::new("produces_x");
        produces_x.outputs.push(OutputDecl { key: "x".into(), guaranteed: true });
        let mut needs_x = Node::new("needs_x");
        needs_x.inputs.push(InputDecl { key: "x".into(), required: true });
        let wf = Workflow::new("w", "produces_x")
            .with_node(produces_x)
            .with_node(needs_x)
            .with_edge(Edge { id: "e1".into(), from: "produces_x".into(), to: "needs_x".into(), event: "ok".into(), guard: None });
        registry.register(wf).unwrap();
        assert!(registry.verify("w").unwrap().is_clean());
    }

    #[test]
    fn verify_flags_unmapped_return_key() {
        let registry = Registry::new();
        let mut only = Node::new("only");
        only.outputs.push(OutputDecl { key: "present".into(), guaranteed: true });
        let child = Workflow::new("child", "only").with_node(only);
        registry.register(child).unwrap();

        let mut invoker = Node::new("invoker");
        invoker.invokes = Some(InvocationSpec {
            workflow_id: "child".into(),
            return_map: vec![ReturnMapping { parent_key: "p".into(), child_key: "missing".into() }],
        });
        let parent = Workflow::new("parent", "invoker").with_node(invoker);
        registry.register(parent).unwrap();

        let report = registry.verify("parent").unwrap();
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].code, VerifyWarningCode::ReturnMapKeyNotInChildOutputs);
    }

    #[test]
    fn verify_skips_return_map_check_when_child_declares_no_outputs() {
        let registry = Registry::new();
        let child = Workflow::new("child", "only").with_node(Node::new("only"));
        registry.register(child).unwrap();

        let mut invoker = Node::new("invoker");
        invoker.invokes = Some(InvocationSpec {
            workflow_id: "child".into(),
            return_map: vec![ReturnMapping { parent_key: "p".into(), child_key: "missing".into() }],
        });
        let parent = Workflow::new("parent", "invoker").with_node(invoker);
        registry.register(parent).unwrap();

        let report = registry.verify("parent").unwrap();
        assert!(report.is_clean(), "child with no declared outputs has no contract to check the return map against");
    }
}
