//! The single-threaded stepping engine: the one piece of Reflex that
//! actually runs a workflow. `Engine` never spawns a task or a thread of
//! its own; `step`/`run` execute entirely on the caller's stack, and the
//! only concurrency primitive the engine touches is the `RwLock` inside
//! each `Blackboard` scope it owns.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use crate::agent::{Decision, DecisionAgent, DecisionContext};
use crate::blackboard::{Blackboard, BlackboardEntry, BlackboardWrite, Source};
use crate::error::EngineError;
use crate::events::{Event, EventHandler, EventKind};
use crate::guard::filter_edges;
use crate::registry::{Edge, Node, Registry, ReturnMapping, Workflow};
use crate::scoped_reader::ScopedReader;

/// A frame on the invocation call stack: where a sub-workflow invocation
/// was made, what to copy back on return, and a frozen snapshot of the
/// invoking scope's blackboard at the moment of the call.
#[derive(Debug, Clone)]
pub struct StackFrame {
    pub workflow_id: String,
    pub current_node_id: String,
    pub return_map: Vec<ReturnMapping>,
    pub snapshot_entries: Vec<BlackboardEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Idle,
    Running,
    Suspended,
    Completed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Advanced,
    Invoked,
    Popped,
    Completed,
    Suspended,
}

#[derive(Debug, Clone)]
pub struct StepResult {
    pub status: StepStatus,
    pub workflow: Option<Arc<Workflow>>,
    pub node: Option<Arc<Node>>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    pub blackboard: Vec<BlackboardWrite>,
}

/// A cooperative cancellation check `run` polls between steps. Reflex
/// ships `CancelFlag`, a trivial `AtomicBool`-backed implementation;
/// embedders with their own cancellation primitive (a `tokio_util`
/// token, a context deadline) can implement this trait directly instead.
pub trait CancelToken: Send + Sync {
    fn is_cancelled(&self) -> bool;
}

#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl CancelToken for CancelFlag {
    fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Runs one workflow (and its sub-workflow invocations) to completion or
/// suspension, one `step()` at a time. Built from a shared `Registry` and
/// a single `DecisionAgent`; everything else is owned, mutable state.
pub struct Engine {
    registry: Arc<Registry>,
    agent: Arc<dyn DecisionAgent>,
    session_id: Uuid,
    status: EngineStatus,
    current_workflow_id: String,
    current_node_id: String,
    current_scope: Arc<Blackboard>,
    stack: Vec<StackFrame>,
    skip_invocation: bool,
    handlers: HashMap<EventKind, Vec<EventHandler>>,
}

impl Engine {
    pub fn new(registry: Arc<Registry>, agent: Arc<dyn DecisionAgent>) -> Self {
        Self {
            registry,
            agent,
            session_id: Uuid::nil(),
            status: EngineStatus::Idle,
            current_workflow_id: String::new(),
            current_node_id: String::new(),
            current_scope: Arc::new(Blackboard::new()),
            stack: Vec::new(),
            skip_invocation: false,
            handlers: HashMap::new(),
        }
    }

    /// Registers a handler for `kind`. Handlers accumulate; there is no
    /// way to unregister one short of dropping the engine.
    pub fn on(&mut self, kind: EventKind, handler: EventHandler) {
        self.handlers.entry(kind).or_default().push(handler);
    }

    /// Starts a new session at `workflow_id`'s entry node. Fails, leaving
    /// the engine's prior state untouched, if the workflow is not
    /// registered.
    pub fn init(&mut self, workflow_id: &str, options: Option<InitOptions>) -> Result<Uuid, EngineError> {
        let workflow = self.registry.get(workflow_id).ok_or_else(|| {
            EngineError::new(format!("cannot initialize: workflow '{workflow_id}' is not registered"))
        })?;

        self.session_id = Uuid::new_v4();
        self.status = EngineStatus::Running;
        self.current_workflow_id = workflow_id.to_string();
        self.current_node_id = workflow.entry.clone();
        self.current_scope = Arc::new(Blackboard::new());
        self.stack.clear();
        self.skip_invocation = false;

        let options = options.unwrap_or_default();
        if !options.blackboard.is_empty() {
            let source = Source { workflow_id: workflow_id.to_string(), node_id: "__init__".to_string(), stack_depth: 0 };
            let entries = self.current_scope.append(&options.blackboard, source);
            self.emit(Event::new(EventKind::BlackboardWrite).with_workflow_id(workflow_id).with_entries(entries));
        }

        let entry_node = workflow.node(&workflow.entry).expect("entry node validated at registration");
        self.emit(Event::new(EventKind::NodeEnter).with_workflow_id(workflow_id).with_node_id(entry_node.id.clone()));

        Ok(self.session_id)
    }

    /// Advances the session by exactly one transition. Valid whenever the
    /// engine is `Running` or `Suspended` (a suspended session can always
    /// be stepped again — the reason for suspension is informational, not
    /// a lock); any other status is a precondition violation.
    pub fn step(&mut self) -> Result<StepResult, EngineError> {
        if self.current_workflow_id.is_empty() {
            return Err(EngineError::new("step() called before init()"));
        }
        match self.status {
            EngineStatus::Running | EngineStatus::Suspended => {}
            other => return Err(EngineError::new(format!("step() called in invalid state: {other:?}"))),
        }
        self.status = EngineStatus::Running;

        let workflow = self.registry.get(&self.current_workflow_id).expect("current workflow must remain registered");
        let node = Arc::new(
            workflow
                .node(&self.current_node_id)
                .cloned()
                .expect("current node must exist in current workflow"),
        );

        if let Some(invoke) = node.invokes.clone() {
            if !self.skip_invocation {
                return self.step_invoke(&workflow, &node, &invoke);
            }
        }
        self.skip_invocation = false;

        let reader = self.build_reader();
        let valid_edges: Vec<Edge> = match filter_edges(&node.id, &workflow.edges, &reader) {
            Ok(edges) => edges.into_iter().cloned().collect(),
            Err(e) => return Ok(self.suspend_on_error(&node.id, &format!("guard evaluation failed: {e}"))),
        };

        let ctx = DecisionContext {
            workflow: workflow.clone(),
            node: node.clone(),
            reader,
            valid_edges: valid_edges.clone(),
            stack: &self.stack,
        };

        let decision = match self.agent.resolve(&ctx) {
            Ok(d) => d,
            Err(e) => return Ok(self.suspend_on_error(&node.id, &format!("decision agent failed: {e}"))),
        };

        match decision {
            Decision::Advance { edge_id, writes } => self.handle_advance(&workflow, &node, &valid_edges, edge_id, writes),
            Decision::Suspend { reason, writes } => self.handle_suspend(&node, reason, writes),
            Decision::Complete { writes } => self.handle_complete(&workflow, &node, writes),
        }
    }

    /// Runs `step()` repeatedly until the session completes, suspends, or
    /// `cancel` reports cancelled. Cancellation is only checked between
    /// steps, never in the middle of one.
    pub fn run(&mut self, cancel: Option<&dyn CancelToken>) -> Result<StepResult, EngineError> {
        loop {
            if let Some(token) = cancel {
                if token.is_cancelled() {
                    return Err(EngineError::new("run() cancelled"));
                }
            }
            let result = self.step()?;
            if matches!(result.status, StepStatus::Completed | StepStatus::Suspended) {
                return Ok(result);
            }
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn status(&self) -> EngineStatus {
        self.status
    }

    pub fn current_workflow(&self) -> Option<Arc<Workflow>> {
        self.registry.get(&self.current_workflow_id)
    }

    pub fn current_node(&self) -> Option<Node> {
        self.current_workflow().and_then(|w| w.node(&self.current_node_id).cloned())
    }

    pub fn stack(&self) -> &[StackFrame] {
        &self.stack
    }

    pub fn current_scope(&self) -> Arc<Blackboard> {
        self.current_scope.clone()
    }

    pub fn blackboard(&self) -> ScopedReader {
        self.build_reader()
    }

    /// Re-runs guard filtering against a fresh reader over the live
    /// blackboard chain. Useful for inspection between steps (e.g. a UI
    /// that wants to show which edges would currently pass) without
    /// mutating engine state or requiring a step to have just run. A guard
    /// evaluation error is swallowed to an empty result since this
    /// accessor, unlike `step`, has no way to surface it.
    pub fn valid_edges(&self) -> Vec<Edge> {
        let Some(workflow) = self.current_workflow() else {
            return Vec::new();
        };
        let reader = self.build_reader();
        filter_edges(&self.current_node_id, &workflow.edges, &reader)
            .map(|edges| edges.into_iter().cloned().collect())
            .unwrap_or_default()
    }

    fn build_reader(&self) -> ScopedReader {
        let mut scopes = Vec::with_capacity(1 + self.stack.len());
        scopes.push(self.current_scope.entries());
        for frame in &self.stack {
            scopes.push(frame.snapshot_entries.clone());
        }
        ScopedReader::new(scopes)
    }

    fn emit(&self, mut event: Event) {
        event.session_id = self.session_id;
        if let Some(handlers) = self.handlers.get(&event.kind) {
            for handler in handlers {
                handler(&event);
            }
        }
    }

    fn suspend_on_error(&mut self, node_id: &str, reason: &str) -> StepResult {
        self.status = EngineStatus::Suspended;
        self.emit(
            Event::new(EventKind::EngineError)
                .with_workflow_id(self.current_workflow_id.clone())
                .with_node_id(node_id.to_string())
                .with_reason(reason.to_string()),
        );
        StepResult { status: StepStatus::Suspended, workflow: None, node: None, reason: Some(reason.to_string()) }
    }

    fn step_invoke(&mut self, workflow: &Arc<Workflow>, node: &Arc<Node>, invoke: &crate::registry::InvocationSpec) -> Result<StepResult, EngineError> {
        let Some(sub) = self.registry.get(&invoke.workflow_id) else {
            let reason = format!("invoked workflow '{}' is not registered", invoke.workflow_id);
            return Ok(self.suspend_on_error(&node.id, &reason));
        };

        let frame = StackFrame {
            workflow_id: self.current_workflow_id.clone(),
            current_node_id: self.current_node_id.clone(),
            return_map: invoke.return_map.clone(),
            snapshot_entries: self.current_scope.entries(),
        };
        self.stack.insert(0, frame);

        self.current_workflow_id = sub.id.clone();
        self.current_node_id = sub.entry.clone();
        self.current_scope = Arc::new(Blackboard::new());

        self.emit(Event::new(EventKind::WorkflowPush).with_workflow_id(sub.id.clone()).with_node_id(node.id.clone()));
        let entry_node = sub.node(&sub.entry).cloned().expect("entry node validated at registration");
        self.emit(Event::new(EventKind::NodeEnter).with_workflow_id(sub.id.clone()).with_node_id(entry_node.id.clone()));

        Ok(StepResult { status: StepStatus::Invoked, workflow: Some(sub), node: Some(Arc::new(entry_node)), reason: None })
    }

    fn handle_advance(
        &mut self,
        workflow: &Arc<Workflow>,
        node: &Arc<Node>,
        valid_edges: &[Edge],
        edge_id: String,
        writes: Vec<BlackboardWrite>,
    ) -> Result<StepResult, EngineError> {
        let Some(chosen) = valid_edges.iter().find(|e| e.id == edge_id).cloned() else {
            let reason = format!("decision chose edge '{edge_id}' which is not a valid edge from this node");
            return Ok(self.suspend_on_error(&node.id, &reason));
        };

        self.emit(
            Event::new(EventKind::NodeExit)
                .with_workflow_id(self.current_workflow_id.clone())
                .with_node_id(node.id.clone()),
        );
        self.emit(
            Event::new(EventKind::EdgeTraverse)
                .with_workflow_id(self.current_workflow_id.clone())
                .with_edge_id(chosen.id.clone()),
        );

        if !writes.is_empty() {
            let source = Source { workflow_id: self.current_workflow_id.clone(), node_id: node.id.clone(), stack_depth: self.stack.len() };
            let entries = self.current_scope.append(&writes, source);
            self.emit(Event::new(EventKind::BlackboardWrite).with_workflow_id(self.current_workflow_id.clone()).with_entries(entries));
        }

        self.current_node_id = chosen.to.clone();
        let next_node = workflow.node(&chosen.to).cloned().expect("edge target validated at registration");
        self.emit(
            Event::new(EventKind::NodeEnter)
                .with_workflow_id(self.current_workflow_id.clone())
                .with_node_id(next_node.id.clone()),
        );

        Ok(StepResult { status: StepStatus::Advanced, workflow: Some(workflow.clone()), node: Some(Arc::new(next_node)), reason: None })
    }

    fn handle_suspend(&mut self, node: &Arc<Node>, reason: String, writes: Vec<BlackboardWrite>) -> Result<StepResult, EngineError> {
        if !writes.is_empty() {
            let source = Source { workflow_id: self.current_workflow_id.clone(), node_id: node.id.clone(), stack_depth: self.stack.len() };
            let entries = self.current_scope.append(&writes, source);
            self.emit(Event::new(EventKind::BlackboardWrite).with_workflow_id(self.current_workflow_id.clone()).with_entries(entries));
        }

        self.status = EngineStatus::Suspended;
        self.emit(
            Event::new(EventKind::EngineSuspend)
                .with_workflow_id(self.current_workflow_id.clone())
                .with_node_id(node.id.clone())
                .with_reason(reason.clone()),
        );

        Ok(StepResult { status: StepStatus::Suspended, workflow: None, node: None, reason: Some(reason) })
    }

    fn handle_complete(&mut self, workflow: &Arc<Workflow>, node: &Arc<Node>, writes: Vec<BlackboardWrite>) -> Result<StepResult, EngineError> {
        if !workflow.is_terminal(&node.id) {
            return Ok(self.suspend_on_error(&node.id, "complete at non-terminal node"));
        }

        if !writes.is_empty() {
            let source = Source { workflow_id: self.current_workflow_id.clone(), node_id: node.id.clone(), stack_depth: self.stack.len() };
            let entries = self.current_scope.append(&writes, source);
            self.emit(Event::new(EventKind::BlackboardWrite).with_workflow_id(self.current_workflow_id.clone()).with_entries(entries));
        }

        if self.stack.is_empty() {
            self.status = EngineStatus::Completed;
            self.emit(Event::new(EventKind::EngineComplete).with_workflow_id(self.current_workflow_id.clone()).with_node_id(node.id.clone()));
            return Ok(StepResult { status: StepStatus::Completed, workflow: Some(workflow.clone()), node: None, reason: None });
        }

        self.pop_stack_frame()
    }

    fn pop_stack_frame(&mut self) -> Result<StepResult, EngineError> {
        let frame = self.stack.remove(0);
        let child_reader = self.current_scope.reader(Vec::new());
        let parent_scope = Blackboard::seeded(frame.snapshot_entries.clone());
        let parent_stack_depth = self.stack.len();

        let parent_workflow = self
            .registry
            .get(&frame.workflow_id)
            .expect("invoking workflow must remain registered across the invocation");

        for mapping in &frame.return_map {
            if let Some(value) = child_reader.get(&mapping.child_key) {
                let source = Source { workflow_id: frame.workflow_id.clone(), node_id: frame.current_node_id.clone(), stack_depth: parent_stack_depth };
                let entries = parent_scope.append(&[BlackboardWrite { key: mapping.parent_key.clone(), value: value.clone() }], source);
                self.emit(Event::new(EventKind::BlackboardWrite).with_workflow_id(parent_workflow.id.clone()).with_entries(entries));
            }
        }

        self.current_workflow_id = frame.workflow_id.clone();
        self.current_node_id = frame.current_node_id.clone();
        self.current_scope = Arc::new(parent_scope);
        self.skip_invocation = true;

        let invoking_node = parent_workflow
            .node(&frame.current_node_id)
            .cloned()
            .expect("invoking node must still exist in its workflow");

        self.emit(
            Event::new(EventKind::WorkflowPop)
                .with_workflow_id(parent_workflow.id.clone())
                .with_node_id(invoking_node.id.clone()),
        );
        self.emit(
            Event::new(EventKind::NodeEnter)
                .with_workflow_id(parent_workflow.id.clone())
                .with_node_id(invoking_node.id.clone()),
        );

        Ok(StepResult { status: StepStatus::Popped, workflow: Some(parent_workflow), node: Some(Arc::new(invoking_node)), reason: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Edge, Node, ReturnMapping, Workflow};
    use serde_json::json;

    struct AlwaysFirstEdge;

    impl DecisionAgent for AlwaysFirstEdge {
        fn resolve(&self, ctx: &DecisionContext) -> Result<Decision, crate::error::AgentError> {
            if let Some(edge) = ctx.valid_edges.first() {
                Ok(Decision::Advance { edge_id: edge.id.clone(), writes: Vec::new() })
            } else {
                Ok(Decision::Complete { writes: Vec::new() })
            }
        }
    }

    fn linear_workflow() -> Workflow {
        Workflow::new("linear", "start")
            .with_node(Node::new("start"))
            .with_node(Node::new("end"))
            .with_edge(Edge { id: "e1".into(), from: "start".into(), to: "end".into(), event: "ok".into(), guard: None })
    }

    #[test]
    fn runs_linear_workflow_to_completion() {
        let registry = Arc::new(Registry::new());
        registry.register(linear_workflow()).unwrap();
        let mut engine = Engine::new(registry, Arc::new(AlwaysFirstEdge));
        engine.init("linear", None).unwrap();
        let result = engine.run(None).unwrap();
        assert_eq!(result.status, StepStatus::Completed);
        assert_eq!(engine.status(), EngineStatus::Completed);
    }

    #[test]
    fn step_before_init_is_an_error() {
        let registry = Arc::new(Registry::new());
        let mut engine = Engine::new(registry, Arc::new(AlwaysFirstEdge));
        assert!(engine.step().is_err());
    }

    #[test]
    fn init_on_unregistered_workflow_leaves_state_untouched() {
        let registry = Arc::new(Registry::new());
        let mut engine = Engine::new(registry, Arc::new(AlwaysFirstEdge));
        assert!(engine.init("ghost", None).is_err());
        assert_eq!(engine.status(), EngineStatus::Idle);
    }

    struct AdvanceOrComplete;
    impl DecisionAgent for AdvanceOrComplete {
        fn resolve(&self, ctx: &DecisionContext) -> Result<Decision, crate::error::AgentError> {
            if ctx.node.id == "child_only" {
                Ok(Decision::Complete { writes: vec![BlackboardWrite { key: "result".into(), value: json!(42) }] })
            } else if let Some(edge) = ctx.valid_edges.first() {
                Ok(Decision::Advance { edge_id: edge.id.clone(), writes: Vec::new() })
            } else {
                Ok(Decision::Complete { writes: Vec::new() })
            }
        }
    }

    #[test]
    fn sub_workflow_invocation_pushes_and_pops_with_return_mapping() {
        let registry = Arc::new(Registry::new());
        let child = Workflow::new("child", "child_only").with_node(Node::new("child_only"));
        registry.register(child).unwrap();

        let mut parent_node = Node::new("invoker");
        parent_node.invokes = Some(crate::registry::InvocationSpec {
            workflow_id: "child".into(),
            return_map: vec![ReturnMapping { parent_key: "answer".into(), child_key: "result".into() }],
        });
        let parent = Workflow::new("parent", "invoker")
            .with_node(parent_node)
            .with_node(Node::new("after"))
            .with_edge(Edge { id: "e1".into(), from: "invoker".into(), to: "after".into(), event: "ok".into(), guard: None });
        registry.register(parent).unwrap();

        let mut engine = Engine::new(registry, Arc::new(AdvanceOrComplete));
        engine.init("parent", None).unwrap();

        let invoked = engine.step().unwrap();
        assert_eq!(invoked.status, StepStatus::Invoked);

        let completed_child = engine.step().unwrap();
        assert_eq!(completed_child.status, StepStatus::Popped);

        assert_eq!(engine.blackboard().get("answer"), Some(&json!(42)));

        let advanced = engine.step().unwrap();
        assert_eq!(advanced.status, StepStatus::Advanced);

        let done = engine.step().unwrap();
        assert_eq!(done.status, StepStatus::Completed);
    }

    #[test]
    fn run_stops_on_suspend_and_can_be_resumed() {
        struct SuspendOnce(std::sync::atomic::AtomicBool);
        impl DecisionAgent for SuspendOnce {
            fn resolve(&self, ctx: &DecisionContext) -> Result<Decision, crate::error::AgentError> {
                if !self.0.swap(true, std::sync::atomic::Ordering::SeqCst) {
                    return Ok(Decision::Suspend { reason: "waiting".into(), writes: Vec::new() });
                }
                if let Some(edge) = ctx.valid_edges.first() {
                    Ok(Decision::Advance { edge_id: edge.id.clone(), writes: Vec::new() })
                } else {
                    Ok(Decision::Complete { writes: Vec::new() })
                }
            }
        }

        let registry = Arc::new(Registry::new());
        registry.register(linear_workflow()).unwrap();
        let mut engine = Engine::new(registry, Arc::new(SuspendOnce(std::sync::atomic::AtomicBool::new(false))));
        engine.init("linear", None).unwrap();

        let first = engine.run(None).unwrap();
        assert_eq!(first.status, StepStatus::Suspended);
        assert_eq!(engine.status(), EngineStatus::Suspended);

        let second = engine.run(None).unwrap();
        assert_eq!(second.status, StepStatus::Completed);
    }

    #[test]
    fn valid_edges_reflects_current_guard_state_without_stepping() {
        let registry = Arc::new(Registry::new());
        let workflow = Workflow::new("guarded", "start")
            .with_node(Node::new("start"))
            .with_node(Node::new("left"))
            .with_node(Node::new("right"))
            .with_edge(Edge {
                id: "to-left".into(),
                from: "start".into(),
                to: "left".into(),
                event: "ok".into(),
                guard: Some(crate::guard::Guard::Exists("flag".into())),
            })
            .with_edge(Edge { id: "to-right".into(), from: "start".into(), to: "right".into(), event: "ok".into(), guard: None });
        registry.register(workflow).unwrap();

        let mut engine = Engine::new(registry, Arc::new(AlwaysFirstEdge));
        engine.init("guarded", None).unwrap();
        let before = engine.valid_edges();
        assert_eq!(before.len(), 1);
        assert_eq!(before[0].id, "to-right");
    }

    #[test]
    fn valid_edges_reports_the_invoking_nodes_own_edges_regardless_of_invocation_state() {
        let registry = Arc::new(Registry::new());
        let child = Workflow::new("child", "only").with_node(Node::new("only"));
        registry.register(child).unwrap();

        let mut parent_node = Node::new("invoker");
        parent_node.invokes = Some(crate::registry::InvocationSpec { workflow_id: "child".into(), return_map: Vec::new() });
        let parent = Workflow::new("parent", "invoker")
            .with_node(parent_node)
            .with_node(Node::new("after"))
            .with_edge(Edge { id: "e1".into(), from: "invoker".into(), to: "after".into(), event: "ok".into(), guard: None });
        registry.register(parent).unwrap();

        let mut engine = Engine::new(registry, Arc::new(AlwaysFirstEdge));
        engine.init("parent", None).unwrap();
        // Before the invocation has even been stepped, `valid_edges` still
        // reports the invoking node's own outgoing edges — it is a pure
        // guard re-filter, not a preview of what `step` would do next.
        let edges = engine.valid_edges();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].id, "e1");
    }

    #[test]
    fn step_invoke_of_unregistered_workflow_suspends_with_engine_error() {
        let registry = Arc::new(Registry::new());
        let mut invoker = Node::new("invoker");
        invoker.invokes = Some(crate::registry::InvocationSpec { workflow_id: "ghost".into(), return_map: Vec::new() });
        let parent = Workflow::new("parent", "invoker").with_node(invoker);
        registry.register(parent).unwrap();

        let mut engine = Engine::new(registry, Arc::new(AlwaysFirstEdge));
        engine.init("parent", None).unwrap();

        let errors = Arc::new(std::sync::Mutex::new(Vec::new()));
        let captured = errors.clone();
        engine.on(EventKind::EngineError, Box::new(move |e| captured.lock().unwrap().push(e.reason.clone())));

        let before = engine.current_scope().entries().len();
        let result = engine.step().unwrap();

        assert_eq!(result.status, StepStatus::Suspended);
        assert_eq!(result.reason.as_deref(), Some("invoked workflow 'ghost' is not registered"));
        assert_eq!(engine.status(), EngineStatus::Suspended);
        assert_eq!(errors.lock().unwrap().as_slice(), [Some("invoked workflow 'ghost' is not registered".to_string())]);
        assert_eq!(engine.current_scope().entries().len(), before);
    }

    #[test]
    fn step_suspends_with_engine_error_when_guard_evaluation_fails() {
        let registry = Arc::new(Registry::new());
        let workflow = Workflow::new("guarded", "start")
            .with_node(Node::new("start"))
            .with_node(Node::new("end"))
            .with_edge(Edge {
                id: "e1".into(),
                from: "start".into(),
                to: "end".into(),
                event: "ok".into(),
                guard: Some(crate::guard::Guard::Custom(crate::guard::CustomGuard::new(|_reader| {
                    Err(crate::error::AgentError::from("boom".to_string()))
                }))),
            });
        registry.register(workflow).unwrap();

        let mut engine = Engine::new(registry, Arc::new(AlwaysFirstEdge));
        engine.init("guarded", None).unwrap();

        let errors = Arc::new(std::sync::Mutex::new(Vec::new()));
        let captured = errors.clone();
        engine.on(EventKind::EngineError, Box::new(move |e| captured.lock().unwrap().push(e.reason.clone())));

        let before = engine.current_scope().entries().len();
        let result = engine.step().unwrap();

        assert_eq!(result.status, StepStatus::Suspended);
        assert_eq!(result.reason.as_deref(), Some("guard evaluation failed: boom"));
        assert_eq!(engine.status(), EngineStatus::Suspended);
        assert_eq!(errors.lock().unwrap().len(), 1);
        assert_eq!(engine.current_scope().entries().len(), before);
    }

    #[test]
    fn step_suspends_with_engine_error_when_decision_agent_fails() {
        struct AlwaysFails;
        impl DecisionAgent for AlwaysFails {
            fn resolve(&self, _ctx: &DecisionContext) -> Result<Decision, crate::error::AgentError> {
                Err(crate::error::AgentError::from("agent exploded".to_string()))
            }
        }

        let registry = Arc::new(Registry::new());
        registry.register(linear_workflow()).unwrap();
        let mut engine = Engine::new(registry, Arc::new(AlwaysFails));
        engine.init("linear", None).unwrap();

        let errors = Arc::new(std::sync::Mutex::new(Vec::new()));
        let captured = errors.clone();
        engine.on(EventKind::EngineError, Box::new(move |e| captured.lock().unwrap().push(e.reason.clone())));

        let before = engine.current_scope().entries().len();
        let result = engine.step().unwrap();

        assert_eq!(result.status, StepStatus::Suspended);
        assert_eq!(result.reason.as_deref(), Some("decision agent failed: agent exploded"));
        assert_eq!(engine.status(), EngineStatus::Suspended);
        assert_eq!(errors.lock().unwrap().len(), 1);
        assert_eq!(engine.current_scope().entries().len(), before);
    }

    #[test]
    fn advance_on_an_edge_not_in_valid_edges_suspends_with_engine_error() {
        struct AdvanceOnGhostEdge;
        impl DecisionAgent for AdvanceOnGhostEdge {
            fn resolve(&self, _ctx: &DecisionContext) -> Result<Decision, crate::error::AgentError> {
                Ok(Decision::Advance { edge_id: "ghost-edge".into(), writes: Vec::new() })
            }
        }

        let registry = Arc::new(Registry::new());
        registry.register(linear_workflow()).unwrap();
        let mut engine = Engine::new(registry, Arc::new(AdvanceOnGhostEdge));
        engine.init("linear", None).unwrap();

        let errors = Arc::new(std::sync::Mutex::new(Vec::new()));
        let captured = errors.clone();
        engine.on(EventKind::EngineError, Box::new(move |e| captured.lock().unwrap().push(e.reason.clone())));

        let before = engine.current_scope().entries().len();
        let result = engine.step().unwrap();

        assert_eq!(result.status, StepStatus::Suspended);
        assert_eq!(result.reason.as_deref(), Some("decision chose edge 'ghost-edge' which is not a valid edge from this node"));
        assert_eq!(engine.status(), EngineStatus::Suspended);
        assert_eq!(errors.lock().unwrap().len(), 1);
        assert_eq!(engine.current_scope().entries().len(), before);
    }

    #[test]
    fn cancel_flag_stops_run_between_steps() {
        let registry = Arc::new(Registry::new());
        registry.register(linear_workflow()).unwrap();
        let mut engine = Engine::new(registry, Arc::new(AlwaysFirstEdge));
        engine.init("linear", None).unwrap();
        let cancel = CancelFlag::new();
        cancel.cancel();
        assert!(engine.run(Some(&cancel)).is_err());
    }
}
