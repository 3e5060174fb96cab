//! The engine's event stream: every externally observable transition is
//! emitted through this, in the strict per-transition ordering the engine
//! module documents.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::blackboard::BlackboardEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    NodeEnter,
    NodeExit,
    EdgeTraverse,
    WorkflowPush,
    WorkflowPop,
    BlackboardWrite,
    EngineSuspend,
    EngineComplete,
    EngineError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub session_id: Uuid,
    pub workflow_id: Option<String>,
    pub node_id: Option<String>,
    pub edge_id: Option<String>,
    pub entries: Vec<BlackboardEntry>,
    pub reason: Option<String>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            session_id: Uuid::nil(),
            workflow_id: None,
            node_id: None,
            edge_id: None,
            entries: Vec::new(),
            reason: None,
        }
    }

    pub fn with_workflow_id(mut self, id: impl Into<String>) -> Self {
        self.workflow_id = Some(id.into());
        self
    }

    pub fn with_node_id(mut self, id: impl Into<String>) -> Self {
        self.node_id = Some(id.into());
        self
    }

    pub fn with_edge_id(mut self, id: impl Into<String>) -> Self {
        self.edge_id = Some(id.into());
        self
    }

    pub fn with_entries(mut self, entries: Vec<BlackboardEntry>) -> Self {
        self.entries = entries;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// A subscriber to one event kind. Handlers run synchronously on the
/// engine's own call stack, in registration order; a handler that panics
/// takes the engine down with it, so handlers should not panic.
pub type EventHandler = Box<dyn Fn(&Event) + Send + Sync>;
