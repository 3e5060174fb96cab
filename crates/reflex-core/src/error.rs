//! Error types shared across the registry and engine. Reflex favors plain
//! structs with a hand-written `Display`/`Error` over a derive macro: the
//! error shapes here carry machine-checkable codes (`ValidationErrorCode`)
//! that callers branch on, which a derive would only obscure.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable, machine-checkable reasons a workflow can fail registration or an
/// embedder-supplied workflow definition can fail to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationErrorCode {
    EmptyWorkflow,
    InvalidEntryNode,
    NodeIdMismatch,
    InvalidEdge,
    NoTerminalNodes,
    CycleDetected,
    DuplicateWorkflowId,
    SchemaViolation,
    UnknownGuardReference,
    WorkflowNotFound,
}

impl ValidationErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationErrorCode::EmptyWorkflow => "EMPTY_WORKFLOW",
            ValidationErrorCode::InvalidEntryNode => "INVALID_ENTRY_NODE",
            ValidationErrorCode::NodeIdMismatch => "NODE_ID_MISMATCH",
            ValidationErrorCode::InvalidEdge => "INVALID_EDGE",
            ValidationErrorCode::NoTerminalNodes => "NO_TERMINAL_NODES",
            ValidationErrorCode::CycleDetected => "CYCLE_DETECTED",
            ValidationErrorCode::DuplicateWorkflowId => "DUPLICATE_WORKFLOW_ID",
            ValidationErrorCode::SchemaViolation => "SCHEMA_VIOLATION",
            ValidationErrorCode::UnknownGuardReference => "UNKNOWN_GUARD_REFERENCE",
            ValidationErrorCode::WorkflowNotFound => "WORKFLOW_NOT_FOUND",
        }
    }
}

impl fmt::Display for ValidationErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structural or schema failure, identified by `code` and carrying enough
/// detail (`details`) for a caller to act on without parsing `message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationError {
    pub code: ValidationErrorCode,
    pub workflow_id: String,
    pub message: String,
    pub details: Option<Value>,
}

impl ValidationError {
    pub fn new(code: ValidationErrorCode, workflow_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            workflow_id: workflow_id.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.workflow_id, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Raised when the engine is asked to do something its current state
/// precludes: `step()` before `init()`, `init()` on an unregistered
/// workflow, `step()`/`run()` while already `Completed`, and so on.
#[derive(Debug, Clone)]
pub struct EngineError {
    pub message: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for EngineError {}

/// Wraps whatever an embedder's `DecisionAgent` or custom guard predicate
/// returns as an error. Kept distinct from `EngineError` because agent and
/// guard failures are recoverable (the engine suspends and emits
/// `engine:error`), not a precondition violation.
#[derive(Debug)]
pub struct AgentError(pub anyhow::Error);

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for AgentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl From<anyhow::Error> for AgentError {
    fn from(e: anyhow::Error) -> Self {
        AgentError(e)
    }
}

impl From<String> for AgentError {
    fn from(s: String) -> Self {
        AgentError(anyhow::anyhow!(s))
    }
}
