//! The `DecisionAgent` contract: the only extension point an embedder must
//! implement to drive a workflow. The engine calls `resolve` once per step
//! at a node with no pending invocation, after filtering edges through
//! their guards.

use std::sync::Arc;

use crate::blackboard::BlackboardWrite;
use crate::engine::StackFrame;
use crate::error::AgentError;
use crate::registry::{Edge, Node, Workflow};
use crate::scoped_reader::ScopedReader;

/// Everything a `DecisionAgent` needs to decide: the workflow and node it
/// is standing at, a blackboard view across the current call stack, the
/// edges that passed their guards, and the stack of ancestor frames (for
/// agents that want to reason about how they got here).
pub struct DecisionContext<'a> {
    pub workflow: Arc<Workflow>,
    pub node: Arc<Node>,
    pub reader: ScopedReader,
    pub valid_edges: Vec<Edge>,
    pub stack: &'a [StackFrame],
}

/// What a `DecisionAgent` returns for a step. Writes attached to any
/// variant are appended to the current scope before the transition they
/// accompany is applied.
pub enum Decision {
    /// Traverse `edge_id`, which must be present in `valid_edges`.
    Advance { edge_id: String, writes: Vec<BlackboardWrite> },
    /// Halt the session at the current node without completing it.
    Suspend { reason: String, writes: Vec<BlackboardWrite> },
    /// The current node is done. Valid only at a terminal node (no
    /// outgoing edges); the engine rejects it otherwise.
    Complete { writes: Vec<BlackboardWrite> },
}

/// The sole extension point embedders implement. `resolve` must be total
/// and return promptly: it decides the next transition for a single node,
/// it does not itself run the workflow forward.
pub trait DecisionAgent: Send + Sync {
    fn resolve(&self, ctx: &DecisionContext) -> Result<Decision, AgentError>;
}
