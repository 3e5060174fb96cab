//! Reflex: a DAG workflow orchestration kernel.
//!
//! A [`registry::Workflow`] is a directed acyclic graph of
//! [`registry::Node`]s joined by guarded [`registry::Edge`]s.
//! [`registry::Registry`] validates and stores workflows; [`engine::Engine`]
//! steps a single session through one, consulting an embedder-supplied
//! [`agent::DecisionAgent`] at every node and recording every write to an
//! append-only, scope-chained [`blackboard::Blackboard`].
//!
//! This crate is the kernel only: it has no opinion on how workflows are
//! authored or persisted (see `reflex-loader`) or which decision strategy
//! drives them (see `reflex-agents`).

pub mod agent;
pub mod blackboard;
pub mod engine;
pub mod error;
pub mod events;
pub mod guard;
pub mod registry;
pub mod scoped_reader;
pub mod value;

use std::sync::Arc;

pub use agent::{Decision, DecisionAgent, DecisionContext};
pub use blackboard::{Blackboard, BlackboardEntry, BlackboardWrite, Source};
pub use engine::{CancelFlag, CancelToken, Engine, EngineStatus, InitOptions, StackFrame, StepResult, StepStatus};
pub use error::{AgentError, EngineError, ValidationError, ValidationErrorCode};
pub use events::{Event, EventHandler, EventKind};
pub use guard::Guard;
pub use registry::{
    Edge, InputDecl, InvocationSpec, Node, NodeSpec, OutputDecl, Registry, ReturnMapping, VerifyReport,
    VerifyWarning, VerifyWarningCode, Workflow,
};
pub use scoped_reader::ScopedReader;

/// Convenience constructor mirroring the common case of a fresh, empty
/// registry shared across however many engines will run against it.
pub fn create_registry() -> Arc<Registry> {
    Arc::new(Registry::new())
}

/// Convenience constructor for an `Engine` over a shared registry and
/// decision agent.
pub fn create_engine(registry: Arc<Registry>, agent: Arc<dyn DecisionAgent>) -> Engine {
    Engine::new(registry, agent)
}
