//! Edge guards: the built-in predicates plus the embedder-supplied custom
//! hook, and the filtering pass the engine runs before calling a
//! `DecisionAgent`.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::AgentError;
use crate::registry::Edge;
use crate::scoped_reader::ScopedReader;
use crate::value::numeric_aware_eq;

/// A guard must be total (never panics), terminating, and side-effect-free
/// with respect to the blackboard; it may still fail (e.g. a custom guard
/// reaching out to something that errors), which the engine treats as a
/// suspend-worthy failure rather than a panic.
pub type CustomGuardFn = dyn Fn(&ScopedReader) -> Result<bool, AgentError> + Send + Sync;

#[derive(Clone)]
pub struct CustomGuard(pub Arc<CustomGuardFn>);

impl CustomGuard {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&ScopedReader) -> Result<bool, AgentError> + Send + Sync + 'static,
    {
        CustomGuard(Arc::new(f))
    }
}

impl fmt::Debug for CustomGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CustomGuard(..)")
    }
}

#[derive(Debug, Clone)]
pub enum Guard {
    Exists(String),
    NotExists(String),
    Equals(String, Value),
    NotEquals(String, Value),
    Custom(CustomGuard),
}

impl Guard {
    pub fn evaluate(&self, reader: &ScopedReader) -> Result<bool, AgentError> {
        match self {
            Guard::Exists(key) => Ok(reader.has(key)),
            Guard::NotExists(key) => Ok(!reader.has(key)),
            Guard::Equals(key, expected) => Ok(reader
                .get(key)
                .map(|actual| numeric_aware_eq(actual, expected))
                .unwrap_or(false)),
            Guard::NotEquals(key, expected) => Ok(reader
                .get(key)
                .map(|actual| !numeric_aware_eq(actual, expected))
                .unwrap_or(true)),
            Guard::Custom(guard) => (guard.0)(reader),
        }
    }
}

/// Returns the edges leaving `node_id` whose guard (if any) evaluates true,
/// in the workflow's declared edge order. Stops and returns the first guard
/// error encountered; the engine treats that as a suspend, not a panic.
pub fn filter_edges<'a>(
    node_id: &str,
    edges: &'a [Edge],
    reader: &ScopedReader,
) -> Result<Vec<&'a Edge>, AgentError> {
    let mut valid = Vec::new();
    for edge in edges.iter().filter(|e| e.from == node_id) {
        let passes = match &edge.guard {
            None => true,
            Some(guard) => guard.evaluate(reader)?,
        };
        if passes {
            valid.push(edge);
        }
    }
    Ok(valid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blackboard::{Blackboard, Source};
    use crate::registry::ReturnMapping;
    use serde_json::json;

    fn reader_with(key: &str, value: Value) -> ScopedReader {
        let bb = Blackboard::new();
        bb.append(
            &[crate::blackboard::BlackboardWrite { key: key.to_string(), value }],
            Source { workflow_id: "w".into(), node_id: "n".into(), stack_depth: 0 },
        );
        bb.reader(Vec::new())
    }

    #[test]
    fn exists_and_not_exists() {
        let reader = reader_with("x", json!(1));
        assert!(Guard::Exists("x".into()).evaluate(&reader).unwrap());
        assert!(!Guard::NotExists("x".into()).evaluate(&reader).unwrap());
        assert!(!Guard::Exists("y".into()).evaluate(&reader).unwrap());
        assert!(Guard::NotExists("y".into()).evaluate(&reader).unwrap());
    }

    #[test]
    fn equals_is_numeric_aware() {
        let reader = reader_with("x", json!(5));
        assert!(Guard::Equals("x".into(), json!(5.0)).evaluate(&reader).unwrap());
        assert!(!Guard::Equals("x".into(), json!("5")).evaluate(&reader).unwrap());
    }

    #[test]
    fn equals_missing_key_is_false() {
        let reader = reader_with("x", json!(5));
        assert!(!Guard::Equals("missing".into(), json!(5)).evaluate(&reader).unwrap());
        assert!(Guard::NotEquals("missing".into(), json!(5)).evaluate(&reader).unwrap());
    }

    #[test]
    fn filter_edges_applies_guards_in_declared_order() {
        let edges = vec![
            Edge { id: "e1".into(), from: "n1".into(), to: "n2".into(), event: "ok".into(), guard: Some(Guard::Exists("flag".into())) },
            Edge { id: "e2".into(), from: "n1".into(), to: "n3".into(), event: "ok".into(), guard: None },
            Edge { id: "e3".into(), from: "n9".into(), to: "n4".into(), event: "ok".into(), guard: None },
        ];
        let reader = reader_with("other", json!(true));
        let valid = filter_edges("n1", &edges, &reader).unwrap();
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].id, "e2");
    }

    #[test]
    fn return_mapping_is_plain_data() {
        let m = ReturnMapping { parent_key: "p".into(), child_key: "c".into() };
        assert_eq!(m.parent_key, "p");
    }
}
