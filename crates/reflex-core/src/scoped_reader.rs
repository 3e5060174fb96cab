//! Read-only view across a chain of blackboard scopes, innermost first.
//! Guards, decision agents, and `Registry::verify` all see the blackboard
//! through this type rather than a raw `Blackboard`.

use serde_json::Value;

use crate::blackboard::BlackboardEntry;
use crate::value::as_finite_f64;

/// An ordered stack of scope snapshots. Index 0 is the current (innermost)
/// scope; later entries are ancestor scopes, outermost last. A key lookup
/// walks scopes in this order and returns the latest entry in the first
/// scope that has the key at all — an inner scope that has never written a
/// key falls through to the parent, but an inner scope that has written it
/// (even once) fully shadows the parent for that key.
pub struct ScopedReader {
    scopes: Vec<Vec<BlackboardEntry>>,
}

impl ScopedReader {
    pub fn new(scopes: Vec<Vec<BlackboardEntry>>) -> Self {
        Self { scopes }
    }

    /// The most recent entry for `key` in the first scope that contains it.
    fn latest_entry(&self, key: &str) -> Option<&BlackboardEntry> {
        for scope in &self.scopes {
            if let Some(entry) = scope.iter().rev().find(|e| e.key == key) {
                return Some(entry);
            }
        }
        None
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.latest_entry(key).map(|e| &e.value)
    }

    pub fn has(&self, key: &str) -> bool {
        self.latest_entry(key).is_some()
    }

    /// Every entry for `key` across every scope, in the same shadowing
    /// order (innermost scope first, each scope in append order).
    pub fn get_all(&self, key: &str) -> Vec<&BlackboardEntry> {
        self.scopes
            .iter()
            .flat_map(|scope| scope.iter().filter(|e| e.key == key))
            .collect()
    }

    /// Every entry currently visible, flattened from innermost to
    /// outermost scope, in append order within each scope.
    pub fn entries(&self) -> Vec<&BlackboardEntry> {
        self.scopes.iter().flatten().collect()
    }

    /// The distinct keys visible across every scope.
    pub fn keys(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for entry in self.entries() {
            if !seen.contains(&entry.key) {
                seen.push(entry.key.clone());
            }
        }
        seen
    }

    /// Entries from the innermost scope only, ignoring ancestors.
    pub fn local(&self) -> &[BlackboardEntry] {
        self.scopes.first().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(as_finite_f64)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| {
            v.as_i64().or_else(|| as_finite_f64(v).filter(|f| f.fract() == 0.0).map(|f| f as i64))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blackboard::Source;
    use serde_json::json;

    fn entry(key: &str, value: Value) -> BlackboardEntry {
        BlackboardEntry {
            key: key.to_string(),
            value,
            source: Source { workflow_id: "w".into(), node_id: "n".into(), stack_depth: 0 },
            timestamp_ms: 0,
        }
    }

    #[test]
    fn inner_scope_shadows_outer() {
        let reader = ScopedReader::new(vec![
            vec![entry("x", json!("inner"))],
            vec![entry("x", json!("outer"))],
        ]);
        assert_eq!(reader.get("x"), Some(&json!("inner")));
    }

    #[test]
    fn missing_key_falls_through_to_outer_scope() {
        let reader = ScopedReader::new(vec![
            vec![entry("y", json!(1))],
            vec![entry("x", json!("outer"))],
        ]);
        assert_eq!(reader.get("x"), Some(&json!("outer")));
    }

    #[test]
    fn latest_write_in_shadowing_scope_wins() {
        let reader = ScopedReader::new(vec![vec![entry("x", json!(1)), entry("x", json!(2))]]);
        assert_eq!(reader.get("x"), Some(&json!(2)));
    }

    #[test]
    fn typed_accessors_coerce() {
        let reader = ScopedReader::new(vec![vec![entry("n", json!(5))]]);
        assert_eq!(reader.get_f64("n"), Some(5.0));
        assert_eq!(reader.get_i64("n"), Some(5));
        assert_eq!(reader.get_str("n"), None);
    }
}
