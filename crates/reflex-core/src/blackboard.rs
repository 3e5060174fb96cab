//! The append-only, per-scope blackboard. Each workflow frame (the
//! top-level run, and each sub-workflow invocation) gets its own
//! `Blackboard`; the engine chains them together for reads via
//! [`crate::scoped_reader::ScopedReader`].

use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::scoped_reader::ScopedReader;

/// Identifies which workflow, node, and stack depth produced an entry.
/// `stack_depth` is 0 for the top-level run and increases by one per
/// sub-workflow invocation, so a consumer can tell how deep in the call
/// stack a write happened without re-walking the stack itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub workflow_id: String,
    pub node_id: String,
    pub stack_depth: usize,
}

/// A single append to a scope's log. Entries are never mutated or removed
/// once appended; a later write to the same key shadows, it does not
/// replace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlackboardEntry {
    pub key: String,
    pub value: Value,
    pub source: Source,
    pub timestamp_ms: i64,
}

/// What a `DecisionAgent` hands the engine to append: just a key and value,
/// the engine fills in `source`/`timestamp_ms` at append time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlackboardWrite {
    pub key: String,
    pub value: Value,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Append-only log for a single scope. Reads never block a concurrent
/// append behind anything more than a brief lock acquisition: `entries()`
/// and `entries_from()` clone out a snapshot rather than holding the lock
/// for the caller's duration, so a background persistence consumer can
/// poll `entries_from(cursor)` on the same scope the engine is still
/// writing to.
#[derive(Debug, Default)]
pub struct Blackboard {
    entries: RwLock<Vec<BlackboardEntry>>,
}

impl Blackboard {
    pub fn new() -> Self {
        Self { entries: RwLock::new(Vec::new()) }
    }

    /// Seeds a scope with entries already produced elsewhere (used when
    /// reconstructing a parent scope from a stack frame's snapshot on
    /// sub-workflow return).
    pub fn seeded(entries: Vec<BlackboardEntry>) -> Self {
        Self { entries: RwLock::new(entries) }
    }

    /// Appends `writes` as new entries stamped with `source` and the
    /// current time, and returns the entries that were just appended (for
    /// event emission). Timestamps are non-decreasing across appends to the
    /// same scope because they are assigned under the write lock.
    pub fn append(&self, writes: &[BlackboardWrite], source: Source) -> Vec<BlackboardEntry> {
        if writes.is_empty() {
            return Vec::new();
        }
        let mut guard = self.entries.write().expect("blackboard lock poisoned");
        let last_ts = guard.last().map(|e| e.timestamp_ms).unwrap_or(i64::MIN);
        let ts = now_ms().max(last_ts);
        let appended: Vec<BlackboardEntry> = writes
            .iter()
            .map(|w| BlackboardEntry {
                key: w.key.clone(),
                value: w.value.clone(),
                source: source.clone(),
                timestamp_ms: ts,
            })
            .collect();
        guard.extend(appended.clone());
        appended
    }

    /// A full snapshot of this scope's entries, in append order.
    pub fn entries(&self) -> Vec<BlackboardEntry> {
        self.entries.read().expect("blackboard lock poisoned").clone()
    }

    /// The current entry count, usable as an opaque cursor for
    /// `entries_from`.
    pub fn cursor(&self) -> usize {
        self.entries.read().expect("blackboard lock poisoned").len()
    }

    /// Entries appended at or after `cursor`, plus the cursor a caller
    /// should pass next. Negative or out-of-range cursors are clamped
    /// rather than treated as errors, so a consumer that starts with `0` or
    /// races slightly ahead of an append never panics.
    pub fn entries_from(&self, cursor: i64) -> (Vec<BlackboardEntry>, usize) {
        let guard = self.entries.read().expect("blackboard lock poisoned");
        let start = cursor.max(0) as usize;
        if start >= guard.len() {
            return (Vec::new(), guard.len());
        }
        (guard[start..].to_vec(), guard.len())
    }

    /// Builds a reader over this scope plus `ancestor_scopes`, innermost
    /// (this scope) first.
    pub fn reader(&self, mut ancestor_scopes: Vec<Vec<BlackboardEntry>>) -> ScopedReader {
        let mut scopes = Vec::with_capacity(1 + ancestor_scopes.len());
        scopes.push(self.entries());
        scopes.append(&mut ancestor_scopes);
        ScopedReader::new(scopes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn src() -> Source {
        Source { workflow_id: "w".into(), node_id: "n".into(), stack_depth: 0 }
    }

    #[test]
    fn append_is_additive_not_overwriting() {
        let bb = Blackboard::new();
        bb.append(&[BlackboardWrite { key: "k".into(), value: json!(1) }], src());
        bb.append(&[BlackboardWrite { key: "k".into(), value: json!(2) }], src());
        let entries = bb.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].value, json!(1));
        assert_eq!(entries[1].value, json!(2));
    }

    #[test]
    fn cursor_and_entries_from_roundtrip() {
        let bb = Blackboard::new();
        bb.append(&[BlackboardWrite { key: "a".into(), value: json!(1) }], src());
        let c = bb.cursor();
        bb.append(&[BlackboardWrite { key: "b".into(), value: json!(2) }], src());
        let (fresh, next) = bb.entries_from(c as i64);
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].key, "b");
        assert_eq!(next, 2);
    }

    #[test]
    fn entries_from_clamps_out_of_range_cursor() {
        let bb = Blackboard::new();
        bb.append(&[BlackboardWrite { key: "a".into(), value: json!(1) }], src());
        assert_eq!(bb.entries_from(-5).0.len(), 1);
        assert_eq!(bb.entries_from(1000).0.len(), 0);
    }
}
