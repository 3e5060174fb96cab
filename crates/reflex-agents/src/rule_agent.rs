use reflex_core::{AgentError, BlackboardWrite, Decision, DecisionAgent, DecisionContext, Edge, NodeSpec};
use serde_json::Value;

/// A deterministic decision agent that interprets a node's `spec` as a
/// rule descriptor rather than running any domain logic. Reads `suspend`,
/// `complete`, `edge`, and `writes` keys to produce a decision.
///
/// Resolution order:
/// 1. `suspend` (string reason) → suspend
/// 2. `complete` (bool, true) → complete, with optional `writes`
/// 3. otherwise → resolve `edge`, advance, with optional `writes`
pub struct RuleAgent;

impl RuleAgent {
    pub fn new() -> Self {
        RuleAgent
    }
}

impl Default for RuleAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl DecisionAgent for RuleAgent {
    fn resolve(&self, ctx: &DecisionContext) -> Result<Decision, AgentError> {
        let spec = &ctx.node.spec;

        if let Some(reason) = spec.get("suspend").and_then(Value::as_str) {
            return Ok(Decision::Suspend { reason: reason.to_string(), writes: Vec::new() });
        }

        if spec.get("complete").and_then(Value::as_bool).unwrap_or(false) {
            return Ok(Decision::Complete { writes: parse_writes(spec) });
        }

        let edge_id = resolve_edge(spec, &ctx.valid_edges)?;
        Ok(Decision::Advance { edge_id, writes: parse_writes(spec) })
    }
}

fn resolve_edge(spec: &NodeSpec, valid_edges: &[Edge]) -> Result<String, AgentError> {
    match spec.get("edge") {
        Some(Value::String(s)) => return Ok(s.clone()),
        Some(Value::Array(candidates)) => {
            let valid_ids: Vec<&str> = valid_edges.iter().map(|e| e.id.as_str()).collect();
            for candidate in candidates {
                if let Some(s) = candidate.as_str() {
                    if valid_ids.contains(&s) {
                        return Ok(s.to_string());
                    }
                }
            }
            if let Some(first) = candidates.first().and_then(Value::as_str) {
                // no candidate matched a valid edge; return the first anyway
                // so the engine rejects it with a precise "invalid edge" reason
                return Ok(first.to_string());
            }
        }
        _ => {}
    }

    match valid_edges.len() {
        1 => Ok(valid_edges[0].id.clone()),
        0 => Err(AgentError::from(anyhow::anyhow!("no valid edges and no edge specified in spec"))),
        _ => Err(AgentError::from(anyhow::anyhow!("multiple valid edges and no edge specified in spec"))),
    }
}

fn parse_writes(spec: &NodeSpec) -> Vec<BlackboardWrite> {
    let Some(Value::Array(items)) = spec.get("writes") else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let obj = item.as_object()?;
            let key = obj.get("key")?.as_str()?.to_string();
            let value = obj.get("value").cloned().unwrap_or(Value::Null);
            Some(BlackboardWrite { key, value })
        })
        .collect()
}
