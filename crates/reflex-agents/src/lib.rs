//! Illustrative `DecisionAgent` implementations. Real embedders almost
//! always write their own agent tailored to their domain; [`RuleAgent`] is
//! here as a reference and a convenient fixture for tests.

mod rule_agent;

pub use rule_agent::RuleAgent;
