//! The dynamic value wrapper Reflex uses for opaque node specs and
//! blackboard entries, plus the numeric-aware equality it is built around.
//!
//! Reflex never interprets domain values itself; it only needs a value type
//! that can be stored, cloned, and compared. `serde_json::Value` already is
//! that type across this workspace, so Reflex reuses it rather than
//! inventing a parallel one.

use serde_json::Value;

/// Coerces `v` to a finite `f64` if it is a JSON number representable as one.
/// Strings, bools, arrays, objects, and null never coerce, and non-finite
/// numbers (there are none in valid JSON, but a custom `Value` construction
/// could produce one) are rejected too.
pub fn as_finite_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()),
        _ => None,
    }
}

/// Numeric-aware equality: if both sides coerce to a finite `f64`, compare
/// as numbers (so `5` and `5.0` agree). Otherwise fall back to structural
/// equality, so `"5"` and `5` never agree.
pub fn numeric_aware_eq(a: &Value, b: &Value) -> bool {
    match (as_finite_f64(a), as_finite_f64(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}
