//! The safe serialization contract.
//!
//! Business data handed to the [`ConnectionManager`](crate::wsrouter::connection_manager::ConnectionManager)
//! arrives as ordinary Rust values; this module is the single place that
//! turns any of them into a JSON value the transport can send, without
//! ever panicking or propagating a serialization error to the caller.
//!
//! The transform is total (every output is valid JSON) and idempotent:
//! running it twice produces the same result as running it once.

use serde::Serialize;
use serde_json::{Map, Value};

/// Capability probe for converting a value into safe JSON.
///
/// The blanket implementation below covers every `Serialize + Debug` type
/// — which, thanks to `serde`'s derive macros, already maps Rust's own
/// structural equivalents onto JSON: structs and maps become JSON objects,
/// `Vec`/`HashSet`/tuples become JSON arrays, and `#[derive(Serialize)]`
/// enums become their declared tag. The only branch that needs explicit
/// handling here is the "anything else" fallback for values whose
/// serialization fails outright (e.g. a stray `f64::NAN`).
pub trait ToSafeJson {
    fn to_safe_json(&self) -> Value;
}

impl<T: Serialize + std::fmt::Debug> ToSafeJson for T {
    fn to_safe_json(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(value) => canonicalize(value),
            Err(err) => {
                log::warn!("serialize_safely: falling back to string form: {err}");
                Value::String(format!("{:?}", self))
            }
        }
    }
}

/// Convert `value` to safe JSON. Thin free-function wrapper over
/// [`ToSafeJson`] for call sites that would rather not import the trait.
pub fn serialize_safely<T: Serialize + std::fmt::Debug>(value: &T) -> Value {
    value.to_safe_json()
}

/// Recursively re-normalize an already-constructed [`Value`] (e.g. business
/// data an agent passed in directly as JSON). Exists so that merging
/// caller-supplied JSON into an envelope goes through the same total,
/// idempotent pass as typed values.
pub fn canonicalize(value: Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, val) in map {
                out.insert(key, canonicalize(val));
            }
            Value::Object(out)
        }
        other => other,
    }
}
