//! Result Codec: wraps step outputs for carry-forward and flattens a job tree's
//! children back into a single step-name → output map (§4.2, §3 "Step Result Wrapper").

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;

/// Current wrapper format version. Bumped if the wire shape ever changes.
pub const WRAPPER_VERSION: u32 = 1;

/// Keys rewritten by [`deep_sanitize`] to prevent prototype-mutation (§3 invariant 3).
const SANITIZED_KEYS: [&str; 3] = ["__proto__", "constructor", "prototype"];

/// On-wire representation of a step's output (§3 "Step Result Wrapper"). The only form
/// in which step outputs are ever stored on a job's return value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum StepResultWrapper {
    Sequential {
        wrapper_version: u32,
        step_name: String,
        step_result: Value,
        prior_results: IndexMap<String, Value>,
    },
    Parallel {
        wrapper_version: u32,
        parallel_results: IndexMap<String, Value>,
        prior_results: IndexMap<String, Value>,
    },
}

impl StepResultWrapper {
    pub fn sequential(
        step_name: impl Into<String>,
        step_result: Value,
        prior_results: IndexMap<String, Value>,
    ) -> Self {
        Self::Sequential {
            wrapper_version: WRAPPER_VERSION,
            step_name: step_name.into(),
            step_result,
            prior_results,
        }
    }

    pub fn parallel(
        parallel_results: IndexMap<String, Value>,
        prior_results: IndexMap<String, Value>,
    ) -> Self {
        Self::Parallel {
            wrapper_version: WRAPPER_VERSION,
            parallel_results,
            prior_results,
        }
    }

    pub fn to_value(&self) -> Result<Value, EngineError> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Rewrites a single sanitization-set key; leaves any other key untouched.
fn sanitize_key(key: String) -> String {
    if SANITIZED_KEYS.contains(&key.as_str()) {
        format!("_sanitized_{key}")
    } else {
        key
    }
}

/// Recursively strips prototype-mutation keys from nested objects and arrays.
/// Primitives and `null` pass through verbatim (§4.2).
pub fn deep_sanitize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sanitized = serde_json::Map::with_capacity(map.len());
            for (key, val) in map {
                sanitized.insert(sanitize_key(key), deep_sanitize(val));
            }
            Value::Object(sanitized)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(deep_sanitize).collect()),
        other => other,
    }
}

fn merge_sanitized(acc: &mut IndexMap<String, Value>, entries: IndexMap<String, Value>) {
    for (key, val) in entries {
        acc.insert(sanitize_key(key), deep_sanitize(val));
    }
}

/// Flattens a job tree's ordered children into a single `step-name → output` map
/// (§4.2). `children` must be in the order children were declared in the submitted
/// tree, matching [`crate::store::BackingStore::get_children_values`]'s ordering
/// contract. For each child, its `prior_results` is merged first, then its own
/// step-result(s) are written on top — later children win on key collision.
pub fn flatten(children: &[(String, Value)]) -> Result<IndexMap<String, Value>, EngineError> {
    let mut acc = IndexMap::new();
    for (_, raw) in children {
        let wrapper: StepResultWrapper = serde_json::from_value(raw.clone())?;
        match wrapper {
            StepResultWrapper::Sequential {
                step_name,
                step_result,
                prior_results,
                ..
            } => {
                merge_sanitized(&mut acc, prior_results);
                acc.insert(sanitize_key(step_name), deep_sanitize(step_result));
            }
            StepResultWrapper::Parallel {
                parallel_results,
                prior_results,
                ..
            } => {
                merge_sanitized(&mut acc, prior_results);
                merge_sanitized(&mut acc, parallel_results);
            }
        }
    }
    Ok(acc)
}
