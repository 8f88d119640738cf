//! In-process step functions, addressed as `builtin:<name>`.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::{Provider, ProviderInvocationError};
use crate::domain::{Payload, ProviderRef, Step};

/// Names accepted after `builtin:`
pub const BUILTIN_FUNCTIONS: &[&str] = &[
    "identity",
    "null",
    "sha256",
    "lowercase",
    "uppercase",
    "trim",
    "now",
    "fail",
    "merge",
];

/// Executes built-in functions
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinProvider;

impl BuiltinProvider {
    pub fn call(
        &self,
        step: &Step,
        function: &str,
        input: Payload,
    ) -> Result<Payload, ProviderInvocationError> {
        let output = match function {
            "identity" => input,
            "null" => Payload::Parsed(Value::Null),
            "sha256" => Payload::Parsed(Value::String(sha256(&input))),
            "lowercase" => map_strings(input, |s| s.to_lowercase()),
            "uppercase" => map_strings(input, |s| s.to_uppercase()),
            "trim" => map_strings(input, |s| s.trim().to_string()),
            "now" => Payload::Parsed(Value::String(Utc::now().to_rfc3339())),
            "fail" => return Err(fail(step, input)),
            "merge" => Payload::Parsed(merge(input.as_value())),
            _ => {
                return Err(ProviderInvocationError::Unsupported {
                    step: step.name.clone(),
                    provider: format!("builtin:{}", function),
                })
            }
        };
        Ok(output)
    }
}

#[async_trait]
impl Provider for BuiltinProvider {
    fn name(&self) -> &str {
        "builtin"
    }

    async fn invoke(
        &self,
        step: &Step,
        provider: &ProviderRef,
        input: Payload,
    ) -> Result<Payload, ProviderInvocationError> {
        match provider {
            ProviderRef::Builtin { name } => self.call(step, name, input),
            other => Err(ProviderInvocationError::Unsupported {
                step: step.name.clone(),
                provider: other.to_string(),
            }),
        }
    }
}

/// Hex digest. Strings hash their text, raw payloads their bytes and
/// anything else its JSON encoding.
fn sha256(input: &Payload) -> String {
    let bytes = match input {
        Payload::Parsed(Value::String(s)) => s.as_bytes().to_vec(),
        other => other.to_bytes(),
    };
    hex::encode(Sha256::digest(&bytes))
}

/// Apply `f` to a string, or to every string field of an object
fn map_strings(input: Payload, f: impl Fn(&str) -> String) -> Payload {
    match input {
        Payload::Parsed(Value::String(s)) => Payload::Parsed(Value::String(f(&s))),
        Payload::Parsed(Value::Object(map)) => Payload::Parsed(Value::Object(
            map.into_iter()
                .map(|(k, v)| match v {
                    Value::String(s) => (k, Value::String(f(&s))),
                    other => (k, other),
                })
                .collect(),
        )),
        Payload::Raw(bytes) => match String::from_utf8(bytes) {
            Ok(text) => Payload::Parsed(Value::String(f(&text))),
            Err(e) => Payload::Raw(e.into_bytes()),
        },
        other => other,
    }
}

fn fail(step: &Step, input: Payload) -> ProviderInvocationError {
    let value = input.as_value();
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("explicit failure")
        .to_string();

    ProviderInvocationError::Failed {
        step: step.name.clone(),
        exit_code: None,
        message,
        output: match value {
            Value::Null => None,
            other => Some(other),
        },
    }
}

/// Shallow merge. Arrays merge their object items left to right; objects
/// merge each object-valued field and keep other fields as they are.
fn merge(input: Value) -> Value {
    let mut out = Map::new();
    match input {
        Value::Array(items) => {
            for item in items {
                if let Value::Object(map) = item {
                    out.extend(map);
                }
            }
        }
        Value::Object(map) => {
            for (key, value) in map {
                match value {
                    Value::Object(inner) => out.extend(inner),
                    other => {
                        out.insert(key, other);
                    }
                }
            }
        }
        other => return other,
    }
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step() -> Step {
        Step {
            name: "f".to_string(),
            provider: "builtin:x".to_string(),
            mappings: Vec::new(),
            timeout_seconds: None,
            retry_policy: None,
        }
    }

    fn call(function: &str, input: Value) -> Result<Payload, ProviderInvocationError> {
        BuiltinProvider.call(&step(), function, Payload::from(input))
    }

    #[test]
    fn test_sha256_is_stable_and_irreversible() {
        let first = call("sha256", json!("secret")).unwrap();
        let second = call("sha256", json!("secret")).unwrap();
        assert_eq!(first, second);
        assert_ne!(first, Payload::from(json!("secret")));
        assert_eq!(
            first,
            Payload::from(json!(
                "2bb80d537b1da3e38bd30361aa855686bde0eacd7162fef6a25fe97bf527a25b"
            ))
        );
    }

    #[test]
    fn test_string_functions() {
        assert_eq!(call("uppercase", json!("abc")).unwrap(), Payload::from(json!("ABC")));
        assert_eq!(
            call("trim", json!({"a": "  x ", "n": 1})).unwrap(),
            Payload::from(json!({"a": "x", "n": 1}))
        );
        assert_eq!(call("null", json!("anything")).unwrap(), Payload::from(Value::Null));
    }

    #[test]
    fn test_fail_echoes_input() {
        let err = call("fail", json!({"field1": "x"})).unwrap_err();
        match err {
            ProviderInvocationError::Failed { output, .. } => {
                assert_eq!(output, Some(json!({"field1": "x"})));
            }
            other => panic!("Expected explicit failure, got {:?}", other),
        }
    }

    #[test]
    fn test_merge() {
        assert_eq!(
            call("merge", json!({"a": {"x": 1}, "b": {"y": 2}, "c": 3})).unwrap(),
            Payload::from(json!({"x": 1, "y": 2, "c": 3}))
        );
        assert_eq!(
            call("merge", json!([{"x": 1}, {"x": 2, "z": 0}])).unwrap(),
            Payload::from(json!({"x": 2, "z": 0}))
        );
    }

    #[test]
    fn test_unknown_function() {
        assert!(matches!(
            call("nope", Value::Null),
            Err(ProviderInvocationError::Unsupported { .. })
        ));
    }
}
