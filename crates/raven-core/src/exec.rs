//! Remote execution request and result envelope.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Request to run a named routine on a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Script identifier, resolved by the worker's registry.
    pub script: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Keyword arguments.
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl ExecutionRequest {
    /// Create a request with no arguments.
    #[must_use]
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    /// Set positional arguments.
    #[must_use]
    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Add a keyword argument.
    #[must_use]
    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }
}

/// Outcome of a remote execution, as carried on the wire.
///
/// Serialized as `{"status": "OK", "output": ..}` or
/// `{"status": "FAILED", "error": .., "trace": ..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum ExecutionResult {
    #[serde(rename = "OK")]
    Success {
        #[serde(default)]
        output: Value,
    },
    #[serde(rename = "FAILED")]
    Failure {
        #[serde(default)]
        error: String,
        #[serde(default, alias = "traceback")]
        trace: String,
    },
}

impl ExecutionResult {
    #[must_use]
    pub const fn success(output: Value) -> Self {
        Self::Success { output }
    }

    #[must_use]
    pub fn failure(error: impl Into<String>, trace: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
            trace: trace.into(),
        }
    }

    /// Interpret a received envelope.
    ///
    /// Any status other than `"OK"` is a failure; an envelope that does not
    /// decode cleanly keeps whatever `error` text it carried.
    #[must_use]
    pub fn from_envelope(envelope: Value) -> Self {
        if let Ok(result) = serde_json::from_value::<Self>(envelope.clone()) {
            return result;
        }

        let field = |key: &str| match envelope.get(key) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        };

        if envelope.get("status").and_then(Value::as_str) == Some("OK") {
            return Self::Success {
                output: envelope.get("output").cloned().unwrap_or(Value::Null),
            };
        }

        Self::Failure {
            error: field("error").unwrap_or_else(|| format!("malformed result envelope: {envelope}")),
            trace: field("trace").or_else(|| field("traceback")).unwrap_or_default(),
        }
    }

    /// Encode as a wire envelope.
    #[must_use]
    pub fn to_envelope(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|e| {
            serde_json::json!({"status": "FAILED", "error": e.to_string(), "trace": ""})
        })
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Output value, if the execution succeeded.
    #[must_use]
    pub const fn output(&self) -> Option<&Value> {
        match self {
            Self::Success { output } => Some(output),
            Self::Failure { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_request_defaults() {
        let req: ExecutionRequest = serde_json::from_value(json!({"script": "train"})).unwrap();
        assert_eq!(req, ExecutionRequest::new("train"));
    }

    #[test]
    fn test_success_envelope() {
        let result = ExecutionResult::success(json!(5));
        assert_eq!(result.to_envelope(), json!({"status": "OK", "output": 5}));
        assert_eq!(ExecutionResult::from_envelope(json!({"status": "OK", "output": 5})), result);
    }

    #[test]
    fn test_failure_envelope_accepts_traceback_key() {
        let result = ExecutionResult::from_envelope(json!({
            "status": "FAILED",
            "error": "boom",
            "traceback": "line 1",
        }));
        assert_eq!(result, ExecutionResult::failure("boom", "line 1"));
    }

    #[test]
    fn test_unknown_status_is_failure() {
        let result = ExecutionResult::from_envelope(json!({"status": "WAT", "error": "odd"}));
        assert_eq!(result, ExecutionResult::failure("odd", ""));
        assert!(!result.is_success());
    }

    #[test]
    fn test_malformed_envelope_is_failure() {
        let result = ExecutionResult::from_envelope(json!([1, 2]));
        match result {
            ExecutionResult::Failure { error, .. } => assert!(error.contains("malformed")),
            ExecutionResult::Success { .. } => panic!("Expected failure"),
        }
    }
}
