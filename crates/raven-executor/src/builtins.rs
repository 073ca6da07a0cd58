//! Routines every worker ships with.

use std::sync::Arc;

use async_trait::async_trait;
use raven_core::{DeviceProbe, Executable, ExecutionError};
use serde_json::{Map, Number, Value, json};

/// Adapter turning a plain function into an [`Executable`].
pub struct FnExecutable<F>(pub F);

#[async_trait]
impl<F> Executable for FnExecutable<F>
where
    F: Fn(Vec<Value>, Map<String, Value>) -> Result<Value, ExecutionError> + Send + Sync,
{
    async fn invoke(&self, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<Value, ExecutionError> {
        (self.0)(args, kwargs)
    }
}

/// Sum numeric positional arguments.
///
/// Integers stay integers; any float promotes the result to a float.
///
/// # Errors
/// Returns `InvalidArguments` for non-numeric arguments or integer overflow.
pub fn add(args: Vec<Value>, _kwargs: Map<String, Value>) -> Result<Value, ExecutionError> {
    let mut int_sum: Option<i64> = Some(0);
    let mut float_sum = 0.0_f64;

    for (i, arg) in args.iter().enumerate() {
        let Value::Number(n) = arg else {
            return Err(ExecutionError::InvalidArguments(format!("argument {i} is not a number: {arg}")));
        };
        int_sum = match (int_sum, n.as_i64()) {
            (Some(acc), Some(v)) => Some(
                acc.checked_add(v)
                    .ok_or_else(|| ExecutionError::InvalidArguments("integer overflow".to_string()))?,
            ),
            _ => None,
        };
        float_sum += n.as_f64().unwrap_or_default();
    }

    match int_sum {
        Some(sum) => Ok(Value::from(sum)),
        None => Number::from_f64(float_sum)
            .map(Value::Number)
            .ok_or_else(|| ExecutionError::InvalidArguments("sum is not finite".to_string())),
    }
}

/// Return the arguments unchanged.
///
/// # Errors
/// Never fails.
#[allow(clippy::unnecessary_wraps)]
pub fn echo(args: Vec<Value>, kwargs: Map<String, Value>) -> Result<Value, ExecutionError> {
    Ok(json!({"args": args, "kwargs": kwargs}))
}

/// Report the worker's node info.
pub struct SysInfo {
    probe: Arc<dyn DeviceProbe>,
}

impl SysInfo {
    #[must_use]
    pub fn new(probe: Arc<dyn DeviceProbe>) -> Self {
        Self { probe }
    }
}

#[async_trait]
impl Executable for SysInfo {
    async fn invoke(&self, _args: Vec<Value>, _kwargs: Map<String, Value>) -> Result<Value, ExecutionError> {
        Ok(serde_json::to_value(self.probe.probe())?)
    }
}
