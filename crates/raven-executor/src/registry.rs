//! Script registry: maps script identifiers to routines and runs requests.

use std::{any::Any, collections::HashMap, panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use raven_core::{DeviceProbe, Executable, ExecutionError, ExecutionRequest, ExecutionResult};
use serde_json::{Map, Value};

use crate::{
    builtins::{self, FnExecutable, SysInfo},
    staged::StagedScripts,
};

/// Routines a worker is willing to run.
///
/// Registered routines win over staged scripts with the same name.
#[derive(Default, Clone)]
pub struct ScriptRegistry {
    routines: HashMap<String, Arc<dyn Executable>>,
    staged: Option<StagedScripts>,
}

impl ScriptRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `add`, `echo` and `sys_info`.
    #[must_use]
    pub fn with_builtins(probe: Arc<dyn DeviceProbe>) -> Self {
        let mut registry = Self::new();
        registry.register_fn("add", builtins::add);
        registry.register_fn("echo", builtins::echo);
        registry.register("sys_info", SysInfo::new(probe));
        registry
    }

    /// Register a routine under `name`, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, routine: impl Executable + 'static) -> &mut Self {
        self.routines.insert(name.into(), Arc::new(routine));
        self
    }

    /// Register a plain function.
    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Vec<Value>, Map<String, Value>) -> Result<Value, ExecutionError> + Send + Sync + 'static,
    {
        self.register(name, FnExecutable(f))
    }

    /// Fall back to scripts pushed into a staging directory.
    pub fn enable_staged(&mut self, staged: StagedScripts) -> &mut Self {
        self.staged = Some(staged);
        self
    }

    /// Names of registered routines, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.routines.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Look up the routine for a script identifier.
    pub async fn resolve(&self, script: &str) -> Option<Arc<dyn Executable>> {
        if let Some(routine) = self.routines.get(script) {
            return Some(Arc::clone(routine));
        }
        let staged = self.staged.as_ref()?.locate(script).await?;
        Some(Arc::new(staged))
    }

    /// Run a request, turning every failure (including panics) into data.
    pub async fn run(&self, request: &ExecutionRequest) -> ExecutionResult {
        let outcome = match self.resolve(&request.script).await {
            Some(routine) => {
                let call = routine.invoke(request.args.clone(), request.kwargs.clone());
                match AssertUnwindSafe(call).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(panic) => Err(ExecutionError::Panicked(panic_message(panic.as_ref()))),
                }
            }
            None => Err(ExecutionError::NotFound(request.script.clone())),
        };

        let result = match outcome {
            Ok(output) => ExecutionResult::success(output),
            Err(e) => {
                tracing::warn!(script = %request.script, error = %e, "Execution failed");
                ExecutionResult::failure(e.to_string(), e.trace())
            }
        };
        tracing::info!(script = %request.script, success = result.is_success(), "Execution over");
        result
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
