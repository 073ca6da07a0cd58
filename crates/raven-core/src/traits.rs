//! Core traits for worker registries and executable routines.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::WorkerDescriptor;

/// Registry error.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Registry file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Registry error: {0}")]
    Internal(String),
}

/// Key-value store of known workers, keyed by host.
///
/// `put` replaces the stored descriptor for a host wholesale. Hosts are never pruned.
#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    /// Get the descriptor last recorded for a host.
    async fn get(&self, host: &str) -> Result<Option<WorkerDescriptor>, RegistryError>;

    /// Record a worker, overwriting any previous entry for its host.
    async fn put(&self, worker: &WorkerDescriptor) -> Result<(), RegistryError>;

    /// List all known workers.
    async fn list(&self) -> Result<Vec<WorkerDescriptor>, RegistryError>;
}

#[async_trait]
impl<R: WorkerRegistry + ?Sized> WorkerRegistry for Arc<R> {
    async fn get(&self, host: &str) -> Result<Option<WorkerDescriptor>, RegistryError> {
        (**self).get(host).await
    }

    async fn put(&self, worker: &WorkerDescriptor) -> Result<(), RegistryError> {
        (**self).put(worker).await
    }

    async fn list(&self) -> Result<Vec<WorkerDescriptor>, RegistryError> {
        (**self).list().await
    }
}

/// Execution error.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Unknown script: {0}")]
    NotFound(String),
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("{0}")]
    Failed(String),
    #[error("Routine panicked: {0}")]
    Panicked(String),
    #[error("Process exited with {status}")]
    Process { status: String, stderr: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ExecutionError {
    /// Trace text reported alongside the error message.
    ///
    /// Captured stderr for process failures, otherwise the error's source chain.
    #[must_use]
    pub fn trace(&self) -> String {
        if let Self::Process { stderr, .. } = self {
            return stderr.clone();
        }

        let mut lines = vec![format!("Error: {self}")];
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            lines.push(format!("Caused by: {cause}"));
            source = cause.source();
        }
        lines.join("\n")
    }
}

/// A routine a worker can run on request.
#[async_trait]
pub trait Executable: Send + Sync {
    /// Invoke with positional and keyword arguments.
    async fn invoke(&self, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<Value, ExecutionError>;
}
