//! Core types for the raven coordinator/worker protocol.
//!
//! This crate provides the shared building blocks:
//! - `NodeInfo`, `WorkerDescriptor`, `DeviceDescriptor` - worker metadata
//! - `ExecutionRequest`, `ExecutionResult` - remote execution envelope
//! - `WorkerRegistry` and `Executable` traits
//! - Staging directory naming rules

pub mod exec;
pub mod node;
pub mod staging;
pub mod traits;

pub use exec::{ExecutionRequest, ExecutionResult};
pub use node::{DeviceDescriptor, DeviceProbe, NodeInfo, StaticProbe, WorkerDescriptor};
pub use staging::staged_path;
pub use traits::{Executable, ExecutionError, RegistryError, WorkerRegistry};
